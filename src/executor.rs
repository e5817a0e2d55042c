//! Thread-pool execution of guarded actions with optional timeouts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ActionError, RailError, RejectReason};
use crate::future::RailFuture;
use crate::pool::WorkerPool;
use crate::rail::GuardRail;
use crate::task::{CancellableTask, OutcomeMap};
use crate::timeout::TimeoutService;

/// Runs guarded actions on a fixed worker pool, arming timeouts against
/// their promises.
///
/// Back-pressure belongs to the rail passed at submit; the pool queue is
/// FIFO and unbounded. Shutdown is explicit, idempotent, and drains
/// in-flight work without cancelling running actions (armed timeouts may
/// still fire and cancel).
pub struct ThreadPoolExecutor {
    pool: WorkerPool,
    timeouts: Arc<TimeoutService>,
    owns_timeouts: bool,
    down: AtomicBool,
}

impl ThreadPoolExecutor {
    /// Creates an executor with `pool_size` workers and its own timeout
    /// service, started immediately.
    pub fn new(name: &str, pool_size: usize) -> Self {
        let timeouts = Arc::new(TimeoutService::new());
        timeouts.start();
        Self {
            pool: WorkerPool::new(name, pool_size),
            timeouts,
            owns_timeouts: true,
            down: AtomicBool::new(false),
        }
    }

    /// Creates an executor sharing an externally managed timeout service.
    ///
    /// The service is not shut down with the executor; its lifecycle stays
    /// with the caller.
    pub fn with_timeout_service(
        name: &str,
        pool_size: usize,
        timeouts: Arc<TimeoutService>,
    ) -> Self {
        Self {
            pool: WorkerPool::new(name, pool_size),
            timeouts,
            owns_timeouts: false,
            down: AtomicBool::new(false),
        }
    }

    /// Submits `action` through `rail`.
    ///
    /// On rejection the returned future is already rejected and carries
    /// the reason. Otherwise the action is wrapped in a cancellable task
    /// bound to a rail promise, queued on the pool, and, when `timeout`
    /// is given, armed on the timeout service.
    pub fn submit<T, F>(
        &self,
        rail: &GuardRail,
        action: F,
        outcomes: OutcomeMap<T>,
        timeout: Option<Duration>,
    ) -> RailFuture<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T, ActionError> + Send + 'static,
    {
        if self.down.load(Ordering::Acquire) {
            return RailFuture::rejected(RejectReason::ExecutorShutdown);
        }
        let promise = match rail.acquire_promise::<T>(1) {
            Ok(promise) => promise,
            Err(reason) => return RailFuture::rejected(RejectReason::Gate(reason)),
        };
        let future = promise.future();
        let task = CancellableTask::new(promise, outcomes.clone(), action);
        let handle = task.cancel_handle();

        if self.pool.submit(Box::new(move || task.run())).is_err() {
            // Shutdown raced the admission; fail the held permit through
            // the error converter so it is released exactly once.
            let error: ActionError =
                Box::new(RailError::Rejected(RejectReason::ExecutorShutdown));
            let outcome = outcomes.convert_error(&error);
            if let Err(error) = handle.cancel(outcome, error) {
                warn!(%error, "could not fail submission after shutdown");
            }
            return future;
        }

        if let Some(timeout) = timeout {
            let handle = handle.clone();
            self.timeouts.schedule_in(timeout, move || {
                if let Err(error) = handle.cancel_on_timeout() {
                    warn!(%error, "timeout cancellation dropped");
                }
            });
        }
        future
    }

    /// Stops accepting work, drains queued and in-flight actions, and
    /// joins the workers. Idempotent.
    pub fn shutdown(&self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("thread pool executor shutting down");
        self.pool.shutdown();
        if self.owns_timeouts {
            self.timeouts.shutdown();
        }
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{RejectionClass, ResultClass};
    use crate::semaphore::SemaphoreGate;

    fn rail(max: u64) -> GuardRail {
        let results = ResultClass::builder()
            .success("success")
            .failure("error")
            .failure("timeout")
            .build();
        let rejections = RejectionClass::builder().reason("max-concurrency").build();
        let gate = Arc::new(SemaphoreGate::new(
            max,
            rejections.reason("max-concurrency").unwrap(),
        ));
        GuardRail::builder("executor-rail", results, rejections)
            .add_back_pressure("semaphore", gate)
            .build()
    }

    fn outcomes(rail: &GuardRail) -> OutcomeMap<u32> {
        let class = rail.result_class();
        OutcomeMap::fixed(
            class.outcome("success").unwrap(),
            class.outcome("error").unwrap(),
            class.outcome("timeout").unwrap(),
        )
    }

    #[test]
    fn submit_runs_the_action_and_completes_the_future() {
        let executor = ThreadPoolExecutor::new("exec", 2);
        let rail = rail(4);

        let future = executor.submit(&rail, || Ok(21), outcomes(&rail), None);
        let completion = future.wait().unwrap();
        assert_eq!(completion.value(), Some(&21));
        executor.shutdown();
    }

    #[test]
    fn rejected_submissions_return_rejected_futures() {
        let executor = ThreadPoolExecutor::new("exec-full", 1);
        let rail = rail(1);

        let held = rail.acquire(1).unwrap();
        let future = executor.submit(&rail, || Ok(1), outcomes(&rail), None);
        assert!(future.is_rejected());
        assert_eq!(
            future.reject_reason().unwrap().to_string(),
            "max-concurrency"
        );
        rail.release_without_result(held);
        executor.shutdown();
    }

    #[test]
    fn submit_after_shutdown_is_rejected_with_the_reserved_reason() {
        let executor = ThreadPoolExecutor::new("exec-down", 1);
        executor.shutdown();
        let rail = rail(1);

        let future = executor.submit(&rail, || Ok(1), outcomes(&rail), None);
        assert_eq!(
            future.reject_reason(),
            Some(RejectReason::ExecutorShutdown)
        );
    }
}
