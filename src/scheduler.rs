//! Single-coordinator scheduler loop.
//!
//! The legacy alternative to [`ThreadPoolExecutor`]: one coordinator
//! thread multiplexes submission, completion delivery, and timeout firing.
//! Callers talk to it through two lock-free queues; worker callables run
//! the actions and push raw results back, so promises complete (and the
//! rail releases) only on the coordinator.
//!
//! [`ThreadPoolExecutor`]: crate::executor::ThreadPoolExecutor

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{ActionError, RailError, RejectReason, TimeoutError};
use crate::future::RailFuture;
use crate::pool::WorkerPool;
use crate::promise::RailPromise;
use crate::rail::GuardRail;
use crate::task::OutcomeMap;

/// Consecutive idle cycles spent busy-spinning before the loop starts
/// yielding.
const SPIN_LIMIT: u32 = 100;
/// Below this remaining spin budget an idle cycle yields the thread.
const YIELD_THRESHOLD: u32 = 50;
/// Park length once the spin budget is exhausted.
const PARK_DURATION: Duration = Duration::from_micros(1);

struct ScheduleMessage<T> {
    action: Box<dyn FnOnce() -> Result<T, ActionError> + Send>,
    outcomes: OutcomeMap<T>,
    promise: RailPromise<T>,
    deadline_nanos: u64,
}

struct ResultMessage<T> {
    id: u64,
    result: Result<T, ActionError>,
}

struct SchedulerShared<T> {
    to_schedule: SegQueue<ScheduleMessage<T>>,
    to_return: SegQueue<ResultMessage<T>>,
    running: AtomicBool,
    rail: GuardRail,
    clock: Arc<dyn Clock>,
}

struct InFlight<T> {
    promise: RailPromise<T>,
    outcomes: OutcomeMap<T>,
    cancelled: Arc<AtomicBool>,
}

/// Submission side of a scheduler. Cheap to clone and thread-safe.
pub struct SchedulerHandle<T> {
    shared: Arc<SchedulerShared<T>>,
}

impl<T> Clone for SchedulerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + Sync + 'static> SchedulerHandle<T> {
    /// Submits `action` through the scheduler's rail with an absolute
    /// deadline of now plus `timeout`.
    ///
    /// Rejections (gate or shutdown) surface as already-rejected futures.
    pub fn submit<F>(&self, action: F, outcomes: OutcomeMap<T>, timeout: Duration) -> RailFuture<T>
    where
        F: FnOnce() -> Result<T, ActionError> + Send + 'static,
    {
        if !self.shared.running.load(Ordering::Acquire) {
            return RailFuture::rejected(RejectReason::ExecutorShutdown);
        }
        let promise = match self.shared.rail.acquire_promise::<T>(1) {
            Ok(promise) => promise,
            Err(reason) => return RailFuture::rejected(RejectReason::Gate(reason)),
        };
        let future = promise.future();
        let timeout_nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        let deadline_nanos = self
            .shared
            .clock
            .now_nanos()
            .saturating_add(timeout_nanos);
        self.shared.to_schedule.push(ScheduleMessage {
            action: Box::new(action),
            outcomes,
            promise,
            deadline_nanos,
        });
        future
    }
}

/// The coordinator's working state: queues, worker pool, pending-deadline
/// map, and the handle-to-task map.
///
/// Built once, then either driven manually one [`run_once`] cycle at a
/// time or handed to [`Scheduler::start`].
///
/// [`run_once`]: ScheduleContext::run_once
pub struct ScheduleContext<T> {
    shared: Arc<SchedulerShared<T>>,
    pool: WorkerPool,
    pool_size: usize,
    pending: BTreeMap<u64, Vec<u64>>,
    tasks: HashMap<u64, InFlight<T>>,
    next_id: u64,
}

impl<T: Send + Sync + 'static> ScheduleContext<T> {
    /// Starts building a context over `rail`.
    pub fn builder(rail: GuardRail) -> ScheduleContextBuilder<T> {
        ScheduleContextBuilder {
            rail,
            name: "scheduler".to_string(),
            pool_size: 1,
            _value_type: PhantomData,
        }
    }

    /// Submission handle bound to this context's queues.
    pub fn handle(&self) -> SchedulerHandle<T> {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs one coordinator cycle: drain up to `pool_size` submissions,
    /// drain up to `pool_size` returns, fire due timeouts, prune the
    /// deadline map. Returns whether the cycle did any work.
    pub fn run_once(&mut self) -> bool {
        let mut did_something = false;
        for _ in 0..self.pool_size {
            if self.handle_scheduling() {
                did_something = true;
            } else {
                break;
            }
        }
        for _ in 0..self.pool_size {
            if self.handle_return() {
                did_something = true;
            } else {
                break;
            }
        }
        let now = self.shared.clock.now_nanos();
        self.trigger_timeouts(now);
        // Tail slice: only live deadlines stay in the map.
        self.pending = self.pending.split_off(&(now + 1));
        did_something
    }

    fn handle_scheduling(&mut self) -> bool {
        let Some(message) = self.shared.to_schedule.pop() else {
            return false;
        };
        let id = self.next_id;
        self.next_id += 1;
        let cancelled = Arc::new(AtomicBool::new(false));

        self.pending.entry(message.deadline_nanos).or_default().push(id);
        self.tasks.insert(
            id,
            InFlight {
                promise: message.promise,
                outcomes: message.outcomes,
                cancelled: Arc::clone(&cancelled),
            },
        );

        let shared = Arc::clone(&self.shared);
        let action = message.action;
        let job = move || {
            if cancelled.load(Ordering::Acquire) {
                return;
            }
            let result = action();
            shared.to_return.push(ResultMessage { id, result });
        };
        if self.pool.submit(Box::new(job)).is_err() {
            if let Some(in_flight) = self.tasks.remove(&id) {
                let error: ActionError =
                    Box::new(RailError::Rejected(RejectReason::ExecutorShutdown));
                let outcome = in_flight.outcomes.convert_error(&error);
                if let Err(error) = in_flight.promise.complete_with_error(outcome, error) {
                    warn!(%error, "could not fail submission after pool shutdown");
                }
            }
        }
        true
    }

    fn handle_return(&mut self) -> bool {
        let Some(message) = self.shared.to_return.pop() else {
            return false;
        };
        if let Some(in_flight) = self.tasks.remove(&message.id) {
            let attempt = match message.result {
                Ok(value) => {
                    let outcome = in_flight.outcomes.convert_result(&value);
                    in_flight.promise.complete(outcome, value)
                }
                Err(error) => {
                    let outcome = in_flight.outcomes.convert_error(&error);
                    in_flight.promise.complete_with_error(outcome, error)
                }
            };
            if let Err(error) = attempt {
                warn!(%error, "scheduler completion dropped; converter returned a foreign outcome");
            }
        }
        true
    }

    fn trigger_timeouts(&mut self, now: u64) {
        let expired: Vec<u64> = self
            .pending
            .range(..=now)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        for id in expired {
            // Idempotent against return delivery: the map entry is gone
            // once a result was handled.
            if let Some(in_flight) = self.tasks.remove(&id) {
                if in_flight.promise.is_pending() {
                    in_flight.cancelled.store(true, Ordering::Release);
                    let outcome = in_flight.outcomes.timeout_outcome().clone();
                    if let Err(error) = in_flight
                        .promise
                        .complete_with_error(outcome, Box::new(TimeoutError))
                    {
                        warn!(%error, "scheduler timeout completion dropped");
                    }
                }
            }
        }
    }

    fn is_drained(&self) -> bool {
        self.tasks.is_empty()
            && self.shared.to_schedule.is_empty()
            && self.shared.to_return.is_empty()
    }
}

/// Builder for [`ScheduleContext`].
pub struct ScheduleContextBuilder<T> {
    rail: GuardRail,
    name: String,
    pool_size: usize,
    _value_type: PhantomData<T>,
}

impl<T: Send + Sync + 'static> ScheduleContextBuilder<T> {
    /// Thread-name prefix for the context's workers.
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Worker count, which also bounds per-cycle queue drains.
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Builds the context. Submissions are accepted immediately; cycles
    /// run only when driven.
    pub fn build(self) -> ScheduleContext<T> {
        let clock = Arc::clone(self.rail.clock());
        ScheduleContext {
            shared: Arc::new(SchedulerShared {
                to_schedule: SegQueue::new(),
                to_return: SegQueue::new(),
                running: AtomicBool::new(true),
                rail: self.rail,
                clock,
            }),
            pool: WorkerPool::new(&self.name, self.pool_size),
            pool_size: self.pool_size,
            pending: BTreeMap::new(),
            tasks: HashMap::new(),
            next_id: 0,
        }
    }
}

/// Owns the coordinator thread driving a [`ScheduleContext`].
pub struct Scheduler<T> {
    shared: Arc<SchedulerShared<T>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> Scheduler<T> {
    /// Spawns the coordinator thread over `context`.
    pub fn start(context: ScheduleContext<T>) -> Self {
        let shared = Arc::clone(&context.shared);
        let handle = std::thread::Builder::new()
            .name("guardrail-scheduler".into())
            .spawn(move || run_loop(context));
        let thread = match handle {
            Ok(handle) => Some(handle),
            Err(error) => {
                warn!(%error, "failed to spawn scheduler coordinator");
                None
            }
        };
        Self {
            shared,
            thread: Mutex::new(thread),
        }
    }

    /// Submission handle for this scheduler.
    pub fn handle(&self) -> SchedulerHandle<T> {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stops accepting submissions, drains in-flight work, and joins the
    /// coordinator. Idempotent.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
            debug!("scheduler coordinator stopped");
        }
    }
}

impl<T> Drop for Scheduler<T> {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn run_loop<T: Send + Sync + 'static>(mut context: ScheduleContext<T>) {
    let mut spin = SPIN_LIMIT;
    loop {
        let running = context.shared.running.load(Ordering::Acquire);
        if !running && context.is_drained() {
            break;
        }
        if context.run_once() {
            spin = SPIN_LIMIT;
            continue;
        }
        // Idle decay: busy-spin, then yield, then park briefly.
        if spin == 0 {
            std::thread::park_timeout(PARK_DURATION);
            spin = SPIN_LIMIT;
        } else {
            spin -= 1;
            if spin < YIELD_THRESHOLD {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }
    context.pool.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{RejectionClass, ResultClass};
    use crate::semaphore::SemaphoreGate;
    use std::sync::mpsc;

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
        GuardRail::builder("scheduler-rail", results, rejections)
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
    fn empty_cycle_does_nothing_and_returns_false() {
        let rail = rail(4);
        let mut context: ScheduleContext<u32> =
            ScheduleContext::builder(rail).pool_size(1).build();
        assert!(!context.run_once());
    }

    #[test]
    fn cycle_reports_work_when_a_submission_is_drained() {
        let rail = rail(4);
        let mut context: ScheduleContext<u32> =
            ScheduleContext::builder(rail.clone()).pool_size(1).build();
        let handle = context.handle();

        let future = handle.submit(|| Ok(5), outcomes(&rail), Duration::from_secs(1));
        assert!(context.run_once());

        // The worker pushes the result; the next productive cycle delivers.
        let completion = loop {
            context.run_once();
            if let Some(completion) = future.completion() {
                break completion;
            }
            std::thread::yield_now();
        };
        assert_eq!(completion.value(), Some(&5));
    }

    #[test]
    fn overdue_submissions_time_out_on_a_later_cycle() {
        let rail = rail(4);
        let mut context: ScheduleContext<u32> =
            ScheduleContext::builder(rail.clone()).pool_size(1).build();
        let handle = context.handle();

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let future = handle.submit(
            move || {
                release_rx.recv().ok();
                Ok(9)
            },
            outcomes(&rail),
            Duration::from_millis(20),
        );
        assert!(context.run_once());

        std::thread::sleep(Duration::from_millis(40));
        context.run_once();

        assert_eq!(future.outcome().unwrap().name(), "timeout");
        // The late natural return must not re-complete.
        release_tx.send(()).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        context.run_once();
        assert_eq!(future.outcome().unwrap().name(), "timeout");
        context.pool.shutdown();
    }

    #[test]
    fn scheduler_thread_runs_submissions_end_to_end() {
        let rail = rail(4);
        let context: ScheduleContext<u32> = ScheduleContext::builder(rail.clone())
            .name("e2e-scheduler")
            .pool_size(2)
            .build();
        let scheduler = Scheduler::start(context);
        let handle = scheduler.handle();

        let future = handle.submit(|| Ok(7), outcomes(&rail), Duration::from_secs(1));
        let completion = future.wait().unwrap();
        assert_eq!(completion.value(), Some(&7));

        scheduler.shutdown();
        let rejected = handle.submit(|| Ok(1), outcomes(&rail), Duration::from_secs(1));
        assert_eq!(
            rejected.reject_reason(),
            Some(RejectReason::ExecutorShutdown)
        );
    }
}
