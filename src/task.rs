//! Cancellable wrapper around user actions.
//!
//! A task pairs an action with the converters that map its result or
//! error to an outcome, targeting a promise. Cancellation CASes a local
//! flag so an action that has not started never runs; for an action in
//! flight the promise's first-writer-wins protocol discards the late
//! natural return.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::class::Outcome;
use crate::error::{ActionError, RailResult};
use crate::promise::RailPromise;

const RUNNABLE: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

type ResultConverter<T> = Arc<dyn Fn(&T) -> Outcome + Send + Sync>;
type ErrorConverter = Arc<dyn Fn(&ActionError) -> Outcome + Send + Sync>;

/// Maps an action's results and errors onto a rail's outcomes.
///
/// Converters must return members of the target rail's result class; a
/// foreign outcome leaves the promise pending and is logged as an error.
pub struct OutcomeMap<T> {
    result_to_outcome: ResultConverter<T>,
    error_to_outcome: ErrorConverter,
    timeout: Outcome,
}

impl<T> Clone for OutcomeMap<T> {
    fn clone(&self) -> Self {
        Self {
            result_to_outcome: Arc::clone(&self.result_to_outcome),
            error_to_outcome: Arc::clone(&self.error_to_outcome),
            timeout: self.timeout.clone(),
        }
    }
}

impl<T> OutcomeMap<T> {
    /// Full form: custom converters plus the outcome used when a timeout
    /// cancels the action.
    pub fn new<R, E>(result_to_outcome: R, error_to_outcome: E, timeout: Outcome) -> Self
    where
        R: Fn(&T) -> Outcome + Send + Sync + 'static,
        E: Fn(&ActionError) -> Outcome + Send + Sync + 'static,
    {
        Self {
            result_to_outcome: Arc::new(result_to_outcome),
            error_to_outcome: Arc::new(error_to_outcome),
            timeout,
        }
    }

    /// Common form: every normal return maps to `success`, every error to
    /// `error`, timeouts to `timeout`.
    pub fn fixed(success: Outcome, error: Outcome, timeout: Outcome) -> Self {
        Self {
            result_to_outcome: Arc::new(move |_| success.clone()),
            error_to_outcome: Arc::new(move |_| error.clone()),
            timeout,
        }
    }

    /// The outcome used when a timeout cancels the action.
    pub fn timeout_outcome(&self) -> &Outcome {
        &self.timeout
    }

    pub(crate) fn convert_result(&self, value: &T) -> Outcome {
        (self.result_to_outcome)(value)
    }

    pub(crate) fn convert_error(&self, error: &ActionError) -> Outcome {
        (self.error_to_outcome)(error)
    }
}

/// A user action bound to a promise, runnable once and cancellable.
pub struct CancellableTask<T> {
    action: Box<dyn FnOnce() -> Result<T, ActionError> + Send>,
    promise: RailPromise<T>,
    outcomes: OutcomeMap<T>,
    flag: Arc<AtomicU8>,
}

impl<T: Send + 'static> CancellableTask<T> {
    /// Wraps `action`, targeting `promise` through `outcomes`.
    pub fn new<F>(promise: RailPromise<T>, outcomes: OutcomeMap<T>, action: F) -> Self
    where
        F: FnOnce() -> Result<T, ActionError> + Send + 'static,
    {
        Self {
            action: Box::new(action),
            promise,
            outcomes,
            flag: Arc::new(AtomicU8::new(RUNNABLE)),
        }
    }

    /// Handle through which a timeout service or caller can cancel.
    pub fn cancel_handle(&self) -> CancelHandle<T> {
        CancelHandle {
            flag: Arc::clone(&self.flag),
            promise: self.promise.clone(),
            outcomes: self.outcomes.clone(),
        }
    }

    /// Runs the action unless it was cancelled first, then completes the
    /// promise with the converted outcome. A completion that lost the
    /// race to a cancel is discarded.
    pub fn run(self) {
        if self
            .flag
            .compare_exchange(RUNNABLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let attempt = match (self.action)() {
            Ok(value) => {
                let outcome = self.outcomes.convert_result(&value);
                self.promise.complete(outcome, value)
            }
            Err(error) => {
                let outcome = self.outcomes.convert_error(&error);
                self.promise.complete_with_error(outcome, error)
            }
        };
        if let Err(error) = attempt {
            warn!(%error, "action completion dropped; converter returned a foreign outcome");
        }
    }
}

/// Cancel side of a [`CancellableTask`]. Cloneable and idempotent.
pub struct CancelHandle<T> {
    flag: Arc<AtomicU8>,
    promise: RailPromise<T>,
    outcomes: OutcomeMap<T>,
}

impl<T> Clone for CancelHandle<T> {
    fn clone(&self) -> Self {
        Self {
            flag: Arc::clone(&self.flag),
            promise: self.promise.clone(),
            outcomes: self.outcomes.clone(),
        }
    }
}

impl<T> CancelHandle<T> {
    /// Cancels the task, completing its promise with `(outcome, error)`.
    ///
    /// Returns `Ok(false)` when the promise was already done; a cancel
    /// after natural completion is a no-op.
    ///
    /// # Errors
    ///
    /// [`crate::error::RailError::InvalidResult`] when `outcome` is not in
    /// the promise's result class.
    pub fn cancel(&self, outcome: Outcome, error: ActionError) -> RailResult<bool> {
        // Stop the action from starting; if it is already running the
        // promise CAS below settles the race.
        let _ = self
            .flag
            .compare_exchange(RUNNABLE, CANCELLED, Ordering::AcqRel, Ordering::Acquire);
        self.promise.complete_with_error(outcome, error)
    }

    /// Cancels with the map's timeout outcome and a [`TimeoutError`]
    /// payload.
    ///
    /// [`TimeoutError`]: crate::error::TimeoutError
    pub fn cancel_on_timeout(&self) -> RailResult<bool> {
        self.cancel(
            self.outcomes.timeout_outcome().clone(),
            Box::new(crate::error::TimeoutError),
        )
    }

    /// True until the task's promise completes.
    pub fn is_pending(&self) -> bool {
        self.promise.is_pending()
    }
}
