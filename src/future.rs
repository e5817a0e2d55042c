//! Read-side view of a one-shot completion cell.

use std::sync::Arc;
use std::time::Duration;

use crate::class::Outcome;
use crate::error::{RailError, RailResult, RejectReason};
use crate::promise::{Completion, PromiseInner};

enum FutureRepr<T> {
    /// Admission was denied; this view never transitions.
    Rejected(RejectReason),
    /// Backed by a live cell.
    Shared(Arc<PromiseInner<T>>),
}

/// A future over a promise or completable.
///
/// Wait-free status queries, a blocking wait, and one-shot completion
/// callbacks. Futures born rejected expose the reason and stay rejected
/// forever.
pub struct RailFuture<T> {
    repr: FutureRepr<T>,
}

impl<T> Clone for RailFuture<T> {
    fn clone(&self) -> Self {
        Self {
            repr: match &self.repr {
                FutureRepr::Rejected(reason) => FutureRepr::Rejected(reason.clone()),
                FutureRepr::Shared(inner) => FutureRepr::Shared(Arc::clone(inner)),
            },
        }
    }
}

impl<T> RailFuture<T> {
    pub(crate) fn shared(inner: Arc<PromiseInner<T>>) -> Self {
        Self {
            repr: FutureRepr::Shared(inner),
        }
    }

    /// Creates a future that was rejected before any work ran.
    pub fn rejected(reason: RejectReason) -> Self {
        Self {
            repr: FutureRepr::Rejected(reason),
        }
    }

    /// True while no completion has landed. Rejected futures are never
    /// pending.
    pub fn is_pending(&self) -> bool {
        match &self.repr {
            FutureRepr::Rejected(_) => false,
            FutureRepr::Shared(inner) => inner.is_pending(),
        }
    }

    /// True when admission was denied.
    pub fn is_rejected(&self) -> bool {
        matches!(self.repr, FutureRepr::Rejected(_))
    }

    /// The rejection reason, when admission was denied.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match &self.repr {
            FutureRepr::Rejected(reason) => Some(reason.clone()),
            FutureRepr::Shared(_) => None,
        }
    }

    /// The completed outcome, once done.
    pub fn outcome(&self) -> Option<Outcome> {
        self.completion().map(|c| c.outcome().clone())
    }

    /// True once completed with a success-tagged outcome.
    pub fn is_success(&self) -> bool {
        self.completion()
            .map(|c| !c.outcome().is_failure())
            .unwrap_or(false)
    }

    /// True once completed with a failure-tagged outcome.
    pub fn is_failure(&self) -> bool {
        self.completion()
            .map(|c| c.outcome().is_failure())
            .unwrap_or(false)
    }

    /// The error payload, once completed with one.
    pub fn error(&self) -> Option<Arc<dyn std::error::Error + Send + Sync>> {
        self.completion().and_then(|c| c.error().cloned())
    }

    /// The full completion, once done.
    pub fn completion(&self) -> Option<Arc<Completion<T>>> {
        match &self.repr {
            FutureRepr::Rejected(_) => None,
            FutureRepr::Shared(inner) => inner.completion(),
        }
    }

    /// Registers a callback fired exactly once at completion, or
    /// immediately if already done. Never fires on a rejected future.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Completion<T>) + Send + 'static,
    {
        if let FutureRepr::Shared(inner) = &self.repr {
            inner.on_complete(Box::new(callback));
        }
    }

    /// Blocks the calling thread until the cell completes.
    ///
    /// # Errors
    ///
    /// [`RailError::Rejected`] when this future was born rejected.
    pub fn wait(&self) -> RailResult<Arc<Completion<T>>> {
        match &self.repr {
            FutureRepr::Rejected(reason) => Err(RailError::Rejected(reason.clone())),
            FutureRepr::Shared(inner) => Ok(inner.wait()),
        }
    }

    /// Blocks until the cell completes or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// [`RailError::Rejected`] when this future was born rejected.
    pub fn wait_timeout(&self, timeout: Duration) -> RailResult<Option<Arc<Completion<T>>>> {
        match &self.repr {
            FutureRepr::Rejected(reason) => Err(RailError::Rejected(reason.clone())),
            FutureRepr::Shared(inner) => Ok(inner.wait_timeout(timeout)),
        }
    }
}

impl<T: Clone> RailFuture<T> {
    /// The completed value, once done with one.
    pub fn value(&self) -> Option<T> {
        self.completion().and_then(|c| c.value().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{RejectionClass, ResultClass};

    #[test]
    fn rejected_futures_never_transition() {
        let rejections = RejectionClass::builder().reason("max-concurrency").build();
        let reason = RejectReason::Gate(rejections.reason("max-concurrency").unwrap());
        let future: RailFuture<u32> = RailFuture::rejected(reason.clone());

        assert!(future.is_rejected());
        assert!(!future.is_pending());
        assert_eq!(future.reject_reason(), Some(reason));
        assert!(future.outcome().is_none());
        assert!(future.wait().is_err());

        // Callbacks on a rejected future are dropped, not deferred.
        future.on_complete(|_| panic!("must not fire"));
    }

    #[test]
    fn view_tracks_the_cell() {
        let class = ResultClass::builder()
            .success("success")
            .failure("error")
            .build();
        let promise = crate::promise::RailPromise::new(&class);
        let future = promise.future();

        assert!(future.is_pending());
        assert!(!future.is_success() && !future.is_failure());

        promise
            .complete(class.outcome("success").unwrap(), 5u32)
            .unwrap();

        assert!(!future.is_pending());
        assert!(future.is_success());
        assert_eq!(future.value(), Some(5));
        assert!(future.error().is_none());
    }
}
