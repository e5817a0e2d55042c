//! One-shot completion cells.
//!
//! A cell moves `pending -> completing -> done` on a single atomic word;
//! the first writer wins and every later completion is a silent no-op.
//! Cells acquired through a rail carry an execution context whose
//! completion hook releases permits and records metrics exactly once.

use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::class::{Outcome, ResultClass};
use crate::error::{ActionError, RailError, RailResult};
use crate::future::RailFuture;
use crate::rail::GuardRail;

const PENDING: u8 = 0;
const COMPLETING: u8 = 1;
const DONE: u8 = 2;

/// The terminal state of a completed cell: an outcome plus its payload.
pub struct Completion<T> {
    outcome: Outcome,
    value: CompletionValue<T>,
}

/// Payload of a completion: the action's value or an error.
pub enum CompletionValue<T> {
    /// The action returned normally.
    Value(T),
    /// The action failed, timed out, or was cancelled.
    Error(Arc<dyn std::error::Error + Send + Sync>),
}

impl<T> Completion<T> {
    /// The outcome this cell completed with.
    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// The action's value, when the completion carried one.
    pub fn value(&self) -> Option<&T> {
        match &self.value {
            CompletionValue::Value(value) => Some(value),
            CompletionValue::Error(_) => None,
        }
    }

    /// The error payload, when the completion carried one.
    pub fn error(&self) -> Option<&Arc<dyn std::error::Error + Send + Sync>> {
        match &self.value {
            CompletionValue::Value(_) => None,
            CompletionValue::Error(error) => Some(error),
        }
    }
}

type Callback<T> = Box<dyn FnOnce(&Completion<T>) + Send>;

enum Callbacks<T> {
    Open(Vec<Callback<T>>),
    Drained,
}

/// Rail binding carried by cells created through `acquire_promise` /
/// `acquire_completable`.
pub(crate) struct ExecutionContext {
    pub(crate) rail: GuardRail,
    pub(crate) permits: u64,
    pub(crate) start_nanos: u64,
}

pub(crate) struct PromiseInner<T> {
    state: AtomicU8,
    slot: Mutex<Option<Arc<Completion<T>>>>,
    done: Condvar,
    callbacks: Mutex<Callbacks<T>>,
    class: ResultClass,
    context: Option<ExecutionContext>,
}

impl<T> PromiseInner<T> {
    fn new(class: ResultClass, context: Option<ExecutionContext>) -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            slot: Mutex::new(None),
            done: Condvar::new(),
            callbacks: Mutex::new(Callbacks::Open(Vec::new())),
            class,
            context,
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) != DONE
    }

    pub(crate) fn completion(&self) -> Option<Arc<Completion<T>>> {
        if self.state.load(Ordering::Acquire) == DONE {
            self.slot.lock().clone()
        } else {
            None
        }
    }

    /// First completion wins; `Ok(false)` means another writer already won.
    pub(crate) fn try_complete(&self, completion: Completion<T>) -> RailResult<bool> {
        if !self.class.contains(&completion.outcome) {
            return Err(RailError::invalid_result(
                completion.outcome.name(),
                self.class.member_list(),
            ));
        }
        if self
            .state
            .compare_exchange(PENDING, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }
        let completion = Arc::new(completion);
        // Metrics, breaker notification, and the permit release happen
        // before the done publication: a caller woken by `wait` observes
        // the rail already updated.
        if let Some(context) = &self.context {
            context.rail.release_completion(
                context.permits,
                context.start_nanos,
                completion.outcome(),
            );
        }
        {
            let mut slot = self.slot.lock();
            *slot = Some(Arc::clone(&completion));
            // Published while holding the lock so a waiter's state check
            // and sleep cannot straddle the store.
            self.state.store(DONE, Ordering::Release);
        }
        self.done.notify_all();
        let callbacks = mem::replace(&mut *self.callbacks.lock(), Callbacks::Drained);
        if let Callbacks::Open(list) = callbacks {
            for callback in list {
                run_callback(callback, &completion);
            }
        }
        Ok(true)
    }

    pub(crate) fn on_complete(&self, callback: Callback<T>) {
        {
            let mut callbacks = self.callbacks.lock();
            if let Callbacks::Open(list) = &mut *callbacks {
                list.push(callback);
                return;
            }
        }
        // Already drained, so the slot is published; fire immediately.
        if let Some(completion) = self.completion() {
            run_callback(callback, &completion);
        }
    }

    pub(crate) fn wait(&self) -> Arc<Completion<T>> {
        let mut slot = self.slot.lock();
        loop {
            if self.state.load(Ordering::Acquire) == DONE {
                if let Some(completion) = slot.as_ref() {
                    return Arc::clone(completion);
                }
            }
            self.done.wait(&mut slot);
        }
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<Arc<Completion<T>>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            if self.state.load(Ordering::Acquire) == DONE {
                if let Some(completion) = slot.as_ref() {
                    return Some(Arc::clone(completion));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.done.wait_for(&mut slot, deadline - now);
        }
    }
}

fn run_callback<T>(callback: Callback<T>, completion: &Arc<Completion<T>>) {
    let completion = Arc::clone(completion);
    if catch_unwind(AssertUnwindSafe(move || callback(&completion))).is_err() {
        warn!("completion callback panicked; other callbacks unaffected");
    }
}

/// Single-writer one-shot result cell.
///
/// The write side of a result view handed to exactly one producer. The
/// completion protocol is shared with [`RailPromise`], so even a misused
/// completable never double-completes.
pub struct Completable<T> {
    inner: Arc<PromiseInner<T>>,
}

impl<T> Completable<T> {
    /// Creates a standalone completable over `class`.
    pub fn new(class: &ResultClass) -> Self {
        Self {
            inner: Arc::new(PromiseInner::new(class.clone(), None)),
        }
    }

    pub(crate) fn with_context(class: ResultClass, context: ExecutionContext) -> Self {
        Self {
            inner: Arc::new(PromiseInner::new(class, Some(context))),
        }
    }

    /// Completes with a value. Returns `Ok(false)` if already done.
    ///
    /// # Errors
    ///
    /// [`RailError::InvalidResult`] when `outcome` is not in the cell's
    /// result class; the cell stays pending.
    pub fn complete(&self, outcome: Outcome, value: T) -> RailResult<bool> {
        self.inner.try_complete(Completion {
            outcome,
            value: CompletionValue::Value(value),
        })
    }

    /// Completes with an error payload. Returns `Ok(false)` if already done.
    ///
    /// # Errors
    ///
    /// [`RailError::InvalidResult`] when `outcome` is not in the cell's
    /// result class; the cell stays pending.
    pub fn complete_with_error(&self, outcome: Outcome, error: ActionError) -> RailResult<bool> {
        self.inner.try_complete(Completion {
            outcome,
            value: CompletionValue::Error(error.into()),
        })
    }

    /// Read-side view of this cell.
    pub fn future(&self) -> RailFuture<T> {
        RailFuture::shared(Arc::clone(&self.inner))
    }
}

/// Multi-writer one-shot result cell.
///
/// Clones share the same cell; completion is first-writer-wins and every
/// losing write is a silent no-op.
pub struct RailPromise<T> {
    inner: Arc<PromiseInner<T>>,
}

impl<T> Clone for RailPromise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> RailPromise<T> {
    /// Creates a standalone promise over `class`.
    pub fn new(class: &ResultClass) -> Self {
        Self {
            inner: Arc::new(PromiseInner::new(class.clone(), None)),
        }
    }

    pub(crate) fn with_context(class: ResultClass, context: ExecutionContext) -> Self {
        Self {
            inner: Arc::new(PromiseInner::new(class, Some(context))),
        }
    }

    /// True until the first completion lands.
    pub fn is_pending(&self) -> bool {
        self.inner.is_pending()
    }

    /// Completes with a value. Returns `Ok(false)` if another writer won.
    ///
    /// # Errors
    ///
    /// [`RailError::InvalidResult`] when `outcome` is not in the cell's
    /// result class; the cell stays pending.
    pub fn complete(&self, outcome: Outcome, value: T) -> RailResult<bool> {
        self.inner.try_complete(Completion {
            outcome,
            value: CompletionValue::Value(value),
        })
    }

    /// Completes with an error payload. Returns `Ok(false)` if another
    /// writer won.
    ///
    /// # Errors
    ///
    /// [`RailError::InvalidResult`] when `outcome` is not in the cell's
    /// result class; the cell stays pending.
    pub fn complete_with_error(&self, outcome: Outcome, error: ActionError) -> RailResult<bool> {
        self.inner.try_complete(Completion {
            outcome,
            value: CompletionValue::Error(error.into()),
        })
    }

    /// Read-side view of this cell.
    pub fn future(&self) -> RailFuture<T> {
        RailFuture::shared(Arc::clone(&self.inner))
    }
}
