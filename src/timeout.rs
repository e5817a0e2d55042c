//! Deadline service for cancelling overdue work.
//!
//! A min-heap of `(deadline, seq)` entries served by one background
//! thread that sleeps until the earliest deadline or an earlier
//! insertion. Lifecycle is explicit: `start` spawns the expirer,
//! `shutdown` stops and joins it. An opt-in process-wide instance is
//! available behind [`TimeoutService::shared`]; nothing starts at module
//! init.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};

struct TimeoutEntry {
    deadline_nanos: u64,
    seq: u64,
    expire: Box<dyn FnOnce() + Send>,
}

impl PartialEq for TimeoutEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_nanos == other.deadline_nanos && self.seq == other.seq
    }
}

impl Eq for TimeoutEntry {}

impl Ord for TimeoutEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse ordering for min-heap (earliest deadline first).
        other
            .deadline_nanos
            .cmp(&self.deadline_nanos)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct TimeoutInner {
    heap: Mutex<BinaryHeap<TimeoutEntry>>,
    signal: Condvar,
    running: AtomicBool,
    seq: AtomicU64,
    clock: Arc<dyn Clock>,
}

/// Background expirer firing cancellation closures at their deadlines.
///
/// A deadline scheduled for `d` fires at some `t >= d`; firing an entry
/// whose promise already completed is a no-op on the cancel side.
/// Entries scheduled past their deadline fire on the next tick without
/// blocking the caller.
pub struct TimeoutService {
    inner: Arc<TimeoutInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutService {
    /// Creates a stopped service on a [`SystemClock`].
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Creates a stopped service on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(TimeoutInner {
                heap: Mutex::new(BinaryHeap::new()),
                signal: Condvar::new(),
                running: AtomicBool::new(false),
                seq: AtomicU64::new(0),
                clock,
            }),
            thread: Mutex::new(None),
        }
    }

    /// The process-wide shared service, started on first use.
    pub fn shared() -> &'static TimeoutService {
        static SHARED: OnceLock<TimeoutService> = OnceLock::new();
        SHARED.get_or_init(|| {
            let service = TimeoutService::new();
            service.start();
            service
        })
    }

    /// Spawns the expirer thread. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("guardrail-timeout".into())
            .spawn(move || run_expirer(&inner));
        match handle {
            Ok(handle) => *self.thread.lock() = Some(handle),
            Err(error) => {
                self.inner.running.store(false, Ordering::Release);
                warn!(%error, "failed to spawn timeout expirer");
            }
        }
    }

    /// Schedules `expire` to fire once `deadline_nanos` passes on the
    /// service's clock.
    pub fn schedule_at<F>(&self, deadline_nanos: u64, expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut heap = self.inner.heap.lock();
            heap.push(TimeoutEntry {
                deadline_nanos,
                seq,
                expire: Box::new(expire),
            });
        }
        self.inner.signal.notify_one();
    }

    /// Schedules `expire` to fire after `delay` from now.
    pub fn schedule_in<F>(&self, delay: Duration, expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let delay_nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        let deadline = self.inner.clock.now_nanos().saturating_add(delay_nanos);
        self.schedule_at(deadline, expire);
    }

    /// Number of deadlines currently armed.
    pub fn armed(&self) -> usize {
        self.inner.heap.lock().len()
    }

    /// Stops and joins the expirer thread. Idempotent; pending deadlines
    /// are dropped without firing.
    pub fn shutdown(&self) {
        {
            // Flip under the heap lock so the expirer's check-then-wait
            // cannot miss the notify.
            let _heap = self.inner.heap.lock();
            self.inner.running.store(false, Ordering::Release);
        }
        self.inner.signal.notify_all();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
            debug!("timeout expirer stopped");
        }
    }
}

impl Default for TimeoutService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimeoutService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_expirer(inner: &TimeoutInner) {
    loop {
        let mut expired = Vec::new();
        {
            let mut heap = inner.heap.lock();
            if !inner.running.load(Ordering::Acquire) {
                break;
            }
            let now = inner.clock.now_nanos();
            loop {
                match heap.peek() {
                    Some(entry) if entry.deadline_nanos <= now => {
                        if let Some(entry) = heap.pop() {
                            expired.push(entry);
                        }
                    }
                    _ => break,
                }
            }
            if expired.is_empty() {
                match heap.peek().map(|e| e.deadline_nanos) {
                    None => {
                        inner.signal.wait(&mut heap);
                    }
                    Some(deadline) => {
                        let wait = Duration::from_nanos(deadline - now);
                        inner.signal.wait_for(&mut heap, wait);
                    }
                }
            }
        }
        for entry in expired {
            if catch_unwind(AssertUnwindSafe(entry.expire)).is_err() {
                warn!("timeout expiry handler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn deadlines_fire_in_order() {
        let service = TimeoutService::new();
        service.start();
        let fired = Arc::new(Mutex::new(Vec::new()));

        for (label, delay) in [("late", 60u64), ("early", 20u64)] {
            let fired = Arc::clone(&fired);
            service.schedule_in(Duration::from_millis(delay), move || {
                fired.lock().push(label);
            });
        }

        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(*fired.lock(), vec!["early", "late"]);
        service.shutdown();
    }

    #[test]
    fn past_deadlines_fire_on_the_next_tick() {
        let service = TimeoutService::new();
        service.start();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        // Deadline zero is always already past.
        service.schedule_at(0, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        service.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent_and_drops_pending_deadlines() {
        let service = TimeoutService::new();
        service.start();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        service.schedule_in(Duration::from_secs(60), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(service.armed(), 1);

        service.shutdown();
        service.shutdown();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn expiry_panics_do_not_kill_the_expirer() {
        let service = TimeoutService::new();
        service.start();
        let fired = Arc::new(AtomicUsize::new(0));

        service.schedule_in(Duration::from_millis(10), || panic!("boom"));
        let counter = Arc::clone(&fired);
        service.schedule_in(Duration::from_millis(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        service.shutdown();
    }
}
