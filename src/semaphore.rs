//! Semaphore gate for concurrency limiting.
//!
//! A non-blocking permit counter: acquires CAS the in-use count and never
//! wait, rejections carry the reason configured at construction.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::backpressure::BackPressure;
use crate::class::Reason;

/// A semaphore-based gate that caps concurrent permits through a rail.
#[derive(Debug)]
pub struct SemaphoreGate {
    max: u64,
    in_use: AtomicU64,
    reason: Reason,
}

impl SemaphoreGate {
    /// Creates a gate admitting at most `max` concurrent permits,
    /// rejecting with `reason` once full.
    ///
    /// # Panics
    ///
    /// Panics if `max` is 0.
    pub fn new(max: u64, reason: Reason) -> Self {
        assert!(max > 0, "semaphore capacity must be greater than 0");
        Self {
            max,
            in_use: AtomicU64::new(0),
            reason,
        }
    }

    /// Maximum concurrent permits.
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Currently reserved permits.
    pub fn in_use(&self) -> u64 {
        self.in_use.load(Ordering::Acquire)
    }

    /// Permits still available.
    pub fn available(&self) -> u64 {
        self.max.saturating_sub(self.in_use())
    }
}

impl BackPressure for SemaphoreGate {
    fn try_acquire(&self, permits: u64, _now_nanos: u64) -> Result<(), Reason> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            if current + permits > self.max {
                return Err(self.reason.clone());
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + permits,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, permits: u64, _now_nanos: u64) {
        let previous = self.in_use.fetch_sub(permits, Ordering::AcqRel);
        debug_assert!(previous >= permits, "semaphore release underflow");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::RejectionClass;
    use std::sync::Arc;
    use std::thread;

    fn gate(max: u64) -> SemaphoreGate {
        let class = RejectionClass::builder().reason("max-concurrency").build();
        SemaphoreGate::new(max, class.reason("max-concurrency").unwrap())
    }

    #[test]
    fn acquire_and_release_track_in_use() {
        let gate = gate(3);
        assert_eq!(gate.available(), 3);

        gate.try_acquire(1, 0).unwrap();
        gate.try_acquire(2, 0).unwrap();
        assert_eq!(gate.in_use(), 3);
        assert_eq!(gate.available(), 0);

        gate.release(2, 0);
        assert_eq!(gate.in_use(), 1);
    }

    #[test]
    fn at_capacity_rejects_with_the_configured_reason() {
        let gate = gate(2);
        gate.try_acquire(2, 0).unwrap();

        let reason = gate.try_acquire(1, 0).unwrap_err();
        assert_eq!(reason.name(), "max-concurrency");

        // One below capacity admits exactly one more.
        gate.release(1, 0);
        gate.try_acquire(1, 0).unwrap();
        assert!(gate.try_acquire(1, 0).is_err());
    }

    #[test]
    fn bulk_acquire_never_overshoots() {
        let gate = gate(5);
        gate.try_acquire(3, 0).unwrap();
        assert!(gate.try_acquire(3, 0).is_err());
        gate.try_acquire(2, 0).unwrap();
        assert_eq!(gate.in_use(), 5);
    }

    #[test]
    #[should_panic(expected = "semaphore capacity must be greater than 0")]
    fn zero_capacity_is_rejected() {
        gate(0);
    }

    #[test]
    fn concurrent_acquires_respect_the_cap() {
        let gate = Arc::new(gate(5));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let gate = Arc::clone(&gate);
            handles.push(thread::spawn(move || gate.try_acquire(1, 0).is_ok()));
        }
        let acquired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        // Nothing is released, so exactly the cap's worth of acquires win.
        assert_eq!(acquired, 5);
        assert_eq!(gate.in_use(), 5);
    }
}
