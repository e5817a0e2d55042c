//! Clock abstractions used by counters, breakers, and the timeout service.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
///
/// Monotonic nanos drive permit accounting, rolling counters, and breaker
/// backoff; wall millis exist only for display and log correlation.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic nanoseconds since an arbitrary per-clock anchor.
    fn now_nanos(&self) -> u64;

    /// Wall-clock milliseconds since the Unix epoch.
    fn wall_millis(&self) -> u64;
}

/// Monotonic clock backed by `Instant::now()`.
///
/// Resets when the process restarts; all timestamps produced by one
/// `SystemClock` instance are mutually comparable.
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl SystemClock {
    /// Creates a clock anchored at the current instant.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now_nanos(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn wall_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// Hand-cranked clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Creates a clock pinned at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a clock pinned at `nanos`.
    pub fn at_nanos(nanos: u64) -> Self {
        Self {
            nanos: AtomicU64::new(nanos),
        }
    }

    /// Sets the current time.
    pub fn set_nanos(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::Release);
    }

    /// Advances the current time by `delta` nanoseconds.
    pub fn advance_nanos(&self, delta: u64) {
        self.nanos.fetch_add(delta, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::Acquire)
    }

    fn wall_millis(&self) -> u64 {
        self.nanos.load(Ordering::Acquire) / 1_000_000
    }
}
