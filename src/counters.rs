//! Rolling per-outcome counters bucketed by time window.
//!
//! Each class member gets a ring of fixed-width buckets. Writers CAS the
//! bucket they land in; stale buckets are recycled lazily on write. Reads
//! aggregate every bucket whose window intersects the queried interval and
//! are approximate under concurrent recycling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::class::{Outcome, Reason, RejectionClass, ResultClass};

/// Marker stored in `window_start` while a writer resets a bucket.
const RECYCLING: u64 = u64::MAX;

struct Bucket {
    window_start: AtomicU64,
    counts: Box<[AtomicU64]>,
}

struct Ring {
    members: usize,
    width_nanos: u64,
    buckets: Box<[Bucket]>,
}

impl Ring {
    fn new(members: usize, window: Duration, slots: usize) -> Self {
        assert!(slots > 0, "counter ring needs at least one slot");
        let window_nanos = u64::try_from(window.as_nanos()).unwrap_or(u64::MAX);
        let width_nanos = (window_nanos / slots as u64).max(1);
        let buckets = (0..slots)
            .map(|_| Bucket {
                window_start: AtomicU64::new(0),
                counts: (0..members).map(|_| AtomicU64::new(0)).collect(),
            })
            .collect();
        Self {
            members,
            width_nanos,
            buckets,
        }
    }

    fn add(&self, index: usize, n: u64, t: u64) {
        let start = t - (t % self.width_nanos);
        let slot = ((t / self.width_nanos) as usize) % self.buckets.len();
        let bucket = &self.buckets[slot];
        loop {
            let current = bucket.window_start.load(Ordering::Acquire);
            if current == RECYCLING {
                std::hint::spin_loop();
                continue;
            }
            if current == start {
                bucket.counts[index].fetch_add(n, Ordering::Relaxed);
                return;
            }
            if current < start {
                if bucket
                    .window_start
                    .compare_exchange(current, RECYCLING, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    for count in bucket.counts.iter() {
                        count.store(0, Ordering::Relaxed);
                    }
                    bucket.window_start.store(start, Ordering::Release);
                    bucket.counts[index].fetch_add(n, Ordering::Relaxed);
                    return;
                }
            } else {
                // The slot was recycled past this timestamp; the write is stale.
                return;
            }
        }
    }

    /// Calls `visit(member, count)` for every bucket intersecting
    /// `[t - period, t]`. Buckets mid-recycle are skipped.
    fn fold(&self, period: u64, t: u64, mut visit: impl FnMut(usize, u64)) {
        let from = t.saturating_sub(period);
        for bucket in self.buckets.iter() {
            let start = bucket.window_start.load(Ordering::Acquire);
            if start == RECYCLING {
                continue;
            }
            if start <= t && start + self.width_nanos > from {
                for (index, count) in bucket.counts.iter().enumerate() {
                    visit(index, count.load(Ordering::Relaxed));
                }
            }
        }
    }

    fn sum(&self, index: usize, period: u64, t: u64) -> u64 {
        let mut total = 0;
        self.fold(period, t, |i, n| {
            if i == index {
                total += n;
            }
        });
        total
    }
}

/// Failure/total view of a result counter over a trailing period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Count of failure-tagged outcomes observed in the period.
    pub failures: u64,
    /// Count of all outcomes observed in the period.
    pub total: u64,
}

impl HealthSnapshot {
    /// Fraction of observations that were failures; zero on no volume.
    pub fn failure_percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failures as f64 / self.total as f64
        }
    }
}

/// Rolling counts of completed-operation outcomes.
pub struct RollingCounts {
    class: ResultClass,
    ring: Ring,
}

impl RollingCounts {
    /// Creates a counter retaining roughly `window` of history across
    /// `slots` buckets.
    pub fn new(class: &ResultClass, window: Duration, slots: usize) -> Self {
        Self {
            class: class.clone(),
            ring: Ring::new(class.len(), window, slots),
        }
    }

    /// The result class this counter indexes.
    pub fn class(&self) -> &ResultClass {
        &self.class
    }

    /// Adds `n` observations of `outcome` at monotonic time `t`.
    ///
    /// Outcomes from a foreign class are ignored (debug builds assert).
    pub fn add(&self, outcome: &Outcome, n: u64, t: u64) {
        if !self.class.contains(outcome) {
            debug_assert!(false, "outcome '{}' is not in this class", outcome);
            return;
        }
        self.ring.add(outcome.index(), n, t);
    }

    /// Observations of `outcome` over the trailing `period` ending at `t`.
    pub fn count_for(&self, outcome: &Outcome, period: Duration, t: u64) -> u64 {
        if !self.class.contains(outcome) {
            return 0;
        }
        self.ring
            .sum(outcome.index(), duration_nanos(period), t)
    }

    /// All observations over the trailing `period` ending at `t`.
    pub fn total_for(&self, period: Duration, t: u64) -> u64 {
        let mut total = 0;
        self.ring.fold(duration_nanos(period), t, |_, n| total += n);
        total
    }

    /// Failure/total snapshot over the trailing `period` ending at `t`.
    pub fn health(&self, period: Duration, t: u64) -> HealthSnapshot {
        let mut snapshot = HealthSnapshot {
            failures: 0,
            total: 0,
        };
        self.ring.fold(duration_nanos(period), t, |index, n| {
            snapshot.total += n;
            if self.class.is_failure_index(index) {
                snapshot.failures += n;
            }
        });
        snapshot
    }
}

/// Rolling counts of denied acquires, by rejection reason.
pub struct RejectedCounts {
    class: RejectionClass,
    ring: Ring,
}

impl RejectedCounts {
    /// Creates a counter retaining roughly `window` of history across
    /// `slots` buckets.
    pub fn new(class: &RejectionClass, window: Duration, slots: usize) -> Self {
        Self {
            class: class.clone(),
            ring: Ring::new(class.len(), window, slots),
        }
    }

    /// The rejection class this counter indexes.
    pub fn class(&self) -> &RejectionClass {
        &self.class
    }

    /// Adds `n` rejections for `reason` at monotonic time `t`.
    ///
    /// Reasons from a foreign class are ignored (debug builds assert).
    pub fn add(&self, reason: &Reason, n: u64, t: u64) {
        if !self.class.contains(reason) {
            debug_assert!(false, "reason '{}' is not in this class", reason);
            return;
        }
        self.ring.add(reason.index(), n, t);
    }

    /// Rejections for `reason` over the trailing `period` ending at `t`.
    pub fn count_for(&self, reason: &Reason, period: Duration, t: u64) -> u64 {
        if !self.class.contains(reason) {
            return 0;
        }
        self.ring.sum(reason.index(), duration_nanos(period), t)
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MILLI: u64 = 1_000_000;

    fn class() -> ResultClass {
        ResultClass::builder()
            .success("success")
            .failure("error")
            .failure("timeout")
            .build()
    }

    #[test]
    fn counts_accumulate_within_a_window() {
        let class = class();
        let counts = RollingCounts::new(&class, Duration::from_secs(1), 10);
        let success = class.outcome("success").unwrap();
        let error = class.outcome("error").unwrap();

        counts.add(&success, 1, 10 * MILLI);
        counts.add(&success, 2, 20 * MILLI);
        counts.add(&error, 1, 30 * MILLI);

        let period = Duration::from_millis(500);
        assert_eq!(counts.count_for(&success, period, 40 * MILLI), 3);
        assert_eq!(counts.count_for(&error, period, 40 * MILLI), 1);
        assert_eq!(counts.total_for(period, 40 * MILLI), 4);
    }

    #[test]
    fn old_buckets_fall_out_of_the_read_interval() {
        let class = class();
        // 10 buckets of 100ms each.
        let counts = RollingCounts::new(&class, Duration::from_secs(1), 10);
        let error = class.outcome("error").unwrap();

        counts.add(&error, 5, 50 * MILLI);
        assert_eq!(
            counts.count_for(&error, Duration::from_millis(200), 150 * MILLI),
            5
        );
        // 400ms later the write's bucket no longer intersects a 200ms read.
        assert_eq!(
            counts.count_for(&error, Duration::from_millis(200), 450 * MILLI),
            0
        );
    }

    #[test]
    fn buckets_are_recycled_on_wraparound() {
        let class = class();
        // 4 buckets of 25ms: the ring covers 100ms.
        let counts = RollingCounts::new(&class, Duration::from_millis(100), 4);
        let success = class.outcome("success").unwrap();

        counts.add(&success, 1, 10 * MILLI);
        // Same slot, one full revolution later: the old count must be gone.
        counts.add(&success, 1, 110 * MILLI);
        assert_eq!(
            counts.count_for(&success, Duration::from_millis(100), 110 * MILLI),
            1
        );
    }

    #[test]
    fn stale_writes_are_dropped() {
        let class = class();
        let counts = RollingCounts::new(&class, Duration::from_millis(100), 4);
        let success = class.outcome("success").unwrap();

        counts.add(&success, 1, 200 * MILLI);
        // An old timestamp mapping to an already-advanced slot is discarded.
        counts.add(&success, 7, 100 * MILLI);
        assert_eq!(
            counts.count_for(&success, Duration::from_millis(100), 200 * MILLI),
            1
        );
    }

    #[test]
    fn health_splits_failures_from_total() {
        let class = class();
        let counts = RollingCounts::new(&class, Duration::from_secs(1), 10);
        let success = class.outcome("success").unwrap();
        let error = class.outcome("error").unwrap();
        let timeout = class.outcome("timeout").unwrap();

        counts.add(&success, 6, 10 * MILLI);
        counts.add(&error, 3, 20 * MILLI);
        counts.add(&timeout, 1, 30 * MILLI);

        let health = counts.health(Duration::from_millis(500), 40 * MILLI);
        assert_eq!(health.failures, 4);
        assert_eq!(health.total, 10);
        assert!((health.failure_percentage() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn rejected_counts_track_by_reason() {
        let class = RejectionClass::builder()
            .reason("max-concurrency")
            .reason("circuit-open")
            .build();
        let counts = RejectedCounts::new(&class, Duration::from_secs(1), 10);
        let full = class.reason("max-concurrency").unwrap();
        let open = class.reason("circuit-open").unwrap();

        counts.add(&full, 2, 10 * MILLI);
        counts.add(&open, 1, 10 * MILLI);

        let period = Duration::from_millis(500);
        assert_eq!(counts.count_for(&full, period, 20 * MILLI), 2);
        assert_eq!(counts.count_for(&open, period, 20 * MILLI), 1);
    }

    #[test]
    fn concurrent_writers_do_not_lose_counts_in_one_window() {
        use std::sync::Arc;
        use std::thread;

        let class = class();
        let counts = Arc::new(RollingCounts::new(&class, Duration::from_secs(10), 10));
        let success = class.outcome("success").unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let counts = Arc::clone(&counts);
            let success = success.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1_000 {
                    counts.add(&success, 1, 50 * MILLI);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(
            counts.count_for(&success, Duration::from_secs(1), 60 * MILLI),
            4_000
        );
    }
}
