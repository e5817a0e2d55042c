//! Per-outcome latency recording with percentile queries.
//!
//! A log-linear histogram per class member: values below `2^sub_bits` get
//! exact buckets, larger values share buckets of bounded relative error
//! set by the significant-digits knob. All cells are atomics; recording is
//! wait-free and queries are approximate snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::class::{Outcome, ResultClass};

struct Histo {
    counts: Box<[AtomicU64]>,
    total: AtomicU64,
    max: AtomicU64,
}

/// Records latencies per outcome and answers percentile/max queries.
///
/// Capacity is fixed at construction: values above `max_value` are clamped
/// into the top bucket.
pub struct LatencyRecorder {
    class: ResultClass,
    max_value: u64,
    sub_bits: u32,
    bucket_count: usize,
    histos: Box<[Histo]>,
}

impl LatencyRecorder {
    /// Creates a recorder tracking values up to `max_value` with
    /// `significant_digits` decimal digits of resolution (1 to 3).
    ///
    /// # Panics
    ///
    /// Panics if `significant_digits` is outside 1..=3 or `max_value` is 0.
    pub fn new(class: &ResultClass, max_value: u64, significant_digits: u8) -> Self {
        assert!(
            (1..=3).contains(&significant_digits),
            "significant digits must be 1 to 3"
        );
        assert!(max_value > 0, "max trackable value must be positive");
        // ceil(digits * log2(10)) bits of sub-bucket resolution.
        let sub_bits = match significant_digits {
            1 => 4,
            2 => 7,
            _ => 10,
        };
        let sub_count = 1u64 << sub_bits;
        let bits = 64 - max_value.leading_zeros();
        let tiers = bits.saturating_sub(sub_bits) as usize;
        let bucket_count = sub_count as usize + tiers * (sub_count / 2) as usize;
        let histos = (0..class.len())
            .map(|_| Histo {
                counts: (0..bucket_count).map(|_| AtomicU64::new(0)).collect(),
                total: AtomicU64::new(0),
                max: AtomicU64::new(0),
            })
            .collect();
        Self {
            class: class.clone(),
            max_value,
            sub_bits,
            bucket_count,
            histos,
        }
    }

    /// The result class this recorder indexes.
    pub fn class(&self) -> &ResultClass {
        &self.class
    }

    /// Records one latency observation for `outcome`.
    ///
    /// Observations for a foreign class are ignored (debug builds assert).
    pub fn record(&self, outcome: &Outcome, value: u64) {
        if !self.class.contains(outcome) {
            debug_assert!(false, "outcome '{}' is not in this class", outcome);
            return;
        }
        let clamped = value.min(self.max_value);
        let histo = &self.histos[outcome.index()];
        histo.counts[self.index_for(clamped)].fetch_add(1, Ordering::Relaxed);
        histo.total.fetch_add(1, Ordering::Relaxed);
        histo.max.fetch_max(clamped, Ordering::Relaxed);
    }

    /// Number of observations recorded for `outcome`.
    pub fn count(&self, outcome: &Outcome) -> u64 {
        if !self.class.contains(outcome) {
            return 0;
        }
        self.histos[outcome.index()].total.load(Ordering::Relaxed)
    }

    /// Largest observed value for `outcome`, if any were recorded.
    pub fn max(&self, outcome: &Outcome) -> Option<u64> {
        if self.count(outcome) == 0 {
            None
        } else {
            Some(self.histos[outcome.index()].max.load(Ordering::Relaxed))
        }
    }

    /// Value at the given percentile (0 to 100) for `outcome`, if any
    /// observations were recorded. Reported at bucket precision.
    pub fn percentile(&self, outcome: &Outcome, percentile: f64) -> Option<u64> {
        if !self.class.contains(outcome) {
            return None;
        }
        let histo = &self.histos[outcome.index()];
        let total = histo.total.load(Ordering::Relaxed);
        if total == 0 {
            return None;
        }
        let rank = ((percentile / 100.0) * total as f64).ceil().max(1.0) as u64;
        let mut cumulative = 0;
        for (index, count) in histo.counts.iter().enumerate() {
            cumulative += count.load(Ordering::Relaxed);
            if cumulative >= rank {
                return Some(self.upper_bound(index).min(self.max_value));
            }
        }
        Some(self.max_value)
    }

    fn index_for(&self, value: u64) -> usize {
        let sub_count = 1u64 << self.sub_bits;
        if value < sub_count {
            return value as usize;
        }
        let bits = 64 - value.leading_zeros();
        let shift = bits - self.sub_bits;
        let scaled = value >> shift;
        let index = sub_count
            + u64::from(shift - 1) * (sub_count / 2)
            + (scaled - sub_count / 2);
        (index as usize).min(self.bucket_count - 1)
    }

    fn upper_bound(&self, index: usize) -> u64 {
        let sub_count = 1u64 << self.sub_bits;
        let index = index as u64;
        if index < sub_count {
            return index;
        }
        let relative = index - sub_count;
        let shift = relative / (sub_count / 2) + 1;
        let position = relative % (sub_count / 2);
        ((sub_count / 2 + position + 1) << shift) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class() -> ResultClass {
        ResultClass::builder()
            .success("success")
            .failure("error")
            .build()
    }

    #[test]
    fn small_values_are_exact() {
        let class = class();
        let recorder = LatencyRecorder::new(&class, 1_000_000, 2);
        let success = class.outcome("success").unwrap();

        for v in [3, 3, 7] {
            recorder.record(&success, v);
        }
        assert_eq!(recorder.count(&success), 3);
        assert_eq!(recorder.max(&success), Some(7));
        assert_eq!(recorder.percentile(&success, 50.0), Some(3));
        assert_eq!(recorder.percentile(&success, 100.0), Some(7));
    }

    #[test]
    fn large_values_keep_relative_precision() {
        let class = class();
        let recorder = LatencyRecorder::new(&class, 10_000_000_000, 2);
        let success = class.outcome("success").unwrap();

        recorder.record(&success, 1_000_000);
        let p100 = recorder.percentile(&success, 100.0).unwrap();
        let error = (p100 as f64 - 1_000_000.0).abs() / 1_000_000.0;
        assert!(error < 0.01, "relative error {error} too large");
    }

    #[test]
    fn values_above_capacity_are_clamped() {
        let class = class();
        let recorder = LatencyRecorder::new(&class, 1_000, 2);
        let error = class.outcome("error").unwrap();

        recorder.record(&error, 50_000);
        assert_eq!(recorder.max(&error), Some(1_000));
        assert!(recorder.percentile(&error, 99.0).unwrap() <= 1_000);
    }

    #[test]
    fn outcomes_record_independently() {
        let class = class();
        let recorder = LatencyRecorder::new(&class, 1_000_000, 2);
        let success = class.outcome("success").unwrap();
        let error = class.outcome("error").unwrap();

        recorder.record(&success, 10);
        assert_eq!(recorder.count(&error), 0);
        assert_eq!(recorder.percentile(&error, 50.0), None);
        assert_eq!(recorder.max(&error), None);
    }

    #[test]
    fn percentile_walks_the_distribution() {
        let class = class();
        let recorder = LatencyRecorder::new(&class, 1_000_000, 2);
        let success = class.outcome("success").unwrap();

        for v in 1..=100 {
            recorder.record(&success, v);
        }
        assert_eq!(recorder.percentile(&success, 50.0), Some(50));
        assert_eq!(recorder.percentile(&success, 90.0), Some(90));
        assert_eq!(recorder.percentile(&success, 100.0), Some(100));
    }
}
