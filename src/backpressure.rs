//! The gate trait every back-pressure mechanism implements.

use crate::class::{Outcome, Reason};

/// A gate that can deny an acquire with a structured reason.
///
/// Gates are registered on a guard rail in order; acquire walks them
/// forward and release walks them in reverse. All methods are
/// non-blocking.
pub trait BackPressure: Send + Sync + 'static {
    /// Attempts to reserve `permits` at monotonic time `now_nanos`.
    fn try_acquire(&self, permits: u64, now_nanos: u64) -> Result<(), Reason>;

    /// Returns `permits` reserved by a successful [`try_acquire`].
    ///
    /// [`try_acquire`]: BackPressure::try_acquire
    fn release(&self, permits: u64, now_nanos: u64) {
        let _ = (permits, now_nanos);
    }

    /// Observes the outcome of a completed operation.
    ///
    /// Called by the rail on every release-with-result; raw permit
    /// releases do not reach this hook.
    fn inform(&self, outcome: &Outcome, now_nanos: u64) {
        let _ = (outcome, now_nanos);
    }
}
