//! The guard rail: one acquire/release surface around an operation.
//!
//! A rail composes an ordered list of back-pressure gates with typed
//! counters and an optional latency recorder. Acquire walks the gates
//! forward and commits only when all admit; release-with-result drives
//! metrics and gate observers exactly once per completed operation.

use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;
use tracing::trace;

use crate::backpressure::BackPressure;
use crate::class::{Outcome, Reason, RejectionClass, ResultClass};
use crate::clock::{Clock, SystemClock};
use crate::counters::{RejectedCounts, RollingCounts};
use crate::latency::LatencyRecorder;
use crate::promise::{Completable, ExecutionContext, RailPromise};

const DEFAULT_WINDOW: Duration = Duration::from_secs(10);
const DEFAULT_SLOTS: usize = 10;

struct NamedGate {
    name: Arc<str>,
    gate: Arc<dyn BackPressure>,
}

struct RailInner {
    name: Arc<str>,
    result_class: ResultClass,
    rejected_class: RejectionClass,
    result_counts: Arc<RollingCounts>,
    rejected_counts: Arc<RejectedCounts>,
    latency: Option<Arc<LatencyRecorder>>,
    gates: SmallVec<[NamedGate; 2]>,
    clock: Arc<dyn Clock>,
}

/// Proof of a successful acquire: the permit count and start timestamp.
///
/// Not clonable, so the manual release path structurally releases at most
/// once.
#[derive(Debug)]
pub struct Acquired {
    permits: u64,
    start_nanos: u64,
}

impl Acquired {
    /// Permits reserved by the acquire.
    pub fn permits(&self) -> u64 {
        self.permits
    }

    /// Monotonic time at which the permits were reserved.
    pub fn start_nanos(&self) -> u64 {
        self.start_nanos
    }
}

/// A guard rail protecting one downstream dependency.
///
/// Cheap to clone; clones share all state.
pub struct GuardRail {
    inner: Arc<RailInner>,
}

impl Clone for GuardRail {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl GuardRail {
    /// Starts building a rail over the given result and rejection classes.
    pub fn builder(
        name: &str,
        result_class: ResultClass,
        rejected_class: RejectionClass,
    ) -> GuardRailBuilder {
        GuardRailBuilder {
            name: Arc::from(name),
            result_class,
            rejected_class,
            result_counts: None,
            rejected_counts: None,
            latency: None,
            gates: SmallVec::new(),
            clock: None,
        }
    }

    /// The rail's name, used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The closed set of outcomes operations complete with.
    pub fn result_class(&self) -> &ResultClass {
        &self.inner.result_class
    }

    /// The closed set of reasons acquires are rejected with.
    pub fn rejected_class(&self) -> &RejectionClass {
        &self.inner.rejected_class
    }

    /// The rail's result counter.
    pub fn result_counts(&self) -> &Arc<RollingCounts> {
        &self.inner.result_counts
    }

    /// The rail's rejection counter.
    pub fn rejected_counts(&self) -> &Arc<RejectedCounts> {
        &self.inner.rejected_counts
    }

    /// The rail's latency recorder, when one was configured.
    pub fn latency(&self) -> Option<&Arc<LatencyRecorder>> {
        self.inner.latency.as_ref()
    }

    /// Current monotonic time on the rail's clock.
    pub fn now_nanos(&self) -> u64 {
        self.inner.clock.now_nanos()
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Attempts to reserve `permits` against every gate in registration
    /// order.
    ///
    /// The first gate to reject wins: earlier gates are rolled back, the
    /// rejection counter is bumped, and no permits stay reserved.
    ///
    /// # Errors
    ///
    /// The rejecting gate's [`Reason`].
    pub fn acquire(&self, permits: u64) -> Result<Acquired, Reason> {
        let now = self.inner.clock.now_nanos();
        for (index, gate) in self.inner.gates.iter().enumerate() {
            if let Err(reason) = gate.gate.try_acquire(permits, now) {
                for rollback in self.inner.gates[..index].iter().rev() {
                    rollback.gate.release(permits, now);
                }
                trace!(
                    rail = %self.inner.name,
                    gate = %gate.name,
                    %reason,
                    "acquire rejected"
                );
                self.inner.rejected_counts.add(&reason, 1, now);
                return Err(reason);
            }
        }
        Ok(Acquired {
            permits,
            start_nanos: now,
        })
    }

    /// Acquires and binds the permits to a multi-writer promise whose
    /// completion releases them exactly once.
    ///
    /// # Errors
    ///
    /// The rejecting gate's [`Reason`].
    pub fn acquire_promise<T>(&self, permits: u64) -> Result<RailPromise<T>, Reason> {
        let acquired = self.acquire(permits)?;
        Ok(RailPromise::with_context(
            self.inner.result_class.clone(),
            ExecutionContext {
                rail: self.clone(),
                permits: acquired.permits,
                start_nanos: acquired.start_nanos,
            },
        ))
    }

    /// Acquires and binds the permits to a single-writer completable
    /// whose completion releases them exactly once.
    ///
    /// # Errors
    ///
    /// The rejecting gate's [`Reason`].
    pub fn acquire_completable<T>(&self, permits: u64) -> Result<Completable<T>, Reason> {
        let acquired = self.acquire(permits)?;
        Ok(Completable::with_context(
            self.inner.result_class.clone(),
            ExecutionContext {
                rail: self.clone(),
                permits: acquired.permits,
                start_nanos: acquired.start_nanos,
            },
        ))
    }

    /// Releases permits with the operation's outcome: bumps the result
    /// counter, records latency, informs every gate in reverse order, then
    /// returns the permits.
    ///
    /// # Panics
    ///
    /// Panics if `outcome` is not in the rail's result class. The
    /// promise-completion path validates before it gets here.
    pub fn release_with_result(&self, acquired: Acquired, outcome: &Outcome) {
        assert!(
            self.inner.result_class.contains(outcome),
            "Invalid result '{}'; Valid results are {}",
            outcome.name(),
            self.inner.result_class.member_list()
        );
        self.release_completion(acquired.permits, acquired.start_nanos, outcome);
    }

    /// Releases permits with no outcome: no counters, no latency, no gate
    /// observers.
    pub fn release_without_result(&self, acquired: Acquired) {
        self.release_raw_permits(acquired.permits);
    }

    /// Returns `permits` to every gate in reverse order, bypassing all
    /// accounting. The breaker is deliberately not informed.
    pub fn release_raw_permits(&self, permits: u64) {
        let now = self.inner.clock.now_nanos();
        for gate in self.inner.gates.iter().rev() {
            gate.gate.release(permits, now);
        }
    }

    /// Metric-and-observer release used by the promise completion hook;
    /// the outcome has already been validated against the result class.
    pub(crate) fn release_completion(&self, permits: u64, start_nanos: u64, outcome: &Outcome) {
        let now = self.inner.clock.now_nanos();
        self.inner.result_counts.add(outcome, 1, now);
        if let Some(latency) = &self.inner.latency {
            latency.record(outcome, now.saturating_sub(start_nanos));
        }
        for gate in self.inner.gates.iter().rev() {
            gate.gate.inform(outcome, now);
        }
        for gate in self.inner.gates.iter().rev() {
            gate.gate.release(permits, now);
        }
        trace!(
            rail = %self.inner.name,
            %outcome,
            latency_nanos = now.saturating_sub(start_nanos),
            "released"
        );
    }
}

/// Builder for [`GuardRail`]. Gate registration order is admission order.
pub struct GuardRailBuilder {
    name: Arc<str>,
    result_class: ResultClass,
    rejected_class: RejectionClass,
    result_counts: Option<Arc<RollingCounts>>,
    rejected_counts: Option<Arc<RejectedCounts>>,
    latency: Option<Arc<LatencyRecorder>>,
    gates: SmallVec<[NamedGate; 2]>,
    clock: Option<Arc<dyn Clock>>,
}

impl GuardRailBuilder {
    /// Uses `counts` as the rail's result counter. Share the same `Arc`
    /// with a breaker built over this rail.
    pub fn result_counts(mut self, counts: Arc<RollingCounts>) -> Self {
        self.result_counts = Some(counts);
        self
    }

    /// Uses `counts` as the rail's rejection counter.
    pub fn rejected_counts(mut self, counts: Arc<RejectedCounts>) -> Self {
        self.rejected_counts = Some(counts);
        self
    }

    /// Records per-outcome latency into `recorder`.
    pub fn latency(mut self, recorder: Arc<LatencyRecorder>) -> Self {
        self.latency = Some(recorder);
        self
    }

    /// Overrides the rail's clock. Defaults to a [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Appends a named back-pressure gate. Acquire walks gates in this
    /// order; release and inform walk them in reverse.
    pub fn add_back_pressure<B: BackPressure>(mut self, name: &str, gate: Arc<B>) -> Self {
        self.gates.push(NamedGate {
            name: Arc::from(name),
            gate,
        });
        self
    }

    /// Builds the immutable rail.
    ///
    /// # Panics
    ///
    /// Panics if a supplied counter or recorder indexes a different class
    /// than the rail's.
    pub fn build(self) -> GuardRail {
        let result_counts = self.result_counts.unwrap_or_else(|| {
            Arc::new(RollingCounts::new(
                &self.result_class,
                DEFAULT_WINDOW,
                DEFAULT_SLOTS,
            ))
        });
        let rejected_counts = self.rejected_counts.unwrap_or_else(|| {
            Arc::new(RejectedCounts::new(
                &self.rejected_class,
                DEFAULT_WINDOW,
                DEFAULT_SLOTS,
            ))
        });
        assert!(
            result_counts.class().id() == self.result_class.id(),
            "result counter indexes a different result class"
        );
        assert!(
            rejected_counts.class().id() == self.rejected_class.id(),
            "rejected counter indexes a different rejection class"
        );
        if let Some(latency) = &self.latency {
            assert!(
                latency.class().id() == self.result_class.id(),
                "latency recorder indexes a different result class"
            );
        }
        GuardRail {
            inner: Arc::new(RailInner {
                name: self.name,
                result_class: self.result_class,
                rejected_class: self.rejected_class,
                result_counts,
                rejected_counts,
                latency: self.latency,
                gates: self.gates,
                clock: self
                    .clock
                    .unwrap_or_else(|| Arc::new(SystemClock::new())),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semaphore::SemaphoreGate;

    fn classes() -> (ResultClass, RejectionClass) {
        (
            ResultClass::builder()
                .success("success")
                .failure("error")
                .failure("timeout")
                .build(),
            RejectionClass::builder()
                .reason("max-concurrency")
                .reason("circuit-open")
                .build(),
        )
    }

    fn rail_with_semaphore(max: u64) -> (GuardRail, Arc<SemaphoreGate>) {
        let (results, rejections) = classes();
        let gate = Arc::new(SemaphoreGate::new(
            max,
            rejections.reason("max-concurrency").unwrap(),
        ));
        let rail = GuardRail::builder("test-rail", results, rejections)
            .add_back_pressure("semaphore", Arc::clone(&gate))
            .build();
        (rail, gate)
    }

    #[test]
    fn acquire_then_raw_release_restores_the_semaphore() {
        let (rail, gate) = rail_with_semaphore(5);
        let acquired = rail.acquire(3).unwrap();
        assert_eq!(gate.in_use(), 3);
        rail.release_raw_permits(acquired.permits());
        assert_eq!(gate.in_use(), 0);
    }

    #[test]
    fn rejection_updates_only_the_rejection_counter() {
        let (rail, _gate) = rail_with_semaphore(2);
        let _held = rail.acquire(2).unwrap();

        let reason = rail.acquire(1).unwrap_err();
        assert_eq!(reason.name(), "max-concurrency");

        let now = rail.now_nanos();
        let period = Duration::from_secs(10);
        assert_eq!(rail.rejected_counts().count_for(&reason, period, now), 1);
        assert_eq!(rail.result_counts().total_for(period, now), 0);
    }

    #[test]
    fn release_with_result_counts_exactly_one_outcome() {
        let (rail, gate) = rail_with_semaphore(5);
        let success = rail.result_class().outcome("success").unwrap();

        let acquired = rail.acquire(1).unwrap();
        rail.release_with_result(acquired, &success);

        assert_eq!(gate.in_use(), 0);
        let now = rail.now_nanos();
        assert_eq!(
            rail.result_counts()
                .count_for(&success, Duration::from_secs(10), now),
            1
        );
    }

    #[test]
    #[should_panic(expected = "Invalid result")]
    fn foreign_outcome_on_manual_release_panics() {
        let (rail, _gate) = rail_with_semaphore(5);
        let other = ResultClass::builder().success("ok").build();
        let acquired = rail.acquire(1).unwrap();
        rail.release_with_result(acquired, &other.outcome("ok").unwrap());
    }

    #[test]
    fn first_rejecting_gate_rolls_back_earlier_gates() {
        let (results, rejections) = classes();
        let first = Arc::new(SemaphoreGate::new(
            10,
            rejections.reason("max-concurrency").unwrap(),
        ));
        let second = Arc::new(SemaphoreGate::new(
            1,
            rejections.reason("circuit-open").unwrap(),
        ));
        let rail = GuardRail::builder("layered", results, rejections)
            .add_back_pressure("wide", Arc::clone(&first))
            .add_back_pressure("narrow", Arc::clone(&second))
            .build();

        let _held = rail.acquire(1).unwrap();
        let reason = rail.acquire(1).unwrap_err();
        assert_eq!(reason.name(), "circuit-open");
        // The wide gate's reservation from the failed acquire was undone.
        assert_eq!(first.in_use(), 1);
        assert_eq!(second.in_use(), 1);
    }

    #[test]
    fn promise_completion_releases_exactly_once() {
        let (rail, gate) = rail_with_semaphore(5);
        let success = rail.result_class().outcome("success").unwrap();

        let promise = rail.acquire_promise::<u32>(1).unwrap();
        assert_eq!(gate.in_use(), 1);

        assert!(promise.complete(success.clone(), 1).unwrap());
        assert_eq!(gate.in_use(), 0);

        // The losing duplicate completion must not double-release.
        assert!(!promise.complete(success.clone(), 2).unwrap());
        assert_eq!(gate.in_use(), 0);
        let now = rail.now_nanos();
        assert_eq!(
            rail.result_counts()
                .count_for(&success, Duration::from_secs(10), now),
            1
        );
    }

    #[test]
    fn completable_routes_latency_to_the_outcome() {
        let (results, rejections) = classes();
        let clock = Arc::new(crate::clock::ManualClock::at_nanos(1_000));
        let latency = Arc::new(LatencyRecorder::new(&results, 1_000_000_000, 2));
        let gate = Arc::new(SemaphoreGate::new(
            5,
            rejections.reason("max-concurrency").unwrap(),
        ));
        let rail = GuardRail::builder("latency-rail", results.clone(), rejections)
            .latency(Arc::clone(&latency))
            .clock(clock.clone())
            .add_back_pressure("semaphore", gate)
            .build();

        let error = results.outcome("error").unwrap();
        let completable = rail.acquire_completable::<u32>(1).unwrap();
        clock.advance_nanos(5_000);
        completable
            .complete_with_error(error.clone(), Box::new(crate::error::TimeoutError))
            .unwrap();

        assert_eq!(latency.count(&error), 1);
        assert_eq!(latency.max(&error), Some(5_000));
    }
}
