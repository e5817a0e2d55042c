//! Core circuit breaker implementation.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::debug;

use crate::backpressure::BackPressure;
use crate::class::{Outcome, Reason};
use crate::counters::{HealthSnapshot, RollingCounts};
use crate::hook::HookRegistry;
use crate::state::{State, StateManager};

/// Thresholds and windows driving breaker transitions.
///
/// Held behind an atomic reference inside the breaker, so a running
/// breaker can swap configs without pausing traffic.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Rolling window the health snapshot reads.
    pub trailing_period: Duration,
    /// Absolute failure count that trips the breaker (strictly greater).
    pub failure_threshold: u64,
    /// Failure fraction (0.0 to 1.0) that trips the breaker.
    pub failure_percentage_threshold: f64,
    /// Minimum volume in the window before the percentage applies.
    pub sample_size_threshold: u64,
    /// How long the breaker stays open before admitting a probe.
    pub backoff_time: Duration,
    /// How long a health snapshot may be served from cache.
    pub health_refresh_interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            trailing_period: Duration::from_secs(5),
            failure_threshold: 20,
            failure_percentage_threshold: 0.5,
            sample_size_threshold: 10,
            backoff_time: Duration::from_secs(30),
            health_refresh_interval: Duration::from_millis(100),
        }
    }
}

struct HealthCache {
    read_at_nanos: u64,
    snapshot: HealthSnapshot,
    valid: bool,
}

/// A circuit breaker gate driven by a rail's result counter.
///
/// Registered on a guard rail as back-pressure, it rejects while open and
/// observes every release-with-result to decide transitions.
pub struct CircuitBreaker {
    state: StateManager,
    config: ArcSwap<BreakerConfig>,
    counts: Arc<RollingCounts>,
    reason: Reason,
    health_cache: Mutex<HealthCache>,
    hooks: Arc<HookRegistry>,
}

impl CircuitBreaker {
    /// Creates a builder over the counter the breaker samples and the
    /// reason it rejects with while open.
    pub fn builder(counts: Arc<RollingCounts>, reason: Reason) -> BreakerBuilder {
        BreakerBuilder {
            counts,
            reason,
            config: BreakerConfig::default(),
            hooks: Arc::new(HookRegistry::new()),
        }
    }

    /// Gets the current state of the circuit breaker.
    pub fn current_state(&self) -> State {
        self.state.current()
    }

    /// Returns the active configuration.
    pub fn config(&self) -> Arc<BreakerConfig> {
        self.config.load_full()
    }

    /// Replaces the configuration without interrupting traffic.
    pub fn update_config(&self, config: BreakerConfig) {
        debug!(?config, "circuit breaker config replaced");
        self.config.store(Arc::new(config));
    }

    /// Forces the breaker open, rejecting all acquires until the backoff
    /// elapses from `now_nanos`. Returns false if it was already open.
    pub fn force_open(&self, now_nanos: u64) -> bool {
        let previous = self.state.force(State::Open, now_nanos);
        if previous != State::Open {
            debug!(from = ?previous, "circuit breaker forced open");
            self.hooks.fire(State::Open);
            true
        } else {
            false
        }
    }

    /// Forces the breaker closed. Returns false if it was already closed.
    pub fn force_closed(&self) -> bool {
        let previous = self.state.force(State::Closed, 0);
        if previous != State::Closed {
            debug!(from = ?previous, "circuit breaker forced closed");
            self.hooks.fire(State::Closed);
            true
        } else {
            false
        }
    }

    /// Failure/total view the breaker would use at `now_nanos`, honoring
    /// the refresh-interval cache.
    pub fn health(&self, now_nanos: u64) -> HealthSnapshot {
        let config = self.config.load();
        self.sample_health(&config, now_nanos)
    }

    fn sample_health(&self, config: &BreakerConfig, now_nanos: u64) -> HealthSnapshot {
        let refresh_nanos =
            u64::try_from(config.health_refresh_interval.as_nanos()).unwrap_or(u64::MAX);
        let mut cache = self.health_cache.lock();
        if cache.valid && now_nanos.saturating_sub(cache.read_at_nanos) < refresh_nanos {
            return cache.snapshot;
        }
        let snapshot = self.counts.health(config.trailing_period, now_nanos);
        *cache = HealthCache {
            read_at_nanos: now_nanos,
            snapshot,
            valid: true,
        };
        snapshot
    }

    fn should_trip(&self, config: &BreakerConfig, snapshot: HealthSnapshot) -> bool {
        if snapshot.failures > config.failure_threshold {
            return true;
        }
        snapshot.total >= config.sample_size_threshold
            && snapshot.total > 0
            && snapshot.failure_percentage() >= config.failure_percentage_threshold
    }
}

impl BackPressure for CircuitBreaker {
    fn try_acquire(&self, _permits: u64, now_nanos: u64) -> Result<(), Reason> {
        match self.state.current() {
            State::Closed => Ok(()),
            State::Open => {
                let config = self.config.load();
                let backoff_nanos =
                    u64::try_from(config.backoff_time.as_nanos()).unwrap_or(u64::MAX);
                if now_nanos.saturating_sub(self.state.opened_at_nanos()) >= backoff_nanos
                    && self.state.attempt_half_open(now_nanos)
                {
                    debug!("circuit breaker half-open, probe admitted");
                    self.hooks.fire(State::HalfOpen);
                    Ok(())
                } else {
                    Err(self.reason.clone())
                }
            }
            // The single probe is in flight; everyone else is rejected.
            State::HalfOpen => Err(self.reason.clone()),
        }
    }

    fn inform(&self, outcome: &Outcome, now_nanos: u64) {
        if outcome.is_failure() {
            match self.state.current() {
                State::HalfOpen => {
                    if self.state.revert_to_open(now_nanos) {
                        debug!("probe failed, circuit breaker re-opened");
                        self.hooks.fire(State::Open);
                    }
                }
                State::Closed => {
                    let config = self.config.load();
                    let snapshot = self.sample_health(&config, now_nanos);
                    if self.should_trip(&config, snapshot)
                        && self.state.trip_open(now_nanos)
                    {
                        debug!(
                            failures = snapshot.failures,
                            total = snapshot.total,
                            "circuit breaker opened"
                        );
                        self.hooks.fire(State::Open);
                    }
                }
                State::Open => {}
            }
        } else if self.state.current() == State::HalfOpen && self.state.reset_closed(now_nanos) {
            debug!("probe succeeded, circuit breaker closed");
            self.hooks.fire(State::Closed);
        }
    }
}

/// Builder for creating circuit breakers with custom configurations.
pub struct BreakerBuilder {
    counts: Arc<RollingCounts>,
    reason: Reason,
    config: BreakerConfig,
    hooks: Arc<HookRegistry>,
}

impl BreakerBuilder {
    /// Sets the rolling window the health snapshot reads.
    pub fn trailing_period(mut self, period: Duration) -> Self {
        self.config.trailing_period = period;
        self
    }

    /// Sets the absolute failure count that trips the circuit
    /// (strictly greater than).
    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Sets the failure fraction (0.0 to 1.0) that trips the circuit.
    pub fn failure_percentage_threshold(mut self, threshold: f64) -> Self {
        self.config.failure_percentage_threshold = threshold;
        self
    }

    /// Sets the minimum window volume before the percentage applies.
    pub fn sample_size_threshold(mut self, threshold: u64) -> Self {
        self.config.sample_size_threshold = threshold;
        self
    }

    /// Sets how long the breaker stays open before admitting a probe.
    pub fn backoff_time(mut self, backoff: Duration) -> Self {
        self.config.backoff_time = backoff;
        self
    }

    /// Sets how long a health snapshot may be served from cache.
    pub fn health_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.health_refresh_interval = interval;
        self
    }

    /// Sets a hook registry for state-transition callbacks.
    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Builds the circuit breaker, initially closed.
    pub fn build(self) -> CircuitBreaker {
        CircuitBreaker {
            state: StateManager::new(),
            config: ArcSwap::from_pointee(self.config),
            counts: self.counts,
            reason: self.reason,
            health_cache: Mutex::new(HealthCache {
                read_at_nanos: 0,
                snapshot: HealthSnapshot {
                    failures: 0,
                    total: 0,
                },
                valid: false,
            }),
            hooks: self.hooks,
        }
    }
}
