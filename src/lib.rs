//! # guardrail-rs
//!
//! A production-grade fault-isolation runtime for protecting callers from
//! slow or failing downstream dependencies.
//!
//! Every unit of work first acquires permits through an ordered chain of
//! back-pressure gates (semaphores, circuit breakers); completion reports
//! the outcome back through the rail, updating typed counters and latency
//! recorders and releasing permits exactly once. On top of the rail sit
//! two execution strategies: a bounded thread pool with armed timeouts,
//! and a single-coordinator scheduler loop.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod backpressure;
mod breaker;
mod class;
mod clock;
mod counters;
mod error;
mod executor;
mod future;
mod hook;
mod latency;
mod pool;
pub mod prelude;
mod promise;
mod rail;
mod scheduler;
mod semaphore;
mod state;
mod task;
mod timeout;

// Re-exports
pub use backpressure::BackPressure;
pub use breaker::{BreakerBuilder, BreakerConfig, CircuitBreaker};
pub use class::{
    Outcome, Reason, RejectionClass, RejectionClassBuilder, ResultClass, ResultClassBuilder,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use counters::{HealthSnapshot, RejectedCounts, RollingCounts};
pub use error::{ActionError, RailError, RailResult, RejectReason, TimeoutError};
pub use executor::ThreadPoolExecutor;
pub use future::RailFuture;
pub use hook::HookRegistry;
pub use latency::LatencyRecorder;
pub use promise::{Completable, Completion, CompletionValue, RailPromise};
pub use rail::{Acquired, GuardRail, GuardRailBuilder};
pub use scheduler::{
    ScheduleContext, ScheduleContextBuilder, Scheduler, SchedulerHandle,
};
pub use semaphore::SemaphoreGate;
pub use state::State;
pub use task::{CancelHandle, CancellableTask, OutcomeMap};
pub use timeout::TimeoutService;
