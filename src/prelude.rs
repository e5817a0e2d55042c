//! Re-exports common types for convenient usage.
//!
//! # Example
//! ```rust,no_run
//! use guardrail_rs::prelude::*;
//! ```

pub use crate::{
    CircuitBreaker, GuardRail, OutcomeMap, RailFuture, RejectionClass, ResultClass, SemaphoreGate,
    ThreadPoolExecutor, TimeoutService,
};
