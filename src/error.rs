//! Error types for the fault-isolation runtime.

use std::error::Error;
use std::fmt::{self, Display, Formatter};

use crate::class::Reason;

/// Result type for guard-rail operations.
pub type RailResult<T> = Result<T, RailError>;

/// Boxed error payload carried by failed actions.
pub type ActionError = Box<dyn Error + Send + Sync>;

/// Error type for guard-rail operations.
#[derive(Debug, Clone)]
pub enum RailError {
    /// Admission was denied by back-pressure.
    Rejected(RejectReason),

    /// The action did not complete within its deadline.
    Timeout,

    /// A completion used an outcome outside the rail's result class.
    InvalidResult {
        /// Name of the outcome that was submitted.
        submitted: String,
        /// Rendered list of the valid outcomes, e.g. `[success, error]`.
        valid: String,
    },
}

impl RailError {
    pub(crate) fn invalid_result(submitted: &str, valid: String) -> Self {
        RailError::InvalidResult {
            submitted: submitted.to_string(),
            valid,
        }
    }
}

impl Display for RailError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RailError::Rejected(reason) => write!(f, "acquire rejected: {}", reason),
            RailError::Timeout => write!(f, "action timed out"),
            RailError::InvalidResult { submitted, valid } => {
                write!(f, "Invalid result '{}'; Valid results are {}", submitted, valid)
            }
        }
    }
}

impl Error for RailError {}

/// Why a future was rejected before any work ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// A back-pressure gate denied the acquire with a class reason.
    Gate(Reason),

    /// The executor was shut down; reserved, never part of a rejection class.
    ExecutorShutdown,
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Gate(reason) => f.write_str(reason.name()),
            RejectReason::ExecutorShutdown => f.write_str("executor-shutdown"),
        }
    }
}

/// Error payload delivered when a timeout cancels an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutError;

impl Display for TimeoutError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("action timed out")
    }
}

impl Error for TimeoutError {}
