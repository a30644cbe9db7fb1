//! Error types for the decision engine
//!
//! Only `EngineError` ever reaches the caller of a cycle. Predictor and statistics
//! errors are recovered locally by the component that observes them.

use thiserror::Error;

/// Hard errors surfaced to the caller of an evaluation cycle
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// A regime label without a threshold policy (or one that does not parse)
    #[error("unknown regime: {0}")]
    UnknownRegime(String),

    /// Caller supplied an input that cannot be evaluated
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Failure of a single ensemble member; excludes the member for one cycle
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PredictorError {
    #[error("predictor {name} failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("predictor {name} returned a non-finite value")]
    NonFinite { name: String },

    #[error("predictor {name} returned {field}={value} outside its range")]
    OutOfRange {
        name: String,
        field: &'static str,
        value: f64,
    },

    #[error("predictor {name} timed out after {timeout_ms}ms")]
    TimedOut { name: String, timeout_ms: u64 },
}

/// Errors from the risk & statistics library
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StatsError {
    #[error("insufficient data: need {needed}, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}
