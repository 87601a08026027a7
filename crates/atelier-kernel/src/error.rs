//! Engine error types.
//!
//! [`EngineError`] is the module-level error used across the refinement
//! pipeline; [`CoreError`] composes sub-module errors at the crate boundary
//! together with [`error_stack::Report`] for context-carrying propagation.

use thiserror::Error;

/// Result type used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Error kinds of the refinement pipeline.
///
/// The variants map onto the failure classes the orchestrator distinguishes:
/// validation failures propagate immediately, backend/storage failures are
/// retryable, judge parse failures drop a single evaluation, and the
/// cancelled/timeout kinds are non-error terminals.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input; never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Transient model-backend failure; handled by the retry wrapper.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Object-store failure; retryable like the backend kind.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A judge's response could not be parsed; that evaluation is dropped.
    #[error("Judge response parse failed: {0}")]
    JudgeParse(String),

    /// No image received any usable evaluation; fatal to the iteration.
    #[error("No usable evaluations: {0}")]
    AggregationEmpty(String),

    /// Cooperative cancellation observed; non-error terminal.
    #[error("Operation was cancelled")]
    Cancelled,

    /// The per-run wall-clock budget elapsed.
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Persistence-layer failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Anything else; marks the request FAILED.
    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Whether the retry wrapper should re-attempt the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Storage(_))
    }

    /// Whether this kind terminates a run without counting as a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

/// Crate-level error composing every sub-module error via `#[from]`.
///
/// Pair with [`CoreResult`] to attach human-readable context as an error
/// propagates up through the runtime entry points.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

/// Convenience result alias using [`error_stack::Report`].
pub type CoreResult<T> = Result<T, error_stack::Report<CoreError>>;
