//! Error types for query resolution

use thiserror::Error;

/// Errors surfaced by the solver chain
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache protocol error: {0}")]
    Protocol(String),

    #[error("malformed cache response: {0}")]
    MalformedResponse(String),

    #[error("model for array {name}: expected {expected} bytes, got {actual}")]
    ModelSizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("backend timed out")]
    Timeout,

    #[error("backend error: {0}")]
    Backend(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for solver operations
pub type SolverResult<T> = Result<T, SolverError>;
