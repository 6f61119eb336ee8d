use thiserror::Error;

/// Typed errors crossing component boundaries. Only the HTTP layer
/// translates these into status codes; the stable `code` string is what
/// clients see.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input, unknown agent in an override, template render
    /// failure.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Deadline hit or explicit cancellation. Distinct from failure: the
    /// user message stays persisted, no assistant message is appended.
    #[error("request cancelled")]
    Cancelled,

    /// Gateway exhausted its retries or hit a non-retryable provider error.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// Invariant breach (alternation, graph acyclicity, dimension
    /// mismatch). Indicates a bug; the request fails and the breach is
    /// logged.
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    /// Underlying store failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::BadRequest(_) => "bad_request",
            EngineError::Cancelled => "cancelled",
            EngineError::ModelUnavailable(_) => "model_unavailable",
            EngineError::ConsistencyViolation(_) => "consistency_violation",
            EngineError::Storage(_) => "storage_error",
        }
    }

    pub fn storage(err: anyhow::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
