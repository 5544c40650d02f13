//! Error types for adflow core
//!
//! - [`AgentError`]: failures reported by an AI agent behind the agent boundary
//! - [`ServiceError`]: failures of a dashboard operation

use adflow_kernel::{EngineError, StepError};

/// Failure of one agent call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    /// Provider throttled the call
    #[error("rate limited by provider (retry after {retry_after_ms}ms)")]
    RateLimited { retry_after_ms: u64 },

    /// Provider down or unreachable
    #[error("agent unavailable: {0}")]
    Unavailable(String),

    /// The provider refused the prompt (policy, safety filter)
    #[error("prompt rejected: {0}")]
    Rejected(String),

    /// The provider answered with something unusable
    #[error("malformed agent response: {0}")]
    Malformed(String),
}

impl AgentError {
    /// Worth calling the agent again after a backoff
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::RateLimited { .. } | AgentError::Unavailable(_))
    }
}

impl From<AgentError> for StepError {
    fn from(value: AgentError) -> Self {
        let message = value.to_string();
        if value.is_retryable() {
            return StepError::transient(message);
        }
        match value {
            AgentError::Malformed(_) => StepError::invalid_output(message),
            _ => StepError::permanent(message),
        }
    }
}

/// Failure of a dashboard operation
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The request could not be decoded
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ServiceError {
    /// Short machine-readable code for API responses
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Engine(e) => e.code(),
            ServiceError::BadRequest(_) => "BadRequest",
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(value: serde_json::Error) -> Self {
        ServiceError::BadRequest(value.to_string())
    }
}
