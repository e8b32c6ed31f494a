//! Agent error types.

use axum::http::StatusCode;

use crate::engines::AdapterError;

/// Agent failures. All of them reach callers as `success: false`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    /// Malformed request; never retried
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Missing or wrong shared secret
    #[error("Unauthorized")]
    Unauthorized,

    /// Engine rejected the operation or was unreachable
    #[error("{0}")]
    Adapter(#[from] AdapterError),

    /// Agent could not be reached or answered with garbage
    #[error("Agent unavailable: {0}")]
    Transport(String),
}

impl AgentError {
    /// HTTP status used by the agent routes
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Adapter(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }
}
