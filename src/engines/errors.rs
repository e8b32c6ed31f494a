//! # Adapter Errors
//!
//! Every engine failure is reported to callers the same way, but the
//! adapter classifies it so retries can be limited to failures that are
//! safe to retry.

use serde::Serialize;

/// Whether retrying the same call can reasonably succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Connectivity, pool exhaustion, TLS: retry-safe
    Transient,
    /// Engine rejected the statement or the input
    Permanent,
}

/// Engine adapter failure
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct AdapterError {
    pub kind: FailureKind,
    pub message: String,
}

/// Result type for adapter operations
pub type AdapterResult<T> = Result<T, AdapterError>;

impl AdapterError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }

    /// Classify a sqlx error from a relational engine
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::transient(err.to_string()),
            _ => Self::permanent(err.to_string()),
        }
    }
}

impl From<super::quoting::QuoteError> for AdapterError {
    fn from(err: super::quoting::QuoteError) -> Self {
        Self::permanent(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlx_classification() {
        assert!(AdapterError::from_sqlx(sqlx::Error::PoolTimedOut).is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(AdapterError::from_sqlx(sqlx::Error::Io(io)).is_transient());
        assert!(!AdapterError::from_sqlx(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn test_display_is_message() {
        let err = AdapterError::permanent("role \"x\" does not exist");
        assert_eq!(err.to_string(), "role \"x\" does not exist");
        assert_eq!(err.kind, FailureKind::Permanent);
    }
}
