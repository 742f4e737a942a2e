//! Stable error kinds shared across the worker's interfaces.
//!
//! The string codes are part of the external contract: the gateway maps them
//! to HTTP statuses and the task service persists them on failed tasks, so
//! they must not change between releases.

use thiserror::Error;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("too many requests: {0}")]
    TooManyRequests(String),

    #[error("{message}")]
    Internal {
        message: String,
        #[source]
        cause: Option<AnyError>,
    },
}

impl TaskError {
    /// Internal error with an underlying cause preserved for logs.
    pub fn internal(message: impl Into<String>, cause: impl Into<AnyError>) -> Self {
        TaskError::Internal {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    /// Internal error with no separate cause.
    pub fn internal_msg(message: impl Into<String>) -> Self {
        TaskError::Internal {
            message: message.into(),
            cause: None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            TaskError::NotFound(_) => "NOT_FOUND",
            TaskError::Conflict(_) => "CONFLICT",
            TaskError::InvalidInput(_) => "INVALID_INPUT",
            TaskError::TooManyRequests(_) => "TOO_MANY_REQUESTS",
            TaskError::Internal { .. } => "INTERNAL",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(TaskError::NotFound("x".into()).code(), "NOT_FOUND");
        assert_eq!(TaskError::Conflict("x".into()).code(), "CONFLICT");
        assert_eq!(TaskError::InvalidInput("x".into()).code(), "INVALID_INPUT");
        assert_eq!(
            TaskError::TooManyRequests("x".into()).code(),
            "TOO_MANY_REQUESTS"
        );
        assert_eq!(TaskError::internal_msg("x").code(), "INTERNAL");
    }

    #[test]
    fn internal_preserves_cause() {
        let cause = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = TaskError::internal("storage failed", cause);
        assert_eq!(err.to_string(), "storage failed");
        assert!(std::error::Error::source(&err).is_some());
    }
}
