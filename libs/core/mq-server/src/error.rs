//! MQ server error types
//!
//! Errors fall into two groups:
//! - **Server errors** (`MqError`): configuration, lifecycle and broker failures
//!   surfaced to the caller or to the server's error callback
//! - **Handler errors** (`HandlerError`): faults raised by a message handler,
//!   which never escape a worker and only decide between retry and DLQ

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fault raised by a message handler.
///
/// Retryable faults are re-queued until the server's retry count is exhausted.
/// Unretryable faults go to the dead-letter queue on the first failure.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{error_code}: {message}")]
pub struct HandlerError {
    pub error_code: String,
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    /// Create a retryable handler error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error_code: "HandlerError".to_string(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Create an error that skips retries and is dead-lettered immediately
    pub fn unretryable(message: impl Into<String>) -> Self {
        Self {
            error_code: "UnRetryableMessagingException".to_string(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Override the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = code.into();
        self
    }
}

/// MQ server errors
#[derive(Error, Debug)]
pub enum MqError {
    /// Redis connection or command error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// No pooled Redis connection became available in time
    #[cfg(feature = "redis")]
    #[error("Redis pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Broker transport failure (lost subscription, closed channel)
    #[error("Broker error: {0}")]
    Broker(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A handler for this message type is already registered
    #[error("Message handler has already been registered for type: {0}")]
    DuplicateHandler(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted on a disposed server or worker
    #[error("Cannot {0} a disposed instance")]
    Disposed(&'static str),

    /// Handler fault surfaced outside the retry pipeline
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// A worker thread panicked while draining its queue
    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MqError {
    /// Create a broker error
    pub fn broker(message: impl Into<String>) -> Self {
        MqError::Broker(message.into())
    }

    /// Whether this error was raised by a disposed guard
    pub fn is_disposed(&self) -> bool {
        matches!(self, MqError::Disposed(_))
    }

    /// Whether this error came from the broker transport
    pub fn is_transport(&self) -> bool {
        match self {
            #[cfg(feature = "redis")]
            MqError::Redis(_) | MqError::Pool(_) => true,
            MqError::Broker(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for MqError {
    fn from(err: serde_json::Error) -> Self {
        MqError::Serialization(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for MqError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        MqError::Internal(format!("lock poisoned: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_defaults_to_retryable() {
        let err = HandlerError::new("boom");
        assert!(err.retryable);
        assert_eq!(err.error_code, "HandlerError");
        assert_eq!(err.to_string(), "HandlerError: boom");
    }

    #[test]
    fn test_unretryable_handler_error() {
        let err = HandlerError::unretryable("bad input").with_code("ValidationError");
        assert!(!err.retryable);
        assert_eq!(err.error_code, "ValidationError");
    }

    #[test]
    fn test_error_classification() {
        assert!(MqError::Disposed("start").is_disposed());
        assert!(MqError::broker("connection reset").is_transport());
        assert!(!MqError::Config("no handlers".into()).is_transport());
        assert_eq!(
            MqError::Disposed("start").to_string(),
            "Cannot start a disposed instance"
        );
    }

    #[test]
    fn test_from_serde_error() {
        let err: MqError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, MqError::Serialization(_)));
    }
}
