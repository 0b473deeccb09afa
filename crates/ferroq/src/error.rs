//! Queue error types.

use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors produced by the task queue facade and its subsystems.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Invalid configuration (empty broker address, bad timezone, ...).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The broker could not be reached at startup.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// Malformed cron expression or `@every` spec.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A task handler returned a failure.
    #[error("Task execution failed: {0}")]
    Execution(String),

    /// A task handler panicked during execution.
    #[error("Task handler panicked: {0}")]
    Panicked(String),

    /// No handler is registered for the dispatched task type.
    #[error("No handler registered for task type: {0}")]
    NoHandler(String),

    /// A task with the same unique key is already enqueued.
    #[error("Duplicate task for unique key: {0}")]
    Duplicate(String),

    /// A broker round-trip or task execution exceeded its bound.
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// Lifecycle misuse (e.g. starting a closed queue).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Operation attempted on a closed component.
    #[error("Closed: {0}")]
    Closed(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Returns true if a task failing with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueueError::Execution(_)
                | QueueError::Panicked(_)
                | QueueError::Timeout(_)
                | QueueError::Redis(_)
                | QueueError::Pool(_)
                | QueueError::Unavailable(_)
                | QueueError::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_execution() {
        let err = QueueError::Execution("oops".into());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_is_retryable_panicked() {
        let err = QueueError::Panicked("index out of bounds".into());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_is_retryable_timeout() {
        let err = QueueError::Timeout(3);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_is_not_retryable_no_handler() {
        let err = QueueError::NoHandler("email:send".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_is_not_retryable_duplicate() {
        let err = QueueError::Duplicate("report-42".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_is_not_retryable_configuration() {
        let err = QueueError::Configuration("broker address is empty".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_is_not_retryable_invalid_state() {
        let err = QueueError::InvalidState {
            expected: "constructed".into(),
            actual: "closed".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display_timeout() {
        let err = QueueError::Timeout(3);
        assert!(err.to_string().contains("3"));
    }

    #[test]
    fn test_error_display_invalid_state() {
        let err = QueueError::InvalidState {
            expected: "constructed".into(),
            actual: "closed".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("constructed") && msg.contains("closed"));
    }

    #[test]
    fn test_from_serde_error() {
        let serde_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err = QueueError::from(serde_err);
        assert!(matches!(err, QueueError::Serialization(_)));
    }
}
