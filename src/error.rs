//! # Error Handling Module
//!
//! This module defines the error types for the realtime core service.
//! It provides structured error handling with context, retry information, and
//! the propagation policy the service is built around: validation and
//! permission errors surface synchronously to callers, while transport and
//! storage errors are absorbed into the retry machinery and only show up in
//! metrics and logs.

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for the realtime core service
#[derive(Error, Debug)]
pub enum RealtimeError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Malformed event or queue item, rejected synchronously
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
        event_id: Option<Uuid>,
    },

    /// Caller is not authorized for the target organization
    #[error("Permission denied: {message}")]
    PermissionDenied {
        message: String,
        user_id: String,
        organization_id: String,
    },

    /// Pub/sub transport I/O failure
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        channel: Option<String>,
        retry_after: Option<u64>,
    },

    /// Persistence collaborator failure
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        operation: Option<String>,
    },

    /// Enqueue rejected after space reclamation
    #[error("Queue full: {message}")]
    QueueFull {
        message: String,
        queue_size: usize,
        max_size: usize,
    },

    /// Dead-letter entry or queue item exceeded its retry budget
    #[error("Permanent failure: {message}")]
    PermanentFailure {
        message: String,
        id: Uuid,
        attempts: u32,
    },

    /// Event serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        event_id: Option<Uuid>,
    },

    /// Internal service errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Error severity levels for categorization and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "low"),
            ErrorSeverity::Medium => write!(f, "medium"),
            ErrorSeverity::High => write!(f, "high"),
            ErrorSeverity::Critical => write!(f, "critical"),
        }
    }
}

impl RealtimeError {
    /// Get the error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RealtimeError::Configuration { .. } => ErrorSeverity::High,
            RealtimeError::Validation { .. } => ErrorSeverity::Low,
            RealtimeError::PermissionDenied { .. } => ErrorSeverity::Medium,
            RealtimeError::Transport { .. } => ErrorSeverity::Medium,
            RealtimeError::Storage { .. } => ErrorSeverity::High,
            RealtimeError::QueueFull { .. } => ErrorSeverity::High,
            RealtimeError::PermanentFailure { .. } => ErrorSeverity::Medium,
            RealtimeError::Serialization { .. } => ErrorSeverity::Low,
            RealtimeError::Internal { .. } => ErrorSeverity::Critical,
        }
    }

    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            RealtimeError::Configuration { .. } => false,
            RealtimeError::Validation { .. } => false,
            RealtimeError::PermissionDenied { .. } => false,
            RealtimeError::Transport { .. } => true,
            RealtimeError::Storage { .. } => true,
            RealtimeError::QueueFull { .. } => true,
            RealtimeError::PermanentFailure { .. } => false,
            RealtimeError::Serialization { .. } => false,
            RealtimeError::Internal { .. } => false,
        }
    }

    /// Get retry delay in seconds, when the transport suggested one
    pub fn retry_delay_seconds(&self) -> Option<u64> {
        match self {
            RealtimeError::Transport { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Get the error category for metrics and monitoring
    pub fn category(&self) -> &'static str {
        match self {
            RealtimeError::Configuration { .. } => "configuration",
            RealtimeError::Validation { .. } => "validation",
            RealtimeError::PermissionDenied { .. } => "permission_denied",
            RealtimeError::Transport { .. } => "transport",
            RealtimeError::Storage { .. } => "storage",
            RealtimeError::QueueFull { .. } => "queue_full",
            RealtimeError::PermanentFailure { .. } => "permanent_failure",
            RealtimeError::Serialization { .. } => "serialization",
            RealtimeError::Internal { .. } => "internal",
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
            event_id: None,
        }
    }

    /// Create a validation error for a specific field
    pub fn validation_field<S: Into<String>>(message: S, field: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
            event_id: None,
        }
    }

    /// Create a permission denied error
    pub fn permission_denied<S: Into<String>>(user_id: S, organization_id: S) -> Self {
        let user_id = user_id.into();
        let organization_id = organization_id.into();
        Self::PermissionDenied {
            message: format!(
                "user {} may not access organization {}",
                user_id, organization_id
            ),
            user_id,
            organization_id,
        }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
            channel: None,
            retry_after: None,
        }
    }

    /// Create a transport error for a specific channel
    pub fn transport_channel<S: Into<String>>(message: S, channel: S) -> Self {
        Self::Transport {
            message: message.into(),
            channel: Some(channel.into()),
            retry_after: None,
        }
    }

    /// Create a storage error
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
            operation: None,
        }
    }

    /// Create a storage error for a specific operation
    pub fn storage_operation<S: Into<String>>(message: S, operation: S) -> Self {
        Self::Storage {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }

    /// Create a queue full error
    pub fn queue_full(queue_size: usize, max_size: usize) -> Self {
        Self::QueueFull {
            message: format!("queue at capacity ({}/{})", queue_size, max_size),
            queue_size,
            max_size,
        }
    }

    /// Create a permanent failure error
    pub fn permanent_failure<S: Into<String>>(message: S, id: Uuid, attempts: u32) -> Self {
        Self::PermanentFailure {
            message: message.into(),
            id,
            attempts,
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self::Serialization {
            message: message.into(),
            event_id: None,
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type for realtime core operations
pub type Result<T> = std::result::Result<T, RealtimeError>;

impl From<serde_json::Error> for RealtimeError {
    fn from(err: serde_json::Error) -> Self {
        RealtimeError::Serialization {
            message: err.to_string(),
            event_id: None,
        }
    }
}

impl From<prometheus::Error> for RealtimeError {
    fn from(err: prometheus::Error) -> Self {
        RealtimeError::Internal {
            message: format!("metrics registry error: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_severity() {
        let config_error = RealtimeError::configuration("test");
        assert_eq!(config_error.severity(), ErrorSeverity::High);

        let validation_error = RealtimeError::validation("test");
        assert_eq!(validation_error.severity(), ErrorSeverity::Low);

        let internal_error = RealtimeError::internal("test");
        assert_eq!(internal_error.severity(), ErrorSeverity::Critical);
    }

    #[test]
    fn test_error_retryability() {
        assert!(!RealtimeError::validation("test").is_retryable());
        assert!(!RealtimeError::permission_denied("u1", "org1").is_retryable());
        assert!(RealtimeError::transport("test").is_retryable());
        assert!(RealtimeError::storage("test").is_retryable());
        assert!(RealtimeError::queue_full(10, 10).is_retryable());
        assert!(!RealtimeError::permanent_failure("test", Uuid::new_v4(), 7).is_retryable());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(RealtimeError::transport("test").category(), "transport");
        assert_eq!(RealtimeError::storage("test").category(), "storage");
        assert_eq!(RealtimeError::queue_full(1, 1).category(), "queue_full");
    }

    #[test]
    fn test_permission_denied_context() {
        let err = RealtimeError::permission_denied("user-1", "org-1");
        match err {
            RealtimeError::PermissionDenied {
                user_id,
                organization_id,
                ..
            } => {
                assert_eq!(user_id, "user-1");
                assert_eq!(organization_id, "org-1");
            }
            _ => panic!("expected permission denied"),
        }
    }

    #[test]
    fn test_retry_delay() {
        let transport_error = RealtimeError::Transport {
            message: "broker unavailable".to_string(),
            channel: None,
            retry_after: Some(5),
        };
        assert_eq!(transport_error.retry_delay_seconds(), Some(5));
        assert_eq!(RealtimeError::validation("x").retry_delay_seconds(), None);
    }

    #[test]
    fn test_serde_json_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: RealtimeError = json_error.into();
        assert!(matches!(err, RealtimeError::Serialization { .. }));
    }
}
