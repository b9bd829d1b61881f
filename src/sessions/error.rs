/*!
 * Session Engine Error Types
 *
 * Closed error taxonomy for the orchestration engine. Every failure a
 * command can surface maps onto one of these kinds; the facade renders
 * `kind()` into the uniform response envelope.
 */

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Session engine error types
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum SessionError {
    /// Aggregate missing
    #[error("{resource_type} not found: {resource_id}")]
    NotFound {
        resource_type: String,
        resource_id: String,
    },

    /// State machine rejects the operation
    #[error("Illegal transition: {message}")]
    IllegalTransition {
        message: String,
        appointment_id: String,
        current_status: String,
    },

    /// Precondition on inputs failed
    #[error("Invalid input: {message}")]
    InvalidInput {
        message: String,
        field: Option<String>,
    },

    /// Scheduler exhausted its window without finding enough slots
    #[error("No feasible schedule: {reason}")]
    NoFeasibleSchedule { reason: String },

    /// Duplicate creation or optimistic concurrency failure after retries
    #[error("Conflict: {message}")]
    Conflict {
        message: String,
        resource_id: Option<String>,
    },

    /// Token expired or invalid against a calendar provider
    #[error("Unauthorized: {message}")]
    Unauthorized {
        message: String,
        provider: Option<String>,
    },

    /// Network/database error surviving the local retry budget
    #[error("Transient failure: {message}")]
    Transient {
        message: String,
        operation: String,
    },

    /// Invariant violation or cryptographic failure
    #[error("Fatal: {message}")]
    Fatal {
        message: String,
        operation: Option<String>,
    },
}

impl SessionError {
    /// Stable kind string for the command envelope
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::NotFound { .. } => "NotFound",
            SessionError::IllegalTransition { .. } => "IllegalTransition",
            SessionError::InvalidInput { .. } => "InvalidInput",
            SessionError::NoFeasibleSchedule { .. } => "NoFeasibleSchedule",
            SessionError::Conflict { .. } => "Conflict",
            SessionError::Unauthorized { .. } => "Unauthorized",
            SessionError::Transient { .. } => "Transient",
            SessionError::Fatal { .. } => "Fatal",
        }
    }

    /// Check if the error is safe to retry at the caller boundary
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Transient { .. })
    }

    /// Create a not-found error
    pub fn not_found(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }

    /// Create an illegal-transition error
    pub fn illegal_transition(
        message: impl Into<String>,
        appointment_id: impl Into<String>,
        current_status: impl Into<String>,
    ) -> Self {
        Self::IllegalTransition {
            message: message.into(),
            appointment_id: appointment_id.into(),
            current_status: current_status.into(),
        }
    }

    /// Create an invalid-input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            field: None,
        }
    }

    /// Create an invalid-input error naming the offending field
    pub fn invalid_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a conflict error
    pub fn conflict(message: impl Into<String>, resource_id: Option<String>) -> Self {
        Self::Conflict {
            message: message.into(),
            resource_id,
        }
    }

    /// Create a transient error
    pub fn transient(message: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            operation: operation.into(),
        }
    }

    /// Create a fatal error
    pub fn fatal(message: impl Into<String>, operation: Option<String>) -> Self {
        Self::Fatal {
            message: message.into(),
            operation,
        }
    }
}

// Convert common error types to SessionError
impl From<sqlx::Error> for SessionError {
    fn from(error: sqlx::Error) -> Self {
        let constraint_violation = matches!(
            error,
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() || db_err.is_foreign_key_violation()
        );

        if constraint_violation {
            SessionError::Conflict {
                message: error.to_string(),
                resource_id: None,
            }
        } else {
            SessionError::Transient {
                message: error.to_string(),
                operation: "database".to_string(),
            }
        }
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(error: reqwest::Error) -> Self {
        SessionError::Transient {
            message: error.to_string(),
            operation: "http".to_string(),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(error: serde_json::Error) -> Self {
        SessionError::Fatal {
            message: format!("serialization failed: {}", error),
            operation: Some("json".to_string()),
        }
    }
}
