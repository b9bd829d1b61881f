/*!
 * Calendar Integration Error Types
 *
 * Error handling for the external calendar adapters: authentication and
 * token failures, network errors, protocol (XML/JSON/iCal) surprises, and
 * token cryptography. Converts into the engine-wide `SessionError` taxonomy
 * at the module boundary.
 */

use thiserror::Error;

use crate::calendar::types::CalendarProvider;
use crate::sessions::error::SessionError;

/// Result type for calendar operations
pub type CalendarResult<T> = Result<T, CalendarError>;

#[derive(Error, Debug, Clone)]
pub enum CalendarError {
    /// Authentication failed against the provider
    #[error("Authentication failed for {provider}: {message}")]
    Authentication {
        provider: CalendarProvider,
        message: String,
        needs_reauth: bool,
    },

    /// Access or refresh token problems
    #[error("Token error for {provider}: {message}")]
    Token {
        provider: CalendarProvider,
        message: String,
        expired: bool,
    },

    /// Network or HTTP-level failure
    #[error("Network error for {provider}: {message}")]
    Network {
        provider: CalendarProvider,
        message: String,
        status_code: Option<u16>,
        is_timeout: bool,
    },

    /// The provider answered with something we could not interpret
    #[error("Protocol error for {provider}: {message}")]
    Protocol {
        provider: CalendarProvider,
        message: String,
    },

    /// Resource missing on the provider side
    #[error("{resource} not found on {provider}")]
    NotFound {
        provider: CalendarProvider,
        resource: String,
    },

    /// Token encryption or decryption failed
    #[error("Token crypto failure: {message}")]
    Crypto { message: String },

    /// Missing or inconsistent provider configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl CalendarError {
    pub fn network(
        provider: CalendarProvider,
        message: impl Into<String>,
        status_code: Option<u16>,
    ) -> Self {
        Self::Network {
            provider,
            message: message.into(),
            status_code,
            is_timeout: false,
        }
    }

    pub fn protocol(provider: CalendarProvider, message: impl Into<String>) -> Self {
        Self::Protocol {
            provider,
            message: message.into(),
        }
    }

    /// Errors worth one refresh-then-retry cycle
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            CalendarError::Authentication { .. }
                | CalendarError::Token { .. }
                | CalendarError::Network {
                    status_code: Some(401),
                    ..
                }
        )
    }
}

impl From<CalendarError> for SessionError {
    fn from(error: CalendarError) -> Self {
        match error {
            CalendarError::Authentication { provider, message, .. }
            | CalendarError::Token { provider, message, .. } => SessionError::Unauthorized {
                message,
                provider: Some(provider.to_string()),
            },
            CalendarError::Network { message, .. } => SessionError::Transient {
                message,
                operation: "calendar".to_string(),
            },
            CalendarError::Protocol { message, .. } => SessionError::Transient {
                message,
                operation: "calendar".to_string(),
            },
            CalendarError::NotFound { resource, .. } => SessionError::NotFound {
                resource_type: "CalendarResource".to_string(),
                resource_id: resource,
            },
            CalendarError::Crypto { message } => SessionError::Fatal {
                message,
                operation: Some("token_crypto".to_string()),
            },
            CalendarError::Configuration { message } => SessionError::InvalidInput {
                message,
                field: None,
            },
        }
    }
}

impl From<reqwest::Error> for CalendarError {
    fn from(error: reqwest::Error) -> Self {
        CalendarError::Network {
            provider: CalendarProvider::Google, // callers re-tag where it matters
            message: error.to_string(),
            status_code: error.status().map(|s| s.as_u16()),
            is_timeout: error.is_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_detection() {
        let auth = CalendarError::Authentication {
            provider: CalendarProvider::Google,
            message: "expired".into(),
            needs_reauth: true,
        };
        assert!(auth.is_unauthorized());

        let plain = CalendarError::network(CalendarProvider::Apple, "503", Some(503));
        assert!(!plain.is_unauthorized());
        let unauthorized = CalendarError::network(CalendarProvider::Microsoft, "401", Some(401));
        assert!(unauthorized.is_unauthorized());
    }

    #[test]
    fn test_session_error_mapping() {
        let token = CalendarError::Token {
            provider: CalendarProvider::Microsoft,
            message: "refresh failed".into(),
            expired: true,
        };
        assert_eq!(SessionError::from(token).kind(), "Unauthorized");

        let crypto = CalendarError::Crypto { message: "bad key".into() };
        assert_eq!(SessionError::from(crypto).kind(), "Fatal");

        let network = CalendarError::network(CalendarProvider::Google, "timeout", None);
        assert_eq!(SessionError::from(network).kind(), "Transient");
    }
}
