/*!
 * Engine Configuration
 *
 * Environment-driven configuration for the orchestration engine. Missing
 * provider credentials disable that provider instead of failing startup;
 * the database connection string and the token encryption key are required.
 */

use serde::{Deserialize, Serialize};

use crate::sessions::error::{SessionError, SessionResult};

/// OAuth client credentials for Google
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleClientConfig {
    pub client_id: String,
    pub client_secret: String,
}

/// OAuth client credentials for Microsoft
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicrosoftClientConfig {
    pub client_id: String,
    pub client_secret: String,
    /// "common" unless the deployment is single-tenant
    pub tenant: String,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Database connection string
    pub database_url: String,
    /// Secret the token cipher key is derived from
    pub calendar_encryption_key: String,
    pub google: Option<GoogleClientConfig>,
    pub microsoft: Option<MicrosoftClientConfig>,
    /// Reminder processor tick in seconds
    pub reminder_tick_seconds: u64,
    /// Outbox dispatcher poll interval in seconds
    pub outbox_poll_seconds: u64,
    /// Outbox dispatch batch size
    pub outbox_batch_size: u32,
    /// Deadline for every external call
    pub external_call_timeout_seconds: u64,
    /// Meeting link retry backoff base
    pub meeting_link_retry_base_seconds: u64,
    /// Meeting link retry backoff cap
    pub meeting_link_retry_cap_seconds: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://skillswap.db?mode=rwc".to_string(),
            calendar_encryption_key: String::new(),
            google: None,
            microsoft: None,
            reminder_tick_seconds: 30,
            outbox_poll_seconds: 5,
            outbox_batch_size: 100,
            external_call_timeout_seconds: 10,
            meeting_link_retry_base_seconds: 30,
            meeting_link_retry_cap_seconds: 1800,
        }
    }
}

impl CoreConfig {
    /// Load from process environment
    pub fn from_env() -> SessionResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> SessionResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DB_CONNECTION_STRING").ok_or_else(|| {
            SessionError::invalid_field("DB_CONNECTION_STRING is required", "DB_CONNECTION_STRING")
        })?;
        let calendar_encryption_key = lookup("CALENDAR_ENCRYPTION_KEY").ok_or_else(|| {
            SessionError::invalid_field(
                "CALENDAR_ENCRYPTION_KEY is required",
                "CALENDAR_ENCRYPTION_KEY",
            )
        })?;

        let google = match (
            lookup("CALENDAR_GOOGLE_CLIENT_ID"),
            lookup("CALENDAR_GOOGLE_CLIENT_SECRET"),
        ) {
            (Some(client_id), Some(client_secret)) => Some(GoogleClientConfig {
                client_id,
                client_secret,
            }),
            (None, None) => None,
            _ => {
                return Err(SessionError::invalid_field(
                    "Google calendar credentials must be set together",
                    "CALENDAR_GOOGLE_CLIENT_ID",
                ))
            }
        };

        let microsoft = match (
            lookup("CALENDAR_MICROSOFT_CLIENT_ID"),
            lookup("CALENDAR_MICROSOFT_CLIENT_SECRET"),
        ) {
            (Some(client_id), Some(client_secret)) => Some(MicrosoftClientConfig {
                client_id,
                client_secret,
                tenant: lookup("CALENDAR_MICROSOFT_TENANT")
                    .unwrap_or_else(|| "common".to_string()),
            }),
            (None, None) => None,
            _ => {
                return Err(SessionError::invalid_field(
                    "Microsoft calendar credentials must be set together",
                    "CALENDAR_MICROSOFT_CLIENT_ID",
                ))
            }
        };

        Ok(Self {
            database_url,
            calendar_encryption_key,
            google,
            microsoft,
            ..Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(map: &'a HashMap<&str, &str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn test_minimal_environment() {
        let env = HashMap::from([
            ("DB_CONNECTION_STRING", "sqlite://test.db"),
            ("CALENDAR_ENCRYPTION_KEY", "secret"),
        ]);
        let config = CoreConfig::from_lookup(lookup_from(&env)).unwrap();
        assert_eq!(config.database_url, "sqlite://test.db");
        assert!(config.google.is_none());
        assert!(config.microsoft.is_none());
        assert_eq!(config.reminder_tick_seconds, 30);
        assert_eq!(config.external_call_timeout_seconds, 10);
    }

    #[test]
    fn test_missing_required_keys() {
        let env = HashMap::from([("DB_CONNECTION_STRING", "sqlite://test.db")]);
        assert_eq!(
            CoreConfig::from_lookup(lookup_from(&env)).unwrap_err().kind(),
            "InvalidInput"
        );
    }

    #[test]
    fn test_provider_credentials() {
        let env = HashMap::from([
            ("DB_CONNECTION_STRING", "sqlite://test.db"),
            ("CALENDAR_ENCRYPTION_KEY", "secret"),
            ("CALENDAR_GOOGLE_CLIENT_ID", "gid"),
            ("CALENDAR_GOOGLE_CLIENT_SECRET", "gsecret"),
            ("CALENDAR_MICROSOFT_CLIENT_ID", "mid"),
            ("CALENDAR_MICROSOFT_CLIENT_SECRET", "msecret"),
            ("CALENDAR_MICROSOFT_TENANT", "contoso"),
        ]);
        let config = CoreConfig::from_lookup(lookup_from(&env)).unwrap();
        assert_eq!(config.google.as_ref().unwrap().client_id, "gid");
        assert_eq!(config.microsoft.as_ref().unwrap().tenant, "contoso");
    }

    #[test]
    fn test_half_configured_provider_rejected() {
        let env = HashMap::from([
            ("DB_CONNECTION_STRING", "sqlite://test.db"),
            ("CALENDAR_ENCRYPTION_KEY", "secret"),
            ("CALENDAR_GOOGLE_CLIENT_ID", "gid"),
        ]);
        assert!(CoreConfig::from_lookup(lookup_from(&env)).is_err());
    }

    #[test]
    fn test_microsoft_tenant_defaults_to_common() {
        let env = HashMap::from([
            ("DB_CONNECTION_STRING", "sqlite://test.db"),
            ("CALENDAR_ENCRYPTION_KEY", "secret"),
            ("CALENDAR_MICROSOFT_CLIENT_ID", "mid"),
            ("CALENDAR_MICROSOFT_CLIENT_SECRET", "msecret"),
        ]);
        let config = CoreConfig::from_lookup(lookup_from(&env)).unwrap();
        assert_eq!(config.microsoft.unwrap().tenant, "common");
    }
}
