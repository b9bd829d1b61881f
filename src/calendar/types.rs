/*!
 * Calendar Integration Types
 *
 * Per-user calendar integrations, decrypted token material, and the
 * provider-neutral event payload the adapters translate into their wire
 * formats. Tokens never leave this process unencrypted except inside the
 * provider HTTP calls themselves.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::sessions::error::SessionError;

pub use crate::sessions::scheduling::BusyInterval;

/// Supported calendar providers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Hash, Eq, PartialEq)]
pub enum CalendarProvider {
    Google,
    Microsoft,
    Apple,
}

impl fmt::Display for CalendarProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalendarProvider::Google => write!(f, "Google"),
            CalendarProvider::Microsoft => write!(f, "Microsoft"),
            CalendarProvider::Apple => write!(f, "Apple"),
        }
    }
}

impl FromStr for CalendarProvider {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Google" => Ok(CalendarProvider::Google),
            "Microsoft" => Ok(CalendarProvider::Microsoft),
            "Apple" => Ok(CalendarProvider::Apple),
            other => Err(SessionError::fatal(
                format!("unknown calendar provider in store: {}", other),
                Some("decode".to_string()),
            )),
        }
    }
}

/// A user's connected calendar; token columns hold AES-256-GCM ciphertext
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarIntegration {
    pub id: String,
    pub user_id: String,
    pub provider: CalendarProvider,
    #[serde(skip_serializing, default)]
    pub access_token_enc: String,
    #[serde(skip_serializing, default)]
    pub refresh_token_enc: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Provider-side calendar to write into; provider default when absent
    pub calendar_id: Option<String>,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Decrypted token material as returned by an OAuth exchange or refresh
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub email: Option<String>,
}

/// Provider-neutral event payload built from an appointment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEventInput {
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub meeting_link: Option<String>,
    pub attendee_emails: Vec<String>,
}

/// Mapping from an appointment to the provider event it was mirrored into
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEventLink {
    pub appointment_id: String,
    pub user_id: String,
    pub provider: CalendarProvider,
    pub external_event_id: String,
    pub calendar_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
