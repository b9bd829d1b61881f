/*!
 * Reminder Types
 *
 * Per-user reminder settings and the scheduled-reminder rows the processor
 * drains. Each row carries a denormalized snapshot of the appointment taken
 * at scheduling time so delivery stays stable under later edits.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::sessions::error::{SessionError, SessionResult};

/// Delivery channels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ReminderChannel {
    Email,
    Push,
    Sms,
}

impl fmt::Display for ReminderChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReminderChannel::Email => write!(f, "Email"),
            ReminderChannel::Push => write!(f, "Push"),
            ReminderChannel::Sms => write!(f, "SMS"),
        }
    }
}

impl FromStr for ReminderChannel {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Email" => Ok(ReminderChannel::Email),
            "Push" => Ok(ReminderChannel::Push),
            "SMS" => Ok(ReminderChannel::Sms),
            other => Err(SessionError::fatal(
                format!("unknown reminder channel in store: {}", other),
                Some("decode".to_string()),
            )),
        }
    }
}

/// Offsets a user may pick, in minutes before the session
pub const ALLOWED_OFFSETS: [u32; 9] = [5, 10, 15, 30, 60, 120, 1440, 2880, 10080];

/// Per-user reminder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReminderSettings {
    pub user_id: String,
    /// Ordered, descending offsets; validated against `ALLOWED_OFFSETS`
    pub minutes_before: Vec<u32>,
    pub email_enabled: bool,
    pub push_enabled: bool,
    pub sms_enabled: bool,
    pub updated_at: DateTime<Utc>,
}

impl ReminderSettings {
    pub fn defaults_for(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            minutes_before: vec![1440, 60, 15],
            email_enabled: true,
            push_enabled: true,
            sms_enabled: false,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> SessionResult<()> {
        if self.minutes_before.is_empty() {
            return Err(SessionError::invalid_field(
                "at least one reminder offset is required",
                "minutesBefore",
            ));
        }
        for offset in &self.minutes_before {
            if !ALLOWED_OFFSETS.contains(offset) {
                return Err(SessionError::invalid_field(
                    format!("unsupported reminder offset: {} minutes", offset),
                    "minutesBefore",
                ));
            }
        }
        if !self.email_enabled && !self.push_enabled && !self.sms_enabled {
            return Err(SessionError::invalid_field(
                "at least one channel must stay enabled",
                "channels",
            ));
        }
        Ok(())
    }

    /// Enabled channels in dispatch order
    pub fn channels(&self) -> Vec<ReminderChannel> {
        let mut channels = Vec::new();
        if self.email_enabled {
            channels.push(ReminderChannel::Email);
        }
        if self.push_enabled {
            channels.push(ReminderChannel::Push);
        }
        if self.sms_enabled {
            channels.push(ReminderChannel::Sms);
        }
        channels
    }
}

/// Scheduled-reminder lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReminderStatus {
    Pending,
    /// Claimed by a worker; the Pending → Dispatching conditional update is
    /// the idempotence gate against concurrent processors
    Dispatching,
    Sent,
    Failed,
    Cancelled,
}

impl fmt::Display for ReminderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReminderStatus::Pending => write!(f, "Pending"),
            ReminderStatus::Dispatching => write!(f, "Dispatching"),
            ReminderStatus::Sent => write!(f, "Sent"),
            ReminderStatus::Failed => write!(f, "Failed"),
            ReminderStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl FromStr for ReminderStatus {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(ReminderStatus::Pending),
            "Dispatching" => Ok(ReminderStatus::Dispatching),
            "Sent" => Ok(ReminderStatus::Sent),
            "Failed" => Ok(ReminderStatus::Failed),
            "Cancelled" => Ok(ReminderStatus::Cancelled),
            other => Err(SessionError::fatal(
                format!("unknown reminder status in store: {}", other),
                Some("decode".to_string()),
            )),
        }
    }
}

/// Appointment facts frozen at reminder-creation time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReminderSnapshot {
    pub partner_name: String,
    pub skill_name: String,
    pub appointment_time: DateTime<Utc>,
    pub meeting_link: Option<String>,
}

/// One scheduled delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledReminder {
    pub id: String,
    pub appointment_id: String,
    pub user_id: String,
    pub reminder_type: ReminderChannel,
    pub minutes_before: u32,
    pub scheduled_for: DateTime<Utc>,
    pub status: ReminderStatus,
    pub snapshot: ReminderSnapshot,
    pub claimed_by: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
