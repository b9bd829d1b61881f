/*!
 * Session Domain Types
 *
 * The three core aggregates of the orchestration engine (Connection,
 * SessionSeries, SessionAppointment) together with the command inputs and
 * their validation. Times are UTC instants at the persistence boundary;
 * localization happens at the notification render boundary only.
 */

use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::sessions::error::{SessionError, SessionResult};

/// How two users settle a connection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Both parties teach each other; two series, balance tracked in minutes
    SkillExchange,
    /// One party pays per hour
    Payment,
    /// One party teaches for free
    Free,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::SkillExchange => write!(f, "SkillExchange"),
            ConnectionType::Payment => write!(f, "Payment"),
            ConnectionType::Free => write!(f, "Free"),
        }
    }
}

impl FromStr for ConnectionType {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SkillExchange" => Ok(ConnectionType::SkillExchange),
            "Payment" => Ok(ConnectionType::Payment),
            "Free" => Ok(ConnectionType::Free),
            other => Err(SessionError::fatal(
                format!("unknown connection type in store: {}", other),
                Some("decode".to_string()),
            )),
        }
    }
}

/// The agreement between two users, owning one or two session series
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub match_request_id: String,
    pub requester_id: String,
    pub target_user_id: String,
    pub connection_type: ConnectionType,
    pub skill_id: String,
    /// Required iff `connection_type == SkillExchange`
    pub exchange_skill_id: Option<String>,
    /// Required iff `connection_type == Payment`
    pub payment_rate_per_hour: Option<f64>,
    pub currency: Option<String>,
    pub total_sessions_planned: u32,
    pub total_sessions_completed: u32,
    /// Teaching debt in minutes, signed from the requester's perspective
    pub balance_minutes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Connection {
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    /// Structural invariants that must hold for every persisted row
    pub fn check_invariants(&self) -> SessionResult<()> {
        if self.requester_id == self.target_user_id {
            return Err(SessionError::fatal(
                format!("connection {} has identical parties", self.id),
                Some("invariant".to_string()),
            ));
        }
        if self.total_sessions_completed > self.total_sessions_planned {
            return Err(SessionError::fatal(
                format!(
                    "connection {} completed {} of {} planned",
                    self.id, self.total_sessions_completed, self.total_sessions_planned
                ),
                Some("invariant".to_string()),
            ));
        }
        match self.connection_type {
            ConnectionType::SkillExchange if self.exchange_skill_id.is_none() => {
                Err(SessionError::fatal(
                    format!("skill exchange connection {} missing exchange skill", self.id),
                    Some("invariant".to_string()),
                ))
            }
            ConnectionType::Payment
                if self.payment_rate_per_hour.is_none() || self.currency.is_none() =>
            {
                Err(SessionError::fatal(
                    format!("payment connection {} missing rate or currency", self.id),
                    Some("invariant".to_string()),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// A stream of teachings of one skill by one party to the other
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSeries {
    pub id: String,
    pub connection_id: String,
    pub teacher_user_id: String,
    pub learner_user_id: String,
    pub skill_id: String,
    pub total_sessions: u32,
    pub completed_sessions: u32,
    pub default_duration_minutes: u32,
    pub title: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SessionSeries {
    pub fn is_complete(&self) -> bool {
        self.completed_sessions >= self.total_sessions
    }
}

/// Appointment lifecycle states
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
    RescheduleRequested,
}

impl AppointmentStatus {
    /// Terminal states admit no further lifecycle transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed | AppointmentStatus::Cancelled | AppointmentStatus::NoShow
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppointmentStatus::Scheduled => write!(f, "Scheduled"),
            AppointmentStatus::Confirmed => write!(f, "Confirmed"),
            AppointmentStatus::InProgress => write!(f, "InProgress"),
            AppointmentStatus::Completed => write!(f, "Completed"),
            AppointmentStatus::Cancelled => write!(f, "Cancelled"),
            AppointmentStatus::NoShow => write!(f, "NoShow"),
            AppointmentStatus::RescheduleRequested => write!(f, "RescheduleRequested"),
        }
    }
}

impl FromStr for AppointmentStatus {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Scheduled" => Ok(AppointmentStatus::Scheduled),
            "Confirmed" => Ok(AppointmentStatus::Confirmed),
            "InProgress" => Ok(AppointmentStatus::InProgress),
            "Completed" => Ok(AppointmentStatus::Completed),
            "Cancelled" => Ok(AppointmentStatus::Cancelled),
            "NoShow" => Ok(AppointmentStatus::NoShow),
            "RescheduleRequested" => Ok(AppointmentStatus::RescheduleRequested),
            other => Err(SessionError::fatal(
                format!("unknown appointment status in store: {}", other),
                Some("decode".to_string()),
            )),
        }
    }
}

/// One scheduled meeting inside a series
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAppointment {
    pub id: String,
    pub session_series_id: String,
    /// Unique within the series, 1-based
    pub session_number: u32,
    pub title: String,
    pub scheduled_date: DateTime<Utc>,
    pub duration_minutes: u32,
    pub organizer_user_id: String,
    pub participant_user_id: String,
    pub meeting_link: Option<String>,
    pub status: AppointmentStatus,
    pub cancelled_by: Option<String>,
    pub cancel_reason: Option<String>,
    pub reschedule_requested_by: Option<String>,
    pub proposed_date: Option<DateTime<Utc>>,
    pub proposed_duration: Option<u32>,
    pub reschedule_reason: Option<String>,
    /// Status to restore when a reschedule request is rejected
    pub reschedule_prior_status: Option<AppointmentStatus>,
    pub no_show_user_ids: Vec<String>,
    pub no_show_reported_by: Option<String>,
    pub is_auto_created: bool,
    pub is_late_cancellation: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SessionAppointment {
    pub fn end_time(&self) -> DateTime<Utc> {
        self.scheduled_date + chrono::Duration::minutes(self.duration_minutes as i64)
    }

    pub fn is_party(&self, user_id: &str) -> bool {
        self.organizer_user_id == user_id || self.participant_user_id == user_id
    }
}

/// Scheduling preferences supplied when materializing a match
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingPreferences {
    /// Preferred weekdays, in preference order; must be non-empty
    pub preferred_days: Vec<Weekday>,
    /// "HH:MM" wall-clock slot openings, in preference order
    pub preferred_times: Vec<String>,
    pub earliest_start_date: DateTime<Utc>,
    pub minimum_days_between: u32,
    pub maximum_days_between: u32,
    pub distribute_evenly: bool,
}

impl SchedulingPreferences {
    pub fn validate(&self) -> SessionResult<()> {
        if self.preferred_days.is_empty() {
            return Err(SessionError::invalid_field(
                "at least one preferred day is required",
                "preferredDays",
            ));
        }
        if self.preferred_times.is_empty() {
            return Err(SessionError::invalid_field(
                "at least one preferred time is required",
                "preferredTimes",
            ));
        }
        for time in &self.preferred_times {
            parse_preferred_time(time)?;
        }
        if self.minimum_days_between > self.maximum_days_between {
            return Err(SessionError::invalid_field(
                "minimumDaysBetween exceeds maximumDaysBetween",
                "minimumDaysBetween",
            ));
        }
        Ok(())
    }
}

impl Default for SchedulingPreferences {
    fn default() -> Self {
        Self {
            preferred_days: vec![Weekday::Mon],
            preferred_times: vec!["18:00".to_string()],
            earliest_start_date: Utc::now(),
            minimum_days_between: 1,
            maximum_days_between: 14,
            distribute_evenly: false,
        }
    }
}

/// Parse an "HH:MM" preferred-time entry into (hour, minute)
pub fn parse_preferred_time(value: &str) -> SessionResult<(u32, u32)> {
    let mut parts = value.splitn(2, ':');
    let hour = parts
        .next()
        .and_then(|h| h.parse::<u32>().ok())
        .filter(|h| *h < 24);
    let minute = parts
        .next()
        .and_then(|m| m.parse::<u32>().ok())
        .filter(|m| *m < 60);
    match (hour, minute) {
        (Some(h), Some(m)) => Ok((h, m)),
        _ => Err(SessionError::invalid_field(
            format!("invalid preferred time: {:?}", value),
            "preferredTimes",
        )),
    }
}

/// Input for `CreateSessionHierarchyFromMatch`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionHierarchyInput {
    pub match_request_id: String,
    pub requester_id: String,
    pub target_user_id: String,
    pub connection_type: ConnectionType,
    pub skill_id: String,
    pub exchange_skill_id: Option<String>,
    pub payment_rate_per_hour: Option<f64>,
    pub currency: Option<String>,
    pub total_sessions: u32,
    pub session_duration_minutes: u32,
    pub title: String,
    pub description: Option<String>,
    pub preferences: SchedulingPreferences,
}

impl CreateSessionHierarchyInput {
    pub fn validate(&self) -> SessionResult<()> {
        if self.requester_id == self.target_user_id {
            return Err(SessionError::invalid_field(
                "requester and target must be distinct users",
                "targetUserId",
            ));
        }
        if !(1..=52).contains(&self.total_sessions) {
            return Err(SessionError::invalid_field(
                "totalSessions must be between 1 and 52",
                "totalSessions",
            ));
        }
        if !(15..=480).contains(&self.session_duration_minutes) {
            return Err(SessionError::invalid_field(
                "sessionDurationMinutes must be between 15 and 480",
                "sessionDurationMinutes",
            ));
        }
        match self.connection_type {
            ConnectionType::SkillExchange => {
                if self.exchange_skill_id.is_none() {
                    return Err(SessionError::invalid_field(
                        "skill exchange requires exchangeSkillId",
                        "exchangeSkillId",
                    ));
                }
            }
            ConnectionType::Payment => {
                if self.payment_rate_per_hour.is_none() || self.currency.is_none() {
                    return Err(SessionError::invalid_field(
                        "payment connection requires paymentRatePerHour and currency",
                        "paymentRatePerHour",
                    ));
                }
            }
            ConnectionType::Free => {}
        }
        self.preferences.validate()
    }
}

/// Input for a single additional appointment inside an existing series
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSessionInput {
    pub session_series_id: String,
    pub scheduled_date: DateTime<Utc>,
    pub duration_minutes: Option<u32>,
    pub title: Option<String>,
}
