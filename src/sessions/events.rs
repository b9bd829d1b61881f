/*!
 * Domain Events
 *
 * Stable event names and payloads form the outbox contract with external
 * subscribers (notifications, chat, search, calendar sync). Events are
 * persisted in the same transaction as the aggregate writes and dispatched
 * at-least-once afterwards; payload shape changes are breaking.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sessions::types::ConnectionType;

/// All events the orchestrator can emit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload")]
pub enum DomainEvent {
    #[serde(rename = "ConnectionCreated")]
    ConnectionCreated {
        #[serde(rename = "connectionId")]
        connection_id: String,
        #[serde(rename = "requesterId")]
        requester_id: String,
        #[serde(rename = "targetUserId")]
        target_user_id: String,
        #[serde(rename = "connectionType")]
        connection_type: ConnectionType,
        #[serde(rename = "skillId")]
        skill_id: String,
        #[serde(rename = "totalSessionsPlanned")]
        total_sessions_planned: u32,
    },

    #[serde(rename = "SessionScheduled")]
    SessionScheduled {
        #[serde(rename = "appointmentId")]
        appointment_id: String,
        #[serde(rename = "sessionSeriesId")]
        session_series_id: String,
        #[serde(rename = "scheduledDate")]
        scheduled_date: DateTime<Utc>,
        #[serde(rename = "organizerUserId")]
        organizer_user_id: String,
        #[serde(rename = "participantUserId")]
        participant_user_id: String,
    },

    #[serde(rename = "SessionCompleted")]
    SessionCompleted {
        #[serde(rename = "appointmentId")]
        appointment_id: String,
        #[serde(rename = "sessionSeriesId")]
        session_series_id: String,
        #[serde(rename = "organizerUserId")]
        organizer_user_id: String,
        #[serde(rename = "participantUserId")]
        participant_user_id: String,
        #[serde(rename = "durationMinutes")]
        duration_minutes: u32,
    },

    #[serde(rename = "SessionCancelled")]
    SessionCancelled {
        #[serde(rename = "appointmentId")]
        appointment_id: String,
        #[serde(rename = "sessionSeriesId")]
        session_series_id: String,
        #[serde(rename = "cancelledBy")]
        cancelled_by: String,
        reason: Option<String>,
        #[serde(rename = "isLateCancellation")]
        is_late_cancellation: bool,
    },

    #[serde(rename = "SessionRescheduleRequested")]
    SessionRescheduleRequested {
        #[serde(rename = "appointmentId")]
        appointment_id: String,
        #[serde(rename = "sessionSeriesId")]
        session_series_id: String,
        #[serde(rename = "requestedBy")]
        requested_by: String,
        #[serde(rename = "proposedDate")]
        proposed_date: DateTime<Utc>,
        #[serde(rename = "proposedDuration")]
        proposed_duration: u32,
        reason: Option<String>,
    },

    #[serde(rename = "SessionRescheduled")]
    SessionRescheduled {
        #[serde(rename = "appointmentId")]
        appointment_id: String,
        #[serde(rename = "sessionSeriesId")]
        session_series_id: String,
        #[serde(rename = "oldDate")]
        old_date: DateTime<Utc>,
        #[serde(rename = "newDate")]
        new_date: DateTime<Utc>,
        #[serde(rename = "approvedBy")]
        approved_by: String,
    },

    #[serde(rename = "SessionNoShow")]
    SessionNoShow {
        #[serde(rename = "appointmentId")]
        appointment_id: String,
        #[serde(rename = "sessionSeriesId")]
        session_series_id: String,
        #[serde(rename = "noShowUserIds")]
        no_show_user_ids: Vec<String>,
        #[serde(rename = "reportedBy")]
        reported_by: String,
    },

    #[serde(rename = "MeetingLinkGenerationFailed")]
    MeetingLinkGenerationFailed {
        #[serde(rename = "appointmentId")]
        appointment_id: String,
        error: String,
    },
}

impl DomainEvent {
    /// Stable event name as dispatched to subscribers
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::ConnectionCreated { .. } => "ConnectionCreated",
            DomainEvent::SessionScheduled { .. } => "SessionScheduled",
            DomainEvent::SessionCompleted { .. } => "SessionCompleted",
            DomainEvent::SessionCancelled { .. } => "SessionCancelled",
            DomainEvent::SessionRescheduleRequested { .. } => "SessionRescheduleRequested",
            DomainEvent::SessionRescheduled { .. } => "SessionRescheduled",
            DomainEvent::SessionNoShow { .. } => "SessionNoShow",
            DomainEvent::MeetingLinkGenerationFailed { .. } => "MeetingLinkGenerationFailed",
        }
    }

    /// The entity whose outbox lane this event rides in; delivery is FIFO
    /// per aggregate id and unordered across aggregates
    pub fn aggregate_id(&self) -> &str {
        match self {
            DomainEvent::ConnectionCreated { connection_id, .. } => connection_id,
            DomainEvent::SessionScheduled { appointment_id, .. }
            | DomainEvent::SessionCompleted { appointment_id, .. }
            | DomainEvent::SessionCancelled { appointment_id, .. }
            | DomainEvent::SessionRescheduleRequested { appointment_id, .. }
            | DomainEvent::SessionRescheduled { appointment_id, .. }
            | DomainEvent::SessionNoShow { appointment_id, .. }
            | DomainEvent::MeetingLinkGenerationFailed { appointment_id, .. } => appointment_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_event_names_are_stable() {
        let event = DomainEvent::ConnectionCreated {
            connection_id: "c-1".into(),
            requester_id: "u-R".into(),
            target_user_id: "u-T".into(),
            connection_type: ConnectionType::SkillExchange,
            skill_id: "s-A".into(),
            total_sessions_planned: 5,
        };
        assert_eq!(event.name(), "ConnectionCreated");
        assert_eq!(event.aggregate_id(), "c-1");
    }

    #[test]
    fn test_payload_uses_contract_keys() {
        let event = DomainEvent::SessionRescheduled {
            appointment_id: "a-1".into(),
            session_series_id: "s-1".into(),
            old_date: Utc.with_ymd_and_hms(2025, 6, 2, 18, 0, 0).unwrap(),
            new_date: Utc.with_ymd_and_hms(2025, 6, 5, 18, 0, 0).unwrap(),
            approved_by: "u-T".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["name"], "SessionRescheduled");
        assert_eq!(json["payload"]["appointmentId"], "a-1");
        assert_eq!(json["payload"]["oldDate"], "2025-06-02T18:00:00Z");
        assert_eq!(json["payload"]["newDate"], "2025-06-05T18:00:00Z");
        assert_eq!(json["payload"]["approvedBy"], "u-T");
    }

    #[test]
    fn test_round_trip_through_outbox_encoding() {
        let event = DomainEvent::SessionCancelled {
            appointment_id: "a-9".into(),
            session_series_id: "s-2".into(),
            cancelled_by: "u-R".into(),
            reason: Some("sick".into()),
            is_late_cancellation: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
