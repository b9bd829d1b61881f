/*!
 * Command / Query Facade
 *
 * Translates external requests into orchestrator calls and wraps every
 * outcome in the uniform `{ success, data?, error? }` envelope. Error
 * messages surface the offending aggregate id but never tokens, stack
 * traces, or other internals.
 */

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::calendar::types::{CalendarIntegration, CalendarProvider};
use crate::calendar::CalendarService;
use crate::reminders::types::ReminderSettings;
use crate::sessions::error::{SessionError, SessionResult};
use crate::sessions::orchestrator::{SessionHierarchy, SessionOrchestrator};
use crate::sessions::types::{
    Connection, CreateSessionHierarchyInput, ScheduleSessionInput, SessionAppointment,
    SessionSeries,
};

/// Uniform response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl<T> ResultEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: SessionError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                kind: error.kind().to_string(),
                message: error.to_string(),
            }),
        }
    }

    pub fn from_result(result: SessionResult<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(error) => Self::err(error),
        }
    }
}

pub struct SessionFacade {
    orchestrator: Arc<SessionOrchestrator>,
    calendar: Arc<CalendarService>,
}

impl SessionFacade {
    pub fn new(orchestrator: Arc<SessionOrchestrator>, calendar: Arc<CalendarService>) -> Self {
        Self {
            orchestrator,
            calendar,
        }
    }

    // === Commands ===

    pub async fn create_session_hierarchy_from_match(
        &self,
        input: CreateSessionHierarchyInput,
    ) -> ResultEnvelope<SessionHierarchy> {
        ResultEnvelope::from_result(self.orchestrator.create_session_hierarchy(input).await)
    }

    pub async fn schedule_session(
        &self,
        input: ScheduleSessionInput,
    ) -> ResultEnvelope<SessionAppointment> {
        ResultEnvelope::from_result(self.orchestrator.schedule_session(input).await)
    }

    pub async fn complete_session(&self, appointment_id: &str) -> ResultEnvelope<SessionAppointment> {
        ResultEnvelope::from_result(self.orchestrator.complete_session(appointment_id).await)
    }

    pub async fn cancel_session(
        &self,
        appointment_id: &str,
        cancelled_by: &str,
        reason: Option<String>,
    ) -> ResultEnvelope<SessionAppointment> {
        ResultEnvelope::from_result(
            self.orchestrator
                .cancel_session(appointment_id, cancelled_by, reason)
                .await,
        )
    }

    pub async fn request_reschedule(
        &self,
        appointment_id: &str,
        requested_by: &str,
        proposed_date: DateTime<Utc>,
        proposed_duration: Option<u32>,
        reason: Option<String>,
    ) -> ResultEnvelope<SessionAppointment> {
        ResultEnvelope::from_result(
            self.orchestrator
                .request_reschedule(
                    appointment_id,
                    requested_by,
                    proposed_date,
                    proposed_duration,
                    reason,
                )
                .await,
        )
    }

    pub async fn approve_reschedule(
        &self,
        appointment_id: &str,
        approved_by: &str,
    ) -> ResultEnvelope<SessionAppointment> {
        ResultEnvelope::from_result(
            self.orchestrator
                .approve_reschedule(appointment_id, approved_by)
                .await,
        )
    }

    pub async fn reject_reschedule(
        &self,
        appointment_id: &str,
        rejected_by: &str,
    ) -> ResultEnvelope<SessionAppointment> {
        ResultEnvelope::from_result(
            self.orchestrator
                .reject_reschedule(appointment_id, rejected_by)
                .await,
        )
    }

    pub async fn mark_no_show(
        &self,
        appointment_id: &str,
        reported_by: &str,
        no_show_user_ids: Vec<String>,
    ) -> ResultEnvelope<SessionAppointment> {
        ResultEnvelope::from_result(
            self.orchestrator
                .mark_no_show(appointment_id, reported_by, no_show_user_ids)
                .await,
        )
    }

    pub async fn close_connection(
        &self,
        connection_id: &str,
        closed_by: &str,
        reason: Option<String>,
    ) -> ResultEnvelope<Connection> {
        ResultEnvelope::from_result(
            self.orchestrator
                .close_connection(connection_id, closed_by, reason)
                .await,
        )
    }

    pub async fn set_reminder_settings(
        &self,
        settings: ReminderSettings,
    ) -> ResultEnvelope<()> {
        ResultEnvelope::from_result(self.orchestrator.set_reminder_settings(settings).await)
    }

    pub async fn connect_calendar(
        &self,
        user_id: &str,
        provider: CalendarProvider,
        code: &str,
        redirect_uri: &str,
        calendar_id: Option<String>,
    ) -> ResultEnvelope<CalendarIntegration> {
        ResultEnvelope::from_result(
            self.calendar
                .connect(user_id, provider, code, redirect_uri, calendar_id)
                .await,
        )
    }

    pub async fn disconnect_calendar(
        &self,
        user_id: &str,
        provider: CalendarProvider,
    ) -> ResultEnvelope<bool> {
        ResultEnvelope::from_result(self.calendar.disconnect(user_id, provider).await)
    }

    // === Queries ===

    pub fn calendar_authorization_url(
        &self,
        provider: CalendarProvider,
        state: &str,
        redirect_uri: &str,
    ) -> ResultEnvelope<String> {
        ResultEnvelope::from_result(self.calendar.authorization_url(provider, state, redirect_uri))
    }

    pub async fn get_connection(&self, connection_id: &str) -> ResultEnvelope<Connection> {
        ResultEnvelope::from_result(self.orchestrator.get_connection(connection_id).await)
    }

    pub async fn list_connections_for_user(
        &self,
        user_id: &str,
    ) -> ResultEnvelope<Vec<Connection>> {
        ResultEnvelope::from_result(self.orchestrator.list_connections_for_user(user_id).await)
    }

    pub async fn get_series(&self, series_id: &str) -> ResultEnvelope<SessionSeries> {
        ResultEnvelope::from_result(self.orchestrator.get_series(series_id).await)
    }

    pub async fn list_appointments_for_series(
        &self,
        series_id: &str,
    ) -> ResultEnvelope<Vec<SessionAppointment>> {
        ResultEnvelope::from_result(
            self.orchestrator.list_appointments_for_series(series_id).await,
        )
    }

    pub async fn get_session_hierarchy(
        &self,
        connection_id: &str,
    ) -> ResultEnvelope<SessionHierarchy> {
        ResultEnvelope::from_result(self.orchestrator.load_hierarchy(connection_id).await)
    }

    pub async fn get_appointment(&self, appointment_id: &str) -> ResultEnvelope<SessionAppointment> {
        ResultEnvelope::from_result(self.orchestrator.get_appointment(appointment_id).await)
    }

    pub async fn list_calendar_integrations(
        &self,
        user_id: &str,
    ) -> ResultEnvelope<Vec<CalendarIntegration>> {
        ResultEnvelope::from_result(self.calendar.list_integrations(user_id).await)
    }

    /// Upcoming appointments over the next `days` for a user
    pub async fn list_upcoming_for_user(
        &self,
        user_id: &str,
        days: u32,
    ) -> ResultEnvelope<Vec<SessionAppointment>> {
        let now = Utc::now();
        ResultEnvelope::from_result(
            self.orchestrator
                .list_upcoming_for_user(user_id, now, now + Duration::days(days as i64))
                .await,
        )
    }

    /// Stored settings, or defaults for users who never saved any
    pub async fn get_reminder_settings(&self, user_id: &str) -> ResultEnvelope<ReminderSettings> {
        ResultEnvelope::from_result(self.orchestrator.get_reminder_settings(user_id).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_success_shape() {
        let envelope = ResultEnvelope::ok(42u32);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"], 42);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_envelope_error_shape() {
        let envelope: ResultEnvelope<u32> =
            ResultEnvelope::err(SessionError::not_found("Connection", "c-404"));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["success"], false);
        assert!(json.get("data").is_none());
        assert_eq!(json["error"]["kind"], "NotFound");
        assert_eq!(json["error"]["message"], "Connection not found: c-404");
    }
}
