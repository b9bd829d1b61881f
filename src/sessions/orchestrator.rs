/*!
 * Session Orchestrator
 *
 * The single entry point for every write on the core aggregates. Each
 * command validates its input, takes the owning connection's lock, executes
 * one transaction (retried on transient failures), and writes its domain
 * events into the outbox inside that same transaction. Calendar and meeting
 * link calls are best-effort: their transient failures never fail a command.
 */

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::reminders::planner::ReminderPlanner;
use crate::reminders::types::ReminderSettings;
use crate::sessions::clock::{new_id, SharedClock};
use crate::sessions::contracts::{BusySource, MeetingLinkService};
use crate::sessions::database::SessionDatabase;
use crate::sessions::error::{SessionError, SessionResult};
use crate::sessions::events::DomainEvent;
use crate::sessions::meeting_link::MeetingLinkRetrier;
use crate::sessions::scheduling::{
    generate_schedule, BusyInterval, CandidateSlot, ScheduleOutcome, ScheduleRequest, SeriesSlot,
};
use crate::sessions::state_machine::{transition, AppointmentEvent};
use crate::sessions::types::{
    AppointmentStatus, Connection, ConnectionType, CreateSessionHierarchyInput,
    ScheduleSessionInput, SessionAppointment, SessionSeries,
};

/// Everything a successful hierarchy creation returns
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHierarchy {
    pub connection: Connection,
    pub series: Vec<SessionSeries>,
    pub appointments: Vec<SessionAppointment>,
    /// Set when the command succeeded but the scheduler found no slots
    pub warning: Option<String>,
}

pub struct SessionOrchestrator {
    database: Arc<SessionDatabase>,
    clock: SharedClock,
    meeting_links: Arc<dyn MeetingLinkService>,
    retrier: Arc<MeetingLinkRetrier>,
    planner: Arc<ReminderPlanner>,
    busy_source: Arc<dyn BusySource>,
    /// Per-connection mutation locks; the connection is always locked before
    /// anything below it, which keeps lock ordering deadlock-free
    connection_locks: Arc<RwLock<HashMap<String, Arc<Mutex<()>>>>>,
    external_call_timeout: Duration,
}

impl SessionOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        database: Arc<SessionDatabase>,
        clock: SharedClock,
        meeting_links: Arc<dyn MeetingLinkService>,
        retrier: Arc<MeetingLinkRetrier>,
        planner: Arc<ReminderPlanner>,
        busy_source: Arc<dyn BusySource>,
        external_call_timeout: Duration,
    ) -> Self {
        Self {
            database,
            clock,
            meeting_links,
            retrier,
            planner,
            busy_source,
            connection_locks: Arc::new(RwLock::new(HashMap::new())),
            external_call_timeout,
        }
    }

    async fn connection_lock(&self, connection_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.connection_locks.write().await;
        Arc::clone(
            locks
                .entry(connection_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    // === CreateSessionHierarchyFromMatch ===

    pub async fn create_session_hierarchy(
        &self,
        input: CreateSessionHierarchyInput,
    ) -> SessionResult<SessionHierarchy> {
        input.validate()?;

        // Idempotent replay: the same match with the same parties returns the
        // hierarchy it already produced; a different payload is a conflict.
        if let Some(existing) = self
            .database
            .find_connection_by_match(&input.match_request_id)
            .await?
        {
            if existing.requester_id == input.requester_id
                && existing.target_user_id == input.target_user_id
                && existing.connection_type == input.connection_type
                && existing.skill_id == input.skill_id
            {
                debug!(
                    "Match {} already materialized as connection {}",
                    input.match_request_id, existing.id
                );
                return self.load_hierarchy(&existing.id).await;
            }
            return Err(SessionError::conflict(
                format!("match request {} already materialized", input.match_request_id),
                Some(existing.id),
            ));
        }

        let busy = self.collect_busy_intervals(&input).await;
        let schedule = generate_schedule(&ScheduleRequest {
            preferences: &input.preferences,
            total_sessions: input.total_sessions,
            session_duration_minutes: input.session_duration_minutes,
            requester_id: &input.requester_id,
            target_user_id: &input.target_user_id,
            skill_exchange: input.connection_type == ConnectionType::SkillExchange,
            busy: &busy,
        });

        let (slots, warning) = match schedule {
            ScheduleOutcome::Scheduled(slots) => (slots, None),
            ScheduleOutcome::Infeasible { reason } => {
                warn!(
                    "No feasible schedule for match {}: {}",
                    input.match_request_id, reason
                );
                (Vec::new(), Some("NoFeasibleSchedule".to_string()))
            }
        };

        let hierarchy = self
            .database
            .with_retry("create_session_hierarchy", || {
                self.persist_hierarchy(&input, &slots, warning.clone())
            })
            .await?;

        info!(
            "Created connection {} with {} appointments for match {}",
            hierarchy.connection.id,
            hierarchy.appointments.len(),
            input.match_request_id
        );

        for appointment in &hierarchy.appointments {
            self.attach_meeting_link(appointment).await;
        }

        Ok(hierarchy)
    }

    async fn collect_busy_intervals(
        &self,
        input: &CreateSessionHierarchyInput,
    ) -> Vec<BusyInterval> {
        let start = input.preferences.earliest_start_date;
        let end = start + ChronoDuration::days(365);
        let mut busy = Vec::new();

        for user_id in [&input.requester_id, &input.target_user_id] {
            match self.database.busy_intervals_for_user(user_id).await {
                Ok(mut intervals) => busy.append(&mut intervals),
                Err(error) => warn!("Appointment busy lookup failed for {}: {}", user_id, error),
            }
            match tokio::time::timeout(
                self.external_call_timeout,
                self.busy_source.busy(user_id, start, end),
            )
            .await
            {
                Ok(Ok(mut intervals)) => busy.append(&mut intervals),
                Ok(Err(error)) => {
                    warn!("Calendar busy lookup failed for {}: {}", user_id, error)
                }
                Err(_) => warn!("Calendar busy lookup timed out for {}", user_id),
            }
        }
        busy
    }

    async fn persist_hierarchy(
        &self,
        input: &CreateSessionHierarchyInput,
        slots: &[CandidateSlot],
        warning: Option<String>,
    ) -> SessionResult<SessionHierarchy> {
        let now = self.clock.now();

        let connection = Connection {
            id: new_id(),
            match_request_id: input.match_request_id.clone(),
            requester_id: input.requester_id.clone(),
            target_user_id: input.target_user_id.clone(),
            connection_type: input.connection_type,
            skill_id: input.skill_id.clone(),
            exchange_skill_id: input.exchange_skill_id.clone(),
            payment_rate_per_hour: input.payment_rate_per_hour,
            currency: input.currency.clone(),
            total_sessions_planned: input.total_sessions,
            total_sessions_completed: 0,
            balance_minutes: 0,
            created_at: now,
            updated_at: now,
            closed_at: None,
            is_deleted: false,
            deleted_at: None,
        };
        connection.check_invariants()?;

        // The requester teaches the connection's skill; a skill exchange adds
        // the mirrored series with the remaining sessions.
        let primary_total = if input.connection_type == ConnectionType::SkillExchange {
            input.total_sessions.div_ceil(2)
        } else {
            input.total_sessions
        };

        let mut series = vec![SessionSeries {
            id: new_id(),
            connection_id: connection.id.clone(),
            teacher_user_id: input.requester_id.clone(),
            learner_user_id: input.target_user_id.clone(),
            skill_id: input.skill_id.clone(),
            total_sessions: primary_total,
            completed_sessions: 0,
            default_duration_minutes: input.session_duration_minutes,
            title: input.title.clone(),
            description: input.description.clone(),
            created_at: now,
            updated_at: now,
            is_deleted: false,
            deleted_at: None,
        }];

        if input.connection_type == ConnectionType::SkillExchange {
            series.push(SessionSeries {
                id: new_id(),
                connection_id: connection.id.clone(),
                teacher_user_id: input.target_user_id.clone(),
                learner_user_id: input.requester_id.clone(),
                skill_id: input
                    .exchange_skill_id
                    .clone()
                    .ok_or_else(|| SessionError::invalid_input("exchange skill missing"))?,
                total_sessions: input.total_sessions - primary_total,
                completed_sessions: 0,
                default_duration_minutes: input.session_duration_minutes,
                title: input.title.clone(),
                description: input.description.clone(),
                created_at: now,
                updated_at: now,
                is_deleted: false,
                deleted_at: None,
            });
        }

        let appointments: Vec<SessionAppointment> = slots
            .iter()
            .map(|slot| {
                let series_id = match slot.series_slot {
                    SeriesSlot::Primary => series[0].id.clone(),
                    SeriesSlot::Secondary => series[1].id.clone(),
                };
                SessionAppointment {
                    id: new_id(),
                    session_series_id: series_id,
                    session_number: slot.session_number,
                    title: format!("{} - Session {}", input.title, slot.session_number),
                    scheduled_date: slot.scheduled_date,
                    duration_minutes: slot.duration_minutes,
                    organizer_user_id: slot.organizer_user_id.clone(),
                    participant_user_id: slot.participant_user_id.clone(),
                    meeting_link: None,
                    status: AppointmentStatus::Scheduled,
                    cancelled_by: None,
                    cancel_reason: None,
                    reschedule_requested_by: None,
                    proposed_date: None,
                    proposed_duration: None,
                    reschedule_reason: None,
                    reschedule_prior_status: None,
                    no_show_user_ids: Vec::new(),
                    no_show_reported_by: None,
                    is_auto_created: true,
                    is_late_cancellation: false,
                    created_at: now,
                    updated_at: now,
                    is_deleted: false,
                    deleted_at: None,
                }
            })
            .collect();

        let mut tx = self.database.begin().await?;
        self.database.insert_connection(&mut tx, &connection).await?;
        for entry in &series {
            self.database.insert_series(&mut tx, entry).await?;
        }
        self.database
            .insert_event(
                &mut tx,
                &DomainEvent::ConnectionCreated {
                    connection_id: connection.id.clone(),
                    requester_id: connection.requester_id.clone(),
                    target_user_id: connection.target_user_id.clone(),
                    connection_type: connection.connection_type,
                    skill_id: connection.skill_id.clone(),
                    total_sessions_planned: connection.total_sessions_planned,
                },
            )
            .await?;
        for appointment in &appointments {
            self.database.insert_appointment(&mut tx, appointment).await?;
            self.database
                .insert_event(&mut tx, &scheduled_event(appointment))
                .await?;
        }
        tx.commit().await?;

        Ok(SessionHierarchy {
            connection,
            series,
            appointments,
            warning,
        })
    }

    /// One synchronous link attempt; failures fall back to the retrier
    async fn attach_meeting_link(&self, appointment: &SessionAppointment) {
        let result = tokio::time::timeout(
            self.external_call_timeout,
            self.meeting_links.generate_meeting_link(&appointment.id),
        )
        .await;

        let error = match result {
            Ok(Ok(link)) => {
                match self.database.set_meeting_link(&appointment.id, &link).await {
                    Ok(true) => {
                        let mut updated = appointment.clone();
                        updated.meeting_link = Some(link);
                        if let Err(error) = self.planner.schedule_for_appointment(&updated).await {
                            warn!(
                                "Reminder planning failed for {}: {}",
                                appointment.id, error
                            );
                        }
                        return;
                    }
                    Ok(false) => return,
                    Err(error) => error,
                }
            }
            Ok(Err(error)) => error,
            Err(_) => SessionError::transient("meeting link call timed out", "meeting_link"),
        };

        warn!(
            "Meeting link generation failed for {}: {}",
            appointment.id, error
        );
        if let Ok(mut tx) = self.database.begin().await {
            let event = DomainEvent::MeetingLinkGenerationFailed {
                appointment_id: appointment.id.clone(),
                error: error.to_string(),
            };
            if self.database.insert_event(&mut tx, &event).await.is_ok() {
                let _ = tx.commit().await;
            }
        }
        self.retrier.enqueue(appointment.id.clone());
    }

    // === ScheduleSession ===

    pub async fn schedule_session(
        &self,
        input: ScheduleSessionInput,
    ) -> SessionResult<SessionAppointment> {
        let series = self.database.get_series(&input.session_series_id).await?;
        let lock = self.connection_lock(&series.connection_id).await;
        let _guard = lock.lock().await;

        let appointment = self
            .database
            .with_retry("schedule_session", || self.schedule_session_once(&input))
            .await?;

        self.attach_meeting_link(&appointment).await;
        Ok(appointment)
    }

    async fn schedule_session_once(
        &self,
        input: &ScheduleSessionInput,
    ) -> SessionResult<SessionAppointment> {
        let now = self.clock.now();
        let mut tx = self.database.begin().await?;
        let series = self.database.get_series_tx(&mut tx, &input.session_series_id).await?;

        if series.is_complete() {
            return Err(SessionError::conflict(
                format!("series {} is already complete", series.id),
                Some(series.id.clone()),
            ));
        }

        let session_number = self.database.next_session_number(&mut tx, &series.id).await?;
        let appointment = SessionAppointment {
            id: new_id(),
            session_series_id: series.id.clone(),
            session_number,
            title: input
                .title
                .clone()
                .unwrap_or_else(|| format!("{} - Session {}", series.title, session_number)),
            scheduled_date: input.scheduled_date,
            duration_minutes: input.duration_minutes.unwrap_or(series.default_duration_minutes),
            organizer_user_id: series.teacher_user_id.clone(),
            participant_user_id: series.learner_user_id.clone(),
            meeting_link: None,
            status: AppointmentStatus::Scheduled,
            cancelled_by: None,
            cancel_reason: None,
            reschedule_requested_by: None,
            proposed_date: None,
            proposed_duration: None,
            reschedule_reason: None,
            reschedule_prior_status: None,
            no_show_user_ids: Vec::new(),
            no_show_reported_by: None,
            is_auto_created: false,
            is_late_cancellation: false,
            created_at: now,
            updated_at: now,
            is_deleted: false,
            deleted_at: None,
        };

        self.database.insert_appointment(&mut tx, &appointment).await?;
        self.database
            .insert_event(&mut tx, &scheduled_event(&appointment))
            .await?;
        tx.commit().await?;
        Ok(appointment)
    }

    // === CompleteSession ===

    pub async fn complete_session(
        &self,
        appointment_id: &str,
    ) -> SessionResult<SessionAppointment> {
        let series = self.series_of(appointment_id).await?;
        let lock = self.connection_lock(&series.connection_id).await;
        let _guard = lock.lock().await;

        self.database
            .with_retry("complete_session", || self.complete_session_once(appointment_id))
            .await
    }

    async fn complete_session_once(
        &self,
        appointment_id: &str,
    ) -> SessionResult<SessionAppointment> {
        let now = self.clock.now();
        let mut tx = self.database.begin().await?;

        let mut appointment = self.database.get_appointment_tx(&mut tx, appointment_id).await?;
        let previous_status = appointment.status;
        appointment.status = transition(appointment_id, previous_status, AppointmentEvent::Finish)?;

        let mut series = self
            .database
            .get_series_tx(&mut tx, &appointment.session_series_id)
            .await?;
        let mut connection = self.database.get_connection_tx(&mut tx, &series.connection_id).await?;

        series.completed_sessions += 1;
        connection.total_sessions_completed += 1;
        if connection.connection_type == ConnectionType::SkillExchange {
            let delta = appointment.duration_minutes as i64;
            if series.teacher_user_id == connection.requester_id {
                connection.balance_minutes += delta;
            } else {
                connection.balance_minutes -= delta;
            }
        }
        if connection.total_sessions_completed == connection.total_sessions_planned {
            connection.closed_at = Some(now);
            info!("Connection {} completed all planned sessions", connection.id);
        }
        connection.check_invariants()?;
        if series.completed_sessions > series.total_sessions {
            return Err(SessionError::fatal(
                format!("series {} overflowed its planned sessions", series.id),
                Some("invariant".to_string()),
            ));
        }

        self.database
            .update_appointment_guarded(&mut tx, &appointment, previous_status)
            .await?;
        self.database.update_series(&mut tx, &series).await?;
        self.database.update_connection(&mut tx, &connection).await?;
        self.database.cancel_pending_reminders(&mut tx, appointment_id).await?;
        self.database
            .insert_event(
                &mut tx,
                &DomainEvent::SessionCompleted {
                    appointment_id: appointment.id.clone(),
                    session_series_id: appointment.session_series_id.clone(),
                    organizer_user_id: appointment.organizer_user_id.clone(),
                    participant_user_id: appointment.participant_user_id.clone(),
                    duration_minutes: appointment.duration_minutes,
                },
            )
            .await?;
        tx.commit().await?;
        Ok(appointment)
    }

    // === CancelSession ===

    pub async fn cancel_session(
        &self,
        appointment_id: &str,
        cancelled_by: &str,
        reason: Option<String>,
    ) -> SessionResult<SessionAppointment> {
        let series = self.series_of(appointment_id).await?;
        let lock = self.connection_lock(&series.connection_id).await;
        let _guard = lock.lock().await;

        self.database
            .with_retry("cancel_session", || {
                self.cancel_session_once(appointment_id, cancelled_by, reason.clone())
            })
            .await
    }

    async fn cancel_session_once(
        &self,
        appointment_id: &str,
        cancelled_by: &str,
        reason: Option<String>,
    ) -> SessionResult<SessionAppointment> {
        let now = self.clock.now();
        let mut tx = self.database.begin().await?;

        let mut appointment = self.database.get_appointment_tx(&mut tx, appointment_id).await?;
        let previous_status = appointment.status;
        appointment.status = transition(appointment_id, previous_status, AppointmentEvent::Cancel)?;
        appointment.cancelled_by = Some(cancelled_by.to_string());
        appointment.cancel_reason = reason.clone();
        appointment.is_late_cancellation =
            appointment.scheduled_date - now < ChronoDuration::hours(24);

        self.database
            .update_appointment_guarded(&mut tx, &appointment, previous_status)
            .await?;
        self.database.cancel_pending_reminders(&mut tx, appointment_id).await?;
        self.database
            .insert_event(
                &mut tx,
                &DomainEvent::SessionCancelled {
                    appointment_id: appointment.id.clone(),
                    session_series_id: appointment.session_series_id.clone(),
                    cancelled_by: cancelled_by.to_string(),
                    reason,
                    is_late_cancellation: appointment.is_late_cancellation,
                },
            )
            .await?;
        tx.commit().await?;
        Ok(appointment)
    }

    // === RequestReschedule ===

    pub async fn request_reschedule(
        &self,
        appointment_id: &str,
        requested_by: &str,
        proposed_date: DateTime<Utc>,
        proposed_duration: Option<u32>,
        reason: Option<String>,
    ) -> SessionResult<SessionAppointment> {
        let series = self.series_of(appointment_id).await?;
        let lock = self.connection_lock(&series.connection_id).await;
        let _guard = lock.lock().await;

        self.database
            .with_retry("request_reschedule", || {
                self.request_reschedule_once(
                    appointment_id,
                    requested_by,
                    proposed_date,
                    proposed_duration,
                    reason.clone(),
                )
            })
            .await
    }

    async fn request_reschedule_once(
        &self,
        appointment_id: &str,
        requested_by: &str,
        proposed_date: DateTime<Utc>,
        proposed_duration: Option<u32>,
        reason: Option<String>,
    ) -> SessionResult<SessionAppointment> {
        let now = self.clock.now();
        let mut tx = self.database.begin().await?;

        let mut appointment = self.database.get_appointment_tx(&mut tx, appointment_id).await?;
        if !appointment.is_party(requested_by) {
            return Err(SessionError::invalid_field(
                format!("{} is not a party of this appointment", requested_by),
                "requestedBy",
            ));
        }
        if proposed_date <= now + ChronoDuration::hours(1) {
            return Err(SessionError::invalid_field(
                "proposed date must be more than one hour in the future",
                "proposedDate",
            ));
        }

        let previous_status = appointment.status;
        appointment.status =
            transition(appointment_id, previous_status, AppointmentEvent::RequestReschedule)?;
        appointment.reschedule_requested_by = Some(requested_by.to_string());
        appointment.proposed_date = Some(proposed_date);
        appointment.proposed_duration = proposed_duration;
        appointment.reschedule_reason = reason.clone();
        appointment.reschedule_prior_status = Some(previous_status);

        self.database
            .update_appointment_guarded(&mut tx, &appointment, previous_status)
            .await?;
        self.database
            .insert_event(
                &mut tx,
                &DomainEvent::SessionRescheduleRequested {
                    appointment_id: appointment.id.clone(),
                    session_series_id: appointment.session_series_id.clone(),
                    requested_by: requested_by.to_string(),
                    proposed_date,
                    proposed_duration: proposed_duration
                        .unwrap_or(appointment.duration_minutes),
                    reason,
                },
            )
            .await?;
        tx.commit().await?;
        Ok(appointment)
    }

    // === ApproveReschedule ===

    pub async fn approve_reschedule(
        &self,
        appointment_id: &str,
        approved_by: &str,
    ) -> SessionResult<SessionAppointment> {
        let series = self.series_of(appointment_id).await?;
        let lock = self.connection_lock(&series.connection_id).await;
        let _guard = lock.lock().await;

        let appointment = self
            .database
            .with_retry("approve_reschedule", || {
                self.approve_reschedule_once(appointment_id, approved_by)
            })
            .await?;

        // The appointment moved: regenerate reminders from a fresh snapshot.
        if let Err(error) = self.planner.schedule_for_appointment(&appointment).await {
            warn!("Reminder replanning failed for {}: {}", appointment_id, error);
        }
        Ok(appointment)
    }

    async fn approve_reschedule_once(
        &self,
        appointment_id: &str,
        approved_by: &str,
    ) -> SessionResult<SessionAppointment> {
        let mut tx = self.database.begin().await?;

        let mut appointment = self.database.get_appointment_tx(&mut tx, appointment_id).await?;
        if !appointment.is_party(approved_by) {
            return Err(SessionError::invalid_field(
                format!("{} is not a party of this appointment", approved_by),
                "approvedBy",
            ));
        }
        if appointment.reschedule_requested_by.as_deref() == Some(approved_by) {
            return Err(SessionError::illegal_transition(
                "a reschedule cannot be approved by its requester",
                appointment_id,
                appointment.status.to_string(),
            ));
        }

        let previous_status = appointment.status;
        appointment.status =
            transition(appointment_id, previous_status, AppointmentEvent::ApproveReschedule)?;

        let old_date = appointment.scheduled_date;
        let new_date = appointment.proposed_date.ok_or_else(|| {
            SessionError::fatal(
                format!("appointment {} is pending without a proposal", appointment_id),
                Some("invariant".to_string()),
            )
        })?;
        appointment.scheduled_date = new_date;
        if let Some(duration) = appointment.proposed_duration {
            appointment.duration_minutes = duration;
        }
        appointment.reschedule_requested_by = None;
        appointment.proposed_date = None;
        appointment.proposed_duration = None;
        appointment.reschedule_reason = None;
        appointment.reschedule_prior_status = None;

        self.database
            .update_appointment_guarded(&mut tx, &appointment, previous_status)
            .await?;
        self.database.cancel_pending_reminders(&mut tx, appointment_id).await?;
        self.database
            .insert_event(
                &mut tx,
                &DomainEvent::SessionRescheduled {
                    appointment_id: appointment.id.clone(),
                    session_series_id: appointment.session_series_id.clone(),
                    old_date,
                    new_date,
                    approved_by: approved_by.to_string(),
                },
            )
            .await?;
        tx.commit().await?;
        Ok(appointment)
    }

    // === RejectReschedule ===

    pub async fn reject_reschedule(
        &self,
        appointment_id: &str,
        rejected_by: &str,
    ) -> SessionResult<SessionAppointment> {
        let series = self.series_of(appointment_id).await?;
        let lock = self.connection_lock(&series.connection_id).await;
        let _guard = lock.lock().await;

        self.database
            .with_retry("reject_reschedule", || {
                self.reject_reschedule_once(appointment_id, rejected_by)
            })
            .await
    }

    async fn reject_reschedule_once(
        &self,
        appointment_id: &str,
        rejected_by: &str,
    ) -> SessionResult<SessionAppointment> {
        let mut tx = self.database.begin().await?;

        let mut appointment = self.database.get_appointment_tx(&mut tx, appointment_id).await?;
        if !appointment.is_party(rejected_by) {
            return Err(SessionError::invalid_field(
                format!("{} is not a party of this appointment", rejected_by),
                "rejectedBy",
            ));
        }
        if appointment.reschedule_requested_by.as_deref() == Some(rejected_by) {
            return Err(SessionError::illegal_transition(
                "a reschedule cannot be rejected by its requester",
                appointment_id,
                appointment.status.to_string(),
            ));
        }

        let previous_status = appointment.status;
        let prior = appointment
            .reschedule_prior_status
            .unwrap_or(AppointmentStatus::Scheduled);
        appointment.status = transition(
            appointment_id,
            previous_status,
            AppointmentEvent::RejectReschedule { prior },
        )?;
        appointment.reschedule_requested_by = None;
        appointment.proposed_date = None;
        appointment.proposed_duration = None;
        appointment.reschedule_reason = None;
        appointment.reschedule_prior_status = None;

        self.database
            .update_appointment_guarded(&mut tx, &appointment, previous_status)
            .await?;
        tx.commit().await?;
        Ok(appointment)
    }

    // === MarkAsNoShow ===

    pub async fn mark_no_show(
        &self,
        appointment_id: &str,
        reported_by: &str,
        no_show_user_ids: Vec<String>,
    ) -> SessionResult<SessionAppointment> {
        let series = self.series_of(appointment_id).await?;
        let lock = self.connection_lock(&series.connection_id).await;
        let _guard = lock.lock().await;

        self.database
            .with_retry("mark_no_show", || {
                self.mark_no_show_once(appointment_id, reported_by, no_show_user_ids.clone())
            })
            .await
    }

    async fn mark_no_show_once(
        &self,
        appointment_id: &str,
        reported_by: &str,
        no_show_user_ids: Vec<String>,
    ) -> SessionResult<SessionAppointment> {
        let now = self.clock.now();
        let mut tx = self.database.begin().await?;

        let mut appointment = self.database.get_appointment_tx(&mut tx, appointment_id).await?;
        if !appointment.is_party(reported_by) {
            return Err(SessionError::invalid_field(
                format!("{} is not a party of this appointment", reported_by),
                "reportedBy",
            ));
        }
        for user_id in &no_show_user_ids {
            if !appointment.is_party(user_id) {
                return Err(SessionError::invalid_field(
                    format!("{} is not a party of this appointment", user_id),
                    "noShowUserIds",
                ));
            }
        }
        if now <= appointment.end_time() {
            return Err(SessionError::illegal_transition(
                "the session has not ended yet",
                appointment_id,
                appointment.status.to_string(),
            ));
        }

        let previous_status = appointment.status;
        appointment.status =
            transition(appointment_id, previous_status, AppointmentEvent::MarkNoShow)?;
        appointment.no_show_user_ids = no_show_user_ids.clone();
        appointment.no_show_reported_by = Some(reported_by.to_string());

        self.database
            .update_appointment_guarded(&mut tx, &appointment, previous_status)
            .await?;
        self.database.cancel_pending_reminders(&mut tx, appointment_id).await?;
        self.database
            .insert_event(
                &mut tx,
                &DomainEvent::SessionNoShow {
                    appointment_id: appointment.id.clone(),
                    session_series_id: appointment.session_series_id.clone(),
                    no_show_user_ids,
                    reported_by: reported_by.to_string(),
                },
            )
            .await?;
        tx.commit().await?;
        Ok(appointment)
    }

    // === CloseConnection (admin) ===

    pub async fn close_connection(
        &self,
        connection_id: &str,
        closed_by: &str,
        reason: Option<String>,
    ) -> SessionResult<Connection> {
        let lock = self.connection_lock(connection_id).await;
        let _guard = lock.lock().await;

        let now = self.clock.now();
        let mut connection = self.database.get_connection(connection_id).await?;
        if connection.is_closed() {
            return Ok(connection);
        }

        let series = self.database.list_series_for_connection(connection_id).await?;
        let mut tx = self.database.begin().await?;
        connection.closed_at = Some(now);
        self.database.update_connection(&mut tx, &connection).await?;

        for entry in &series {
            for mut appointment in
                self.database.list_appointments_for_series(&entry.id).await?
            {
                if appointment.status.is_terminal() {
                    continue;
                }
                let previous_status = appointment.status;
                appointment.status = AppointmentStatus::Cancelled;
                appointment.cancelled_by = Some(closed_by.to_string());
                appointment.cancel_reason = reason.clone();
                self.database
                    .update_appointment_guarded(&mut tx, &appointment, previous_status)
                    .await?;
                self.database
                    .cancel_pending_reminders(&mut tx, &appointment.id)
                    .await?;
                self.database
                    .insert_event(
                        &mut tx,
                        &DomainEvent::SessionCancelled {
                            appointment_id: appointment.id.clone(),
                            session_series_id: appointment.session_series_id.clone(),
                            cancelled_by: closed_by.to_string(),
                            reason: reason.clone(),
                            is_late_cancellation: false,
                        },
                    )
                    .await?;
            }
        }
        tx.commit().await?;

        info!("Connection {} closed by {}", connection_id, closed_by);
        Ok(connection)
    }

    // === SetReminderSettings ===

    pub async fn set_reminder_settings(&self, settings: ReminderSettings) -> SessionResult<()> {
        settings.validate()?;
        self.database
            .with_retry("set_reminder_settings", || async {
                self.database.upsert_reminder_settings(&settings).await
            })
            .await
    }

    // === Queries ===

    pub async fn get_connection(&self, connection_id: &str) -> SessionResult<Connection> {
        self.database.get_connection(connection_id).await
    }

    pub async fn get_appointment(&self, appointment_id: &str) -> SessionResult<SessionAppointment> {
        self.database.get_appointment(appointment_id).await
    }

    pub async fn list_connections_for_user(&self, user_id: &str) -> SessionResult<Vec<Connection>> {
        self.database.list_connections_for_user(user_id).await
    }

    pub async fn get_series(&self, series_id: &str) -> SessionResult<SessionSeries> {
        self.database.get_series(series_id).await
    }

    pub async fn list_appointments_for_series(
        &self,
        series_id: &str,
    ) -> SessionResult<Vec<SessionAppointment>> {
        // An unknown series surfaces as NotFound, not an empty list.
        self.database.get_series(series_id).await?;
        self.database.list_appointments_for_series(series_id).await
    }

    pub async fn list_upcoming_for_user(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> SessionResult<Vec<SessionAppointment>> {
        self.database.list_upcoming_for_user(user_id, from, to).await
    }

    pub async fn get_reminder_settings(&self, user_id: &str) -> SessionResult<ReminderSettings> {
        Ok(self
            .database
            .get_reminder_settings(user_id)
            .await?
            .unwrap_or_else(|| ReminderSettings::defaults_for(user_id, self.clock.now())))
    }

    pub async fn load_hierarchy(&self, connection_id: &str) -> SessionResult<SessionHierarchy> {
        let connection = self.database.get_connection(connection_id).await?;
        let series = self.database.list_series_for_connection(connection_id).await?;
        let mut appointments = Vec::new();
        for entry in &series {
            appointments.extend(self.database.list_appointments_for_series(&entry.id).await?);
        }
        appointments.sort_by_key(|a| (a.scheduled_date, a.session_number));
        Ok(SessionHierarchy {
            connection,
            series,
            appointments,
            warning: None,
        })
    }

    async fn series_of(&self, appointment_id: &str) -> SessionResult<SessionSeries> {
        let appointment = self.database.get_appointment(appointment_id).await?;
        self.database.get_series(&appointment.session_series_id).await
    }
}

fn scheduled_event(appointment: &SessionAppointment) -> DomainEvent {
    DomainEvent::SessionScheduled {
        appointment_id: appointment.id.clone(),
        session_series_id: appointment.session_series_id.clone(),
        scheduled_date: appointment.scheduled_date,
        organizer_user_id: appointment.organizer_user_id.clone(),
        participant_user_id: appointment.participant_user_id.clone(),
    }
}
