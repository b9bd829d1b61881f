/*!
 * End-to-end scenarios for the session orchestration engine: hierarchy
 * materialization, lifecycle commands, reminder pruning, and outbox
 * delivery, all against a real SQLite store with fake collaborators.
 */

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc, Weekday};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::calendar::{CalendarIntegrationStore, CalendarService};
use crate::reminders::planner::ReminderPlanner;
use crate::reminders::types::ReminderStatus;
use crate::sessions::clock::{FixedClock, SharedClock};
use crate::sessions::contracts::{
    BusySource, EventSubscriber, FlakyMeetingLinks, InMemorySkillCatalog, InMemoryUserDirectory,
    UserContact,
};
use crate::sessions::database::test_support::scratch_db;
use crate::sessions::database::SessionDatabase;
use crate::sessions::error::SessionResult;
use crate::sessions::events::DomainEvent;
use crate::sessions::facade::SessionFacade;
use crate::sessions::meeting_link::MeetingLinkRetrier;
use crate::sessions::orchestrator::SessionOrchestrator;
use crate::sessions::outbox::OutboxDispatcher;
use crate::sessions::scheduling::BusyInterval;
use crate::sessions::types::{
    AppointmentStatus, ConnectionType, CreateSessionHierarchyInput, SchedulingPreferences,
    ScheduleSessionInput,
};

/// Sunday noon; the requested window starts the next day
fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn monday() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap()
}

struct FixedBusy(Vec<BusyInterval>);

#[async_trait]
impl BusySource for FixedBusy {
    async fn busy(
        &self,
        _user_id: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> SessionResult<Vec<BusyInterval>> {
        Ok(self.0.clone())
    }
}

struct RecordingSubscriber {
    events: Arc<Mutex<Vec<DomainEvent>>>,
}

#[async_trait]
impl EventSubscriber for RecordingSubscriber {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn handle(&self, event: &DomainEvent) -> SessionResult<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

struct Harness {
    database: Arc<SessionDatabase>,
    orchestrator: Arc<SessionOrchestrator>,
    facade: SessionFacade,
    outbox: Arc<OutboxDispatcher>,
    events: Arc<Mutex<Vec<DomainEvent>>>,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn new() -> Self {
        Self::with_busy(Vec::new()).await
    }

    async fn with_busy(busy: Vec<BusyInterval>) -> Self {
        let (database, dir) = scratch_db().await;
        let database = Arc::new(database);
        let clock: SharedClock = Arc::new(FixedClock(test_now()));

        let directory = Arc::new(
            InMemoryUserDirectory::new()
                .with_contact(contact("u-R", "Rita"))
                .with_contact(contact("u-T", "Tom")),
        );
        let skills = Arc::new(
            InMemorySkillCatalog::new()
                .with_skill("s-A", "Guitar")
                .with_skill("s-B", "Spanish"),
        );
        let meeting_links = Arc::new(FlakyMeetingLinks::reliable("https://meet.example.com"));
        let planner = Arc::new(ReminderPlanner::new(
            Arc::clone(&database),
            directory,
            skills,
            Arc::clone(&clock),
        ));
        let retrier = Arc::new(MeetingLinkRetrier::new(
            Arc::clone(&database),
            meeting_links.clone(),
            Arc::clone(&planner),
            Duration::from_millis(5),
            Duration::from_millis(20),
        ));
        let orchestrator = Arc::new(SessionOrchestrator::new(
            Arc::clone(&database),
            Arc::clone(&clock),
            meeting_links,
            retrier,
            planner,
            Arc::new(FixedBusy(busy)),
            Duration::from_secs(10),
        ));

        let outbox = Arc::new(OutboxDispatcher::new(
            Arc::clone(&database),
            Duration::from_secs(5),
            100,
        ));
        let events = Arc::new(Mutex::new(Vec::new()));
        outbox
            .register_subscriber(Arc::new(RecordingSubscriber {
                events: Arc::clone(&events),
            }))
            .await;

        let store = Arc::new(
            CalendarIntegrationStore::new(database.pool().clone())
                .await
                .unwrap(),
        );
        let facade = SessionFacade::new(
            Arc::clone(&orchestrator),
            Arc::new(CalendarService::new(store)),
        );

        Self {
            database,
            orchestrator,
            facade,
            outbox,
            events,
            _dir: dir,
        }
    }

    async fn drain_events(&self) -> Vec<DomainEvent> {
        while self.outbox.drain_once().await.unwrap() > 0 {}
        let events = self.events.lock().await.clone();
        self.events.lock().await.clear();
        events
    }
}

fn contact(user_id: &str, name: &str) -> UserContact {
    UserContact {
        user_id: user_id.to_string(),
        display_name: name.to_string(),
        email: Some(format!("{}@example.com", user_id)),
        phone: None,
        push_token: None,
        timezone: Some("Europe/Berlin".to_string()),
    }
}

fn exchange_input(match_id: &str) -> CreateSessionHierarchyInput {
    CreateSessionHierarchyInput {
        match_request_id: match_id.to_string(),
        requester_id: "u-R".to_string(),
        target_user_id: "u-T".to_string(),
        connection_type: ConnectionType::SkillExchange,
        skill_id: "s-A".to_string(),
        exchange_skill_id: Some("s-B".to_string()),
        payment_rate_per_hour: None,
        currency: None,
        total_sessions: 5,
        session_duration_minutes: 60,
        title: "Guitar for Spanish".to_string(),
        description: None,
        preferences: SchedulingPreferences {
            preferred_days: vec![Weekday::Mon, Weekday::Wed],
            preferred_times: vec!["18:00".to_string()],
            earliest_start_date: monday(),
            minimum_days_between: 1,
            maximum_days_between: 14,
            distribute_evenly: false,
        },
    }
}

// === S1: skill exchange split ===

#[tokio::test]
async fn test_s1_skill_exchange_split() {
    let harness = Harness::new().await;
    let hierarchy = harness
        .orchestrator
        .create_session_hierarchy(exchange_input("m-1"))
        .await
        .unwrap();

    assert!(hierarchy.warning.is_none());
    assert_eq!(hierarchy.connection.total_sessions_planned, 5);
    assert_eq!(hierarchy.series.len(), 2);

    let primary = &hierarchy.series[0];
    assert_eq!(primary.teacher_user_id, "u-R");
    assert_eq!(primary.learner_user_id, "u-T");
    assert_eq!(primary.skill_id, "s-A");
    assert_eq!(primary.total_sessions, 3);

    let secondary = &hierarchy.series[1];
    assert_eq!(secondary.teacher_user_id, "u-T");
    assert_eq!(secondary.skill_id, "s-B");
    assert_eq!(secondary.total_sessions, 2);

    let numbers: Vec<u32> = hierarchy.appointments.iter().map(|a| a.session_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    let organizers: Vec<&str> = hierarchy
        .appointments
        .iter()
        .map(|a| a.organizer_user_id.as_str())
        .collect();
    assert_eq!(organizers, vec!["u-R", "u-T", "u-R", "u-T", "u-R"]);
    assert_eq!(
        hierarchy.appointments[0].scheduled_date,
        Utc.with_ymd_and_hms(2025, 6, 2, 18, 0, 0).unwrap()
    );

    // Meeting links were generated synchronously by the reliable fake.
    let stored = harness
        .database
        .get_appointment(&hierarchy.appointments[0].id)
        .await
        .unwrap();
    assert!(stored.meeting_link.as_deref().unwrap().starts_with("https://meet.example.com/join/"));

    let events = harness.drain_events().await;
    assert_eq!(
        events.iter().filter(|e| e.name() == "ConnectionCreated").count(),
        1
    );
    assert_eq!(
        events.iter().filter(|e| e.name() == "SessionScheduled").count(),
        5
    );
}

#[tokio::test]
async fn test_s1_replay_is_idempotent() {
    let harness = Harness::new().await;
    let first = harness
        .orchestrator
        .create_session_hierarchy(exchange_input("m-1"))
        .await
        .unwrap();
    let second = harness
        .orchestrator
        .create_session_hierarchy(exchange_input("m-1"))
        .await
        .unwrap();

    assert_eq!(first.connection.id, second.connection.id);
    assert_eq!(second.appointments.len(), 5);

    // A different payload under the same match id is a conflict.
    let mut changed = exchange_input("m-1");
    changed.skill_id = "s-Z".to_string();
    let error = harness
        .orchestrator
        .create_session_hierarchy(changed)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), "Conflict");
}

// === S2: late cancellation ===

#[tokio::test]
async fn test_s2_cancel_within_24_hours() {
    let harness = Harness::new().await;
    let hierarchy = harness
        .orchestrator
        .create_session_hierarchy(exchange_input("m-1"))
        .await
        .unwrap();

    // Move one appointment to six hours from now.
    let series_id = hierarchy.series[0].id.clone();
    let near = harness
        .orchestrator
        .schedule_session(ScheduleSessionInput {
            session_series_id: series_id,
            scheduled_date: test_now() + ChronoDuration::hours(6),
            duration_minutes: None,
            title: None,
        })
        .await
        .unwrap();

    let reminders_before = harness
        .database
        .list_reminders_for_appointment(&near.id)
        .await
        .unwrap();
    assert!(!reminders_before.is_empty());

    let cancelled = harness
        .orchestrator
        .cancel_session(&near.id, "u-R", Some("sick".to_string()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
    assert!(cancelled.is_late_cancellation);

    let reminders_after = harness
        .database
        .list_reminders_for_appointment(&near.id)
        .await
        .unwrap();
    assert!(reminders_after
        .iter()
        .all(|r| r.status == ReminderStatus::Cancelled));

    let events = harness.drain_events().await;
    let cancel_event = events
        .iter()
        .find(|e| matches!(e, DomainEvent::SessionCancelled { appointment_id, .. } if *appointment_id == near.id))
        .expect("SessionCancelled emitted");
    match cancel_event {
        DomainEvent::SessionCancelled {
            cancelled_by,
            is_late_cancellation,
            ..
        } => {
            assert_eq!(cancelled_by, "u-R");
            assert!(is_late_cancellation);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_cancel_far_ahead_is_not_late() {
    let harness = Harness::new().await;
    let hierarchy = harness
        .orchestrator
        .create_session_hierarchy(exchange_input("m-1"))
        .await
        .unwrap();

    let target = &hierarchy.appointments[4];
    let cancelled = harness
        .orchestrator
        .cancel_session(&target.id, "u-T", None)
        .await
        .unwrap();
    assert!(!cancelled.is_late_cancellation);
}

// === S3 / S4: reschedule ===

#[tokio::test]
async fn test_s3_reschedule_approval_moves_the_session() {
    let harness = Harness::new().await;
    let hierarchy = harness
        .orchestrator
        .create_session_hierarchy(exchange_input("m-1"))
        .await
        .unwrap();

    let appointment = &hierarchy.appointments[0];
    let old_date = appointment.scheduled_date;
    let new_date = old_date + ChronoDuration::days(3);

    harness
        .orchestrator
        .request_reschedule(&appointment.id, "u-R", new_date, None, Some("conflict".into()))
        .await
        .unwrap();

    let pending = harness
        .database
        .get_appointment(&appointment.id)
        .await
        .unwrap();
    assert_eq!(pending.status, AppointmentStatus::RescheduleRequested);
    assert_eq!(pending.proposed_date, Some(new_date));

    let approved = harness
        .orchestrator
        .approve_reschedule(&appointment.id, "u-T")
        .await
        .unwrap();
    assert_eq!(approved.status, AppointmentStatus::Scheduled);
    assert_eq!(approved.scheduled_date, new_date);
    assert!(approved.proposed_date.is_none());
    assert!(approved.reschedule_requested_by.is_none());

    // Old reminders are cancelled; the regenerated set snapshots the new date.
    let reminders = harness
        .database
        .list_reminders_for_appointment(&appointment.id)
        .await
        .unwrap();
    let pending_rows: Vec<_> = reminders
        .iter()
        .filter(|r| r.status == ReminderStatus::Pending)
        .collect();
    assert!(!pending_rows.is_empty());
    assert!(pending_rows
        .iter()
        .all(|r| r.snapshot.appointment_time == new_date));
    assert!(reminders
        .iter()
        .filter(|r| r.snapshot.appointment_time == old_date)
        .all(|r| r.status == ReminderStatus::Cancelled));

    let events = harness.drain_events().await;
    let rescheduled = events
        .iter()
        .find(|e| e.name() == "SessionRescheduled")
        .expect("SessionRescheduled emitted");
    match rescheduled {
        DomainEvent::SessionRescheduled {
            old_date: event_old,
            new_date: event_new,
            approved_by,
            ..
        } => {
            assert_eq!(*event_old, old_date);
            assert_eq!(*event_new, new_date);
            assert_eq!(approved_by, "u-T");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_s4_self_approval_is_blocked() {
    let harness = Harness::new().await;
    let hierarchy = harness
        .orchestrator
        .create_session_hierarchy(exchange_input("m-1"))
        .await
        .unwrap();
    harness.drain_events().await;

    let appointment = &hierarchy.appointments[0];
    let new_date = appointment.scheduled_date + ChronoDuration::days(3);
    harness
        .orchestrator
        .request_reschedule(&appointment.id, "u-R", new_date, None, None)
        .await
        .unwrap();
    harness.drain_events().await;

    let error = harness
        .orchestrator
        .approve_reschedule(&appointment.id, "u-R")
        .await
        .unwrap_err();
    assert_eq!(error.kind(), "IllegalTransition");

    let unchanged = harness
        .database
        .get_appointment(&appointment.id)
        .await
        .unwrap();
    assert_eq!(unchanged.status, AppointmentStatus::RescheduleRequested);
    assert_eq!(unchanged.proposed_date, Some(new_date));

    let events = harness.drain_events().await;
    assert!(events.iter().all(|e| e.name() != "SessionRescheduled"));
}

#[tokio::test]
async fn test_reject_restores_prior_state() {
    let harness = Harness::new().await;
    let hierarchy = harness
        .orchestrator
        .create_session_hierarchy(exchange_input("m-1"))
        .await
        .unwrap();

    let appointment = &hierarchy.appointments[0];
    let new_date = appointment.scheduled_date + ChronoDuration::days(3);
    harness
        .orchestrator
        .request_reschedule(&appointment.id, "u-T", new_date, Some(90), None)
        .await
        .unwrap();

    let rejected = harness
        .orchestrator
        .reject_reschedule(&appointment.id, "u-R")
        .await
        .unwrap();
    assert_eq!(rejected.status, AppointmentStatus::Scheduled);
    assert_eq!(rejected.scheduled_date, appointment.scheduled_date);
    assert!(rejected.proposed_date.is_none());
}

// === S5: infeasible schedule ===

#[tokio::test]
async fn test_s5_infeasible_schedule_creates_empty_hierarchy() {
    // Both parties busy every Sunday 02:00-04:00 through the max window.
    let mut busy = Vec::new();
    let first_sunday = Utc.with_ymd_and_hms(2025, 6, 8, 2, 0, 0).unwrap();
    for week in 0..60 {
        let start = first_sunday + ChronoDuration::days(7 * week);
        busy.push(BusyInterval::new(start, start + ChronoDuration::hours(2)));
    }
    let harness = Harness::with_busy(busy).await;

    let input = CreateSessionHierarchyInput {
        match_request_id: "m-5".to_string(),
        requester_id: "u-R".to_string(),
        target_user_id: "u-T".to_string(),
        connection_type: ConnectionType::Free,
        skill_id: "s-A".to_string(),
        exchange_skill_id: None,
        payment_rate_per_hour: None,
        currency: None,
        total_sessions: 20,
        session_duration_minutes: 60,
        title: "Guitar".to_string(),
        description: None,
        preferences: SchedulingPreferences {
            preferred_days: vec![Weekday::Sun],
            preferred_times: vec!["03:00".to_string()],
            earliest_start_date: Utc.with_ymd_and_hms(2025, 6, 8, 0, 0, 0).unwrap(),
            minimum_days_between: 1,
            maximum_days_between: 14,
            distribute_evenly: false,
        },
    };

    let hierarchy = harness.orchestrator.create_session_hierarchy(input).await.unwrap();
    assert_eq!(hierarchy.warning.as_deref(), Some("NoFeasibleSchedule"));
    assert!(hierarchy.appointments.is_empty());
    assert_eq!(hierarchy.series.len(), 1);
    assert_eq!(hierarchy.series[0].total_sessions, 20);

    let events = harness.drain_events().await;
    assert_eq!(events.iter().filter(|e| e.name() == "ConnectionCreated").count(), 1);
    assert!(events.iter().all(|e| e.name() != "SessionScheduled"));
}

// === Completion, balance, and closing ===

#[tokio::test]
async fn test_completion_updates_counters_and_balance() {
    let harness = Harness::new().await;
    let hierarchy = harness
        .orchestrator
        .create_session_hierarchy(exchange_input("m-1"))
        .await
        .unwrap();

    for appointment in &hierarchy.appointments {
        harness
            .orchestrator
            .complete_session(&appointment.id)
            .await
            .unwrap();
    }

    let connection = harness
        .orchestrator
        .get_connection(&hierarchy.connection.id)
        .await
        .unwrap();
    assert_eq!(connection.total_sessions_completed, 5);
    // Three hours taught by the requester, two by the target.
    assert_eq!(connection.balance_minutes, 60);
    assert!(connection.closed_at.is_some());

    let series = harness
        .database
        .list_series_for_connection(&connection.id)
        .await
        .unwrap();
    let total: u32 = series.iter().map(|s| s.total_sessions).sum();
    let completed: u32 = series.iter().map(|s| s.completed_sessions).sum();
    assert_eq!(total, connection.total_sessions_planned);
    assert_eq!(completed, connection.total_sessions_completed);

    let events = harness.drain_events().await;
    assert_eq!(events.iter().filter(|e| e.name() == "SessionCompleted").count(), 5);
}

#[tokio::test]
async fn test_concurrent_completion_has_one_winner() {
    let harness = Harness::new().await;
    let hierarchy = harness
        .orchestrator
        .create_session_hierarchy(exchange_input("m-1"))
        .await
        .unwrap();
    let appointment_id = hierarchy.appointments[0].id.clone();

    let (a, b) = tokio::join!(
        harness.orchestrator.complete_session(&appointment_id),
        harness.orchestrator.complete_session(&appointment_id),
    );
    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    let loser = outcomes.iter().find(|r| r.is_err()).unwrap();
    assert_eq!(loser.as_ref().unwrap_err().kind(), "IllegalTransition");

    let connection = harness
        .orchestrator
        .get_connection(&hierarchy.connection.id)
        .await
        .unwrap();
    assert_eq!(connection.total_sessions_completed, 1);
}

#[tokio::test]
async fn test_terminal_appointment_rejects_everything() {
    let harness = Harness::new().await;
    let hierarchy = harness
        .orchestrator
        .create_session_hierarchy(exchange_input("m-1"))
        .await
        .unwrap();
    let appointment = &hierarchy.appointments[0];

    harness
        .orchestrator
        .cancel_session(&appointment.id, "u-R", None)
        .await
        .unwrap();

    assert_eq!(
        harness
            .orchestrator
            .complete_session(&appointment.id)
            .await
            .unwrap_err()
            .kind(),
        "IllegalTransition"
    );
    assert_eq!(
        harness
            .orchestrator
            .cancel_session(&appointment.id, "u-R", None)
            .await
            .unwrap_err()
            .kind(),
        "IllegalTransition"
    );
    assert_eq!(
        harness
            .orchestrator
            .request_reschedule(
                &appointment.id,
                "u-R",
                test_now() + ChronoDuration::days(2),
                None,
                None
            )
            .await
            .unwrap_err()
            .kind(),
        "IllegalTransition"
    );
}

#[tokio::test]
async fn test_no_show_requires_session_end() {
    let harness = Harness::new().await;
    let hierarchy = harness
        .orchestrator
        .create_session_hierarchy(exchange_input("m-1"))
        .await
        .unwrap();

    // The first scheduled appointment is in the future: too early.
    let future = &hierarchy.appointments[0];
    assert_eq!(
        harness
            .orchestrator
            .mark_no_show(&future.id, "u-R", vec!["u-T".to_string()])
            .await
            .unwrap_err()
            .kind(),
        "IllegalTransition"
    );

    // An appointment that ended two hours ago can be reported.
    let past = harness
        .orchestrator
        .schedule_session(ScheduleSessionInput {
            session_series_id: hierarchy.series[0].id.clone(),
            scheduled_date: test_now() - ChronoDuration::hours(3),
            duration_minutes: Some(60),
            title: None,
        })
        .await
        .unwrap();
    let marked = harness
        .orchestrator
        .mark_no_show(&past.id, "u-R", vec!["u-T".to_string()])
        .await
        .unwrap();
    assert_eq!(marked.status, AppointmentStatus::NoShow);
    assert_eq!(marked.no_show_user_ids, vec!["u-T".to_string()]);
    assert_eq!(marked.no_show_reported_by.as_deref(), Some("u-R"));

    let events = harness.drain_events().await;
    assert!(events.iter().any(|e| e.name() == "SessionNoShow"));
}

#[tokio::test]
async fn test_admin_close_cancels_open_appointments() {
    let harness = Harness::new().await;
    let hierarchy = harness
        .orchestrator
        .create_session_hierarchy(exchange_input("m-1"))
        .await
        .unwrap();
    harness
        .orchestrator
        .complete_session(&hierarchy.appointments[0].id)
        .await
        .unwrap();

    let closed = harness
        .orchestrator
        .close_connection(&hierarchy.connection.id, "admin", Some("dispute".into()))
        .await
        .unwrap();
    assert!(closed.closed_at.is_some());

    let after = harness
        .orchestrator
        .load_hierarchy(&hierarchy.connection.id)
        .await
        .unwrap();
    let completed = after
        .appointments
        .iter()
        .filter(|a| a.status == AppointmentStatus::Completed)
        .count();
    let cancelled = after
        .appointments
        .iter()
        .filter(|a| a.status == AppointmentStatus::Cancelled)
        .count();
    assert_eq!(completed, 1);
    assert_eq!(cancelled, 4);

    // Closing again is a no-op.
    harness
        .orchestrator
        .close_connection(&hierarchy.connection.id, "admin", None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_query_surface_reads_the_hierarchy() {
    let harness = Harness::new().await;
    let hierarchy = harness
        .orchestrator
        .create_session_hierarchy(exchange_input("m-1"))
        .await
        .unwrap();

    let for_requester = harness.facade.list_connections_for_user("u-R").await;
    assert!(for_requester.success);
    let connections = for_requester.data.unwrap();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].id, hierarchy.connection.id);

    // Both parties see the connection; a stranger sees nothing.
    assert_eq!(
        harness
            .facade
            .list_connections_for_user("u-T")
            .await
            .data
            .unwrap()
            .len(),
        1
    );
    assert!(harness
        .facade
        .list_connections_for_user("u-X")
        .await
        .data
        .unwrap()
        .is_empty());

    let series = harness.facade.get_series(&hierarchy.series[0].id).await;
    assert!(series.success);
    let series = series.data.unwrap();
    assert_eq!(series.teacher_user_id, "u-R");
    assert_eq!(series.total_sessions, 3);

    let appointments = harness
        .facade
        .list_appointments_for_series(&hierarchy.series[0].id)
        .await;
    assert!(appointments.success);
    let appointments = appointments.data.unwrap();
    assert_eq!(appointments.len(), 3);
    assert!(appointments
        .iter()
        .all(|a| a.session_series_id == hierarchy.series[0].id));
    let numbers: Vec<u32> = appointments.iter().map(|a| a.session_number).collect();
    assert_eq!(numbers, vec![1, 3, 5]);

    let missing_series = harness.facade.get_series("ss-missing").await;
    assert!(!missing_series.success);
    assert_eq!(missing_series.error.unwrap().kind, "NotFound");

    let missing_list = harness.facade.list_appointments_for_series("ss-missing").await;
    assert!(!missing_list.success);
    assert_eq!(missing_list.error.unwrap().kind, "NotFound");
}

#[tokio::test]
async fn test_schedule_session_assigns_next_number() {
    let harness = Harness::new().await;
    let hierarchy = harness
        .orchestrator
        .create_session_hierarchy(exchange_input("m-1"))
        .await
        .unwrap();

    // The primary series holds numbers 1, 3, 5; the next one is 6.
    let next = harness
        .orchestrator
        .schedule_session(ScheduleSessionInput {
            session_series_id: hierarchy.series[0].id.clone(),
            scheduled_date: monday() + ChronoDuration::days(30),
            duration_minutes: None,
            title: None,
        })
        .await
        .unwrap();
    assert_eq!(next.session_number, 6);
    assert_eq!(next.duration_minutes, 60);
    assert!(!next.is_auto_created);
}
