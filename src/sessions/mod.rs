/*!
 * Session Orchestration for SkillSwap
 *
 * The core of the platform: materializes accepted matches into
 * Connection / SessionSeries / SessionAppointment hierarchies, generates
 * schedules, runs the appointment state machines with transactional side
 * effects and a durable outbox, and exposes the whole write surface through
 * a uniform command facade.
 */

pub mod clock;
pub mod contracts;
pub mod database;
pub mod error;
pub mod events;
pub mod facade;
pub mod meeting_link;
pub mod orchestrator;
pub mod outbox;
pub mod scheduling;
pub mod state_machine;
pub mod types;

#[cfg(test)]
mod integration_test;

pub use clock::{Clock, FixedClock, SharedClock, SystemClock};
pub use contracts::{
    BusySource, EventSubscriber, MeetingLinkService, NotificationSender, SkillCatalog,
    UserContact, UserDirectory,
};
pub use database::SessionDatabase;
pub use error::{SessionError, SessionResult};
pub use events::DomainEvent;
pub use facade::{ErrorBody, ResultEnvelope, SessionFacade};
pub use meeting_link::MeetingLinkRetrier;
pub use orchestrator::{SessionHierarchy, SessionOrchestrator};
pub use outbox::OutboxDispatcher;
pub use scheduling::{BusyInterval, CandidateSlot, ScheduleOutcome, SeriesSlot};
pub use state_machine::AppointmentEvent;
pub use types::{
    AppointmentStatus, Connection, ConnectionType, CreateSessionHierarchyInput,
    SchedulingPreferences, ScheduleSessionInput, SessionAppointment, SessionSeries,
};

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::calendar::{
    crypto, AppleCalendarProvider, CalendarIntegrationStore, CalendarService, CalendarSyncService,
    GoogleCalendarProvider, OutlookCalendarProvider,
};
use crate::config::CoreConfig;
use crate::reminders::{ReminderPlanner, ReminderProcessor};

/// External collaborators the engine is wired with at startup
pub struct EngineCollaborators {
    pub directory: Arc<dyn UserDirectory>,
    pub skills: Arc<dyn SkillCatalog>,
    pub meeting_links: Arc<dyn MeetingLinkService>,
    pub notifications: Arc<dyn NotificationSender>,
}

/// The assembled engine: one application builder wires the whole graph
pub struct SessionEngine {
    config: CoreConfig,
    database: Arc<SessionDatabase>,
    calendar: Arc<CalendarService>,
    orchestrator: Arc<SessionOrchestrator>,
    facade: Arc<SessionFacade>,
    outbox: Arc<OutboxDispatcher>,
    processor: Arc<ReminderProcessor>,
    retrier: Arc<MeetingLinkRetrier>,
}

impl SessionEngine {
    pub async fn new(
        config: CoreConfig,
        collaborators: EngineCollaborators,
    ) -> SessionResult<Self> {
        info!("Initializing session engine");

        crypto::init_global_cipher(&config.calendar_encryption_key)?;

        let database = Arc::new(SessionDatabase::new(&config.database_url).await?);
        let store = Arc::new(CalendarIntegrationStore::new(database.pool().clone()).await?);

        let mut calendar = CalendarService::new(Arc::clone(&store));
        if let Some(google) = &config.google {
            calendar.register_provider(Arc::new(GoogleCalendarProvider::new(
                google.client_id.clone(),
                google.client_secret.clone(),
            )?));
        }
        if let Some(microsoft) = &config.microsoft {
            calendar.register_provider(Arc::new(OutlookCalendarProvider::new(
                microsoft.client_id.clone(),
                microsoft.client_secret.clone(),
                &microsoft.tenant,
            )?));
        }
        calendar.register_provider(Arc::new(AppleCalendarProvider::new()?));
        let calendar = Arc::new(calendar);

        let clock: SharedClock = Arc::new(SystemClock);
        let planner = Arc::new(ReminderPlanner::new(
            Arc::clone(&database),
            Arc::clone(&collaborators.directory),
            Arc::clone(&collaborators.skills),
            Arc::clone(&clock),
        ));
        let retrier = Arc::new(MeetingLinkRetrier::new(
            Arc::clone(&database),
            Arc::clone(&collaborators.meeting_links),
            Arc::clone(&planner),
            Duration::from_secs(config.meeting_link_retry_base_seconds),
            Duration::from_secs(config.meeting_link_retry_cap_seconds),
        ));

        let busy_source: Arc<dyn BusySource> = Arc::clone(&calendar) as Arc<dyn BusySource>;
        let orchestrator = Arc::new(SessionOrchestrator::new(
            Arc::clone(&database),
            Arc::clone(&clock),
            Arc::clone(&collaborators.meeting_links),
            Arc::clone(&retrier),
            Arc::clone(&planner),
            busy_source,
            Duration::from_secs(config.external_call_timeout_seconds),
        ));

        let outbox = Arc::new(OutboxDispatcher::new(
            Arc::clone(&database),
            Duration::from_secs(config.outbox_poll_seconds),
            config.outbox_batch_size,
        ));
        outbox
            .register_subscriber(Arc::new(CalendarSyncService::new(
                Arc::clone(&database),
                Arc::clone(&calendar),
                Arc::clone(&store),
                Arc::clone(&collaborators.directory),
            )))
            .await;

        let processor = Arc::new(ReminderProcessor::new(
            Arc::clone(&database),
            Arc::clone(&collaborators.directory),
            Arc::clone(&collaborators.notifications),
            Arc::clone(&clock),
            clock::new_id(),
            Duration::from_secs(config.reminder_tick_seconds),
        ));

        let facade = Arc::new(SessionFacade::new(
            Arc::clone(&orchestrator),
            Arc::clone(&calendar),
        ));

        info!("Session engine initialized");
        Ok(Self {
            config,
            database,
            calendar,
            orchestrator,
            facade,
            outbox,
            processor,
            retrier,
        })
    }

    /// Start the background services
    pub async fn start(&self) {
        info!("Starting session engine services");
        self.outbox.start().await;
        self.processor.start().await;
    }

    /// Stop the background services
    pub async fn stop(&self) {
        info!("Stopping session engine");
        self.outbox.stop().await;
        self.processor.stop().await;
        self.retrier.stop().await;
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn facade(&self) -> Arc<SessionFacade> {
        Arc::clone(&self.facade)
    }

    pub fn orchestrator(&self) -> Arc<SessionOrchestrator> {
        Arc::clone(&self.orchestrator)
    }

    pub fn database(&self) -> Arc<SessionDatabase> {
        Arc::clone(&self.database)
    }

    pub fn calendar(&self) -> Arc<CalendarService> {
        Arc::clone(&self.calendar)
    }

    pub fn outbox(&self) -> Arc<OutboxDispatcher> {
        Arc::clone(&self.outbox)
    }

    /// Register an additional outbox subscriber (chat, search, notifications)
    pub async fn register_subscriber(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.outbox.register_subscriber(subscriber).await;
    }
}
