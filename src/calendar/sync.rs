/*!
 * Calendar Mirroring
 *
 * Outbox subscriber that mirrors appointments into each party's connected
 * calendars: created on `SessionScheduled`, moved on `SessionRescheduled`,
 * removed on `SessionCancelled` and `SessionNoShow`. Redelivery is safe:
 * the (appointment, user, provider) link table records what already exists,
 * and transient provider failures bubble up so the outbox retries them.
 */

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::calendar::store::CalendarIntegrationStore;
use crate::calendar::types::{CalendarEventInput, CalendarEventLink};
use crate::calendar::CalendarService;
use crate::sessions::contracts::{EventSubscriber, UserDirectory};
use crate::sessions::database::SessionDatabase;
use crate::sessions::error::{SessionError, SessionResult};
use crate::sessions::events::DomainEvent;
use crate::sessions::types::SessionAppointment;

pub struct CalendarSyncService {
    sessions: Arc<SessionDatabase>,
    calendar: Arc<CalendarService>,
    store: Arc<CalendarIntegrationStore>,
    directory: Arc<dyn UserDirectory>,
}

impl CalendarSyncService {
    pub fn new(
        sessions: Arc<SessionDatabase>,
        calendar: Arc<CalendarService>,
        store: Arc<CalendarIntegrationStore>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            sessions,
            calendar,
            store,
            directory,
        }
    }

    async fn event_input(&self, appointment: &SessionAppointment) -> CalendarEventInput {
        let mut attendee_emails = Vec::new();
        for user_id in [&appointment.organizer_user_id, &appointment.participant_user_id] {
            match self.directory.contact(user_id).await {
                Ok(contact) => {
                    if let Some(email) = contact.email {
                        attendee_emails.push(email);
                    }
                }
                Err(error) => debug!("No contact for {}: {}", user_id, error),
            }
        }

        let description = match self.sessions.get_series(&appointment.session_series_id).await {
            Ok(series) => series.description,
            Err(_) => None,
        };

        CalendarEventInput {
            title: appointment.title.clone(),
            description,
            location: None,
            start: appointment.scheduled_date,
            end: appointment.end_time(),
            meeting_link: appointment.meeting_link.clone(),
            attendee_emails,
        }
    }

    /// Surface only errors worth an outbox redelivery; an unauthorized
    /// integration needs the user, not a retry loop
    fn keep_for_retry(error: SessionError) -> SessionResult<()> {
        match &error {
            SessionError::Unauthorized { message, .. } => {
                warn!("Skipping calendar mirror, reconnect required: {}", message);
                Ok(())
            }
            _ => Err(error),
        }
    }

    async fn mirror_create(&self, appointment_id: &str) -> SessionResult<()> {
        let appointment = match self.sessions.get_appointment(appointment_id).await {
            Ok(appointment) => appointment,
            // A vanished appointment has nothing to mirror.
            Err(SessionError::NotFound { .. }) => return Ok(()),
            Err(error) => return Err(error),
        };
        if appointment.status.is_terminal() {
            return Ok(());
        }

        let input = self.event_input(&appointment).await;
        let existing = self.store.links_for_appointment(appointment_id).await?;

        for user_id in [&appointment.organizer_user_id, &appointment.participant_user_id] {
            for integration in self.calendar.list_integrations(user_id).await? {
                let already_mirrored = existing.iter().any(|link| {
                    link.user_id == *user_id && link.provider == integration.provider
                });
                if already_mirrored {
                    continue;
                }
                match self.calendar.create_event(&integration, &input).await {
                    Ok(external_event_id) => {
                        self.store
                            .insert_event_link(&CalendarEventLink {
                                appointment_id: appointment_id.to_string(),
                                user_id: user_id.clone(),
                                provider: integration.provider,
                                external_event_id,
                                calendar_id: integration.calendar_id.clone(),
                                created_at: Utc::now(),
                            })
                            .await?;
                        debug!(
                            "Mirrored appointment {} to {} for {}",
                            appointment_id, integration.provider, user_id
                        );
                    }
                    Err(error) => Self::keep_for_retry(error)?,
                }
            }
        }
        Ok(())
    }

    async fn mirror_update(&self, appointment_id: &str) -> SessionResult<()> {
        let appointment = match self.sessions.get_appointment(appointment_id).await {
            Ok(appointment) => appointment,
            Err(SessionError::NotFound { .. }) => return Ok(()),
            Err(error) => return Err(error),
        };
        let input = self.event_input(&appointment).await;

        for link in self.store.links_for_appointment(appointment_id).await? {
            let Some(integration) = self
                .calendar
                .integration_for(&link.user_id, link.provider)
                .await?
            else {
                continue;
            };
            match self
                .calendar
                .update_event(&integration, &link.external_event_id, &input)
                .await
            {
                Ok(()) => {}
                Err(SessionError::NotFound { .. }) => {
                    // The provider lost the event; recreate on the next pass.
                    self.store
                        .delete_event_link(appointment_id, &link.user_id, link.provider)
                        .await?;
                }
                Err(error) => Self::keep_for_retry(error)?,
            }
        }
        Ok(())
    }

    async fn mirror_delete(&self, appointment_id: &str) -> SessionResult<()> {
        for link in self.store.links_for_appointment(appointment_id).await? {
            let Some(integration) = self
                .calendar
                .integration_for(&link.user_id, link.provider)
                .await?
            else {
                self.store
                    .delete_event_link(appointment_id, &link.user_id, link.provider)
                    .await?;
                continue;
            };
            match self
                .calendar
                .delete_event(&integration, &link.external_event_id)
                .await
            {
                Ok(()) | Err(SessionError::NotFound { .. }) => {
                    self.store
                        .delete_event_link(appointment_id, &link.user_id, link.provider)
                        .await?;
                }
                Err(error) => Self::keep_for_retry(error)?,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventSubscriber for CalendarSyncService {
    fn name(&self) -> &str {
        "calendar-sync"
    }

    async fn handle(&self, event: &DomainEvent) -> SessionResult<()> {
        match event {
            DomainEvent::SessionScheduled { appointment_id, .. } => {
                self.mirror_create(appointment_id).await
            }
            DomainEvent::SessionRescheduled { appointment_id, .. } => {
                self.mirror_update(appointment_id).await
            }
            DomainEvent::SessionCancelled { appointment_id, .. }
            | DomainEvent::SessionNoShow { appointment_id, .. } => {
                self.mirror_delete(appointment_id).await
            }
            // Completed sessions stay on the calendar; the remaining events
            // have no calendar footprint.
            _ => Ok(()),
        }
    }
}
