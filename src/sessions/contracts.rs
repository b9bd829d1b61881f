/*!
 * Collaborator Contracts
 *
 * The engine treats the surrounding platform as external collaborators and
 * depends only on these traits: user contact lookup, skill lookup, meeting
 * link generation, notification dispatch, and outbox event subscription.
 * In-memory implementations are provided for wiring tests and local runs.
 */

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::reminders::types::ReminderChannel;
use crate::sessions::error::{SessionError, SessionResult};
use crate::sessions::events::DomainEvent;

/// Contact details resolved from the user service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContact {
    pub user_id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub push_token: Option<String>,
    /// IANA zone for render-boundary localization
    pub timezone: Option<String>,
}

/// User-identity service: only the contact-lookup contract is required
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn contact(&self, user_id: &str) -> SessionResult<UserContact>;
}

/// Skill catalog: only the skill-lookup contract is required
#[async_trait]
pub trait SkillCatalog: Send + Sync {
    async fn skill_name(&self, skill_id: &str) -> SessionResult<String>;
}

/// Meeting link service; may fail transiently
#[async_trait]
pub trait MeetingLinkService: Send + Sync {
    async fn generate_meeting_link(&self, appointment_id: &str) -> SessionResult<String>;
}

/// Notification orchestrator contract used by the reminder processor
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(
        &self,
        channel: ReminderChannel,
        recipient: &UserContact,
        subject: &str,
        body: &str,
    ) -> SessionResult<()>;
}

/// Outbox subscriber; delivery is at-least-once, FIFO per aggregate
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, event: &DomainEvent) -> SessionResult<()>;
}

/// External busy intervals for a user, typically the union of their
/// connected calendars. Failures degrade scheduling rather than failing it.
#[async_trait]
pub trait BusySource: Send + Sync {
    async fn busy(
        &self,
        user_id: &str,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> SessionResult<Vec<crate::sessions::scheduling::BusyInterval>>;
}

/// Busy source for deployments without calendar integrations
#[derive(Debug, Default)]
pub struct NoBusySource;

#[async_trait]
impl BusySource for NoBusySource {
    async fn busy(
        &self,
        _user_id: &str,
        _start: chrono::DateTime<chrono::Utc>,
        _end: chrono::DateTime<chrono::Utc>,
    ) -> SessionResult<Vec<crate::sessions::scheduling::BusyInterval>> {
        Ok(Vec::new())
    }
}

/// In-memory user directory for tests and local runs
#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
    contacts: HashMap<String, UserContact>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contact(mut self, contact: UserContact) -> Self {
        self.contacts.insert(contact.user_id.clone(), contact);
        self
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn contact(&self, user_id: &str) -> SessionResult<UserContact> {
        self.contacts
            .get(user_id)
            .cloned()
            .ok_or_else(|| SessionError::not_found("User", user_id))
    }
}

/// In-memory skill catalog for tests and local runs
#[derive(Debug, Default)]
pub struct InMemorySkillCatalog {
    skills: HashMap<String, String>,
}

impl InMemorySkillCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_skill(mut self, skill_id: impl Into<String>, name: impl Into<String>) -> Self {
        self.skills.insert(skill_id.into(), name.into());
        self
    }
}

#[async_trait]
impl SkillCatalog for InMemorySkillCatalog {
    async fn skill_name(&self, skill_id: &str) -> SessionResult<String> {
        self.skills
            .get(skill_id)
            .cloned()
            .ok_or_else(|| SessionError::not_found("Skill", skill_id))
    }
}

/// Deterministic meeting-link service that can be told to fail a number of
/// times before succeeding; used to exercise the retry path
pub struct FlakyMeetingLinks {
    base_url: String,
    failures_remaining: Arc<Mutex<u32>>,
}

impl FlakyMeetingLinks {
    pub fn new(base_url: impl Into<String>, failures: u32) -> Self {
        Self {
            base_url: base_url.into(),
            failures_remaining: Arc::new(Mutex::new(failures)),
        }
    }

    pub fn reliable(base_url: impl Into<String>) -> Self {
        Self::new(base_url, 0)
    }
}

#[async_trait]
impl MeetingLinkService for FlakyMeetingLinks {
    async fn generate_meeting_link(&self, appointment_id: &str) -> SessionResult<String> {
        let mut remaining = self.failures_remaining.lock().await;
        if *remaining > 0 {
            *remaining -= 1;
            return Err(SessionError::transient(
                "meeting link backend unavailable",
                "meeting_link",
            ));
        }
        Ok(format!("{}/join/{}", self.base_url, appointment_id))
    }
}
