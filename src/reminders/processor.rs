/*!
 * Reminder Processor
 *
 * Cooperative background loop draining due `ScheduledReminder` rows. The
 * Pending -> Dispatching conditional claim makes concurrent processors safe:
 * each row has exactly one winner. Outcomes are recorded on the row; nothing
 * is retried automatically. Reminders whose appointment reached a terminal
 * state between scheduling and dispatch are cancelled instead of sent.
 */

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::reminders::types::{ReminderSnapshot, ScheduledReminder};
use crate::sessions::clock::SharedClock;
use crate::sessions::contracts::{NotificationSender, UserDirectory};
use crate::sessions::database::SessionDatabase;
use crate::sessions::error::{SessionError, SessionResult};

/// Past this many due rows the processor switches to batch draining
const BACKLOG_THRESHOLD: u64 = 1000;
const BATCH_SIZE: u32 = 100;
/// Upper bound for a single normal-mode claim
const MAX_CLAIM: u32 = 10_000;

pub struct ReminderProcessor {
    database: Arc<SessionDatabase>,
    directory: Arc<dyn UserDirectory>,
    notifications: Arc<dyn NotificationSender>,
    clock: SharedClock,
    worker_id: String,
    tick_interval: Duration,
    running: Arc<RwLock<bool>>,
}

impl ReminderProcessor {
    pub fn new(
        database: Arc<SessionDatabase>,
        directory: Arc<dyn UserDirectory>,
        notifications: Arc<dyn NotificationSender>,
        clock: SharedClock,
        worker_id: String,
        tick_interval: Duration,
    ) -> Self {
        Self {
            database,
            directory,
            notifications,
            clock,
            worker_id,
            tick_interval,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the processing loop
    pub async fn start(self: &Arc<Self>) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let processor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(processor.tick_interval);
            info!("Reminder processor {} started", processor.worker_id);

            while *processor.running.read().await {
                let backlog_remains = match processor.tick_once().await {
                    Ok(outcome) => outcome.backlog_remains,
                    Err(error) => {
                        warn!("Reminder tick failed: {}", error);
                        false
                    }
                };
                // With a backlog we drain again immediately instead of
                // sleeping a full tick.
                if !backlog_remains {
                    ticker.tick().await;
                }
            }
            info!("Reminder processor {} stopped", processor.worker_id);
        });
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    /// One claim-and-dispatch pass; exposed for deterministic tests
    pub async fn tick_once(&self) -> SessionResult<TickOutcome> {
        let now = self.clock.now();
        let due = self.database.count_due_reminders(now).await?;
        if due == 0 {
            return Ok(TickOutcome::default());
        }

        let limit = if due > BACKLOG_THRESHOLD {
            BATCH_SIZE
        } else {
            due.min(MAX_CLAIM as u64) as u32
        };

        let claimed = self
            .database
            .claim_due_reminders(now, &self.worker_id, limit)
            .await?;
        debug!(
            "Worker {} claimed {} of {} due reminders",
            self.worker_id,
            claimed.len(),
            due
        );

        let mut outcome = TickOutcome {
            claimed: claimed.len(),
            ..TickOutcome::default()
        };
        for reminder in claimed {
            match self.dispatch(&reminder).await {
                DispatchResult::Sent => outcome.sent += 1,
                DispatchResult::Cancelled => outcome.cancelled += 1,
                DispatchResult::Failed => outcome.failed += 1,
            }
        }

        outcome.backlog_remains = due > BACKLOG_THRESHOLD;
        Ok(outcome)
    }

    async fn dispatch(&self, reminder: &ScheduledReminder) -> DispatchResult {
        // Terminal appointments silence their remaining reminders.
        let appointment_alive = match self.database.get_appointment(&reminder.appointment_id).await
        {
            Ok(appointment) => !appointment.status.is_terminal(),
            Err(SessionError::NotFound { .. }) => false,
            Err(error) => {
                warn!(
                    "Appointment lookup failed for reminder {}: {}",
                    reminder.id, error
                );
                let _ = self
                    .database
                    .mark_reminder_failed(&reminder.id, &error.to_string())
                    .await;
                return DispatchResult::Failed;
            }
        };
        if !appointment_alive {
            let _ = self.database.mark_reminder_cancelled(&reminder.id).await;
            return DispatchResult::Cancelled;
        }

        let contact = match self.directory.contact(&reminder.user_id).await {
            Ok(contact) => contact,
            Err(error) => {
                let _ = self
                    .database
                    .mark_reminder_failed(&reminder.id, &error.to_string())
                    .await;
                return DispatchResult::Failed;
            }
        };

        // Variables come from the stored snapshot, never from a refetch.
        let (subject, body) = render_notification(&reminder.snapshot, contact.timezone.as_deref());

        match self
            .notifications
            .send(reminder.reminder_type, &contact, &subject, &body)
            .await
        {
            Ok(()) => {
                let _ = self
                    .database
                    .mark_reminder_sent(&reminder.id, self.clock.now())
                    .await;
                DispatchResult::Sent
            }
            Err(error) => {
                warn!("Reminder {} delivery failed: {}", reminder.id, error);
                let _ = self
                    .database
                    .mark_reminder_failed(&reminder.id, &error.to_string())
                    .await;
                DispatchResult::Failed
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    pub claimed: usize,
    pub sent: usize,
    pub cancelled: usize,
    pub failed: usize,
    pub backlog_remains: bool,
}

enum DispatchResult {
    Sent,
    Cancelled,
    Failed,
}

/// Storage keeps UTC; the user's wall clock appears only here, at the
/// render boundary
fn format_local(time: DateTime<Utc>, timezone: Option<&str>) -> String {
    match timezone.and_then(|name| name.parse::<Tz>().ok()) {
        Some(tz) => time.with_timezone(&tz).format("%Y-%m-%d %H:%M (%Z)").to_string(),
        None => time.format("%Y-%m-%d %H:%M (UTC)").to_string(),
    }
}

fn render_notification(snapshot: &ReminderSnapshot, timezone: Option<&str>) -> (String, String) {
    let subject = format!(
        "Upcoming session: {} with {}",
        snapshot.skill_name, snapshot.partner_name
    );
    let mut body = format!(
        "Your {} session with {} starts at {}.",
        snapshot.skill_name,
        snapshot.partner_name,
        format_local(snapshot.appointment_time, timezone),
    );
    if let Some(link) = &snapshot.meeting_link {
        body.push_str(&format!(" Join here: {}", link));
    }
    (subject, body)
}
