/*!
 * Meeting Link Integration
 *
 * The orchestrator attempts one synchronous link generation per appointment;
 * on failure it stores a null link, emits `MeetingLinkGenerationFailed`, and
 * hands the appointment to this retrier. The retrier backs off exponentially
 * (base 30 s, cap 30 min, ±20 % jitter) and gives up only when the
 * appointment reaches a terminal state.
 */

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::reminders::planner::ReminderPlanner;
use crate::sessions::contracts::MeetingLinkService;
use crate::sessions::database::SessionDatabase;

pub struct MeetingLinkRetrier {
    database: Arc<SessionDatabase>,
    service: Arc<dyn MeetingLinkService>,
    planner: Arc<ReminderPlanner>,
    base_delay: Duration,
    max_delay: Duration,
    running: Arc<RwLock<bool>>,
}

impl MeetingLinkRetrier {
    pub fn new(
        database: Arc<SessionDatabase>,
        service: Arc<dyn MeetingLinkService>,
        planner: Arc<ReminderPlanner>,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            database,
            service,
            planner,
            base_delay,
            max_delay,
            running: Arc::new(RwLock::new(true)),
        }
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    /// Queue an appointment whose synchronous generation failed
    pub fn enqueue(&self, appointment_id: String) {
        let database = Arc::clone(&self.database);
        let service = Arc::clone(&self.service);
        let planner = Arc::clone(&self.planner);
        let running = Arc::clone(&self.running);
        let base_delay = self.base_delay;
        let max_delay = self.max_delay;

        tokio::spawn(async move {
            let mut delay = base_delay;

            loop {
                tokio::time::sleep(with_jitter(delay)).await;

                if !*running.read().await {
                    return;
                }

                // Terminal appointments no longer need a link; a vanished
                // appointment ends the retry loop the same way.
                match database.get_appointment(&appointment_id).await {
                    Ok(appointment) if appointment.status.is_terminal() => {
                        debug!(
                            "Abandoning meeting link retry for terminal appointment {}",
                            appointment_id
                        );
                        return;
                    }
                    Ok(_) => {}
                    Err(_) => return,
                }

                match service.generate_meeting_link(&appointment_id).await {
                    Ok(link) => match database.set_meeting_link(&appointment_id, &link).await {
                        Ok(stored) => {
                            info!("Meeting link generated for appointment {}", appointment_id);
                            if stored {
                                // Reminders are created once the link exists.
                                if let Ok(appointment) =
                                    database.get_appointment(&appointment_id).await
                                {
                                    if let Err(error) =
                                        planner.schedule_for_appointment(&appointment).await
                                    {
                                        warn!(
                                            "Reminder planning failed for {}: {}",
                                            appointment_id, error
                                        );
                                    }
                                }
                            }
                            return;
                        }
                        Err(error) => {
                            warn!(
                                "Failed to store meeting link for {}: {}",
                                appointment_id, error
                            );
                        }
                    },
                    Err(error) => {
                        debug!(
                            "Meeting link retry for {} failed: {}",
                            appointment_id, error
                        );
                    }
                }

                delay = (delay * 2).min(max_delay);
            }
        });
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::clock::SystemClock;
    use crate::sessions::contracts::{
        FlakyMeetingLinks, InMemorySkillCatalog, InMemoryUserDirectory,
    };
    use crate::sessions::database::test_support::{
        appointment_fixture, scratch_db, seed_appointment_chain,
    };
    use crate::sessions::types::AppointmentStatus;
    use chrono::Utc;

    fn test_planner(db: Arc<SessionDatabase>) -> Arc<ReminderPlanner> {
        Arc::new(ReminderPlanner::new(
            db,
            Arc::new(InMemoryUserDirectory::new()),
            Arc::new(InMemorySkillCatalog::new()),
            Arc::new(SystemClock),
        ))
    }

    async fn seed_appointment(db: &SessionDatabase, status: AppointmentStatus) {
        let mut appointment = appointment_fixture("a-1", "ss-1", 1);
        appointment.status = status;
        appointment.scheduled_date = Utc::now() + chrono::Duration::days(1);
        seed_appointment_chain(db, appointment).await;
    }

    #[tokio::test]
    async fn test_retrier_recovers_after_failures() {
        let (db, _dir) = scratch_db().await;
        let db = Arc::new(db);
        seed_appointment(&db, AppointmentStatus::Scheduled).await;

        let retrier = MeetingLinkRetrier::new(
            Arc::clone(&db),
            Arc::new(FlakyMeetingLinks::new("https://meet.example.com", 2)),
            test_planner(Arc::clone(&db)),
            Duration::from_millis(5),
            Duration::from_millis(20),
        );
        retrier.enqueue("a-1".to_string());

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if db.get_appointment("a-1").await.unwrap().meeting_link.is_some() {
                break;
            }
        }
        assert_eq!(
            db.get_appointment("a-1").await.unwrap().meeting_link.as_deref(),
            Some("https://meet.example.com/join/a-1")
        );
    }

    #[tokio::test]
    async fn test_retrier_abandons_terminal_appointments() {
        let (db, _dir) = scratch_db().await;
        let db = Arc::new(db);
        seed_appointment(&db, AppointmentStatus::Cancelled).await;

        let retrier = MeetingLinkRetrier::new(
            Arc::clone(&db),
            Arc::new(FlakyMeetingLinks::reliable("https://meet.example.com")),
            test_planner(Arc::clone(&db)),
            Duration::from_millis(5),
            Duration::from_millis(20),
        );
        retrier.enqueue("a-1".to_string());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(db.get_appointment("a-1").await.unwrap().meeting_link.is_none());
    }
}
