/*!
 * Reminder Planning
 *
 * Builds the `ScheduledReminder` rows for an appointment once its meeting
 * link is known. Each row freezes a snapshot (partner name, skill name,
 * appointment time, link) so later appointment edits cannot change what a
 * user receives; a reschedule cancels the old rows and plans a fresh set.
 */

use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::reminders::types::{ReminderSettings, ReminderSnapshot, ReminderStatus, ScheduledReminder};
use crate::sessions::clock::{new_id, SharedClock};
use crate::sessions::contracts::{SkillCatalog, UserDirectory};
use crate::sessions::database::SessionDatabase;
use crate::sessions::error::SessionResult;
use crate::sessions::types::SessionAppointment;

pub struct ReminderPlanner {
    database: Arc<SessionDatabase>,
    directory: Arc<dyn UserDirectory>,
    skills: Arc<dyn SkillCatalog>,
    clock: SharedClock,
}

impl ReminderPlanner {
    pub fn new(
        database: Arc<SessionDatabase>,
        directory: Arc<dyn UserDirectory>,
        skills: Arc<dyn SkillCatalog>,
        clock: SharedClock,
    ) -> Self {
        Self {
            database,
            directory,
            skills,
            clock,
        }
    }

    /// Plan reminders for both parties of an appointment. Offsets already in
    /// the past are skipped; a user without stored settings gets defaults.
    /// Returns the number of rows created.
    pub async fn schedule_for_appointment(
        &self,
        appointment: &SessionAppointment,
    ) -> SessionResult<usize> {
        let now = self.clock.now();
        let series = self.database.get_series(&appointment.session_series_id).await?;
        let skill_name = match self.skills.skill_name(&series.skill_id).await {
            Ok(name) => name,
            Err(error) => {
                warn!(
                    "Skill lookup failed for {}, using id in snapshot: {}",
                    series.skill_id, error
                );
                series.skill_id.clone()
            }
        };

        let parties = [
            (&appointment.organizer_user_id, &appointment.participant_user_id),
            (&appointment.participant_user_id, &appointment.organizer_user_id),
        ];

        let mut created = 0usize;
        let mut tx = self.database.begin().await?;

        for (user_id, partner_id) in parties {
            let settings = match self.database.get_reminder_settings(user_id).await? {
                Some(settings) => settings,
                None => ReminderSettings::defaults_for(user_id.clone(), now),
            };

            let partner_name = match self.directory.contact(partner_id).await {
                Ok(contact) => contact.display_name,
                Err(error) => {
                    warn!("Contact lookup failed for {}: {}", partner_id, error);
                    partner_id.clone()
                }
            };

            let snapshot = ReminderSnapshot {
                partner_name,
                skill_name: skill_name.clone(),
                appointment_time: appointment.scheduled_date,
                meeting_link: appointment.meeting_link.clone(),
            };

            for &minutes_before in &settings.minutes_before {
                let scheduled_for =
                    appointment.scheduled_date - Duration::minutes(minutes_before as i64);
                if scheduled_for <= now {
                    continue;
                }
                for channel in settings.channels() {
                    let reminder = ScheduledReminder {
                        id: new_id(),
                        appointment_id: appointment.id.clone(),
                        user_id: user_id.clone(),
                        reminder_type: channel,
                        minutes_before,
                        scheduled_for,
                        status: ReminderStatus::Pending,
                        snapshot: snapshot.clone(),
                        claimed_by: None,
                        sent_at: None,
                        error_message: None,
                        created_at: now,
                        updated_at: now,
                    };
                    self.database.insert_reminder(&mut tx, &reminder).await?;
                    created += 1;
                }
            }
        }

        tx.commit().await?;
        debug!(
            "Planned {} reminders for appointment {}",
            created, appointment.id
        );
        Ok(created)
    }
}
