/*!
 * Reminders for SkillSwap Sessions
 *
 * Per-user reminder settings, snapshot-based reminder planning, and the
 * background processor that fans deliveries out to the notification
 * channels.
 */

pub mod planner;
pub mod processor;
pub mod types;

pub use planner::ReminderPlanner;
pub use processor::{ReminderProcessor, TickOutcome};
pub use types::{
    ReminderChannel, ReminderSettings, ReminderSnapshot, ReminderStatus, ScheduledReminder,
    ALLOWED_OFFSETS,
};
