//! SkillSwap Core
//!
//! The session orchestration engine for the SkillSwap tutoring platform:
//! materializes match agreements into Connection / SessionSeries /
//! SessionAppointment hierarchies, generates schedules from participant
//! preferences, runs the appointment lifecycle state machines, delivers
//! time-triggered reminders, and mirrors appointments into external
//! calendars (Google, Microsoft, Apple CalDAV).

pub mod calendar;
pub mod config;
pub mod reminders;
pub mod sessions;

// Re-export core functionality
pub use config::CoreConfig;
pub use sessions::{SessionEngine, SessionError, SessionResult};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the library
pub fn init() {
    // Initialize tracing only if not already initialized
    let _ = tracing_subscriber::fmt::try_init();
    tracing::info!("SkillSwap core v{} initialized", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        init(); // Should not panic
    }

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
