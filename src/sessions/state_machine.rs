/*!
 * Appointment Lifecycle State Machine
 *
 * The single source of truth for which lifecycle transitions an appointment
 * admits. Pure: callers (the orchestrator) evaluate time- and party-based
 * preconditions, then ask the machine for the successor state. Anything not
 * listed here is an illegal transition.
 */

use crate::sessions::error::{SessionError, SessionResult};
use crate::sessions::types::AppointmentStatus;

/// Lifecycle events an appointment can receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentEvent {
    Confirm,
    Start,
    Finish,
    Cancel,
    RequestReschedule,
    ApproveReschedule,
    /// Restores the status captured when the reschedule was requested
    RejectReschedule { prior: AppointmentStatus },
    MarkNoShow,
}

impl AppointmentEvent {
    fn name(&self) -> &'static str {
        match self {
            AppointmentEvent::Confirm => "confirm",
            AppointmentEvent::Start => "start",
            AppointmentEvent::Finish => "finish",
            AppointmentEvent::Cancel => "cancel",
            AppointmentEvent::RequestReschedule => "requestReschedule",
            AppointmentEvent::ApproveReschedule => "approveReschedule",
            AppointmentEvent::RejectReschedule { .. } => "rejectReschedule",
            AppointmentEvent::MarkNoShow => "markNoShow",
        }
    }
}

/// Compute the successor status for `event`, or reject the pair
pub fn transition(
    appointment_id: &str,
    current: AppointmentStatus,
    event: AppointmentEvent,
) -> SessionResult<AppointmentStatus> {
    use AppointmentStatus::*;

    let next = match (current, event) {
        (Scheduled, AppointmentEvent::Confirm) => Some(Confirmed),
        (Scheduled, AppointmentEvent::Start) => Some(InProgress),
        (Confirmed, AppointmentEvent::Start) => Some(InProgress),
        (InProgress, AppointmentEvent::Finish) => Some(Completed),
        // Completion is also allowed straight from Scheduled/Confirmed when a
        // session was held without an explicit start signal.
        (Scheduled, AppointmentEvent::Finish) => Some(Completed),
        (Confirmed, AppointmentEvent::Finish) => Some(Completed),
        (Scheduled, AppointmentEvent::Cancel) => Some(Cancelled),
        (Confirmed, AppointmentEvent::Cancel) => Some(Cancelled),
        (InProgress, AppointmentEvent::Cancel) => Some(Cancelled),
        (RescheduleRequested, AppointmentEvent::Cancel) => Some(Cancelled),
        (Scheduled, AppointmentEvent::RequestReschedule) => Some(RescheduleRequested),
        (Confirmed, AppointmentEvent::RequestReschedule) => Some(RescheduleRequested),
        (RescheduleRequested, AppointmentEvent::ApproveReschedule) => Some(Scheduled),
        (RescheduleRequested, AppointmentEvent::RejectReschedule { prior })
            if !prior.is_terminal() =>
        {
            Some(prior)
        }
        (from, AppointmentEvent::MarkNoShow) if !from.is_terminal() => Some(NoShow),
        _ => None,
    };

    next.ok_or_else(|| {
        SessionError::illegal_transition(
            format!("{} is not allowed from {}", event.name(), current),
            appointment_id,
            current.to_string(),
        )
    })
}
