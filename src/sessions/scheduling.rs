/*!
 * Schedule generation.
 *
 * A pure constraint-satisfaction generator: given participant preferences and
 * the union of both parties' busy intervals, produce an ordered sequence of
 * concrete session slots. No I/O; identical inputs yield identical output.
 *
 * The search enumerates candidate (day, time) pairs over a rolling window
 * that starts at 60 days and doubles up to 365 until enough candidates
 * survive filtering and greedy selection.
 */

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::sessions::types::{parse_preferred_time, SchedulingPreferences};

/// Half-open interval `[start, end)` during which a user is unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BusyInterval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Half-open overlap; touching at an exact boundary is not an overlap
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start < self.end && self.start < end
    }
}

/// Which of the two series inside a skill exchange a slot belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeriesSlot {
    /// Requester teaches the primary skill (odd session numbers)
    Primary,
    /// Target teaches the exchange skill (even session numbers)
    Secondary,
}

/// One generated session slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSlot {
    pub scheduled_date: DateTime<Utc>,
    pub duration_minutes: u32,
    pub organizer_user_id: String,
    pub participant_user_id: String,
    /// 1-based position in the overall schedule
    pub session_number: u32,
    pub series_slot: SeriesSlot,
}

/// Everything the generator needs; busy intervals are the union of both
/// parties' calendars plus their already-scheduled appointments
#[derive(Debug, Clone)]
pub struct ScheduleRequest<'a> {
    pub preferences: &'a SchedulingPreferences,
    pub total_sessions: u32,
    pub session_duration_minutes: u32,
    pub requester_id: &'a str,
    pub target_user_id: &'a str,
    /// Alternate organizer and series assignment per session
    pub skill_exchange: bool,
    pub busy: &'a [BusyInterval],
}

/// Generator outcome
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome {
    Scheduled(Vec<CandidateSlot>),
    Infeasible { reason: String },
}

impl ScheduleOutcome {
    pub fn slots(&self) -> &[CandidateSlot] {
        match self {
            ScheduleOutcome::Scheduled(slots) => slots,
            ScheduleOutcome::Infeasible { .. } => &[],
        }
    }
}

const INITIAL_WINDOW_DAYS: i64 = 60;
const MAX_WINDOW_DAYS: i64 = 365;

/// Generate the full schedule for a request
pub fn generate_schedule(request: &ScheduleRequest<'_>) -> ScheduleOutcome {
    let mut window_days = INITIAL_WINDOW_DAYS;

    loop {
        if let Some(slots) = try_window(request, window_days) {
            return ScheduleOutcome::Scheduled(slots);
        }
        if window_days >= MAX_WINDOW_DAYS {
            return ScheduleOutcome::Infeasible {
                reason: format!(
                    "no schedule of {} sessions found within {} days of {}",
                    request.total_sessions,
                    MAX_WINDOW_DAYS,
                    request.preferences.earliest_start_date.format("%Y-%m-%d"),
                ),
            };
        }
        window_days = (window_days * 2).min(MAX_WINDOW_DAYS);
    }
}

/// Attempt a single window size; None when the greedy pass comes up short
fn try_window(request: &ScheduleRequest<'_>, window_days: i64) -> Option<Vec<CandidateSlot>> {
    let candidates = enumerate_candidates(request, window_days);
    let accepted = select_greedy(request, window_days, &candidates);
    if accepted.len() as u32 == request.total_sessions {
        Some(assign_slots(request, &accepted))
    } else {
        None
    }
}

/// A raw candidate before greedy selection, with its sort key material
#[derive(Debug, Clone, Copy)]
struct RawCandidate {
    start: DateTime<Utc>,
    iso_year: i32,
    iso_week: u32,
    day_rank: usize,
    time_rank: usize,
}

/// Enumerate (day, time) pairs in the window, drop busy overlaps, and order
/// by ISO week, then preferred-day rank, then preferred-time rank
fn enumerate_candidates(request: &ScheduleRequest<'_>, window_days: i64) -> Vec<RawCandidate> {
    let prefs = request.preferences;
    let earliest = prefs.earliest_start_date;
    let duration = Duration::minutes(request.session_duration_minutes as i64);

    // Pre-parse times; invalid entries were rejected at input validation
    let times: Vec<(usize, u32, u32)> = prefs
        .preferred_times
        .iter()
        .enumerate()
        .filter_map(|(rank, t)| parse_preferred_time(t).ok().map(|(h, m)| (rank, h, m)))
        .collect();

    let day_rank = |weekday: Weekday| prefs.preferred_days.iter().position(|d| *d == weekday);

    let mut candidates = Vec::new();
    let first_day = earliest.date_naive();

    for offset in 0..window_days {
        let date = first_day + Duration::days(offset);
        let Some(rank) = day_rank(date.weekday()) else {
            continue;
        };
        for &(time_rank, hour, minute) in &times {
            let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
                continue;
            };
            let start = Utc.from_utc_datetime(&naive);
            if start < earliest {
                continue;
            }
            let end = start + duration;
            if request.busy.iter().any(|b| b.overlaps(start, end)) {
                continue;
            }
            let iso = date.iso_week();
            candidates.push(RawCandidate {
                start,
                iso_year: iso.year(),
                iso_week: iso.week(),
                day_rank: rank,
                time_rank,
            });
        }
    }

    candidates.sort_by_key(|c| (c.iso_year, c.iso_week, c.day_rank, c.time_rank));
    candidates
}

/// Greedy pass over the ordered candidate stream
fn select_greedy(
    request: &ScheduleRequest<'_>,
    window_days: i64,
    candidates: &[RawCandidate],
) -> Vec<DateTime<Utc>> {
    let prefs = request.preferences;
    let min_gap = prefs.minimum_days_between as f64;
    let max_gap = prefs.maximum_days_between as f64;
    let target_gap = if request.total_sessions > 1 {
        window_days as f64 / (request.total_sessions - 1) as f64
    } else {
        0.0
    };

    let mut accepted: Vec<DateTime<Utc>> = Vec::with_capacity(request.total_sessions as usize);

    for candidate in candidates {
        if accepted.len() as u32 == request.total_sessions {
            break;
        }
        match accepted.last() {
            None => accepted.push(candidate.start),
            Some(last) => {
                let gap_days = (candidate.start - *last).num_seconds() as f64 / 86_400.0;
                if gap_days < min_gap || gap_days > max_gap {
                    continue;
                }
                if prefs.distribute_evenly {
                    let first = accepted[0];
                    let span_days =
                        (candidate.start - first).num_seconds() as f64 / 86_400.0;
                    let mean_gap = span_days / accepted.len() as f64;
                    if (mean_gap - target_gap).abs() > 1.0 {
                        continue;
                    }
                }
                accepted.push(candidate.start);
            }
        }
    }

    accepted
}

/// Attach session numbers, organizers, and series assignment to the accepted
/// starts. For a skill exchange the organizer alternates beginning with the
/// requester; odd sessions belong to the primary series.
fn assign_slots(request: &ScheduleRequest<'_>, accepted: &[DateTime<Utc>]) -> Vec<CandidateSlot> {
    accepted
        .iter()
        .enumerate()
        .map(|(index, start)| {
            let session_number = index as u32 + 1;
            let requester_organizes = !request.skill_exchange || session_number % 2 == 1;
            let (organizer, participant, series_slot) = if requester_organizes {
                (request.requester_id, request.target_user_id, SeriesSlot::Primary)
            } else {
                (request.target_user_id, request.requester_id, SeriesSlot::Secondary)
            };
            CandidateSlot {
                scheduled_date: *start,
                duration_minutes: request.session_duration_minutes,
                organizer_user_id: organizer.to_string(),
                participant_user_id: participant.to_string(),
                session_number,
                series_slot: if request.skill_exchange {
                    series_slot
                } else {
                    SeriesSlot::Primary
                },
            }
        })
        .collect()
}
