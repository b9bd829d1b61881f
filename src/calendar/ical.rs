/*!
 * iCalendar Serialization
 *
 * Renders and parses the VCALENDAR/VEVENT wire format used against CalDAV.
 * The rendered bytes are part of the external contract: property order,
 * CRLF line endings, `yyyyMMddTHHmmssZ` timestamps, and backslash escaping
 * are all fixed. The parser is tolerant of LF-only input and folded lines.
 */

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::calendar::error::{CalendarError, CalendarResult};
use crate::calendar::types::{BusyInterval, CalendarProvider};

const PRODID: &str = "-//SkillSwap//Calendar//EN";
const TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// One VEVENT as rendered to or parsed from the wire
#[derive(Debug, Clone, PartialEq)]
pub struct IcalEvent {
    pub uid: String,
    pub dtstamp: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub attendee_emails: Vec<String>,
}

/// Escape text content: `\` first, then `;`, `,`, newline; `\r` is dropped
pub fn escape_text(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            ';' => escaped.push_str("\\;"),
            ',' => escaped.push_str("\\,"),
            '\n' => escaped.push_str("\\n"),
            '\r' => {}
            other => escaped.push(other),
        }
    }
    escaped
}

/// Inverse of `escape_text`
pub fn unescape_text(value: &str) -> String {
    let mut unescaped = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            unescaped.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => unescaped.push('\n'),
            Some('\\') => unescaped.push('\\'),
            Some(';') => unescaped.push(';'),
            Some(',') => unescaped.push(','),
            Some(other) => {
                unescaped.push('\\');
                unescaped.push(other);
            }
            None => unescaped.push('\\'),
        }
    }
    unescaped
}

impl IcalEvent {
    /// Render the full VCALENDAR document, CRLF-terminated
    pub fn render(&self) -> String {
        let mut lines: Vec<String> = vec![
            "BEGIN:VCALENDAR".to_string(),
            "VERSION:2.0".to_string(),
            format!("PRODID:{}", PRODID),
            "BEGIN:VEVENT".to_string(),
            format!("UID:{}", self.uid),
            format!("DTSTAMP:{}", self.dtstamp.format(TIME_FORMAT)),
            format!("DTSTART:{}", self.start.format(TIME_FORMAT)),
            format!("DTEND:{}", self.end.format(TIME_FORMAT)),
            format!("SUMMARY:{}", escape_text(&self.summary)),
        ];
        if let Some(description) = &self.description {
            lines.push(format!("DESCRIPTION:{}", escape_text(description)));
        }
        if let Some(location) = &self.location {
            lines.push(format!("LOCATION:{}", escape_text(location)));
        }
        if let Some(url) = &self.url {
            lines.push(format!("URL:{}", url));
        }
        for email in &self.attendee_emails {
            lines.push(format!("ATTENDEE:mailto:{}", email));
        }
        lines.push("END:VEVENT".to_string());
        lines.push("END:VCALENDAR".to_string());

        let mut rendered = lines.join("\r\n");
        rendered.push_str("\r\n");
        rendered
    }

    /// Parse the first VEVENT of a document
    pub fn parse(input: &str) -> CalendarResult<IcalEvent> {
        let mut events = parse_events(input)?;
        if events.is_empty() {
            return Err(CalendarError::protocol(
                CalendarProvider::Apple,
                "document contains no VEVENT",
            ));
        }
        Ok(events.remove(0))
    }
}

/// Unfold continuation lines and normalize line endings
fn unfold_lines(input: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in input.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.is_empty() {
            continue;
        }
        match lines.last_mut() {
            Some(last) if line.starts_with(' ') || line.starts_with('\t') => {
                last.push_str(&line[1..]);
            }
            _ => lines.push(line.to_string()),
        }
    }
    lines
}

/// Split a content line into (name, value), dropping parameters
fn split_property(line: &str) -> Option<(String, String)> {
    let colon = line.find(':')?;
    let (lhs, value) = line.split_at(colon);
    let name = lhs.split(';').next().unwrap_or(lhs);
    Some((name.to_ascii_uppercase(), value[1..].to_string()))
}

fn parse_timestamp(value: &str) -> CalendarResult<DateTime<Utc>> {
    // Zulu timestamp is the wire norm; bare dates mark all-day events.
    if let Ok(parsed) = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%SZ") {
        return Ok(Utc.from_utc_datetime(&parsed));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y%m%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| CalendarError::protocol(CalendarProvider::Apple, "invalid date"))?;
        return Ok(Utc.from_utc_datetime(&midnight));
    }
    Err(CalendarError::protocol(
        CalendarProvider::Apple,
        format!("unsupported timestamp: {}", value),
    ))
}

/// Parse every VEVENT in a document
pub fn parse_events(input: &str) -> CalendarResult<Vec<IcalEvent>> {
    let mut events = Vec::new();
    let mut current: Option<PartialEvent> = None;

    for line in unfold_lines(input) {
        if line.eq_ignore_ascii_case("BEGIN:VEVENT") {
            current = Some(PartialEvent::default());
            continue;
        }
        if line.eq_ignore_ascii_case("END:VEVENT") {
            if let Some(partial) = current.take() {
                events.push(partial.finish()?);
            }
            continue;
        }
        let Some(partial) = current.as_mut() else {
            continue;
        };
        let Some((name, value)) = split_property(&line) else {
            continue;
        };
        match name.as_str() {
            "UID" => partial.uid = Some(value),
            "DTSTAMP" => partial.dtstamp = Some(parse_timestamp(&value)?),
            "DTSTART" => partial.start = Some(parse_timestamp(&value)?),
            "DTEND" => partial.end = Some(parse_timestamp(&value)?),
            "SUMMARY" => partial.summary = Some(unescape_text(&value)),
            "DESCRIPTION" => partial.description = Some(unescape_text(&value)),
            "LOCATION" => partial.location = Some(unescape_text(&value)),
            "URL" => partial.url = Some(value),
            "ATTENDEE" => {
                let email = value.strip_prefix("mailto:").unwrap_or(&value);
                partial.attendee_emails.push(email.to_string());
            }
            _ => {}
        }
    }

    Ok(events)
}

/// Busy intervals from every VEVENT in a CalDAV REPORT payload
pub fn parse_busy_intervals(input: &str) -> CalendarResult<Vec<BusyInterval>> {
    Ok(parse_events(input)?
        .into_iter()
        .map(|event| BusyInterval::new(event.start, event.end))
        .collect())
}

#[derive(Default)]
struct PartialEvent {
    uid: Option<String>,
    dtstamp: Option<DateTime<Utc>>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    summary: Option<String>,
    description: Option<String>,
    location: Option<String>,
    url: Option<String>,
    attendee_emails: Vec<String>,
}

impl PartialEvent {
    fn finish(self) -> CalendarResult<IcalEvent> {
        let start = self.start.ok_or_else(|| {
            CalendarError::protocol(CalendarProvider::Apple, "VEVENT missing DTSTART")
        })?;
        let end = self.end.unwrap_or(start);
        Ok(IcalEvent {
            uid: self.uid.unwrap_or_default(),
            dtstamp: self.dtstamp.unwrap_or(start),
            start,
            end,
            summary: self.summary.unwrap_or_default(),
            description: self.description,
            location: self.location,
            url: self.url,
            attendee_emails: self.attendee_emails,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> IcalEvent {
        IcalEvent {
            uid: "appt-1".to_string(),
            dtstamp: Utc.with_ymd_and_hms(2025, 6, 1, 9, 30, 0).unwrap(),
            start: Utc.with_ymd_and_hms(2025, 6, 2, 18, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 6, 2, 19, 0, 0).unwrap(),
            summary: "Guitar - Session 1".to_string(),
            description: Some("Bring your own guitar".to_string()),
            location: Some("Online".to_string()),
            url: Some("https://meet.example.com/join/appt-1".to_string()),
            attendee_emails: vec!["rita@example.com".to_string(), "tom@example.com".to_string()],
        }
    }

    #[test]
    fn test_render_is_bit_exact() {
        let rendered = sample().render();
        let expected = "BEGIN:VCALENDAR\r\n\
            VERSION:2.0\r\n\
            PRODID:-//SkillSwap//Calendar//EN\r\n\
            BEGIN:VEVENT\r\n\
            UID:appt-1\r\n\
            DTSTAMP:20250601T093000Z\r\n\
            DTSTART:20250602T180000Z\r\n\
            DTEND:20250602T190000Z\r\n\
            SUMMARY:Guitar - Session 1\r\n\
            DESCRIPTION:Bring your own guitar\r\n\
            LOCATION:Online\r\n\
            URL:https://meet.example.com/join/appt-1\r\n\
            ATTENDEE:mailto:rita@example.com\r\n\
            ATTENDEE:mailto:tom@example.com\r\n\
            END:VEVENT\r\n\
            END:VCALENDAR\r\n";
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_escaping() {
        assert_eq!(escape_text("A, B; C\nD"), "A\\, B\\; C\\nD");
        assert_eq!(escape_text("back\\slash"), "back\\\\slash");
        assert_eq!(escape_text("strip\rreturn"), "stripreturn");
        assert_eq!(unescape_text("A\\, B\\; C\\nD"), "A, B; C\nD");
        assert_eq!(unescape_text("back\\\\slash"), "back\\slash");
    }

    #[test]
    fn test_escaped_summary_round_trips() {
        let mut event = sample();
        event.summary = "A, B; C\nD".to_string();
        let rendered = event.render();
        assert!(rendered.contains("SUMMARY:A\\, B\\; C\\nD\r\n"));
        let parsed = IcalEvent::parse(&rendered).unwrap();
        assert_eq!(parsed.summary, "A, B; C\nD");
    }

    #[test]
    fn test_full_round_trip() {
        let event = sample();
        let parsed = IcalEvent::parse(&event.render()).unwrap();
        assert_eq!(parsed.start, event.start);
        assert_eq!(parsed.end, event.end);
        assert_eq!(parsed.summary, event.summary);
        assert_eq!(parsed.description, event.description);
        assert_eq!(parsed.location, event.location);
        assert_eq!(parsed.url, event.url);
        assert_eq!(parsed.attendee_emails, event.attendee_emails);
    }

    #[test]
    fn test_parse_tolerates_lf_and_folding() {
        let input = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:x\nDTSTART:20250602T180000Z\n\
            DTEND:20250602T190000Z\nSUMMARY:A long\n  folded summary\nEND:VEVENT\nEND:VCALENDAR\n";
        let parsed = IcalEvent::parse(input).unwrap();
        assert_eq!(parsed.summary, "A long folded summary");
    }

    #[test]
    fn test_parse_busy_intervals() {
        let input = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:a\r\nDTSTART:20250601T020000Z\r\n\
            DTEND:20250601T040000Z\r\nEND:VEVENT\r\nBEGIN:VEVENT\r\nUID:b\r\n\
            DTSTART;VALUE=DATE:20250608\r\nDTEND;VALUE=DATE:20250609\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let busy = parse_busy_intervals(input).unwrap();
        assert_eq!(busy.len(), 2);
        assert_eq!(busy[0].start, Utc.with_ymd_and_hms(2025, 6, 1, 2, 0, 0).unwrap());
        assert_eq!(busy[1].start, Utc.with_ymd_and_hms(2025, 6, 8, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_properties_with_parameters() {
        let input = "BEGIN:VEVENT\r\nUID:x\r\nDTSTART;TZID=UTC:20250602T180000Z\r\n\
            ATTENDEE;CN=Rita:mailto:rita@example.com\r\nEND:VEVENT\r\n";
        let parsed = IcalEvent::parse(input).unwrap();
        assert_eq!(parsed.attendee_emails, vec!["rita@example.com".to_string()]);
    }
}
