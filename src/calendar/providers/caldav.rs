/*!
 * Apple iCloud CalDAV Provider
 *
 * CalDAV client against caldav.icloud.com. Authentication is HTTP Basic
 * with an app-specific password; the "access token" handled by the rest of
 * the engine is `base64(appleId:appPassword)`. Discovery follows the
 * `current-user-principal -> calendar-home-set -> first calendar child`
 * PROPFIND chain and falls back to the calendar home itself when no
 * calendar resource is advertised. Events travel as iCalendar documents.
 */

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::calendar::error::{CalendarError, CalendarResult};
use crate::calendar::ical::{parse_busy_intervals, IcalEvent};
use crate::calendar::providers::traits::CalendarProviderTrait;
use crate::calendar::types::{BusyInterval, CalendarEventInput, CalendarProvider, TokenSet};

const ICLOUD_CALDAV_URL: &str = "https://caldav.icloud.com";
const APPLE_SETUP_URL: &str = "https://appleid.apple.com/account/manage";

const PRINCIPAL_PROPFIND: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop>
    <D:current-user-principal/>
  </D:prop>
</D:propfind>"#;

const HOME_SET_PROPFIND: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop>
    <C:calendar-home-set/>
  </D:prop>
</D:propfind>"#;

const CALENDAR_LIST_PROPFIND: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop>
    <D:resourcetype/>
    <D:displayname/>
  </D:prop>
</D:propfind>"#;

pub struct AppleCalendarProvider {
    client: Client,
    base_url: String,
    /// Discovered calendar collection per access token
    calendar_paths: RwLock<HashMap<String, String>>,
}

impl AppleCalendarProvider {
    pub fn new() -> CalendarResult<Self> {
        Self::with_base_url(ICLOUD_CALDAV_URL)
    }

    pub fn with_base_url(base_url: &str) -> CalendarResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| CalendarError::network(CalendarProvider::Apple, e.to_string(), None))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            calendar_paths: RwLock::new(HashMap::new()),
        })
    }

    /// Build the opaque access token from Apple credentials
    pub fn make_access_token(apple_id: &str, app_password: &str) -> String {
        general_purpose::STANDARD.encode(format!("{}:{}", apple_id, app_password))
    }

    fn basic_auth_header(&self, access_token: &str) -> CalendarResult<HeaderValue> {
        HeaderValue::from_str(&format!("Basic {}", access_token)).map_err(|_| {
            CalendarError::Token {
                provider: CalendarProvider::Apple,
                message: "access token is not a valid header value".to_string(),
                expired: false,
            }
        })
    }

    /// Hrefs come back absolute or relative; never concatenate twice
    fn resolve_url(&self, href: &str) -> CalendarResult<String> {
        let trimmed = href.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return Ok(trimmed.trim_end_matches('/').to_string());
        }
        let base = Url::parse(&self.base_url).map_err(|_| CalendarError::Configuration {
            message: format!("invalid CalDAV base URL: {}", self.base_url),
        })?;
        let host = base.host_str().ok_or_else(|| CalendarError::Configuration {
            message: "CalDAV base URL has no host".to_string(),
        })?;
        Ok(format!(
            "{}://{}{}",
            base.scheme(),
            host,
            trimmed.trim_end_matches('/')
        ))
    }

    async fn dav_request(
        &self,
        method: &str,
        url: &str,
        access_token: &str,
        depth: Option<&str>,
        body: String,
    ) -> CalendarResult<String> {
        let method = Method::from_bytes(method.as_bytes()).map_err(|_| {
            CalendarError::protocol(CalendarProvider::Apple, "invalid WebDAV method")
        })?;
        let mut request = self
            .client
            .request(method, url)
            .header(AUTHORIZATION, self.basic_auth_header(access_token)?)
            .header(CONTENT_TYPE, "application/xml; charset=utf-8");
        if let Some(depth) = depth {
            request = request.header("Depth", depth);
        }

        let response = request.body(body).send().await.map_err(|e| {
            CalendarError::Network {
                provider: CalendarProvider::Apple,
                message: e.to_string(),
                status_code: e.status().map(|s| s.as_u16()),
                is_timeout: e.is_timeout(),
            }
        })?;

        let status = response.status();
        if status.as_u16() == 401 {
            return Err(CalendarError::Authentication {
                provider: CalendarProvider::Apple,
                message: "Basic authentication rejected".to_string(),
                needs_reauth: true,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CalendarError::network(
                CalendarProvider::Apple,
                format!("request failed with status {}: {}", status, body),
                Some(status.as_u16()),
            ));
        }
        response.text().await.map_err(|e| {
            CalendarError::network(CalendarProvider::Apple, e.to_string(), Some(status.as_u16()))
        })
    }

    /// The `current-user-principal -> calendar-home-set -> calendar` chain
    async fn discover_calendar_path(&self, access_token: &str) -> CalendarResult<String> {
        if let Some(path) = self.calendar_paths.read().await.get(access_token) {
            return Ok(path.clone());
        }

        let principal_response = self
            .dav_request(
                "PROPFIND",
                &self.base_url,
                access_token,
                Some("0"),
                PRINCIPAL_PROPFIND.to_string(),
            )
            .await?;
        let principal_href = extract_href_in(&principal_response, "current-user-principal")
            .ok_or_else(|| {
                CalendarError::protocol(CalendarProvider::Apple, "no current-user-principal")
            })?;
        let principal_url = self.resolve_url(&principal_href)?;
        debug!("CalDAV principal: {}", principal_url);

        let home_response = self
            .dav_request(
                "PROPFIND",
                &principal_url,
                access_token,
                Some("0"),
                HOME_SET_PROPFIND.to_string(),
            )
            .await?;
        let home_href = extract_href_in(&home_response, "calendar-home-set").ok_or_else(|| {
            CalendarError::protocol(CalendarProvider::Apple, "no calendar-home-set")
        })?;
        let home_url = self.resolve_url(&home_href)?;
        debug!("CalDAV calendar home: {}", home_url);

        let list_response = self
            .dav_request(
                "PROPFIND",
                &format!("{}/", home_url),
                access_token,
                Some("1"),
                CALENDAR_LIST_PROPFIND.to_string(),
            )
            .await?;
        let calendar_url = match first_calendar_href(&list_response) {
            Some(href) => self.resolve_url(&href)?,
            None => {
                warn!("No calendar collection found under {}, using home", home_url);
                home_url
            }
        };

        self.calendar_paths
            .write()
            .await
            .insert(access_token.to_string(), calendar_url.clone());
        Ok(calendar_url)
    }

    async fn event_url(&self, access_token: &str, event_uid: &str) -> CalendarResult<String> {
        let calendar = self.discover_calendar_path(access_token).await?;
        Ok(format!("{}/{}.ics", calendar, event_uid))
    }

    fn apple_id_from_token(access_token: &str) -> Option<String> {
        let decoded = general_purpose::STANDARD.decode(access_token).ok()?;
        let text = String::from_utf8(decoded).ok()?;
        text.split_once(':').map(|(id, _)| id.to_string())
    }
}

/// Local name of a possibly-prefixed XML tag
fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|b| *b == b':') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}

/// First `<href>` nested inside the named element
fn extract_href_in(xml: &str, container: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut in_container = false;
    let mut in_href = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = local_name(e.name().as_ref()).to_vec();
                if name == container.as_bytes() {
                    in_container = true;
                } else if name == b"href" && in_container {
                    in_href = true;
                }
            }
            Ok(Event::Text(e)) => {
                if in_container && in_href {
                    let text = e.unescape().unwrap_or_default().to_string();
                    if !text.is_empty() {
                        return Some(text);
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                let name = local_name(e.name().as_ref()).to_vec();
                if name == container.as_bytes() {
                    in_container = false;
                } else if name == b"href" {
                    in_href = false;
                }
            }
            Ok(Event::Eof) => return None,
            Err(error) => {
                warn!("CalDAV XML parsing error: {:?}", error);
                return None;
            }
            _ => {}
        }
        buf.clear();
    }
}

/// Href of the first multistatus response whose resourcetype is a calendar
fn first_calendar_href(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut current_href: Option<String> = None;
    let mut in_href = false;
    let mut is_calendar = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match local_name(e.name().as_ref()) {
                b"response" => {
                    current_href = None;
                    is_calendar = false;
                }
                b"href" => in_href = true,
                b"calendar" => is_calendar = true,
                _ => {}
            },
            Ok(Event::Empty(ref e)) => {
                if local_name(e.name().as_ref()) == b"calendar" {
                    is_calendar = true;
                }
            }
            Ok(Event::Text(e)) => {
                if in_href && current_href.is_none() {
                    let text = e.unescape().unwrap_or_default().to_string();
                    if !text.is_empty() {
                        current_href = Some(text);
                    }
                }
            }
            Ok(Event::End(ref e)) => match local_name(e.name().as_ref()) {
                b"href" => in_href = false,
                b"response" => {
                    if is_calendar {
                        if let Some(href) = current_href.take() {
                            return Some(href);
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => return None,
            Err(error) => {
                warn!("CalDAV XML parsing error: {:?}", error);
                return None;
            }
            _ => {}
        }
        buf.clear();
    }
}

/// Every `<calendar-data>` text block of a REPORT response
fn extract_calendar_data(xml: &str) -> Vec<String> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut blocks = Vec::new();
    let mut in_data = false;
    let mut current = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                if local_name(e.name().as_ref()) == b"calendar-data" {
                    in_data = true;
                    current.clear();
                }
            }
            Ok(Event::Text(e)) => {
                if in_data {
                    current.push_str(&e.unescape().unwrap_or_default());
                }
            }
            Ok(Event::CData(e)) => {
                if in_data {
                    current.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Ok(Event::End(ref e)) => {
                if local_name(e.name().as_ref()) == b"calendar-data" {
                    in_data = false;
                    if !current.is_empty() {
                        blocks.push(std::mem::take(&mut current));
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(error) => {
                warn!("CalDAV XML parsing error: {:?}", error);
                break;
            }
            _ => {}
        }
        buf.clear();
    }
    blocks
}

fn report_body(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8" ?>
<C:calendar-query xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop>
    <D:getetag/>
    <C:calendar-data/>
  </D:prop>
  <C:filter>
    <C:comp-filter name="VCALENDAR">
      <C:comp-filter name="VEVENT">
        <C:time-range start="{}" end="{}"/>
      </C:comp-filter>
    </C:comp-filter>
  </C:filter>
</C:calendar-query>"#,
        start.format("%Y%m%dT%H%M%SZ"),
        end.format("%Y%m%dT%H%M%SZ")
    )
}

fn to_ical_event(event: &CalendarEventInput, uid: &str, dtstamp: DateTime<Utc>) -> IcalEvent {
    IcalEvent {
        uid: uid.to_string(),
        dtstamp,
        start: event.start,
        end: event.end,
        summary: event.title.clone(),
        description: event.description.clone(),
        location: event.location.clone(),
        url: event.meeting_link.clone(),
        attendee_emails: event.attendee_emails.clone(),
    }
}

#[async_trait]
impl CalendarProviderTrait for AppleCalendarProvider {
    fn provider_type(&self) -> CalendarProvider {
        CalendarProvider::Apple
    }

    fn authorization_url(&self, _state: &str, _redirect_uri: &str) -> CalendarResult<String> {
        // Apple has no OAuth flow; the user creates an app-specific password
        // on their account page and hands it over out-of-band.
        Ok(APPLE_SETUP_URL.to_string())
    }

    async fn exchange_code(&self, code: &str, _redirect_uri: &str) -> CalendarResult<TokenSet> {
        // The "code" is the out-of-band credential pair `appleId:appPassword`.
        let (apple_id, app_password) = code.split_once(':').ok_or_else(|| {
            CalendarError::Configuration {
                message: "Apple credentials must be supplied as appleId:appPassword".to_string(),
            }
        })?;
        if apple_id.is_empty() || app_password.is_empty() {
            return Err(CalendarError::Configuration {
                message: "Apple id and app password must both be non-empty".to_string(),
            });
        }
        Ok(TokenSet {
            access_token: Self::make_access_token(apple_id, app_password),
            refresh_token: None,
            expires_at: None,
            email: Some(apple_id.to_string()),
        })
    }

    async fn refresh_access_token(&self, _refresh_token: &str) -> CalendarResult<TokenSet> {
        Err(CalendarError::Configuration {
            message: "token refresh is not required for Apple app-specific passwords".to_string(),
        })
    }

    async fn revoke(&self, _access_token: &str) -> CalendarResult<()> {
        info!("Apple app-specific passwords are revoked from the Apple ID account page");
        Ok(())
    }

    async fn create_event(
        &self,
        access_token: &str,
        event: &CalendarEventInput,
        calendar_id: Option<&str>,
    ) -> CalendarResult<String> {
        let uid = uuid::Uuid::new_v4().to_string();
        let url = match calendar_id {
            Some(path) => format!("{}/{}.ics", self.resolve_url(path)?, uid),
            None => self.event_url(access_token, &uid).await?,
        };
        let body = to_ical_event(event, &uid, Utc::now()).render();

        let response = self
            .client
            .put(&url)
            .header(AUTHORIZATION, self.basic_auth_header(access_token)?)
            .header(CONTENT_TYPE, "text/calendar; charset=utf-8")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(uid)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(CalendarError::network(
                CalendarProvider::Apple,
                format!("event PUT failed with status {}: {}", status, body),
                Some(status.as_u16()),
            ))
        }
    }

    async fn update_event(
        &self,
        access_token: &str,
        external_event_id: &str,
        event: &CalendarEventInput,
        calendar_id: Option<&str>,
    ) -> CalendarResult<()> {
        let url = match calendar_id {
            Some(path) => format!("{}/{}.ics", self.resolve_url(path)?, external_event_id),
            None => self.event_url(access_token, external_event_id).await?,
        };
        let body = to_ical_event(event, external_event_id, Utc::now()).render();

        let response = self
            .client
            .put(&url)
            .header(AUTHORIZATION, self.basic_auth_header(access_token)?)
            .header(CONTENT_TYPE, "text/calendar; charset=utf-8")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(CalendarError::network(
                CalendarProvider::Apple,
                format!("event update failed with status {}: {}", status, body),
                Some(status.as_u16()),
            ))
        }
    }

    async fn delete_event(
        &self,
        access_token: &str,
        external_event_id: &str,
        calendar_id: Option<&str>,
    ) -> CalendarResult<()> {
        let url = match calendar_id {
            Some(path) => format!("{}/{}.ics", self.resolve_url(path)?, external_event_id),
            None => self.event_url(access_token, external_event_id).await?,
        };
        let response = self
            .client
            .delete(&url)
            .header(AUTHORIZATION, self.basic_auth_header(access_token)?)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status.as_u16() == 404 || status.as_u16() == 410 {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(CalendarError::network(
                CalendarProvider::Apple,
                format!("event delete failed with status {}: {}", status, body),
                Some(status.as_u16()),
            ))
        }
    }

    async fn busy(
        &self,
        access_token: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        calendar_id: Option<&str>,
    ) -> CalendarResult<Vec<BusyInterval>> {
        let calendar = match calendar_id {
            Some(path) => self.resolve_url(path)?,
            None => self.discover_calendar_path(access_token).await?,
        };
        let response = self
            .dav_request(
                "REPORT",
                &format!("{}/", calendar),
                access_token,
                Some("1"),
                report_body(start, end),
            )
            .await?;

        let mut intervals = Vec::new();
        for block in extract_calendar_data(&response) {
            match parse_busy_intervals(&block) {
                Ok(mut parsed) => intervals.append(&mut parsed),
                Err(error) => warn!("Skipping unparseable calendar data: {}", error),
            }
        }
        // Only overlap with the query window counts as busy.
        intervals.retain(|interval| interval.overlaps(start, end));
        Ok(intervals)
    }

    async fn user_email(&self, access_token: &str) -> CalendarResult<Option<String>> {
        Ok(Self::apple_id_from_token(access_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_access_token_round_trip() {
        let token = AppleCalendarProvider::make_access_token("rita@icloud.com", "abcd-efgh");
        assert_eq!(
            AppleCalendarProvider::apple_id_from_token(&token).as_deref(),
            Some("rita@icloud.com")
        );
    }

    #[test]
    fn test_resolve_url_accepts_absolute_and_relative() {
        let provider = AppleCalendarProvider::new().unwrap();
        assert_eq!(
            provider.resolve_url("/123456/calendars/home/").unwrap(),
            "https://caldav.icloud.com/123456/calendars/home"
        );
        assert_eq!(
            provider
                .resolve_url("https://p42-caldav.icloud.com/123456/calendars/home/")
                .unwrap(),
            "https://p42-caldav.icloud.com/123456/calendars/home"
        );
    }

    #[test]
    fn test_extract_principal_href() {
        let xml = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/</D:href>
    <D:propstat>
      <D:prop>
        <D:current-user-principal>
          <D:href>/123456/principal/</D:href>
        </D:current-user-principal>
      </D:prop>
    </D:propstat>
  </D:response>
</D:multistatus>"#;
        assert_eq!(
            extract_href_in(xml, "current-user-principal").as_deref(),
            Some("/123456/principal/")
        );
    }

    #[test]
    fn test_first_calendar_href_skips_non_calendars() {
        let xml = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:response>
    <D:href>/123456/calendars/</D:href>
    <D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop></D:propstat>
  </D:response>
  <D:response>
    <D:href>/123456/calendars/inbox/</D:href>
    <D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop></D:propstat>
  </D:response>
  <D:response>
    <D:href>/123456/calendars/home/</D:href>
    <D:propstat><D:prop><D:resourcetype><D:collection/><C:calendar/></D:resourcetype></D:prop></D:propstat>
  </D:response>
</D:multistatus>"#;
        assert_eq!(
            first_calendar_href(xml).as_deref(),
            Some("/123456/calendars/home/")
        );
    }

    #[test]
    fn test_first_calendar_href_none_when_absent() {
        let xml = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/123456/calendars/</D:href>
    <D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop></D:propstat>
  </D:response>
</D:multistatus>"#;
        assert!(first_calendar_href(xml).is_none());
    }

    #[test]
    fn test_extract_calendar_data_blocks() {
        let xml = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:response>
    <D:href>/123456/calendars/home/evt.ics</D:href>
    <D:propstat><D:prop>
      <C:calendar-data>BEGIN:VCALENDAR
BEGIN:VEVENT
UID:evt
DTSTART:20250601T020000Z
DTEND:20250601T040000Z
END:VEVENT
END:VCALENDAR
</C:calendar-data>
    </D:prop></D:propstat>
  </D:response>
</D:multistatus>"#;
        let blocks = extract_calendar_data(xml);
        assert_eq!(blocks.len(), 1);
        let busy = parse_busy_intervals(&blocks[0]).unwrap();
        assert_eq!(
            busy[0].start,
            Utc.with_ymd_and_hms(2025, 6, 1, 2, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_report_body_uses_zulu_time_range() {
        let body = report_body(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap(),
        );
        assert!(body.contains(r#"<C:time-range start="20250601T000000Z" end="20250701T000000Z"/>"#));
        assert!(body.contains(r#"<C:comp-filter name="VEVENT">"#));
    }

    #[tokio::test]
    async fn test_exchange_code_parses_credentials() {
        let provider = AppleCalendarProvider::new().unwrap();
        let tokens = provider
            .exchange_code("rita@icloud.com:abcd-efgh-ijkl", "unused")
            .await
            .unwrap();
        assert_eq!(tokens.email.as_deref(), Some("rita@icloud.com"));
        assert!(tokens.refresh_token.is_none());
        assert!(provider.exchange_code("no-colon", "unused").await.is_err());
    }
}
