/*!
 * Google Calendar API Provider
 *
 * Google Calendar v3 integration: OAuth2 authorization-code flow with
 * offline access, event CRUD against the calendars collection, and busy
 * interval lookup through the freeBusy endpoint.
 */

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, RefreshToken,
    Scope, TokenResponse, TokenUrl,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

use crate::calendar::error::{CalendarError, CalendarResult};
use crate::calendar::providers::traits::CalendarProviderTrait;
use crate::calendar::types::{BusyInterval, CalendarEventInput, CalendarProvider, TokenSet};

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";
const SCOPE: &str = "https://www.googleapis.com/auth/calendar";

pub struct GoogleCalendarProvider {
    client: Client,
    oauth: BasicClient,
    base_url: String,
}

impl GoogleCalendarProvider {
    pub fn new(client_id: String, client_secret: String) -> CalendarResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| CalendarError::network(CalendarProvider::Google, e.to_string(), None))?;

        let oauth = BasicClient::new(
            ClientId::new(client_id),
            Some(ClientSecret::new(client_secret)),
            AuthUrl::new(AUTH_URL.to_string()).map_err(|e| CalendarError::Configuration {
                message: format!("invalid auth URL: {}", e),
            })?,
            Some(TokenUrl::new(TOKEN_URL.to_string()).map_err(|e| {
                CalendarError::Configuration {
                    message: format!("invalid token URL: {}", e),
                }
            })?),
        );

        Ok(Self {
            client,
            oauth,
            base_url: "https://www.googleapis.com/calendar/v3".to_string(),
        })
    }

    fn auth_headers(&self, access_token: &str) -> CalendarResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", access_token)).map_err(|_| {
                CalendarError::Token {
                    provider: CalendarProvider::Google,
                    message: "access token is not a valid header value".to_string(),
                    expired: false,
                }
            })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn handle_api_error(&self, status_code: u16, error_body: &str) -> CalendarError {
        match status_code {
            401 => CalendarError::Authentication {
                provider: CalendarProvider::Google,
                message: "authentication failed".to_string(),
                needs_reauth: true,
            },
            404 | 410 => CalendarError::NotFound {
                provider: CalendarProvider::Google,
                resource: "event".to_string(),
            },
            _ => CalendarError::network(
                CalendarProvider::Google,
                format!("API request failed with status {}: {}", status_code, error_body),
                Some(status_code),
            ),
        }
    }

    fn redirect(&self, redirect_uri: &str) -> CalendarResult<RedirectUrl> {
        RedirectUrl::new(redirect_uri.to_string()).map_err(|e| CalendarError::Configuration {
            message: format!("invalid redirect URI: {}", e),
        })
    }

    fn event_path(&self, calendar_id: Option<&str>) -> String {
        format!(
            "{}/calendars/{}/events",
            self.base_url,
            urlencoding::encode(calendar_id.unwrap_or("primary"))
        )
    }
}

/// Build the Google event body for an appointment payload
fn event_body(event: &CalendarEventInput) -> Value {
    let mut body = json!({
        "summary": event.title,
        "start": {
            "dateTime": event.start.to_rfc3339(),
            "timeZone": "UTC",
        },
        "end": {
            "dateTime": event.end.to_rfc3339(),
            "timeZone": "UTC",
        },
        "attendees": event
            .attendee_emails
            .iter()
            .map(|email| json!({ "email": email }))
            .collect::<Vec<_>>(),
    });
    if let Some(description) = &event.description {
        body["description"] = json!(description);
    }
    if let Some(location) = &event.location {
        body["location"] = json!(location);
    }
    if let Some(link) = &event.meeting_link {
        body["conferenceData"] = json!({
            "entryPoints": [{
                "entryPointType": "video",
                "uri": link,
            }],
        });
    }
    body
}

#[derive(Debug, Deserialize)]
struct GoogleEventResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GoogleBusySlot {
    start: String,
    end: String,
}

#[derive(Debug, Deserialize)]
struct GoogleBusyCalendar {
    #[serde(default)]
    busy: Vec<GoogleBusySlot>,
}

#[derive(Debug, Deserialize)]
struct GoogleFreeBusyResponse {
    #[serde(default)]
    calendars: HashMap<String, GoogleBusyCalendar>,
}

#[derive(Debug, Deserialize)]
struct GoogleCalendarResource {
    id: String,
}

fn parse_busy_response(response: GoogleFreeBusyResponse) -> CalendarResult<Vec<BusyInterval>> {
    let mut intervals = Vec::new();
    for calendar in response.calendars.into_values() {
        for slot in calendar.busy {
            let start = DateTime::parse_from_rfc3339(&slot.start).map_err(|e| {
                CalendarError::protocol(
                    CalendarProvider::Google,
                    format!("bad busy start: {}", e),
                )
            })?;
            let end = DateTime::parse_from_rfc3339(&slot.end).map_err(|e| {
                CalendarError::protocol(CalendarProvider::Google, format!("bad busy end: {}", e))
            })?;
            intervals.push(BusyInterval::new(
                start.with_timezone(&Utc),
                end.with_timezone(&Utc),
            ));
        }
    }
    Ok(intervals)
}

#[async_trait]
impl CalendarProviderTrait for GoogleCalendarProvider {
    fn provider_type(&self) -> CalendarProvider {
        CalendarProvider::Google
    }

    fn authorization_url(&self, state: &str, redirect_uri: &str) -> CalendarResult<String> {
        let state = state.to_string();
        let (url, _csrf) = self
            .oauth
            .authorize_url(move || CsrfToken::new(state.clone()))
            .add_scope(Scope::new(SCOPE.to_string()))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .set_redirect_uri(std::borrow::Cow::Owned(self.redirect(redirect_uri)?))
            .url();
        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> CalendarResult<TokenSet> {
        let token = self
            .oauth
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_redirect_uri(std::borrow::Cow::Owned(self.redirect(redirect_uri)?))
            .request_async(async_http_client)
            .await
            .map_err(|e| CalendarError::Authentication {
                provider: CalendarProvider::Google,
                message: format!("code exchange failed: {}", e),
                needs_reauth: true,
            })?;

        let access_token = token.access_token().secret().clone();
        let email = self.user_email(&access_token).await.unwrap_or(None);
        Ok(TokenSet {
            access_token,
            refresh_token: token.refresh_token().map(|t| t.secret().clone()),
            expires_at: token
                .expires_in()
                .map(|d| Utc::now() + chrono::Duration::seconds(d.as_secs() as i64)),
            email,
        })
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> CalendarResult<TokenSet> {
        let token = self
            .oauth
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| CalendarError::Token {
                provider: CalendarProvider::Google,
                message: format!("token refresh failed: {}", e),
                expired: true,
            })?;

        Ok(TokenSet {
            access_token: token.access_token().secret().clone(),
            refresh_token: token
                .refresh_token()
                .map(|t| t.secret().clone())
                .or_else(|| Some(refresh_token.to_string())),
            expires_at: token
                .expires_in()
                .map(|d| Utc::now() + chrono::Duration::seconds(d.as_secs() as i64)),
            email: None,
        })
    }

    async fn revoke(&self, access_token: &str) -> CalendarResult<()> {
        let response = self
            .client
            .post(REVOKE_URL)
            .form(&[("token", access_token)])
            .send()
            .await?;
        if !response.status().is_success() {
            debug!("Google token revocation returned {}", response.status());
        }
        Ok(())
    }

    async fn create_event(
        &self,
        access_token: &str,
        event: &CalendarEventInput,
        calendar_id: Option<&str>,
    ) -> CalendarResult<String> {
        let url = format!("{}?conferenceDataVersion=1", self.event_path(calendar_id));
        let response = self
            .client
            .post(&url)
            .headers(self.auth_headers(access_token)?)
            .json(&event_body(event))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.handle_api_error(status.as_u16(), &body));
        }
        let created: GoogleEventResponse = response.json().await.map_err(|e| {
            CalendarError::protocol(CalendarProvider::Google, format!("bad event response: {}", e))
        })?;
        Ok(created.id)
    }

    async fn update_event(
        &self,
        access_token: &str,
        external_event_id: &str,
        event: &CalendarEventInput,
        calendar_id: Option<&str>,
    ) -> CalendarResult<()> {
        let url = format!(
            "{}/{}?conferenceDataVersion=1",
            self.event_path(calendar_id),
            urlencoding::encode(external_event_id)
        );
        let response = self
            .client
            .put(&url)
            .headers(self.auth_headers(access_token)?)
            .json(&event_body(event))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.handle_api_error(status.as_u16(), &body));
        }
        Ok(())
    }

    async fn delete_event(
        &self,
        access_token: &str,
        external_event_id: &str,
        calendar_id: Option<&str>,
    ) -> CalendarResult<()> {
        let url = format!(
            "{}/{}",
            self.event_path(calendar_id),
            urlencoding::encode(external_event_id)
        );
        let response = self
            .client
            .delete(&url)
            .headers(self.auth_headers(access_token)?)
            .send()
            .await?;

        let status = response.status();
        // An already-deleted event is not an error for our callers.
        if status.is_success() || status.as_u16() == 404 || status.as_u16() == 410 {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(self.handle_api_error(status.as_u16(), &body))
        }
    }

    async fn busy(
        &self,
        access_token: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        calendar_id: Option<&str>,
    ) -> CalendarResult<Vec<BusyInterval>> {
        let body = json!({
            "timeMin": start.to_rfc3339(),
            "timeMax": end.to_rfc3339(),
            "items": [{ "id": calendar_id.unwrap_or("primary") }],
        });
        let response = self
            .client
            .post(format!("{}/freeBusy", self.base_url))
            .headers(self.auth_headers(access_token)?)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.handle_api_error(status.as_u16(), &body));
        }
        let parsed: GoogleFreeBusyResponse = response.json().await.map_err(|e| {
            CalendarError::protocol(
                CalendarProvider::Google,
                format!("bad freeBusy response: {}", e),
            )
        })?;
        parse_busy_response(parsed)
    }

    async fn user_email(&self, access_token: &str) -> CalendarResult<Option<String>> {
        let response = self
            .client
            .get(format!("{}/calendars/primary", self.base_url))
            .headers(self.auth_headers(access_token)?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Ok(None);
        }
        let calendar: GoogleCalendarResource = response.json().await.map_err(|e| {
            CalendarError::protocol(
                CalendarProvider::Google,
                format!("bad calendar response: {}", e),
            )
        })?;
        // The primary calendar id is the account email.
        Ok(Some(calendar.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_event() -> CalendarEventInput {
        CalendarEventInput {
            title: "Guitar - Session 1".to_string(),
            description: Some("First session".to_string()),
            location: None,
            start: Utc.with_ymd_and_hms(2025, 6, 2, 18, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 6, 2, 19, 0, 0).unwrap(),
            meeting_link: Some("https://meet.example.com/join/a-1".to_string()),
            attendee_emails: vec!["rita@example.com".to_string()],
        }
    }

    #[test]
    fn test_event_body_shape() {
        let body = event_body(&sample_event());
        assert_eq!(body["summary"], "Guitar - Session 1");
        assert_eq!(body["start"]["timeZone"], "UTC");
        assert_eq!(body["start"]["dateTime"], "2025-06-02T18:00:00+00:00");
        assert_eq!(body["attendees"][0]["email"], "rita@example.com");
        assert_eq!(
            body["conferenceData"]["entryPoints"][0]["entryPointType"],
            "video"
        );
    }

    #[test]
    fn test_event_body_omits_absent_fields() {
        let mut event = sample_event();
        event.description = None;
        event.meeting_link = None;
        let body = event_body(&event);
        assert!(body.get("description").is_none());
        assert!(body.get("conferenceData").is_none());
    }

    #[test]
    fn test_busy_response_parsing() {
        let raw = r#"{
            "calendars": {
                "primary": {
                    "busy": [
                        {"start": "2025-06-01T02:00:00Z", "end": "2025-06-01T04:00:00Z"}
                    ]
                }
            }
        }"#;
        let parsed: GoogleFreeBusyResponse = serde_json::from_str(raw).unwrap();
        let intervals = parse_busy_response(parsed).unwrap();
        assert_eq!(intervals.len(), 1);
        assert_eq!(
            intervals[0].start,
            Utc.with_ymd_and_hms(2025, 6, 1, 2, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_authorization_url_contains_offline_access() {
        let provider =
            GoogleCalendarProvider::new("client-id".to_string(), "client-secret".to_string())
                .unwrap();
        let url = provider
            .authorization_url("state-1", "https://app.example.com/oauth/callback")
            .unwrap();
        assert!(url.starts_with(AUTH_URL));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("state=state-1"));
    }
}
