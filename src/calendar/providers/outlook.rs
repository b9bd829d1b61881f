/*!
 * Microsoft Graph Calendar Provider
 *
 * Outlook/Microsoft 365 integration over Microsoft Graph: OAuth2 with
 * `offline_access` against the common or tenant authority, event CRUD under
 * /me, and busy lookup through calendarView (events marked free or
 * workingElsewhere do not count as busy).
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
use tracing::debug;

use crate::calendar::error::{CalendarError, CalendarResult};
use crate::calendar::providers::traits::CalendarProviderTrait;
use crate::calendar::types::{BusyInterval, CalendarEventInput, CalendarProvider, TokenSet};

const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";
const SCOPES: [&str; 2] = ["https://graph.microsoft.com/Calendars.ReadWrite", "offline_access"];

pub struct OutlookCalendarProvider {
    client: Client,
    oauth: BasicClient,
    base_url: String,
}

impl OutlookCalendarProvider {
    /// `tenant` is usually "common"; single-tenant apps pass their tenant id
    pub fn new(client_id: String, client_secret: String, tenant: &str) -> CalendarResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| {
                CalendarError::network(CalendarProvider::Microsoft, e.to_string(), None)
            })?;

        let authority = format!("https://login.microsoftonline.com/{}/oauth2/v2.0", tenant);
        let oauth = BasicClient::new(
            ClientId::new(client_id),
            Some(ClientSecret::new(client_secret)),
            AuthUrl::new(format!("{}/authorize", authority)).map_err(|e| {
                CalendarError::Configuration {
                    message: format!("invalid auth URL: {}", e),
                }
            })?,
            Some(TokenUrl::new(format!("{}/token", authority)).map_err(|e| {
                CalendarError::Configuration {
                    message: format!("invalid token URL: {}", e),
                }
            })?),
        );

        Ok(Self {
            client,
            oauth,
            base_url: GRAPH_BASE.to_string(),
        })
    }

    fn auth_headers(&self, access_token: &str) -> CalendarResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", access_token)).map_err(|_| {
                CalendarError::Token {
                    provider: CalendarProvider::Microsoft,
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
                provider: CalendarProvider::Microsoft,
                message: "authentication failed".to_string(),
                needs_reauth: true,
            },
            404 | 410 => CalendarError::NotFound {
                provider: CalendarProvider::Microsoft,
                resource: "event".to_string(),
            },
            _ => CalendarError::network(
                CalendarProvider::Microsoft,
                format!("Graph request failed with status {}: {}", status_code, error_body),
                Some(status_code),
            ),
        }
    }

    fn redirect(&self, redirect_uri: &str) -> CalendarResult<RedirectUrl> {
        RedirectUrl::new(redirect_uri.to_string()).map_err(|e| CalendarError::Configuration {
            message: format!("invalid redirect URI: {}", e),
        })
    }

    fn events_path(&self, calendar_id: Option<&str>) -> String {
        match calendar_id {
            Some(id) => format!(
                "{}/me/calendars/{}/events",
                self.base_url,
                urlencoding::encode(id)
            ),
            None => format!("{}/me/events", self.base_url),
        }
    }
}

/// Build the Graph event body for an appointment payload
fn event_body(event: &CalendarEventInput) -> Value {
    let mut body = json!({
        "subject": event.title,
        "body": {
            "contentType": "text",
            "content": event.description.clone().unwrap_or_default(),
        },
        "start": {
            "dateTime": event.start.format("%Y-%m-%dT%H:%M:%S").to_string(),
            "timeZone": "UTC",
        },
        "end": {
            "dateTime": event.end.format("%Y-%m-%dT%H:%M:%S").to_string(),
            "timeZone": "UTC",
        },
        "attendees": event
            .attendee_emails
            .iter()
            .map(|email| {
                json!({
                    "emailAddress": { "address": email },
                    "type": "required",
                })
            })
            .collect::<Vec<_>>(),
    });
    if let Some(location) = &event.location {
        body["location"] = json!({ "displayName": location });
    }
    if let Some(link) = &event.meeting_link {
        body["isOnlineMeeting"] = json!(true);
        body["onlineMeetingUrl"] = json!(link);
    }
    body
}

#[derive(Debug, Deserialize)]
struct GraphEventResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphDateTime {
    date_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphCalendarViewEvent {
    start: GraphDateTime,
    end: GraphDateTime,
    #[serde(default)]
    show_as: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphCalendarViewResponse {
    #[serde(default)]
    value: Vec<GraphCalendarViewEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
    #[serde(default)]
    mail: Option<String>,
    #[serde(default)]
    user_principal_name: Option<String>,
}

fn parse_graph_time(value: &str) -> CalendarResult<DateTime<Utc>> {
    // Graph returns fractional-second local times in the requested zone
    // (UTC here), without an offset suffix.
    let trimmed = value.trim_end_matches('Z');
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(parsed) = chrono::NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(DateTime::from_naive_utc_and_offset(parsed, Utc));
        }
    }
    Err(CalendarError::protocol(
        CalendarProvider::Microsoft,
        format!("unsupported Graph timestamp: {}", value),
    ))
}

fn parse_calendar_view(response: GraphCalendarViewResponse) -> CalendarResult<Vec<BusyInterval>> {
    let mut intervals = Vec::new();
    for event in response.value {
        if let Some(show_as) = &event.show_as {
            if show_as == "free" || show_as == "workingElsewhere" {
                continue;
            }
        }
        intervals.push(BusyInterval::new(
            parse_graph_time(&event.start.date_time)?,
            parse_graph_time(&event.end.date_time)?,
        ));
    }
    Ok(intervals)
}

#[async_trait]
impl CalendarProviderTrait for OutlookCalendarProvider {
    fn provider_type(&self) -> CalendarProvider {
        CalendarProvider::Microsoft
    }

    fn authorization_url(&self, state: &str, redirect_uri: &str) -> CalendarResult<String> {
        let state = state.to_string();
        let (url, _csrf) = self
            .oauth
            .authorize_url(move || CsrfToken::new(state.clone()))
            .add_scopes(SCOPES.iter().map(|s| Scope::new(s.to_string())))
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
                provider: CalendarProvider::Microsoft,
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
                provider: CalendarProvider::Microsoft,
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

    async fn revoke(&self, _access_token: &str) -> CalendarResult<()> {
        // Microsoft has no token revocation endpoint; tokens die when the
        // user removes the app grant.
        debug!("Microsoft token revocation is a no-op");
        Ok(())
    }

    async fn create_event(
        &self,
        access_token: &str,
        event: &CalendarEventInput,
        calendar_id: Option<&str>,
    ) -> CalendarResult<String> {
        let response = self
            .client
            .post(self.events_path(calendar_id))
            .headers(self.auth_headers(access_token)?)
            .json(&event_body(event))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.handle_api_error(status.as_u16(), &body));
        }
        let created: GraphEventResponse = response.json().await.map_err(|e| {
            CalendarError::protocol(
                CalendarProvider::Microsoft,
                format!("bad event response: {}", e),
            )
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
            "{}/{}",
            self.events_path(calendar_id),
            urlencoding::encode(external_event_id)
        );
        let response = self
            .client
            .patch(&url)
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
            self.events_path(calendar_id),
            urlencoding::encode(external_event_id)
        );
        let response = self
            .client
            .delete(&url)
            .headers(self.auth_headers(access_token)?)
            .send()
            .await?;

        let status = response.status();
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
        let base = match calendar_id {
            Some(id) => format!(
                "{}/me/calendars/{}/calendarView",
                self.base_url,
                urlencoding::encode(id)
            ),
            None => format!("{}/me/calendarView", self.base_url),
        };
        let url = format!(
            "{}?startDateTime={}&endDateTime={}&$select=start,end,showAs&$top=500",
            base,
            urlencoding::encode(&start.to_rfc3339()),
            urlencoding::encode(&end.to_rfc3339())
        );

        let mut headers = self.auth_headers(access_token)?;
        headers.insert(
            "Prefer",
            HeaderValue::from_static("outlook.timezone=\"UTC\""),
        );
        let response = self.client.get(&url).headers(headers).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.handle_api_error(status.as_u16(), &body));
        }
        let parsed: GraphCalendarViewResponse = response.json().await.map_err(|e| {
            CalendarError::protocol(
                CalendarProvider::Microsoft,
                format!("bad calendarView response: {}", e),
            )
        })?;
        parse_calendar_view(parsed)
    }

    async fn user_email(&self, access_token: &str) -> CalendarResult<Option<String>> {
        let response = self
            .client
            .get(format!("{}/me", self.base_url))
            .headers(self.auth_headers(access_token)?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Ok(None);
        }
        let user: GraphUser = response.json().await.map_err(|e| {
            CalendarError::protocol(CalendarProvider::Microsoft, format!("bad user response: {}", e))
        })?;
        Ok(user.mail.or(user.user_principal_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_event() -> CalendarEventInput {
        CalendarEventInput {
            title: "Spanish - Session 2".to_string(),
            description: Some("Conversation practice".to_string()),
            location: Some("Online".to_string()),
            start: Utc.with_ymd_and_hms(2025, 6, 4, 18, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 6, 4, 19, 0, 0).unwrap(),
            meeting_link: Some("https://meet.example.com/join/a-2".to_string()),
            attendee_emails: vec!["tom@example.com".to_string()],
        }
    }

    #[test]
    fn test_event_body_shape() {
        let body = event_body(&sample_event());
        assert_eq!(body["subject"], "Spanish - Session 2");
        assert_eq!(body["body"]["contentType"], "text");
        assert_eq!(body["start"]["dateTime"], "2025-06-04T18:00:00");
        assert_eq!(body["start"]["timeZone"], "UTC");
        assert_eq!(body["attendees"][0]["emailAddress"]["address"], "tom@example.com");
        assert_eq!(body["isOnlineMeeting"], true);
        assert_eq!(body["onlineMeetingUrl"], "https://meet.example.com/join/a-2");
    }

    #[test]
    fn test_event_body_without_link_is_offline() {
        let mut event = sample_event();
        event.meeting_link = None;
        let body = event_body(&event);
        assert!(body.get("isOnlineMeeting").is_none());
    }

    #[test]
    fn test_calendar_view_filters_free_slots() {
        let raw = r#"{
            "value": [
                {"start": {"dateTime": "2025-06-04T10:00:00.0000000"}, "end": {"dateTime": "2025-06-04T11:00:00.0000000"}, "showAs": "busy"},
                {"start": {"dateTime": "2025-06-04T12:00:00.0000000"}, "end": {"dateTime": "2025-06-04T13:00:00.0000000"}, "showAs": "free"},
                {"start": {"dateTime": "2025-06-04T14:00:00.0000000"}, "end": {"dateTime": "2025-06-04T15:00:00.0000000"}, "showAs": "workingElsewhere"},
                {"start": {"dateTime": "2025-06-04T16:00:00.0000000"}, "end": {"dateTime": "2025-06-04T17:00:00.0000000"}, "showAs": "tentative"}
            ]
        }"#;
        let parsed: GraphCalendarViewResponse = serde_json::from_str(raw).unwrap();
        let intervals = parse_calendar_view(parsed).unwrap();
        assert_eq!(intervals.len(), 2);
        assert_eq!(
            intervals[0].start,
            Utc.with_ymd_and_hms(2025, 6, 4, 10, 0, 0).unwrap()
        );
        assert_eq!(
            intervals[1].start,
            Utc.with_ymd_and_hms(2025, 6, 4, 16, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_authorization_url_uses_tenant_authority() {
        let provider = OutlookCalendarProvider::new(
            "client-id".to_string(),
            "client-secret".to_string(),
            "common",
        )
        .unwrap();
        let url = provider
            .authorization_url("state-2", "https://app.example.com/oauth/callback")
            .unwrap();
        assert!(url.starts_with("https://login.microsoftonline.com/common/oauth2/v2.0/authorize"));
        assert!(url.contains("offline_access"));
    }
}
