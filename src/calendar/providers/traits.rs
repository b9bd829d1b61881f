/*!
 * Calendar Provider Traits
 *
 * One capability surface all three providers implement. Tokens arrive
 * decrypted; adapters never log them or persist anything themselves.
 */

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::calendar::error::CalendarResult;
use crate::calendar::types::{BusyInterval, CalendarEventInput, CalendarProvider, TokenSet};

#[async_trait]
pub trait CalendarProviderTrait: Send + Sync {
    /// Get provider type
    fn provider_type(&self) -> CalendarProvider;

    /// Authorization URL to send the user to. For Apple this is a setup URL;
    /// credential capture happens out-of-band.
    fn authorization_url(&self, state: &str, redirect_uri: &str) -> CalendarResult<String>;

    /// Exchange an authorization code for tokens
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> CalendarResult<TokenSet>;

    /// Refresh an access token; Apple reports that refresh is not required
    async fn refresh_access_token(&self, refresh_token: &str) -> CalendarResult<TokenSet>;

    /// Best-effort token revocation
    async fn revoke(&self, access_token: &str) -> CalendarResult<()>;

    // === Event operations ===

    /// Create a provider event; returns the external event id
    async fn create_event(
        &self,
        access_token: &str,
        event: &CalendarEventInput,
        calendar_id: Option<&str>,
    ) -> CalendarResult<String>;

    /// Update an existing provider event
    async fn update_event(
        &self,
        access_token: &str,
        external_event_id: &str,
        event: &CalendarEventInput,
        calendar_id: Option<&str>,
    ) -> CalendarResult<()>;

    /// Delete a provider event
    async fn delete_event(
        &self,
        access_token: &str,
        external_event_id: &str,
        calendar_id: Option<&str>,
    ) -> CalendarResult<()>;

    // === Availability ===

    /// Busy intervals in `[start, end)`
    async fn busy(
        &self,
        access_token: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        calendar_id: Option<&str>,
    ) -> CalendarResult<Vec<BusyInterval>>;

    /// The account email behind the token, when the provider exposes it
    async fn user_email(&self, access_token: &str) -> CalendarResult<Option<String>>;
}
