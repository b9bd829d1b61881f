/*!
 * Calendar Integration for SkillSwap
 *
 * External calendar support behind one capability surface: Google Calendar,
 * Microsoft Graph, and Apple iCloud CalDAV. The service owns per-user
 * integrations (tokens AES-256-GCM encrypted at rest), refreshes expired
 * access tokens, answers busy queries for the scheduler, and backs the
 * appointment-mirroring outbox subscriber.
 */

pub mod crypto;
pub mod error;
pub mod ical;
pub mod providers;
pub mod store;
pub mod sync;
pub mod types;

pub use error::{CalendarError, CalendarResult};
pub use providers::{
    AppleCalendarProvider, CalendarProviderTrait, GoogleCalendarProvider, OutlookCalendarProvider,
};
pub use store::CalendarIntegrationStore;
pub use sync::CalendarSyncService;
pub use types::{
    BusyInterval, CalendarEventInput, CalendarEventLink, CalendarIntegration, CalendarProvider,
    TokenSet,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::sessions::clock::new_id;
use crate::sessions::contracts::BusySource;
use crate::sessions::error::{SessionError, SessionResult};

/// Refresh tokens this close to expiry instead of using them
const EXPIRY_SLACK_SECONDS: i64 = 60;

pub struct CalendarService {
    store: Arc<CalendarIntegrationStore>,
    providers: HashMap<CalendarProvider, Arc<dyn CalendarProviderTrait>>,
}

impl CalendarService {
    pub fn new(store: Arc<CalendarIntegrationStore>) -> Self {
        Self {
            store,
            providers: HashMap::new(),
        }
    }

    pub fn register_provider(&mut self, provider: Arc<dyn CalendarProviderTrait>) {
        info!("Registering calendar provider: {}", provider.provider_type());
        self.providers.insert(provider.provider_type(), provider);
    }

    pub fn providers(&self) -> Vec<CalendarProvider> {
        self.providers.keys().copied().collect()
    }

    fn provider(&self, provider: CalendarProvider) -> SessionResult<&Arc<dyn CalendarProviderTrait>> {
        self.providers.get(&provider).ok_or_else(|| {
            SessionError::invalid_input(format!("calendar provider {} is not configured", provider))
        })
    }

    // === Connection management ===

    pub fn authorization_url(
        &self,
        provider: CalendarProvider,
        state: &str,
        redirect_uri: &str,
    ) -> SessionResult<String> {
        Ok(self.provider(provider)?.authorization_url(state, redirect_uri)?)
    }

    /// Complete the provider handshake and store the integration. For Apple
    /// the code is the out-of-band `appleId:appPassword` pair.
    pub async fn connect(
        &self,
        user_id: &str,
        provider: CalendarProvider,
        code: &str,
        redirect_uri: &str,
        calendar_id: Option<String>,
    ) -> SessionResult<CalendarIntegration> {
        let adapter = self.provider(provider)?;
        let tokens = adapter.exchange_code(code, redirect_uri).await?;

        let cipher = crypto::global_cipher()?;
        let now = Utc::now();
        let integration = CalendarIntegration {
            id: new_id(),
            user_id: user_id.to_string(),
            provider,
            access_token_enc: cipher.encrypt(&tokens.access_token)?,
            refresh_token_enc: tokens
                .refresh_token
                .as_deref()
                .map(|t| cipher.encrypt(t))
                .transpose()?,
            expires_at: tokens.expires_at,
            calendar_id,
            email: tokens.email,
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_integration(&integration).await?;
        info!("Connected {} calendar for user {}", provider, user_id);
        Ok(integration)
    }

    /// Best-effort revoke, then forget the integration
    pub async fn disconnect(
        &self,
        user_id: &str,
        provider: CalendarProvider,
    ) -> SessionResult<bool> {
        if let Some(integration) = self.store.get_integration(user_id, provider).await? {
            if let Ok(token) = self.decrypt_access_token(&integration) {
                if let Err(error) = self.provider(provider)?.revoke(&token).await {
                    warn!("Token revocation failed for {}: {}", provider, error);
                }
            }
        }
        let removed = self.store.delete_integration(user_id, provider).await?;
        if removed {
            info!("Disconnected {} calendar for user {}", provider, user_id);
        }
        Ok(removed)
    }

    pub async fn list_integrations(&self, user_id: &str) -> SessionResult<Vec<CalendarIntegration>> {
        self.store.list_for_user(user_id).await
    }

    // === Token handling ===

    fn decrypt_access_token(&self, integration: &CalendarIntegration) -> SessionResult<String> {
        Ok(crypto::global_cipher()?.decrypt(&integration.access_token_enc)?)
    }

    fn token_expired(&self, integration: &CalendarIntegration, now: DateTime<Utc>) -> bool {
        integration
            .expires_at
            .map(|at| at <= now + Duration::seconds(EXPIRY_SLACK_SECONDS))
            .unwrap_or(false)
    }

    /// Decrypted access token, refreshed and re-persisted when expired
    async fn access_token(&self, integration: &CalendarIntegration) -> SessionResult<String> {
        if !self.token_expired(integration, Utc::now()) {
            return self.decrypt_access_token(integration);
        }
        self.refresh_integration(integration).await
    }

    async fn refresh_integration(&self, integration: &CalendarIntegration) -> SessionResult<String> {
        let cipher = crypto::global_cipher()?;
        let refresh_token = integration
            .refresh_token_enc
            .as_deref()
            .map(|enc| cipher.decrypt(enc))
            .transpose()?
            .ok_or_else(|| SessionError::Unauthorized {
                message: "access token expired and no refresh token is stored".to_string(),
                provider: Some(integration.provider.to_string()),
            })?;

        let tokens = self
            .provider(integration.provider)?
            .refresh_access_token(&refresh_token)
            .await?;

        let refresh_enc = tokens
            .refresh_token
            .as_deref()
            .map(|t| cipher.encrypt(t))
            .transpose()?;
        self.store
            .update_tokens(
                &integration.id,
                &cipher.encrypt(&tokens.access_token)?,
                refresh_enc.as_deref(),
                tokens.expires_at,
            )
            .await?;
        Ok(tokens.access_token)
    }

    /// Run a provider call; an unauthorized answer triggers one
    /// refresh-then-retry cycle before the error surfaces
    async fn with_token_retry<F, Fut, T>(
        &self,
        integration: &CalendarIntegration,
        operation: F,
    ) -> SessionResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = CalendarResult<T>>,
    {
        let token = self.access_token(integration).await?;
        match operation(token).await {
            Ok(value) => Ok(value),
            Err(error) if error.is_unauthorized() => {
                warn!(
                    "{} rejected the token for {}, refreshing once",
                    integration.provider, integration.user_id
                );
                let token = self.refresh_integration(integration).await?;
                Ok(operation(token).await?)
            }
            Err(error) => Err(error.into()),
        }
    }

    // === Provider event operations ===

    pub async fn create_event(
        &self,
        integration: &CalendarIntegration,
        event: &CalendarEventInput,
    ) -> SessionResult<String> {
        let adapter = Arc::clone(self.provider(integration.provider)?);
        let calendar_id = integration.calendar_id.clone();
        self.with_token_retry(integration, move |token| {
            let adapter = Arc::clone(&adapter);
            let calendar_id = calendar_id.clone();
            let event = event.clone();
            async move {
                adapter
                    .create_event(&token, &event, calendar_id.as_deref())
                    .await
            }
        })
        .await
    }

    pub async fn update_event(
        &self,
        integration: &CalendarIntegration,
        external_event_id: &str,
        event: &CalendarEventInput,
    ) -> SessionResult<()> {
        let adapter = Arc::clone(self.provider(integration.provider)?);
        let calendar_id = integration.calendar_id.clone();
        let external_event_id = external_event_id.to_string();
        self.with_token_retry(integration, move |token| {
            let adapter = Arc::clone(&adapter);
            let calendar_id = calendar_id.clone();
            let event = event.clone();
            let external_event_id = external_event_id.clone();
            async move {
                adapter
                    .update_event(&token, &external_event_id, &event, calendar_id.as_deref())
                    .await
            }
        })
        .await
    }

    pub async fn delete_event(
        &self,
        integration: &CalendarIntegration,
        external_event_id: &str,
    ) -> SessionResult<()> {
        let adapter = Arc::clone(self.provider(integration.provider)?);
        let calendar_id = integration.calendar_id.clone();
        let external_event_id = external_event_id.to_string();
        self.with_token_retry(integration, move |token| {
            let adapter = Arc::clone(&adapter);
            let calendar_id = calendar_id.clone();
            let external_event_id = external_event_id.clone();
            async move {
                adapter
                    .delete_event(&token, &external_event_id, calendar_id.as_deref())
                    .await
            }
        })
        .await
    }

    pub async fn integration_for(
        &self,
        user_id: &str,
        provider: CalendarProvider,
    ) -> SessionResult<Option<CalendarIntegration>> {
        self.store.get_integration(user_id, provider).await
    }
}

#[async_trait]
impl BusySource for CalendarService {
    /// Union of busy intervals across the user's integrations. A failing
    /// integration degrades the result instead of failing the query.
    async fn busy(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SessionResult<Vec<BusyInterval>> {
        let mut intervals = Vec::new();
        for integration in self.store.list_for_user(user_id).await? {
            let adapter = match self.provider(integration.provider) {
                Ok(adapter) => Arc::clone(adapter),
                Err(_) => continue,
            };
            let calendar_id = integration.calendar_id.clone();
            let result = self
                .with_token_retry(&integration, move |token| {
                    let adapter = Arc::clone(&adapter);
                    let calendar_id = calendar_id.clone();
                    async move { adapter.busy(&token, start, end, calendar_id.as_deref()).await }
                })
                .await;
            match result {
                Ok(mut busy) => intervals.append(&mut busy),
                Err(error) => warn!(
                    "Busy lookup failed for {} on {}: {}",
                    user_id, integration.provider, error
                ),
            }
        }
        Ok(intervals)
    }
}
