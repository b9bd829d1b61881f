/*!
 * Calendar Integration Storage
 *
 * SQLite persistence for per-user calendar integrations (encrypted token
 * envelopes) and the mapping between appointments and the provider events
 * they were mirrored into.
 */

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

use crate::calendar::types::{CalendarEventLink, CalendarIntegration, CalendarProvider};
use crate::sessions::error::{SessionError, SessionResult};

pub struct CalendarIntegrationStore {
    pool: SqlitePool,
}

impl CalendarIntegrationStore {
    pub async fn new(pool: SqlitePool) -> SessionResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> SessionResult<()> {
        info!("Initializing calendar integration schema");
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS calendar_integrations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL CHECK (provider IN ('Google', 'Microsoft', 'Apple')),
                access_token_enc TEXT NOT NULL,
                refresh_token_enc TEXT,
                expires_at DATETIME,
                calendar_id TEXT,
                email TEXT,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,

                UNIQUE(user_id, provider)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS calendar_event_links (
                appointment_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                external_event_id TEXT NOT NULL,
                calendar_id TEXT,
                created_at DATETIME NOT NULL,

                PRIMARY KEY (appointment_id, user_id, provider)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_calendar_integrations_user ON calendar_integrations (user_id)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_calendar_event_links_appointment ON calendar_event_links (appointment_id)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_integration(
        &self,
        integration: &CalendarIntegration,
    ) -> SessionResult<()> {
        sqlx::query(
            r#"
            INSERT INTO calendar_integrations (
                id, user_id, provider, access_token_enc, refresh_token_enc,
                expires_at, calendar_id, email, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, provider) DO UPDATE SET
                access_token_enc = excluded.access_token_enc,
                refresh_token_enc = excluded.refresh_token_enc,
                expires_at = excluded.expires_at,
                calendar_id = excluded.calendar_id,
                email = excluded.email,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&integration.id)
        .bind(&integration.user_id)
        .bind(integration.provider.to_string())
        .bind(&integration.access_token_enc)
        .bind(&integration.refresh_token_enc)
        .bind(integration.expires_at)
        .bind(&integration.calendar_id)
        .bind(&integration.email)
        .bind(integration.created_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_tokens(
        &self,
        integration_id: &str,
        access_token_enc: &str,
        refresh_token_enc: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> SessionResult<()> {
        sqlx::query(
            r#"
            UPDATE calendar_integrations
            SET access_token_enc = ?, refresh_token_enc = COALESCE(?, refresh_token_enc),
                expires_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(access_token_enc)
        .bind(refresh_token_enc)
        .bind(expires_at)
        .bind(Utc::now())
        .bind(integration_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_integration(
        &self,
        user_id: &str,
        provider: CalendarProvider,
    ) -> SessionResult<Option<CalendarIntegration>> {
        let row = sqlx::query(
            "SELECT * FROM calendar_integrations WHERE user_id = ? AND provider = ?",
        )
        .bind(user_id)
        .bind(provider.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_integration(&r)).transpose()
    }

    pub async fn list_for_user(&self, user_id: &str) -> SessionResult<Vec<CalendarIntegration>> {
        let rows = sqlx::query(
            "SELECT * FROM calendar_integrations WHERE user_id = ? ORDER BY provider ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_integration).collect()
    }

    pub async fn delete_integration(
        &self,
        user_id: &str,
        provider: CalendarProvider,
    ) -> SessionResult<bool> {
        let result = sqlx::query(
            "DELETE FROM calendar_integrations WHERE user_id = ? AND provider = ?",
        )
        .bind(user_id)
        .bind(provider.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // === Event links ===

    pub async fn insert_event_link(&self, link: &CalendarEventLink) -> SessionResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO calendar_event_links (
                appointment_id, user_id, provider, external_event_id, calendar_id, created_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&link.appointment_id)
        .bind(&link.user_id)
        .bind(link.provider.to_string())
        .bind(&link.external_event_id)
        .bind(&link.calendar_id)
        .bind(link.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn links_for_appointment(
        &self,
        appointment_id: &str,
    ) -> SessionResult<Vec<CalendarEventLink>> {
        let rows = sqlx::query(
            "SELECT * FROM calendar_event_links WHERE appointment_id = ? ORDER BY user_id, provider",
        )
        .bind(appointment_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_link).collect()
    }

    pub async fn delete_event_link(
        &self,
        appointment_id: &str,
        user_id: &str,
        provider: CalendarProvider,
    ) -> SessionResult<()> {
        sqlx::query(
            "DELETE FROM calendar_event_links WHERE appointment_id = ? AND user_id = ? AND provider = ?",
        )
        .bind(appointment_id)
        .bind(user_id)
        .bind(provider.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn decode_err(error: sqlx::Error) -> SessionError {
    SessionError::fatal(format!("row decode failed: {}", error), Some("decode".to_string()))
}

fn row_to_integration(row: &SqliteRow) -> SessionResult<CalendarIntegration> {
    let provider: String = row.try_get("provider").map_err(decode_err)?;
    Ok(CalendarIntegration {
        id: row.try_get("id").map_err(decode_err)?,
        user_id: row.try_get("user_id").map_err(decode_err)?,
        provider: CalendarProvider::from_str(&provider)?,
        access_token_enc: row.try_get("access_token_enc").map_err(decode_err)?,
        refresh_token_enc: row.try_get("refresh_token_enc").map_err(decode_err)?,
        expires_at: row.try_get("expires_at").map_err(decode_err)?,
        calendar_id: row.try_get("calendar_id").map_err(decode_err)?,
        email: row.try_get("email").map_err(decode_err)?,
        created_at: row.try_get("created_at").map_err(decode_err)?,
        updated_at: row.try_get("updated_at").map_err(decode_err)?,
    })
}

fn row_to_link(row: &SqliteRow) -> SessionResult<CalendarEventLink> {
    let provider: String = row.try_get("provider").map_err(decode_err)?;
    Ok(CalendarEventLink {
        appointment_id: row.try_get("appointment_id").map_err(decode_err)?,
        user_id: row.try_get("user_id").map_err(decode_err)?,
        provider: CalendarProvider::from_str(&provider)?,
        external_event_id: row.try_get("external_event_id").map_err(decode_err)?,
        calendar_id: row.try_get("calendar_id").map_err(decode_err)?,
        created_at: row.try_get("created_at").map_err(decode_err)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::database::test_support::scratch_db;

    async fn store() -> (CalendarIntegrationStore, tempfile::TempDir) {
        let (db, dir) = scratch_db().await;
        let store = CalendarIntegrationStore::new(db.pool().clone()).await.unwrap();
        (store, dir)
    }

    fn integration(user_id: &str, provider: CalendarProvider) -> CalendarIntegration {
        CalendarIntegration {
            id: format!("ci-{}-{}", user_id, provider),
            user_id: user_id.to_string(),
            provider,
            access_token_enc: "envelope-a".to_string(),
            refresh_token_enc: Some("envelope-r".to_string()),
            expires_at: None,
            calendar_id: None,
            email: Some(format!("{}@example.com", user_id)),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_provider_row() {
        let (store, _dir) = store().await;
        store
            .upsert_integration(&integration("u-R", CalendarProvider::Google))
            .await
            .unwrap();

        let mut replacement = integration("u-R", CalendarProvider::Google);
        replacement.access_token_enc = "envelope-b".to_string();
        store.upsert_integration(&replacement).await.unwrap();

        let loaded = store
            .get_integration("u-R", CalendarProvider::Google)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.access_token_enc, "envelope-b");
        assert_eq!(store.list_for_user("u-R").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_removes_row() {
        let (store, _dir) = store().await;
        store
            .upsert_integration(&integration("u-R", CalendarProvider::Apple))
            .await
            .unwrap();
        assert!(store
            .delete_integration("u-R", CalendarProvider::Apple)
            .await
            .unwrap());
        assert!(!store
            .delete_integration("u-R", CalendarProvider::Apple)
            .await
            .unwrap());
        assert!(store
            .get_integration("u-R", CalendarProvider::Apple)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_event_links_round_trip() {
        let (store, _dir) = store().await;
        let link = CalendarEventLink {
            appointment_id: "a-1".to_string(),
            user_id: "u-R".to_string(),
            provider: CalendarProvider::Google,
            external_event_id: "evt-123".to_string(),
            calendar_id: None,
            created_at: Utc::now(),
        };
        store.insert_event_link(&link).await.unwrap();
        // Redelivery overwrites rather than duplicating.
        store.insert_event_link(&link).await.unwrap();

        let links = store.links_for_appointment("a-1").await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].external_event_id, "evt-123");

        store
            .delete_event_link("a-1", "u-R", CalendarProvider::Google)
            .await
            .unwrap();
        assert!(store.links_for_appointment("a-1").await.unwrap().is_empty());
    }
}
