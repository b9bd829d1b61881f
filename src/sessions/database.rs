/*!
 * Session Database Operations
 *
 * SQLite persistence for the five core aggregates (Connection,
 * SessionSeries, SessionAppointment, ReminderSettings, ScheduledReminder)
 * plus the transactional outbox. Write operations take an open transaction
 * so a whole command commits or aborts as one unit; reads filter soft
 * deletes explicitly. Audit timestamps are set here, not by callers.
 */

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::reminders::types::{
    ReminderChannel, ReminderSettings, ReminderSnapshot, ReminderStatus, ScheduledReminder,
};
use crate::sessions::error::{SessionError, SessionResult};
use crate::sessions::events::DomainEvent;
use crate::sessions::scheduling::BusyInterval;
use crate::sessions::types::{
    AppointmentStatus, Connection, ConnectionType, SessionAppointment, SessionSeries,
};

/// Backoff schedule for transient persistence failures
const RETRY_DELAYS_MS: [u64; 3] = [50, 200, 1000];

/// One undispatched or dispatched outbox row
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: i64,
    pub aggregate_id: String,
    pub event_name: String,
    pub event: DomainEvent,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Database connection and repository operations
pub struct SessionDatabase {
    pool: SqlitePool,
}

impl SessionDatabase {
    /// Connect and initialize the schema
    pub async fn new(database_url: &str) -> SessionResult<Self> {
        let pool = SqlitePool::connect(database_url).await.map_err(|e| {
            SessionError::transient(
                format!("failed to connect to database: {}", e),
                "connect",
            )
        })?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a command transaction
    pub async fn begin(&self) -> SessionResult<Transaction<'_, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Execution-strategy retry: re-run `operation` on transient failures
    /// with 50 ms / 200 ms / 1 s backoff, surfacing everything else as-is
    pub async fn with_retry<F, Fut, T>(&self, operation_name: &str, operation: F) -> SessionResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = SessionResult<T>>,
    {
        let mut last_error = None;

        for (attempt, delay_ms) in std::iter::once(&0u64).chain(RETRY_DELAYS_MS.iter()).enumerate()
        {
            if *delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
            }
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!("{} succeeded after {} retries", operation_name, attempt);
                    }
                    return Ok(result);
                }
                Err(error) if error.is_retryable() => {
                    warn!("{} attempt {} failed: {}", operation_name, attempt + 1, error);
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            SessionError::transient("retry budget exhausted", operation_name)
        }))
    }

    /// Initialize database schema with all required tables and indexes
    async fn init_schema(&self) -> SessionResult<()> {
        info!("Initializing session database schema");

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS connections (
                id TEXT PRIMARY KEY,
                match_request_id TEXT NOT NULL UNIQUE,
                requester_id TEXT NOT NULL,
                target_user_id TEXT NOT NULL,
                connection_type TEXT NOT NULL CHECK (connection_type IN ('SkillExchange', 'Payment', 'Free')),
                skill_id TEXT NOT NULL,
                exchange_skill_id TEXT,
                payment_rate_per_hour REAL,
                currency TEXT,
                total_sessions_planned INTEGER NOT NULL,
                total_sessions_completed INTEGER NOT NULL DEFAULT 0,
                balance_minutes INTEGER NOT NULL DEFAULT 0,
                closed_at DATETIME,
                is_deleted BOOLEAN NOT NULL DEFAULT 0,
                deleted_at DATETIME,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_series (
                id TEXT PRIMARY KEY,
                connection_id TEXT NOT NULL,
                teacher_user_id TEXT NOT NULL,
                learner_user_id TEXT NOT NULL,
                skill_id TEXT NOT NULL,
                total_sessions INTEGER NOT NULL,
                completed_sessions INTEGER NOT NULL DEFAULT 0,
                default_duration_minutes INTEGER NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                is_deleted BOOLEAN NOT NULL DEFAULT 0,
                deleted_at DATETIME,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,

                FOREIGN KEY (connection_id) REFERENCES connections (id)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_appointments (
                id TEXT PRIMARY KEY,
                session_series_id TEXT NOT NULL,
                session_number INTEGER NOT NULL,
                title TEXT NOT NULL,
                scheduled_date DATETIME NOT NULL,
                duration_minutes INTEGER NOT NULL,
                organizer_user_id TEXT NOT NULL,
                participant_user_id TEXT NOT NULL,
                meeting_link TEXT,
                status TEXT NOT NULL CHECK (status IN ('Scheduled', 'Confirmed', 'InProgress', 'Completed', 'Cancelled', 'NoShow', 'RescheduleRequested')),
                cancelled_by TEXT,
                cancel_reason TEXT,
                reschedule_requested_by TEXT,
                proposed_date DATETIME,
                proposed_duration INTEGER,
                reschedule_reason TEXT,
                reschedule_prior_status TEXT,
                no_show_user_ids TEXT NOT NULL DEFAULT '[]',
                no_show_reported_by TEXT,
                is_auto_created BOOLEAN NOT NULL DEFAULT 0,
                is_late_cancellation BOOLEAN NOT NULL DEFAULT 0,
                is_deleted BOOLEAN NOT NULL DEFAULT 0,
                deleted_at DATETIME,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,

                FOREIGN KEY (session_series_id) REFERENCES session_series (id),
                UNIQUE(session_series_id, session_number)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reminder_settings (
                user_id TEXT PRIMARY KEY,
                minutes_before TEXT NOT NULL,
                email_enabled BOOLEAN NOT NULL DEFAULT 1,
                push_enabled BOOLEAN NOT NULL DEFAULT 1,
                sms_enabled BOOLEAN NOT NULL DEFAULT 0,
                updated_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_reminders (
                id TEXT PRIMARY KEY,
                appointment_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                reminder_type TEXT NOT NULL CHECK (reminder_type IN ('Email', 'Push', 'SMS')),
                minutes_before INTEGER NOT NULL,
                scheduled_for DATETIME NOT NULL,
                status TEXT NOT NULL DEFAULT 'Pending' CHECK (status IN ('Pending', 'Dispatching', 'Sent', 'Failed', 'Cancelled')),
                snapshot TEXT NOT NULL,
                claimed_by TEXT,
                sent_at DATETIME,
                error_message TEXT,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,

                FOREIGN KEY (appointment_id) REFERENCES session_appointments (id)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                aggregate_id TEXT NOT NULL,
                event_name TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                dispatched_at DATETIME,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        self.create_indexes(&mut tx).await?;
        tx.commit().await?;

        info!("Session database schema initialized");
        Ok(())
    }

    async fn create_indexes(&self, tx: &mut Transaction<'_, Sqlite>) -> SessionResult<()> {
        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_connections_match_request ON connections (match_request_id)",
            "CREATE INDEX IF NOT EXISTS idx_connections_requester ON connections (requester_id)",
            "CREATE INDEX IF NOT EXISTS idx_connections_target ON connections (target_user_id)",
            "CREATE INDEX IF NOT EXISTS idx_series_connection ON session_series (connection_id)",
            "CREATE INDEX IF NOT EXISTS idx_appointments_series ON session_appointments (session_series_id)",
            "CREATE INDEX IF NOT EXISTS idx_appointments_date ON session_appointments (scheduled_date)",
            "CREATE INDEX IF NOT EXISTS idx_appointments_status ON session_appointments (status)",
            "CREATE INDEX IF NOT EXISTS idx_appointments_organizer ON session_appointments (organizer_user_id)",
            "CREATE INDEX IF NOT EXISTS idx_appointments_participant ON session_appointments (participant_user_id)",
            "CREATE INDEX IF NOT EXISTS idx_reminders_appointment ON scheduled_reminders (appointment_id)",
            "CREATE INDEX IF NOT EXISTS idx_reminders_due ON scheduled_reminders (status, scheduled_for)",
            "CREATE INDEX IF NOT EXISTS idx_outbox_undispatched ON outbox_events (dispatched_at, aggregate_id, id)",
        ];

        for index_sql in &indexes {
            sqlx::query(index_sql).execute(&mut **tx).await?;
        }
        Ok(())
    }

    // === Connection operations ===

    pub async fn insert_connection(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        connection: &Connection,
    ) -> SessionResult<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO connections (
                id, match_request_id, requester_id, target_user_id, connection_type,
                skill_id, exchange_skill_id, payment_rate_per_hour, currency,
                total_sessions_planned, total_sessions_completed, balance_minutes,
                closed_at, is_deleted, deleted_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?, ?)
            "#,
        )
        .bind(&connection.id)
        .bind(&connection.match_request_id)
        .bind(&connection.requester_id)
        .bind(&connection.target_user_id)
        .bind(connection.connection_type.to_string())
        .bind(&connection.skill_id)
        .bind(&connection.exchange_skill_id)
        .bind(connection.payment_rate_per_hour)
        .bind(&connection.currency)
        .bind(connection.total_sessions_planned)
        .bind(connection.total_sessions_completed)
        .bind(connection.balance_minutes)
        .bind(connection.closed_at)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn update_connection(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        connection: &Connection,
    ) -> SessionResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE connections SET
                total_sessions_completed = ?, balance_minutes = ?, closed_at = ?,
                updated_at = ?
            WHERE id = ? AND is_deleted = 0
            "#,
        )
        .bind(connection.total_sessions_completed)
        .bind(connection.balance_minutes)
        .bind(connection.closed_at)
        .bind(Utc::now())
        .bind(&connection.id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SessionError::not_found("Connection", &connection.id));
        }
        Ok(())
    }

    pub async fn get_connection(&self, id: &str) -> SessionResult<Connection> {
        let row = sqlx::query("SELECT * FROM connections WHERE id = ? AND is_deleted = 0")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_connection(&r))
            .transpose()?
            .ok_or_else(|| SessionError::not_found("Connection", id))
    }

    pub async fn get_connection_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        id: &str,
    ) -> SessionResult<Connection> {
        let row = sqlx::query("SELECT * FROM connections WHERE id = ? AND is_deleted = 0")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(|r| row_to_connection(&r))
            .transpose()?
            .ok_or_else(|| SessionError::not_found("Connection", id))
    }

    pub async fn find_connection_by_match(
        &self,
        match_request_id: &str,
    ) -> SessionResult<Option<Connection>> {
        let row =
            sqlx::query("SELECT * FROM connections WHERE match_request_id = ? AND is_deleted = 0")
                .bind(match_request_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|r| row_to_connection(&r)).transpose()
    }

    pub async fn list_connections_for_user(&self, user_id: &str) -> SessionResult<Vec<Connection>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM connections
            WHERE (requester_id = ? OR target_user_id = ?) AND is_deleted = 0
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_connection).collect()
    }

    // === Series operations ===

    pub async fn insert_series(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        series: &SessionSeries,
    ) -> SessionResult<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO session_series (
                id, connection_id, teacher_user_id, learner_user_id, skill_id,
                total_sessions, completed_sessions, default_duration_minutes,
                title, description, is_deleted, deleted_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?, ?)
            "#,
        )
        .bind(&series.id)
        .bind(&series.connection_id)
        .bind(&series.teacher_user_id)
        .bind(&series.learner_user_id)
        .bind(&series.skill_id)
        .bind(series.total_sessions)
        .bind(series.completed_sessions)
        .bind(series.default_duration_minutes)
        .bind(&series.title)
        .bind(&series.description)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn update_series(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        series: &SessionSeries,
    ) -> SessionResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE session_series SET completed_sessions = ?, updated_at = ?
            WHERE id = ? AND is_deleted = 0
            "#,
        )
        .bind(series.completed_sessions)
        .bind(Utc::now())
        .bind(&series.id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SessionError::not_found("SessionSeries", &series.id));
        }
        Ok(())
    }

    pub async fn get_series(&self, id: &str) -> SessionResult<SessionSeries> {
        let row = sqlx::query("SELECT * FROM session_series WHERE id = ? AND is_deleted = 0")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_series(&r))
            .transpose()?
            .ok_or_else(|| SessionError::not_found("SessionSeries", id))
    }

    pub async fn get_series_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        id: &str,
    ) -> SessionResult<SessionSeries> {
        let row = sqlx::query("SELECT * FROM session_series WHERE id = ? AND is_deleted = 0")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(|r| row_to_series(&r))
            .transpose()?
            .ok_or_else(|| SessionError::not_found("SessionSeries", id))
    }

    pub async fn list_series_for_connection(
        &self,
        connection_id: &str,
    ) -> SessionResult<Vec<SessionSeries>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM session_series
            WHERE connection_id = ? AND is_deleted = 0
            ORDER BY rowid ASC
            "#,
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_series).collect()
    }

    // === Appointment operations ===

    pub async fn insert_appointment(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        appointment: &SessionAppointment,
    ) -> SessionResult<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO session_appointments (
                id, session_series_id, session_number, title, scheduled_date,
                duration_minutes, organizer_user_id, participant_user_id,
                meeting_link, status, cancelled_by, cancel_reason,
                reschedule_requested_by, proposed_date, proposed_duration,
                reschedule_reason, reschedule_prior_status, no_show_user_ids,
                no_show_reported_by, is_auto_created, is_late_cancellation,
                is_deleted, deleted_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?, ?)
            "#,
        )
        .bind(&appointment.id)
        .bind(&appointment.session_series_id)
        .bind(appointment.session_number)
        .bind(&appointment.title)
        .bind(appointment.scheduled_date)
        .bind(appointment.duration_minutes)
        .bind(&appointment.organizer_user_id)
        .bind(&appointment.participant_user_id)
        .bind(&appointment.meeting_link)
        .bind(appointment.status.to_string())
        .bind(&appointment.cancelled_by)
        .bind(&appointment.cancel_reason)
        .bind(&appointment.reschedule_requested_by)
        .bind(appointment.proposed_date)
        .bind(appointment.proposed_duration)
        .bind(&appointment.reschedule_reason)
        .bind(appointment.reschedule_prior_status.map(|s| s.to_string()))
        .bind(serde_json::to_string(&appointment.no_show_user_ids)?)
        .bind(&appointment.no_show_reported_by)
        .bind(appointment.is_auto_created)
        .bind(appointment.is_late_cancellation)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Full-row update guarded by the expected current status; the guard is
    /// what makes concurrent lifecycle commands lose cleanly instead of
    /// double-applying
    pub async fn update_appointment_guarded(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        appointment: &SessionAppointment,
        expected_status: AppointmentStatus,
    ) -> SessionResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE session_appointments SET
                title = ?, scheduled_date = ?, duration_minutes = ?, meeting_link = ?,
                status = ?, cancelled_by = ?, cancel_reason = ?,
                reschedule_requested_by = ?, proposed_date = ?, proposed_duration = ?,
                reschedule_reason = ?, reschedule_prior_status = ?, no_show_user_ids = ?,
                no_show_reported_by = ?, is_late_cancellation = ?, updated_at = ?
            WHERE id = ? AND status = ? AND is_deleted = 0
            "#,
        )
        .bind(&appointment.title)
        .bind(appointment.scheduled_date)
        .bind(appointment.duration_minutes)
        .bind(&appointment.meeting_link)
        .bind(appointment.status.to_string())
        .bind(&appointment.cancelled_by)
        .bind(&appointment.cancel_reason)
        .bind(&appointment.reschedule_requested_by)
        .bind(appointment.proposed_date)
        .bind(appointment.proposed_duration)
        .bind(&appointment.reschedule_reason)
        .bind(appointment.reschedule_prior_status.map(|s| s.to_string()))
        .bind(serde_json::to_string(&appointment.no_show_user_ids)?)
        .bind(&appointment.no_show_reported_by)
        .bind(appointment.is_late_cancellation)
        .bind(Utc::now())
        .bind(&appointment.id)
        .bind(expected_status.to_string())
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SessionError::illegal_transition(
                "appointment changed concurrently",
                &appointment.id,
                expected_status.to_string(),
            ));
        }
        Ok(())
    }

    pub async fn set_meeting_link(
        &self,
        appointment_id: &str,
        meeting_link: &str,
    ) -> SessionResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE session_appointments SET meeting_link = ?, updated_at = ?
            WHERE id = ? AND is_deleted = 0
              AND status NOT IN ('Completed', 'Cancelled', 'NoShow')
            "#,
        )
        .bind(meeting_link)
        .bind(Utc::now())
        .bind(appointment_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_appointment(&self, id: &str) -> SessionResult<SessionAppointment> {
        let row =
            sqlx::query("SELECT * FROM session_appointments WHERE id = ? AND is_deleted = 0")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|r| row_to_appointment(&r))
            .transpose()?
            .ok_or_else(|| SessionError::not_found("SessionAppointment", id))
    }

    pub async fn get_appointment_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        id: &str,
    ) -> SessionResult<SessionAppointment> {
        let row =
            sqlx::query("SELECT * FROM session_appointments WHERE id = ? AND is_deleted = 0")
                .bind(id)
                .fetch_optional(&mut **tx)
                .await?;
        row.map(|r| row_to_appointment(&r))
            .transpose()?
            .ok_or_else(|| SessionError::not_found("SessionAppointment", id))
    }

    pub async fn list_appointments_for_series(
        &self,
        series_id: &str,
    ) -> SessionResult<Vec<SessionAppointment>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM session_appointments
            WHERE session_series_id = ? AND is_deleted = 0
            ORDER BY session_number ASC
            "#,
        )
        .bind(series_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_appointment).collect()
    }

    pub async fn list_upcoming_for_user(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> SessionResult<Vec<SessionAppointment>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM session_appointments
            WHERE (organizer_user_id = ? OR participant_user_id = ?)
              AND scheduled_date >= ? AND scheduled_date < ?
              AND status NOT IN ('Completed', 'Cancelled', 'NoShow')
              AND is_deleted = 0
            ORDER BY scheduled_date ASC
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_appointment).collect()
    }

    pub async fn next_session_number(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        series_id: &str,
    ) -> SessionResult<u32> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(session_number), 0) AS max_number FROM session_appointments WHERE session_series_id = ?",
        )
        .bind(series_id)
        .fetch_one(&mut **tx)
        .await?;
        let max: i64 = row.try_get("max_number").map_err(sqlx_decode)?;
        Ok(max as u32 + 1)
    }

    /// Active appointments of a user as busy intervals for the scheduler
    pub async fn busy_intervals_for_user(&self, user_id: &str) -> SessionResult<Vec<BusyInterval>> {
        let rows = sqlx::query(
            r#"
            SELECT scheduled_date, duration_minutes FROM session_appointments
            WHERE (organizer_user_id = ? OR participant_user_id = ?)
              AND status NOT IN ('Completed', 'Cancelled', 'NoShow')
              AND is_deleted = 0
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let start: DateTime<Utc> = row.try_get("scheduled_date").map_err(sqlx_decode)?;
                let minutes: i64 = row.try_get("duration_minutes").map_err(sqlx_decode)?;
                Ok(BusyInterval::new(
                    start,
                    start + chrono::Duration::minutes(minutes),
                ))
            })
            .collect()
    }

    // === Reminder settings ===

    pub async fn upsert_reminder_settings(&self, settings: &ReminderSettings) -> SessionResult<()> {
        sqlx::query(
            r#"
            INSERT INTO reminder_settings (user_id, minutes_before, email_enabled, push_enabled, sms_enabled, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                minutes_before = excluded.minutes_before,
                email_enabled = excluded.email_enabled,
                push_enabled = excluded.push_enabled,
                sms_enabled = excluded.sms_enabled,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&settings.user_id)
        .bind(serde_json::to_string(&settings.minutes_before)?)
        .bind(settings.email_enabled)
        .bind(settings.push_enabled)
        .bind(settings.sms_enabled)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_reminder_settings(
        &self,
        user_id: &str,
    ) -> SessionResult<Option<ReminderSettings>> {
        let row = sqlx::query("SELECT * FROM reminder_settings WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_settings(&r)).transpose()
    }

    // === Scheduled reminders ===

    pub async fn insert_reminder(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        reminder: &ScheduledReminder,
    ) -> SessionResult<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO scheduled_reminders (
                id, appointment_id, user_id, reminder_type, minutes_before,
                scheduled_for, status, snapshot, claimed_by, sent_at,
                error_message, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL, ?, ?)
            "#,
        )
        .bind(&reminder.id)
        .bind(&reminder.appointment_id)
        .bind(&reminder.user_id)
        .bind(reminder.reminder_type.to_string())
        .bind(reminder.minutes_before)
        .bind(reminder.scheduled_for)
        .bind(reminder.status.to_string())
        .bind(serde_json::to_string(&reminder.snapshot)?)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Move every pending reminder of an appointment to Cancelled
    pub async fn cancel_pending_reminders(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        appointment_id: &str,
    ) -> SessionResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_reminders SET status = 'Cancelled', updated_at = ?
            WHERE appointment_id = ? AND status = 'Pending'
            "#,
        )
        .bind(Utc::now())
        .bind(appointment_id)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }

    /// Count reminders due at `now`; drives the backlog fast path
    pub async fn count_due_reminders(&self, now: DateTime<Utc>) -> SessionResult<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS due FROM scheduled_reminders WHERE status = 'Pending' AND scheduled_for <= ?",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        let due: i64 = row.try_get("due").map_err(sqlx_decode)?;
        Ok(due as u64)
    }

    /// Claim up to `limit` due reminders for `worker_id`. The per-row
    /// conditional Pending → Dispatching update is the idempotence gate:
    /// a row already claimed by a concurrent processor is skipped.
    pub async fn claim_due_reminders(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        limit: u32,
    ) -> SessionResult<Vec<ScheduledReminder>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM scheduled_reminders
            WHERE status = 'Pending' AND scheduled_for <= ?
            ORDER BY scheduled_for ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::new();
        for row in rows {
            let id: String = row.try_get("id").map_err(sqlx_decode)?;
            let result = sqlx::query(
                r#"
                UPDATE scheduled_reminders
                SET status = 'Dispatching', claimed_by = ?, updated_at = ?
                WHERE id = ? AND status = 'Pending'
                "#,
            )
            .bind(worker_id)
            .bind(Utc::now())
            .bind(&id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                let row = sqlx::query("SELECT * FROM scheduled_reminders WHERE id = ?")
                    .bind(&id)
                    .fetch_one(&self.pool)
                    .await?;
                claimed.push(row_to_reminder(&row)?);
            }
        }
        Ok(claimed)
    }

    pub async fn mark_reminder_sent(
        &self,
        reminder_id: &str,
        sent_at: DateTime<Utc>,
    ) -> SessionResult<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_reminders SET status = 'Sent', sent_at = ?, updated_at = ?
            WHERE id = ? AND status = 'Dispatching'
            "#,
        )
        .bind(sent_at)
        .bind(Utc::now())
        .bind(reminder_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_reminder_failed(
        &self,
        reminder_id: &str,
        error_message: &str,
    ) -> SessionResult<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_reminders SET status = 'Failed', error_message = ?, updated_at = ?
            WHERE id = ? AND status = 'Dispatching'
            "#,
        )
        .bind(error_message)
        .bind(Utc::now())
        .bind(reminder_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_reminder_cancelled(&self, reminder_id: &str) -> SessionResult<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_reminders SET status = 'Cancelled', updated_at = ?
            WHERE id = ? AND status IN ('Pending', 'Dispatching')
            "#,
        )
        .bind(Utc::now())
        .bind(reminder_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_reminders_for_appointment(
        &self,
        appointment_id: &str,
    ) -> SessionResult<Vec<ScheduledReminder>> {
        let rows = sqlx::query(
            "SELECT * FROM scheduled_reminders WHERE appointment_id = ? ORDER BY scheduled_for ASC",
        )
        .bind(appointment_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_reminder).collect()
    }

    // === Outbox ===

    /// Persist an event inside the command transaction
    pub async fn insert_event(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        event: &DomainEvent,
    ) -> SessionResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (aggregate_id, event_name, payload, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(event.aggregate_id())
        .bind(event.name())
        .bind(serde_json::to_string(event)?)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Undispatched rows in (aggregate_id, id) order so per-aggregate FIFO
    /// survives partial failures
    pub async fn fetch_undispatched_events(&self, limit: u32) -> SessionResult<Vec<OutboxRow>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM outbox_events
            WHERE dispatched_at IS NULL
            ORDER BY aggregate_id ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_outbox).collect()
    }

    pub async fn mark_event_dispatched(&self, event_id: i64) -> SessionResult<()> {
        sqlx::query("UPDATE outbox_events SET dispatched_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_event_failure(&self, event_id: i64, error: &str) -> SessionResult<()> {
        sqlx::query(
            "UPDATE outbox_events SET attempts = attempts + 1, last_error = ? WHERE id = ?",
        )
        .bind(error)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn sqlx_decode(error: sqlx::Error) -> SessionError {
    SessionError::fatal(format!("row decode failed: {}", error), Some("decode".to_string()))
}

fn row_to_connection(row: &SqliteRow) -> SessionResult<Connection> {
    let connection_type: String = row.try_get("connection_type").map_err(sqlx_decode)?;
    Ok(Connection {
        id: row.try_get("id").map_err(sqlx_decode)?,
        match_request_id: row.try_get("match_request_id").map_err(sqlx_decode)?,
        requester_id: row.try_get("requester_id").map_err(sqlx_decode)?,
        target_user_id: row.try_get("target_user_id").map_err(sqlx_decode)?,
        connection_type: ConnectionType::from_str(&connection_type)?,
        skill_id: row.try_get("skill_id").map_err(sqlx_decode)?,
        exchange_skill_id: row.try_get("exchange_skill_id").map_err(sqlx_decode)?,
        payment_rate_per_hour: row.try_get("payment_rate_per_hour").map_err(sqlx_decode)?,
        currency: row.try_get("currency").map_err(sqlx_decode)?,
        total_sessions_planned: row
            .try_get::<i64, _>("total_sessions_planned")
            .map_err(sqlx_decode)? as u32,
        total_sessions_completed: row
            .try_get::<i64, _>("total_sessions_completed")
            .map_err(sqlx_decode)? as u32,
        balance_minutes: row.try_get("balance_minutes").map_err(sqlx_decode)?,
        created_at: row.try_get("created_at").map_err(sqlx_decode)?,
        updated_at: row.try_get("updated_at").map_err(sqlx_decode)?,
        closed_at: row.try_get("closed_at").map_err(sqlx_decode)?,
        is_deleted: row.try_get("is_deleted").map_err(sqlx_decode)?,
        deleted_at: row.try_get("deleted_at").map_err(sqlx_decode)?,
    })
}

fn row_to_series(row: &SqliteRow) -> SessionResult<SessionSeries> {
    Ok(SessionSeries {
        id: row.try_get("id").map_err(sqlx_decode)?,
        connection_id: row.try_get("connection_id").map_err(sqlx_decode)?,
        teacher_user_id: row.try_get("teacher_user_id").map_err(sqlx_decode)?,
        learner_user_id: row.try_get("learner_user_id").map_err(sqlx_decode)?,
        skill_id: row.try_get("skill_id").map_err(sqlx_decode)?,
        total_sessions: row.try_get::<i64, _>("total_sessions").map_err(sqlx_decode)? as u32,
        completed_sessions: row
            .try_get::<i64, _>("completed_sessions")
            .map_err(sqlx_decode)? as u32,
        default_duration_minutes: row
            .try_get::<i64, _>("default_duration_minutes")
            .map_err(sqlx_decode)? as u32,
        title: row.try_get("title").map_err(sqlx_decode)?,
        description: row.try_get("description").map_err(sqlx_decode)?,
        created_at: row.try_get("created_at").map_err(sqlx_decode)?,
        updated_at: row.try_get("updated_at").map_err(sqlx_decode)?,
        is_deleted: row.try_get("is_deleted").map_err(sqlx_decode)?,
        deleted_at: row.try_get("deleted_at").map_err(sqlx_decode)?,
    })
}

fn row_to_appointment(row: &SqliteRow) -> SessionResult<SessionAppointment> {
    let status: String = row.try_get("status").map_err(sqlx_decode)?;
    let prior: Option<String> = row.try_get("reschedule_prior_status").map_err(sqlx_decode)?;
    let no_show_json: String = row.try_get("no_show_user_ids").map_err(sqlx_decode)?;
    Ok(SessionAppointment {
        id: row.try_get("id").map_err(sqlx_decode)?,
        session_series_id: row.try_get("session_series_id").map_err(sqlx_decode)?,
        session_number: row.try_get::<i64, _>("session_number").map_err(sqlx_decode)? as u32,
        title: row.try_get("title").map_err(sqlx_decode)?,
        scheduled_date: row.try_get("scheduled_date").map_err(sqlx_decode)?,
        duration_minutes: row.try_get::<i64, _>("duration_minutes").map_err(sqlx_decode)? as u32,
        organizer_user_id: row.try_get("organizer_user_id").map_err(sqlx_decode)?,
        participant_user_id: row.try_get("participant_user_id").map_err(sqlx_decode)?,
        meeting_link: row.try_get("meeting_link").map_err(sqlx_decode)?,
        status: AppointmentStatus::from_str(&status)?,
        cancelled_by: row.try_get("cancelled_by").map_err(sqlx_decode)?,
        cancel_reason: row.try_get("cancel_reason").map_err(sqlx_decode)?,
        reschedule_requested_by: row.try_get("reschedule_requested_by").map_err(sqlx_decode)?,
        proposed_date: row.try_get("proposed_date").map_err(sqlx_decode)?,
        proposed_duration: row
            .try_get::<Option<i64>, _>("proposed_duration")
            .map_err(sqlx_decode)?
            .map(|d| d as u32),
        reschedule_reason: row.try_get("reschedule_reason").map_err(sqlx_decode)?,
        reschedule_prior_status: prior.map(|p| AppointmentStatus::from_str(&p)).transpose()?,
        no_show_user_ids: serde_json::from_str(&no_show_json)?,
        no_show_reported_by: row.try_get("no_show_reported_by").map_err(sqlx_decode)?,
        is_auto_created: row.try_get("is_auto_created").map_err(sqlx_decode)?,
        is_late_cancellation: row.try_get("is_late_cancellation").map_err(sqlx_decode)?,
        created_at: row.try_get("created_at").map_err(sqlx_decode)?,
        updated_at: row.try_get("updated_at").map_err(sqlx_decode)?,
        is_deleted: row.try_get("is_deleted").map_err(sqlx_decode)?,
        deleted_at: row.try_get("deleted_at").map_err(sqlx_decode)?,
    })
}

fn row_to_settings(row: &SqliteRow) -> SessionResult<ReminderSettings> {
    let minutes_json: String = row.try_get("minutes_before").map_err(sqlx_decode)?;
    Ok(ReminderSettings {
        user_id: row.try_get("user_id").map_err(sqlx_decode)?,
        minutes_before: serde_json::from_str(&minutes_json)?,
        email_enabled: row.try_get("email_enabled").map_err(sqlx_decode)?,
        push_enabled: row.try_get("push_enabled").map_err(sqlx_decode)?,
        sms_enabled: row.try_get("sms_enabled").map_err(sqlx_decode)?,
        updated_at: row.try_get("updated_at").map_err(sqlx_decode)?,
    })
}

fn row_to_reminder(row: &SqliteRow) -> SessionResult<ScheduledReminder> {
    let reminder_type: String = row.try_get("reminder_type").map_err(sqlx_decode)?;
    let status: String = row.try_get("status").map_err(sqlx_decode)?;
    let snapshot_json: String = row.try_get("snapshot").map_err(sqlx_decode)?;
    Ok(ScheduledReminder {
        id: row.try_get("id").map_err(sqlx_decode)?,
        appointment_id: row.try_get("appointment_id").map_err(sqlx_decode)?,
        user_id: row.try_get("user_id").map_err(sqlx_decode)?,
        reminder_type: ReminderChannel::from_str(&reminder_type)?,
        minutes_before: row.try_get::<i64, _>("minutes_before").map_err(sqlx_decode)? as u32,
        scheduled_for: row.try_get("scheduled_for").map_err(sqlx_decode)?,
        status: ReminderStatus::from_str(&status)?,
        snapshot: serde_json::from_str::<ReminderSnapshot>(&snapshot_json)?,
        claimed_by: row.try_get("claimed_by").map_err(sqlx_decode)?,
        sent_at: row.try_get("sent_at").map_err(sqlx_decode)?,
        error_message: row.try_get("error_message").map_err(sqlx_decode)?,
        created_at: row.try_get("created_at").map_err(sqlx_decode)?,
        updated_at: row.try_get("updated_at").map_err(sqlx_decode)?,
    })
}

fn row_to_outbox(row: &SqliteRow) -> SessionResult<OutboxRow> {
    let payload: String = row.try_get("payload").map_err(sqlx_decode)?;
    Ok(OutboxRow {
        id: row.try_get("id").map_err(sqlx_decode)?,
        aggregate_id: row.try_get("aggregate_id").map_err(sqlx_decode)?,
        event_name: row.try_get("event_name").map_err(sqlx_decode)?,
        event: serde_json::from_str(&payload)?,
        created_at: row.try_get("created_at").map_err(sqlx_decode)?,
        dispatched_at: row.try_get("dispatched_at").map_err(sqlx_decode)?,
        attempts: row.try_get::<i64, _>("attempts").map_err(sqlx_decode)? as u32,
        last_error: row.try_get("last_error").map_err(sqlx_decode)?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::TimeZone;

    /// File-backed scratch database; in-memory SQLite gives every pooled
    /// connection its own schema, so tests use a temp file instead
    pub async fn scratch_db() -> (SessionDatabase, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}/sessions.db?mode=rwc", dir.path().display());
        let db = SessionDatabase::new(&url).await.expect("schema init");
        (db, dir)
    }

    pub fn connection_fixture(id: &str, match_id: &str) -> Connection {
        Connection {
            id: id.to_string(),
            match_request_id: match_id.to_string(),
            requester_id: "u-R".to_string(),
            target_user_id: "u-T".to_string(),
            connection_type: ConnectionType::SkillExchange,
            skill_id: "s-A".to_string(),
            exchange_skill_id: Some("s-B".to_string()),
            payment_rate_per_hour: None,
            currency: None,
            total_sessions_planned: 5,
            total_sessions_completed: 0,
            balance_minutes: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            closed_at: None,
            is_deleted: false,
            deleted_at: None,
        }
    }

    pub fn series_fixture(id: &str, connection_id: &str) -> SessionSeries {
        SessionSeries {
            id: id.to_string(),
            connection_id: connection_id.to_string(),
            teacher_user_id: "u-R".to_string(),
            learner_user_id: "u-T".to_string(),
            skill_id: "s-A".to_string(),
            total_sessions: 3,
            completed_sessions: 0,
            default_duration_minutes: 60,
            title: "Guitar".to_string(),
            description: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            is_deleted: false,
            deleted_at: None,
        }
    }

    pub fn appointment_fixture(id: &str, series_id: &str, number: u32) -> SessionAppointment {
        SessionAppointment {
            id: id.to_string(),
            session_series_id: series_id.to_string(),
            session_number: number,
            title: "Session".to_string(),
            scheduled_date: Utc.with_ymd_and_hms(2025, 6, 2, 18, 0, 0).unwrap(),
            duration_minutes: 60,
            organizer_user_id: "u-R".to_string(),
            participant_user_id: "u-T".to_string(),
            meeting_link: None,
            status: AppointmentStatus::Scheduled,
            cancelled_by: None,
            cancel_reason: None,
            reschedule_requested_by: None,
            proposed_date: None,
            proposed_duration: None,
            reschedule_reason: None,
            reschedule_prior_status: None,
            no_show_user_ids: Vec::new(),
            no_show_reported_by: None,
            is_auto_created: true,
            is_late_cancellation: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            is_deleted: false,
            deleted_at: None,
        }
    }

    /// Insert a full connection -> series -> appointment chain and return
    /// the appointment
    pub async fn seed_appointment_chain(
        db: &SessionDatabase,
        appointment: SessionAppointment,
    ) -> SessionAppointment {
        let connection = connection_fixture("c-1", "m-1");
        let series = series_fixture(&appointment.session_series_id, &connection.id);
        let mut tx = db.begin().await.expect("begin");
        db.insert_connection(&mut tx, &connection).await.expect("connection");
        db.insert_series(&mut tx, &series).await.expect("series");
        db.insert_appointment(&mut tx, &appointment).await.expect("appointment");
        tx.commit().await.expect("commit");
        appointment
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{
        appointment_fixture, connection_fixture, scratch_db, series_fixture,
    };
    use super::*;

    #[tokio::test]
    async fn test_connection_round_trip() {
        let (db, _dir) = scratch_db().await;
        let connection = connection_fixture("c-1", "m-1");

        let mut tx = db.begin().await.unwrap();
        db.insert_connection(&mut tx, &connection).await.unwrap();
        tx.commit().await.unwrap();

        let loaded = db.get_connection("c-1").await.unwrap();
        assert_eq!(loaded.match_request_id, "m-1");
        assert_eq!(loaded.connection_type, ConnectionType::SkillExchange);
        assert_eq!(loaded.exchange_skill_id.as_deref(), Some("s-B"));

        let by_match = db.find_connection_by_match("m-1").await.unwrap();
        assert!(by_match.is_some());
        assert!(db.find_connection_by_match("m-2").await.unwrap().is_none());

        for user in ["u-R", "u-T"] {
            let listed = db.list_connections_for_user(user).await.unwrap();
            assert_eq!(listed.len(), 1);
            assert_eq!(listed[0].id, "c-1");
        }
        assert!(db.list_connections_for_user("u-X").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_match_request_rejected() {
        let (db, _dir) = scratch_db().await;
        let mut tx = db.begin().await.unwrap();
        db.insert_connection(&mut tx, &connection_fixture("c-1", "m-1"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = db.begin().await.unwrap();
        let error = db
            .insert_connection(&mut tx, &connection_fixture("c-2", "m-1"))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), "Conflict");
    }

    #[tokio::test]
    async fn test_guarded_appointment_update() {
        let (db, _dir) = scratch_db().await;
        let mut tx = db.begin().await.unwrap();
        db.insert_connection(&mut tx, &connection_fixture("c-1", "m-1"))
            .await
            .unwrap();
        db.insert_series(&mut tx, &series_fixture("ss-1", "c-1")).await.unwrap();
        db.insert_appointment(&mut tx, &appointment_fixture("a-1", "ss-1", 1))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut appointment = db.get_appointment("a-1").await.unwrap();
        appointment.status = AppointmentStatus::Completed;

        let mut tx = db.begin().await.unwrap();
        db.update_appointment_guarded(&mut tx, &appointment, AppointmentStatus::Scheduled)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        // The same guard now fails: the stored status moved on.
        let mut tx = db.begin().await.unwrap();
        let error = db
            .update_appointment_guarded(&mut tx, &appointment, AppointmentStatus::Scheduled)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), "IllegalTransition");
    }

    #[tokio::test]
    async fn test_session_numbers_are_unique_per_series() {
        let (db, _dir) = scratch_db().await;
        let mut tx = db.begin().await.unwrap();
        db.insert_connection(&mut tx, &connection_fixture("c-1", "m-1"))
            .await
            .unwrap();
        db.insert_series(&mut tx, &series_fixture("ss-1", "c-1")).await.unwrap();
        db.insert_appointment(&mut tx, &appointment_fixture("a-1", "ss-1", 1))
            .await
            .unwrap();
        assert_eq!(db.next_session_number(&mut tx, "ss-1").await.unwrap(), 2);
        let error = db
            .insert_appointment(&mut tx, &appointment_fixture("a-2", "ss-1", 1))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), "Conflict");
    }

    #[tokio::test]
    async fn test_reminder_claim_is_single_winner() {
        let (db, _dir) = scratch_db().await;
        let now = Utc::now();

        let mut tx = db.begin().await.unwrap();
        db.insert_connection(&mut tx, &connection_fixture("c-1", "m-1"))
            .await
            .unwrap();
        db.insert_series(&mut tx, &series_fixture("ss-1", "c-1")).await.unwrap();
        db.insert_appointment(&mut tx, &appointment_fixture("a-1", "ss-1", 1))
            .await
            .unwrap();
        for n in 0..4 {
            let reminder = ScheduledReminder {
                id: format!("r-{}", n),
                appointment_id: "a-1".to_string(),
                user_id: "u-R".to_string(),
                reminder_type: ReminderChannel::Email,
                minutes_before: 15,
                scheduled_for: now - chrono::Duration::minutes(n),
                status: ReminderStatus::Pending,
                snapshot: ReminderSnapshot {
                    partner_name: "T".to_string(),
                    skill_name: "Guitar".to_string(),
                    appointment_time: now,
                    meeting_link: None,
                },
                claimed_by: None,
                sent_at: None,
                error_message: None,
                created_at: now,
                updated_at: now,
            };
            db.insert_reminder(&mut tx, &reminder).await.unwrap();
        }
        tx.commit().await.unwrap();

        assert_eq!(db.count_due_reminders(now).await.unwrap(), 4);

        let first = db.claim_due_reminders(now, "worker-1", 10).await.unwrap();
        assert_eq!(first.len(), 4);
        // A second worker arriving immediately after finds nothing to claim.
        let second = db.claim_due_reminders(now, "worker-2", 10).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_outbox_fifo_per_aggregate() {
        let (db, _dir) = scratch_db().await;
        let mut tx = db.begin().await.unwrap();
        for n in 0..3 {
            db.insert_event(
                &mut tx,
                &DomainEvent::MeetingLinkGenerationFailed {
                    appointment_id: "a-1".to_string(),
                    error: format!("attempt {}", n),
                },
            )
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();

        let rows = db.fetch_undispatched_events(10).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].id < w[1].id));

        db.mark_event_dispatched(rows[0].id).await.unwrap();
        let remaining = db.fetch_undispatched_events(10).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].id, rows[1].id);
    }

    #[tokio::test]
    async fn test_events_from_aborted_transactions_vanish() {
        let (db, _dir) = scratch_db().await;
        let mut tx = db.begin().await.unwrap();
        db.insert_event(
            &mut tx,
            &DomainEvent::MeetingLinkGenerationFailed {
                appointment_id: "a-9".to_string(),
                error: "boom".to_string(),
            },
        )
        .await
        .unwrap();
        tx.rollback().await.unwrap();

        assert!(db.fetch_undispatched_events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_soft_deleted_rows_are_invisible() {
        let (db, _dir) = scratch_db().await;
        let mut tx = db.begin().await.unwrap();
        db.insert_connection(&mut tx, &connection_fixture("c-1", "m-1"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        sqlx::query("UPDATE connections SET is_deleted = 1, deleted_at = ? WHERE id = 'c-1'")
            .bind(Utc::now())
            .execute(db.pool())
            .await
            .unwrap();

        assert_eq!(db.get_connection("c-1").await.unwrap_err().kind(), "NotFound");
    }
}
