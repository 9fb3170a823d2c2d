//! Postgres store. Plain `sqlx` queries, `ON CONFLICT` for the idempotent
//! writes, and a small idempotent migration that creates the schema.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use atrium_common::{
    ActivityLogEntry, AnalysisState, AtriumError, DeliveryProfile, Discovery, LogLevel,
    MeasurementPoint, Notification,
};

use crate::traits::{
    ActivityLog, CheckpointCache, DiscoveryStore, NotificationStore, NotificationUpsert,
    PersonaDirectory, PointStore, StateStore,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| AtriumError::Database(format!("connecting to Postgres: {e}")))?;
        Ok(Self { pool })
    }

    /// Create the schema if it doesn't exist yet.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS analysis_state (
                singleton BOOLEAN PRIMARY KEY DEFAULT TRUE,
                enabled BOOLEAN NOT NULL,
                interval_spec TEXT NOT NULL,
                last_run_at TIMESTAMPTZ,
                next_run_at TIMESTAMPTZ,
                lock_acquired_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS discoveries (
                id UUID PRIMARY KEY,
                title TEXT NOT NULL,
                category TEXT NOT NULL,
                severity TEXT NOT NULL,
                confidence DOUBLE PRECISION NOT NULL,
                reasoning TEXT NOT NULL,
                evidence JSONB NOT NULL,
                recipients JSONB NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id UUID PRIMARY KEY,
                discovery_id UUID NOT NULL,
                persona_name TEXT NOT NULL,
                format TEXT NOT NULL,
                content TEXT NOT NULL,
                sent_at TIMESTAMPTZ NOT NULL,
                viewed_at TIMESTAMPTZ,
                UNIQUE (discovery_id, persona_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS activity_log (
                seq BIGSERIAL PRIMARY KEY,
                execution_id TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                ts TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ingestion_checkpoints (
                sensor_id TEXT PRIMARY KEY,
                last_processed TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS measurement_points (
                seq BIGSERIAL PRIMARY KEY,
                sensor_id TEXT NOT NULL,
                field TEXT NOT NULL,
                value DOUBLE PRECISION NOT NULL,
                data_ts TIMESTAMPTZ NOT NULL,
                received_ts TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS personas (
                persona_name TEXT PRIMARY KEY,
                email TEXT,
                notifications_enabled BOOLEAN NOT NULL DEFAULT TRUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database schema ensured");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row conversion helpers
// ---------------------------------------------------------------------------

fn enum_from_text<T: serde::de::DeserializeOwned>(raw: String) -> Result<T, sqlx::Error> {
    serde_json::from_value(serde_json::Value::String(raw))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn enum_to_text<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

fn discovery_from_row(row: &PgRow) -> Result<Discovery, sqlx::Error> {
    Ok(Discovery {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        category: enum_from_text(row.try_get::<String, _>("category")?)?,
        severity: enum_from_text(row.try_get::<String, _>("severity")?)?,
        confidence: row.try_get("confidence")?,
        reasoning: row.try_get("reasoning")?,
        evidence: row.try_get("evidence")?,
        recipients: serde_json::from_value(row.try_get("recipients")?)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        status: enum_from_text(row.try_get::<String, _>("status")?)?,
        created_at: row.try_get("created_at")?,
    })
}

fn notification_from_row(row: &PgRow) -> Result<Notification, sqlx::Error> {
    Ok(Notification {
        id: row.try_get("id")?,
        discovery_id: row.try_get("discovery_id")?,
        persona_name: row.try_get("persona_name")?,
        format: row.try_get("format")?,
        content: row.try_get("content")?,
        sent_at: row.try_get("sent_at")?,
        viewed_at: row.try_get("viewed_at")?,
    })
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

#[async_trait]
impl StateStore for PgStore {
    async fn get_state(&self) -> Result<AnalysisState> {
        let row = sqlx::query(
            "SELECT enabled, interval_spec, last_run_at, next_run_at, lock_acquired_at
             FROM analysis_state WHERE singleton",
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(AnalysisState {
                enabled: row.try_get("enabled")?,
                interval_spec: row.try_get("interval_spec")?,
                last_run_at: row.try_get("last_run_at")?,
                next_run_at: row.try_get("next_run_at")?,
                lock_acquired_at: row.try_get("lock_acquired_at")?,
            }),
            None => Ok(AnalysisState::default()),
        }
    }

    async fn put_state(&self, state: &AnalysisState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO analysis_state (singleton, enabled, interval_spec, last_run_at, next_run_at, lock_acquired_at)
            VALUES (TRUE, $1, $2, $3, $4, $5)
            ON CONFLICT (singleton) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                interval_spec = EXCLUDED.interval_spec,
                last_run_at = EXCLUDED.last_run_at,
                next_run_at = EXCLUDED.next_run_at,
                lock_acquired_at = EXCLUDED.lock_acquired_at
            "#,
        )
        .bind(state.enabled)
        .bind(&state.interval_spec)
        .bind(state.last_run_at)
        .bind(state.next_run_at)
        .bind(state.lock_acquired_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_lock(&self) -> Result<()> {
        sqlx::query("UPDATE analysis_state SET lock_acquired_at = NULL WHERE singleton")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DiscoveryStore
// ---------------------------------------------------------------------------

#[async_trait]
impl DiscoveryStore for PgStore {
    async fn insert(&self, discovery: &Discovery) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO discoveries
                (id, title, category, severity, confidence, reasoning, evidence, recipients, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(discovery.id)
        .bind(&discovery.title)
        .bind(enum_to_text(&discovery.category))
        .bind(enum_to_text(&discovery.severity))
        .bind(discovery.confidence)
        .bind(&discovery.reasoning)
        .bind(&discovery.evidence)
        .bind(serde_json::to_value(&discovery.recipients)?)
        .bind(enum_to_text(&discovery.status))
        .bind(discovery.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Discovery>> {
        let row = sqlx::query("SELECT * FROM discoveries WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(discovery_from_row).transpose().map_err(Into::into)
    }

    async fn recent(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Discovery>> {
        let rows = sqlx::query(
            "SELECT * FROM discoveries WHERE created_at >= $1
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| discovery_from_row(r).map_err(Into::into))
            .collect()
    }

    async fn mark_notified(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE discoveries SET status = 'notified' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NotificationStore
// ---------------------------------------------------------------------------

#[async_trait]
impl NotificationStore for PgStore {
    async fn upsert(&self, notification: &Notification) -> Result<NotificationUpsert> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO notifications (id, discovery_id, persona_name, format, content, sent_at, viewed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (discovery_id, persona_name) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(notification.id)
        .bind(notification.discovery_id)
        .bind(&notification.persona_name)
        .bind(&notification.format)
        .bind(&notification.content)
        .bind(notification.sent_at)
        .bind(notification.viewed_at)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            return Ok(NotificationUpsert::Created(notification.clone()));
        }

        // Conflict path: hand back the row that got there first.
        let row = sqlx::query(
            "SELECT * FROM notifications WHERE discovery_id = $1 AND persona_name = $2",
        )
        .bind(notification.discovery_id)
        .bind(&notification.persona_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(NotificationUpsert::Existing(notification_from_row(&row)?))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>> {
        let row = sqlx::query("SELECT * FROM notifications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(notification_from_row)
            .transpose()
            .map_err(Into::into)
    }

    async fn count_for_discovery(&self, discovery_id: Uuid) -> Result<u64> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM notifications WHERE discovery_id = $1",
        )
        .bind(discovery_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 as u64)
    }
}

// ---------------------------------------------------------------------------
// ActivityLog
// ---------------------------------------------------------------------------

#[async_trait]
impl ActivityLog for PgStore {
    async fn append(&self, entry: &ActivityLogEntry) -> Result<()> {
        let level = match entry.level {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        sqlx::query(
            "INSERT INTO activity_log (execution_id, level, message, ts) VALUES ($1, $2, $3, $4)",
        )
        .bind(&entry.execution_id)
        .bind(level)
        .bind(&entry.message)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CheckpointCache
// ---------------------------------------------------------------------------

#[async_trait]
impl CheckpointCache for PgStore {
    async fn get(&self, sensor_id: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query_as::<_, (DateTime<Utc>,)>(
            "SELECT last_processed FROM ingestion_checkpoints
             WHERE sensor_id = $1 AND expires_at > NOW()",
        )
        .bind(sensor_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    async fn set(&self, sensor_id: &str, timestamp: DateTime<Utc>, ttl: Duration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_checkpoints (sensor_id, last_processed, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (sensor_id) DO UPDATE SET
                last_processed = EXCLUDED.last_processed,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(sensor_id)
        .bind(timestamp)
        .bind(Utc::now() + ttl)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PointStore
// ---------------------------------------------------------------------------

#[async_trait]
impl PointStore for PgStore {
    async fn write_points(&self, points: &[MeasurementPoint]) -> Result<()> {
        for point in points {
            sqlx::query(
                "INSERT INTO measurement_points (sensor_id, field, value, data_ts, received_ts)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(&point.sensor_id)
            .bind(&point.field)
            .bind(point.value)
            .bind(point.data_ts)
            .bind(point.received_ts)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn recent_points(&self, since: DateTime<Utc>) -> Result<Vec<MeasurementPoint>> {
        let rows = sqlx::query(
            "SELECT sensor_id, field, value, data_ts, received_ts FROM measurement_points
             WHERE data_ts >= $1 ORDER BY data_ts ASC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(MeasurementPoint {
                    sensor_id: row.try_get("sensor_id")?,
                    field: row.try_get("field")?,
                    value: row.try_get("value")?,
                    data_ts: row.try_get("data_ts")?,
                    received_ts: row.try_get("received_ts")?,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// PersonaDirectory
// ---------------------------------------------------------------------------

#[async_trait]
impl PersonaDirectory for PgStore {
    async fn delivery_profile(&self, persona_name: &str) -> Result<Option<DeliveryProfile>> {
        let row = sqlx::query_as::<_, (String, Option<String>, bool)>(
            "SELECT persona_name, email, notifications_enabled FROM personas
             WHERE persona_name = $1",
        )
        .bind(persona_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(persona_name, email, notifications_enabled)| DeliveryProfile {
            persona_name,
            email,
            notifications_enabled,
        }))
    }
}
