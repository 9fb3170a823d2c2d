//! Read/write contracts the core needs from persistence. Transaction
//! semantics are deliberately out of scope — both locks in this system are
//! optimistic check-then-set with a staleness override.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use atrium_common::{
    ActivityLogEntry, AnalysisState, DeliveryProfile, Discovery, MeasurementPoint, Notification,
};

/// The singleton analysis scheduling state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_state(&self) -> Result<AnalysisState>;
    async fn put_state(&self, state: &AnalysisState) -> Result<()>;
    /// Clear only the lock field. Used on release paths so a crashing cycle
    /// never has to round-trip the full state to let go of the lock.
    async fn clear_lock(&self) -> Result<()>;
}

#[async_trait]
pub trait DiscoveryStore: Send + Sync {
    async fn insert(&self, discovery: &Discovery) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Discovery>>;
    /// Most recent discoveries created at or after `since`, newest first,
    /// capped at `limit`. This is the dedup recency snapshot.
    async fn recent(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Discovery>>;
    async fn mark_notified(&self, id: Uuid) -> Result<()>;
}

/// Result of an idempotent notification write.
#[derive(Debug, Clone)]
pub enum NotificationUpsert {
    Created(Notification),
    /// A row for this (discovery_id, persona_name) already existed — the
    /// expected shape of an at-least-once task retry.
    Existing(Notification),
}

impl NotificationUpsert {
    pub fn into_inner(self) -> Notification {
        match self {
            NotificationUpsert::Created(n) | NotificationUpsert::Existing(n) => n,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, NotificationUpsert::Created(_))
    }
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert keyed by (discovery_id, persona_name); a repeat write returns
    /// the existing row untouched.
    async fn upsert(&self, notification: &Notification) -> Result<NotificationUpsert>;
    async fn get(&self, id: Uuid) -> Result<Option<Notification>>;
    async fn count_for_discovery(&self, discovery_id: Uuid) -> Result<u64>;
}

/// Append-only audit trail.
#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn append(&self, entry: &ActivityLogEntry) -> Result<()>;
}

/// Per-sensor ingestion checkpoints in a shared fast KV cache. Entries
/// expire via TTL; an expired sensor silently returns to no-checkpoint.
#[async_trait]
pub trait CheckpointCache: Send + Sync {
    async fn get(&self, sensor_id: &str) -> Result<Option<DateTime<Utc>>>;
    async fn set(&self, sensor_id: &str, timestamp: DateTime<Utc>, ttl: Duration) -> Result<()>;
}

/// Validated time-series points. Ingestion writes; the analysis cycle
/// reads a recency window.
#[async_trait]
pub trait PointStore: Send + Sync {
    async fn write_points(&self, points: &[MeasurementPoint]) -> Result<()>;
    /// Points with a data timestamp at or after `since`, oldest first.
    async fn recent_points(&self, since: DateTime<Utc>) -> Result<Vec<MeasurementPoint>>;
}

/// Persona delivery preferences, consulted at the send-email stage.
#[async_trait]
pub trait PersonaDirectory: Send + Sync {
    async fn delivery_profile(&self, persona_name: &str) -> Result<Option<DeliveryProfile>>;
}
