//! In-memory store implementations. These back the test suites and make
//! local wiring possible without Postgres; they honor the same contracts
//! as the Postgres store, TTL expiry included.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use atrium_common::{
    ActivityLogEntry, AnalysisState, DeliveryProfile, Discovery, MeasurementPoint, Notification,
};

use crate::traits::{
    ActivityLog, CheckpointCache, DiscoveryStore, NotificationStore, NotificationUpsert,
    PersonaDirectory, PointStore, StateStore,
};

/// Everything but the checkpoint cache and persona directory, in one struct.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<AnalysisState>,
    discoveries: Mutex<Vec<Discovery>>,
    notifications: Mutex<Vec<Notification>>,
    activity: Mutex<Vec<ActivityLogEntry>>,
    points: Mutex<Vec<MeasurementPoint>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_state(state: AnalysisState) -> Arc<Self> {
        let store = Self::default();
        *store.state.try_lock().expect("fresh store") = state;
        Arc::new(store)
    }

    /// Test inspection helpers.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().await.clone()
    }

    pub async fn activity_entries(&self) -> Vec<ActivityLogEntry> {
        self.activity.lock().await.clone()
    }

    pub async fn points(&self) -> Vec<MeasurementPoint> {
        self.points.lock().await.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_state(&self) -> Result<AnalysisState> {
        Ok(self.state.lock().await.clone())
    }

    async fn put_state(&self, state: &AnalysisState) -> Result<()> {
        *self.state.lock().await = state.clone();
        Ok(())
    }

    async fn clear_lock(&self) -> Result<()> {
        self.state.lock().await.lock_acquired_at = None;
        Ok(())
    }
}

#[async_trait]
impl DiscoveryStore for MemoryStore {
    async fn insert(&self, discovery: &Discovery) -> Result<()> {
        self.discoveries.lock().await.push(discovery.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Discovery>> {
        Ok(self
            .discoveries
            .lock()
            .await
            .iter()
            .find(|d| d.id == id)
            .cloned())
    }

    async fn recent(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Discovery>> {
        let mut recent: Vec<Discovery> = self
            .discoveries
            .lock()
            .await
            .iter()
            .filter(|d| d.created_at >= since)
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        recent.truncate(limit);
        Ok(recent)
    }

    async fn mark_notified(&self, id: Uuid) -> Result<()> {
        if let Some(d) = self.discoveries.lock().await.iter_mut().find(|d| d.id == id) {
            d.status = atrium_common::DiscoveryStatus::Notified;
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn upsert(&self, notification: &Notification) -> Result<NotificationUpsert> {
        let mut rows = self.notifications.lock().await;
        if let Some(existing) = rows.iter().find(|n| {
            n.discovery_id == notification.discovery_id
                && n.persona_name == notification.persona_name
        }) {
            return Ok(NotificationUpsert::Existing(existing.clone()));
        }
        rows.push(notification.clone());
        Ok(NotificationUpsert::Created(notification.clone()))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>> {
        Ok(self
            .notifications
            .lock()
            .await
            .iter()
            .find(|n| n.id == id)
            .cloned())
    }

    async fn count_for_discovery(&self, discovery_id: Uuid) -> Result<u64> {
        Ok(self
            .notifications
            .lock()
            .await
            .iter()
            .filter(|n| n.discovery_id == discovery_id)
            .count() as u64)
    }
}

#[async_trait]
impl ActivityLog for MemoryStore {
    async fn append(&self, entry: &ActivityLogEntry) -> Result<()> {
        self.activity.lock().await.push(entry.clone());
        Ok(())
    }
}

#[async_trait]
impl PointStore for MemoryStore {
    async fn write_points(&self, points: &[MeasurementPoint]) -> Result<()> {
        self.points.lock().await.extend_from_slice(points);
        Ok(())
    }

    async fn recent_points(&self, since: DateTime<Utc>) -> Result<Vec<MeasurementPoint>> {
        let mut recent: Vec<MeasurementPoint> = self
            .points
            .lock()
            .await
            .iter()
            .filter(|p| p.data_ts >= since)
            .cloned()
            .collect();
        recent.sort_by(|a, b| a.data_ts.cmp(&b.data_ts));
        Ok(recent)
    }
}

// ---------------------------------------------------------------------------
// Checkpoint cache
// ---------------------------------------------------------------------------

/// In-memory TTL checkpoint cache. Entries past their expiry read as
/// absent — the sensor is back to no-checkpoint, exactly like a cache
/// eviction in the shared KV store would look.
#[derive(Default)]
pub struct MemoryCheckpointCache {
    entries: Mutex<HashMap<String, (DateTime<Utc>, DateTime<Utc>)>>,
}

impl MemoryCheckpointCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl CheckpointCache for MemoryCheckpointCache {
    async fn get(&self, sensor_id: &str) -> Result<Option<DateTime<Utc>>> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        match entries.get(sensor_id) {
            Some((_, expires_at)) if *expires_at <= now => {
                entries.remove(sensor_id);
                Ok(None)
            }
            Some((ts, _)) => Ok(Some(*ts)),
            None => Ok(None),
        }
    }

    async fn set(&self, sensor_id: &str, timestamp: DateTime<Utc>, ttl: Duration) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(sensor_id.to_string(), (timestamp, Utc::now() + ttl));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Persona directory
// ---------------------------------------------------------------------------

/// Fixed persona → delivery profile table.
pub struct StaticPersonaDirectory {
    profiles: HashMap<String, DeliveryProfile>,
}

impl StaticPersonaDirectory {
    pub fn new(profiles: impl IntoIterator<Item = DeliveryProfile>) -> Arc<Self> {
        Arc::new(Self {
            profiles: profiles
                .into_iter()
                .map(|p| (p.persona_name.clone(), p))
                .collect(),
        })
    }
}

#[async_trait]
impl PersonaDirectory for StaticPersonaDirectory {
    async fn delivery_profile(&self, persona_name: &str) -> Result<Option<DeliveryProfile>> {
        Ok(self.profiles.get(persona_name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_common::{DiscoveryCategory, DiscoveryStatus, Severity};

    fn discovery(title: &str, created_at: DateTime<Utc>) -> Discovery {
        Discovery {
            id: Uuid::new_v4(),
            title: title.to_string(),
            category: DiscoveryCategory::Comfort,
            severity: Severity::Info,
            confidence: 0.9,
            reasoning: String::new(),
            evidence: serde_json::json!({}),
            recipients: vec![],
            status: DiscoveryStatus::New,
            created_at,
        }
    }

    #[tokio::test]
    async fn recent_is_newest_first_and_capped() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for i in 0..5 {
            store
                .insert(&discovery(&format!("d{i}"), now - Duration::minutes(i)))
                .await
                .unwrap();
        }
        let recent = store.recent(now - Duration::hours(1), 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].title, "d0");
    }

    #[tokio::test]
    async fn notification_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let n = Notification {
            id: Uuid::new_v4(),
            discovery_id: Uuid::new_v4(),
            persona_name: "facilities".into(),
            format: "email".into(),
            content: "hello".into(),
            sent_at: Utc::now(),
            viewed_at: None,
        };
        assert!(store.upsert(&n).await.unwrap().is_created());

        let retry = Notification {
            id: Uuid::new_v4(),
            ..n.clone()
        };
        let outcome = store.upsert(&retry).await.unwrap();
        assert!(!outcome.is_created());
        // The original row wins.
        assert_eq!(outcome.into_inner().id, n.id);
        assert_eq!(store.notifications().await.len(), 1);
    }

    #[tokio::test]
    async fn checkpoint_ttl_expires() {
        let cache = MemoryCheckpointCache::new();
        let ts = Utc::now();
        cache.set("fcu-01", ts, Duration::seconds(-1)).await.unwrap();
        assert_eq!(cache.get("fcu-01").await.unwrap(), None);

        cache.set("fcu-01", ts, Duration::minutes(30)).await.unwrap();
        assert_eq!(cache.get("fcu-01").await.unwrap(), Some(ts));
    }
}
