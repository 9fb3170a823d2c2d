//! Batch admission: parse, staleness gate, duplicate gate, extract,
//! persist, checkpoint. The order matters — a stale batch must never touch
//! a checkpoint, and a duplicate must leave it exactly as it was.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use atrium_common::MeasurementPoint;
use atrium_store::{CheckpointCache, PointStore};

use crate::fields::extract_fields;
use crate::timestamp::parse_timestamp;

/// One pub/sub message: a shared data timestamp and per-sensor field maps.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorBatch {
    pub timestamp: String,
    #[serde(default)]
    pub status: BTreeMap<String, BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Neither ISO-8601 nor the vendor format matched. Permanent.
    UnparseableTimestamp,
    /// Data older than the staleness window. Broker redelivery backlog or
    /// a wedged device clock. Permanent.
    Stale { age: Duration },
    /// Data from the future beyond clock-skew tolerance. Permanent.
    FutureSkewed { age: Duration },
    /// Every sensor's checkpoint already equals this timestamp — the
    /// retained-message redelivery shape.
    Duplicate,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::UnparseableTimestamp => write!(f, "unparseable timestamp"),
            RejectReason::Stale { age } => write!(f, "stale ({}s old)", age.num_seconds()),
            RejectReason::FutureSkewed { age } => {
                write!(f, "future-skewed ({}s ahead)", -age.num_seconds())
            }
            RejectReason::Duplicate => write!(f, "duplicate"),
        }
    }
}

#[derive(Debug)]
pub enum Admission {
    Accepted {
        points_written: usize,
        /// Fields the mapping table didn't recognize, as `sensor.field`.
        unmapped: Vec<String>,
    },
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy)]
pub struct ValidatorConfig {
    /// Data older than this is rejected as stale.
    pub max_age: Duration,
    /// Tolerated forward clock skew.
    pub max_future_skew: Duration,
    /// Checkpoint lifetime; an expired sensor returns to no-checkpoint.
    pub checkpoint_ttl: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::minutes(10),
            max_future_skew: Duration::minutes(2),
            checkpoint_ttl: Duration::minutes(30),
        }
    }
}

pub struct BatchValidator {
    checkpoints: Arc<dyn CheckpointCache>,
    points: Arc<dyn PointStore>,
    config: ValidatorConfig,
}

impl BatchValidator {
    pub fn new(
        checkpoints: Arc<dyn CheckpointCache>,
        points: Arc<dyn PointStore>,
        config: ValidatorConfig,
    ) -> Self {
        Self {
            checkpoints,
            points,
            config,
        }
    }

    /// Admit or reject one batch. `received_ts` is when this process got
    /// the message; it rides along with every persisted point, separate
    /// from the data timestamp.
    pub async fn admit(
        &self,
        batch: &SensorBatch,
        received_ts: DateTime<Utc>,
    ) -> Result<Admission> {
        let Some(data_ts) = parse_timestamp(&batch.timestamp) else {
            warn!(raw = batch.timestamp.as_str(), "Unparseable batch timestamp");
            return Ok(Admission::Rejected(RejectReason::UnparseableTimestamp));
        };

        let age = received_ts - data_ts;
        if age > self.config.max_age {
            warn!(
                age_secs = age.num_seconds(),
                "Rejecting stale batch"
            );
            return Ok(Admission::Rejected(RejectReason::Stale { age }));
        }
        if age < -self.config.max_future_skew {
            warn!(
                skew_secs = -age.num_seconds(),
                "Rejecting future-skewed batch"
            );
            return Ok(Admission::Rejected(RejectReason::FutureSkewed { age }));
        }

        // Per-sensor duplicate gate. Sensors already at this timestamp are
        // dropped without touching their checkpoint.
        let mut fresh_sensors = Vec::new();
        for sensor_id in batch.status.keys() {
            match self.checkpoints.get(sensor_id).await? {
                Some(checkpoint) if checkpoint == data_ts => {
                    debug!(sensor = sensor_id.as_str(), "Duplicate sensor reading");
                }
                _ => fresh_sensors.push(sensor_id.clone()),
            }
        }
        if fresh_sensors.is_empty() {
            return Ok(Admission::Rejected(RejectReason::Duplicate));
        }

        let mut points = Vec::new();
        let mut unmapped = Vec::new();
        for sensor_id in &fresh_sensors {
            let fields = &batch.status[sensor_id];
            let extraction = extract_fields(fields.iter());
            for (field, value) in extraction.values {
                points.push(MeasurementPoint {
                    sensor_id: sensor_id.clone(),
                    field,
                    value,
                    data_ts,
                    received_ts,
                });
            }
            for field in extraction.unmapped {
                unmapped.push(format!("{sensor_id}.{field}"));
            }
        }

        if !unmapped.is_empty() {
            warn!(?unmapped, "Fields with no numeric mapping in batch");
        }

        self.points.write_points(&points).await?;
        for sensor_id in &fresh_sensors {
            self.checkpoints
                .set(sensor_id, data_ts, self.config.checkpoint_ttl)
                .await?;
        }

        Ok(Admission::Accepted {
            points_written: points.len(),
            unmapped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_store::{MemoryCheckpointCache, MemoryStore};

    fn batch(timestamp: &str) -> SensorBatch {
        serde_json::from_value(serde_json::json!({
            "timestamp": timestamp,
            "status": {
                "fcu-01": {
                    "Return_Air_Temp": 22.4,
                    "Occupation_Status": "Occupied",
                    "H_O_A": "Hand"
                }
            }
        }))
        .unwrap()
    }

    fn validator(
        checkpoints: Arc<MemoryCheckpointCache>,
        store: Arc<MemoryStore>,
    ) -> BatchValidator {
        BatchValidator::new(checkpoints, store, ValidatorConfig::default())
    }

    #[tokio::test]
    async fn fresh_batch_is_accepted_with_unmapped_flagged() {
        let checkpoints = MemoryCheckpointCache::new();
        let store = MemoryStore::new();
        let v = validator(checkpoints, store.clone());

        let now = Utc::now();
        let admission = v.admit(&batch(&now.to_rfc3339()), now).await.unwrap();

        let Admission::Accepted {
            points_written,
            unmapped,
        } = admission
        else {
            panic!("expected acceptance, got {admission:?}");
        };
        assert_eq!(points_written, 2);
        assert_eq!(unmapped, vec!["fcu-01.H_O_A".to_string()]);

        let points = store.points().await;
        assert_eq!(points.len(), 2);
        assert!(points.iter().all(|p| p.received_ts == now));
    }

    #[tokio::test]
    async fn staleness_boundary_is_ten_minutes() {
        let checkpoints = MemoryCheckpointCache::new();
        let store = MemoryStore::new();
        let v = validator(checkpoints, store);
        let now = Utc::now();

        let just_stale = now - Duration::minutes(10) - Duration::seconds(1);
        let admission = v.admit(&batch(&just_stale.to_rfc3339()), now).await.unwrap();
        assert!(matches!(
            admission,
            Admission::Rejected(RejectReason::Stale { .. })
        ));

        let just_fresh = now - Duration::minutes(9) - Duration::seconds(59);
        let admission = v.admit(&batch(&just_fresh.to_rfc3339()), now).await.unwrap();
        assert!(matches!(admission, Admission::Accepted { .. }));
    }

    #[tokio::test]
    async fn future_skew_beyond_two_minutes_is_rejected() {
        let checkpoints = MemoryCheckpointCache::new();
        let store = MemoryStore::new();
        let v = validator(checkpoints, store);
        let now = Utc::now();

        let skewed = now + Duration::minutes(3);
        let admission = v.admit(&batch(&skewed.to_rfc3339()), now).await.unwrap();
        assert!(matches!(
            admission,
            Admission::Rejected(RejectReason::FutureSkewed { .. })
        ));

        // A minute ahead is inside clock-skew tolerance.
        let tolerable = now + Duration::minutes(1);
        let admission = v.admit(&batch(&tolerable.to_rfc3339()), now).await.unwrap();
        assert!(matches!(admission, Admission::Accepted { .. }));
    }

    #[tokio::test]
    async fn redelivered_batch_is_duplicate_and_checkpoint_unchanged() {
        let checkpoints = MemoryCheckpointCache::new();
        let store = MemoryStore::new();
        let v = validator(checkpoints.clone(), store.clone());
        let now = Utc::now();
        let ts = now - Duration::minutes(1);
        let b = batch(&ts.to_rfc3339());

        assert!(matches!(
            v.admit(&b, now).await.unwrap(),
            Admission::Accepted { .. }
        ));
        let checkpoint_after_first = checkpoints.get("fcu-01").await.unwrap();
        assert_eq!(checkpoint_after_first, Some(ts));

        assert!(matches!(
            v.admit(&b, now).await.unwrap(),
            Admission::Rejected(RejectReason::Duplicate)
        ));
        assert_eq!(checkpoints.get("fcu-01").await.unwrap(), checkpoint_after_first);
        // No second set of points either.
        assert_eq!(store.points().await.len(), 2);
    }

    #[tokio::test]
    async fn unparseable_timestamp_is_permanent_rejection() {
        let checkpoints = MemoryCheckpointCache::new();
        let store = MemoryStore::new();
        let v = validator(checkpoints, store);

        let admission = v
            .admit(&batch("yesterday-ish"), Utc::now())
            .await
            .unwrap();
        assert!(matches!(
            admission,
            Admission::Rejected(RejectReason::UnparseableTimestamp)
        ));
    }

    #[tokio::test]
    async fn vendor_timestamps_flow_through_admission() {
        let checkpoints = MemoryCheckpointCache::new();
        let store = MemoryStore::new();
        let v = validator(checkpoints, store.clone());

        // Received moments after the data was produced.
        let received = parse_timestamp("04-Sep-25 3:15 PM BST").unwrap() + Duration::seconds(30);
        let admission = v
            .admit(&batch("04-Sep-25 3:15 PM BST"), received)
            .await
            .unwrap();
        assert!(matches!(admission, Admission::Accepted { .. }));

        let points = store.points().await;
        assert!(points.iter().all(|p| p.data_ts != p.received_ts));
    }
}
