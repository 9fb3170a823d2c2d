//! Full analysis cycles against the in-memory stores, with a canned
//! generator and fan-out.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use atrium_common::{
    AnalysisState, CycleOutcome, Discovery, DiscoveryCategory, DiscoveryStatus, Recipient,
    Severity, SkipReason,
};
use atrium_engine::{
    AnalysisCycle, CycleLock, DedupConfig, DiscoveryGenerator, SimilarityDeduplicator,
};
use atrium_notify::{Fanout, FanoutStats};
use atrium_store::{DiscoveryStore, MemoryStore, StateStore};

struct CannedGenerator {
    findings: Vec<Discovery>,
    fail: bool,
}

impl CannedGenerator {
    fn returning(findings: Vec<Discovery>) -> Arc<Self> {
        Arc::new(Self {
            findings,
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            findings: vec![],
            fail: true,
        })
    }
}

#[async_trait]
impl DiscoveryGenerator for CannedGenerator {
    async fn generate(&self, _since: DateTime<Utc>) -> Result<Vec<Discovery>> {
        if self.fail {
            return Err(anyhow!("provider unavailable"));
        }
        Ok(self.findings.clone())
    }
}

#[derive(Default)]
struct RecordingFanout {
    dispatched: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl Fanout for RecordingFanout {
    async fn dispatch(&self, discovery_id: Uuid, _execution_id: &str) -> Result<FanoutStats> {
        self.dispatched.lock().await.push(discovery_id);
        Ok(FanoutStats {
            notifications_created: 1,
            emails_sent: 1,
            ..FanoutStats::default()
        })
    }
}

fn finding(title: &str, reasoning: &str) -> Discovery {
    Discovery {
        id: Uuid::new_v4(),
        title: title.to_string(),
        category: DiscoveryCategory::Anomaly,
        severity: Severity::Warning,
        confidence: 0.9,
        reasoning: reasoning.to_string(),
        evidence: serde_json::json!({}),
        recipients: vec![Recipient {
            persona_name: "facilities".into(),
            role: "facilities manager".into(),
        }],
        status: DiscoveryStatus::New,
        created_at: Utc::now(),
    }
}

fn cycle_with(
    store: Arc<MemoryStore>,
    generator: Arc<CannedGenerator>,
    fanout: Arc<RecordingFanout>,
) -> AnalysisCycle {
    AnalysisCycle::new(
        store.clone(),
        store.clone(),
        store.clone(),
        generator,
        fanout,
        CycleLock::new(store),
        SimilarityDeduplicator::new(DedupConfig::default()),
    )
}

#[tokio::test]
async fn disabled_state_skips_cleanly() {
    let store = MemoryStore::with_state(AnalysisState {
        enabled: false,
        ..AnalysisState::default()
    });
    let fanout = Arc::new(RecordingFanout::default());
    let cycle = cycle_with(store, CannedGenerator::returning(vec![]), fanout.clone());

    let outcome = cycle.run().await.unwrap();
    assert!(matches!(
        outcome,
        CycleOutcome::Skipped {
            reason: SkipReason::Disabled
        }
    ));
    assert!(fanout.dispatched.lock().await.is_empty());
}

#[tokio::test]
async fn not_yet_due_skips() {
    let store = MemoryStore::with_state(AnalysisState {
        next_run_at: Some(Utc::now() + Duration::minutes(30)),
        ..AnalysisState::default()
    });
    let cycle = cycle_with(
        store,
        CannedGenerator::returning(vec![]),
        Arc::new(RecordingFanout::default()),
    );

    let outcome = cycle.run().await.unwrap();
    assert!(matches!(
        outcome,
        CycleOutcome::Skipped {
            reason: SkipReason::NotYetTime
        }
    ));
}

#[tokio::test]
async fn held_lock_skips_as_already_running() {
    let store = MemoryStore::with_state(AnalysisState {
        lock_acquired_at: Some(Utc::now() - Duration::minutes(1)),
        ..AnalysisState::default()
    });
    let cycle = cycle_with(
        store,
        CannedGenerator::returning(vec![]),
        Arc::new(RecordingFanout::default()),
    );

    let outcome = cycle.run().await.unwrap();
    assert!(matches!(
        outcome,
        CycleOutcome::Skipped {
            reason: SkipReason::AlreadyRunning
        }
    ));
}

#[tokio::test]
async fn completed_cycle_persists_notifies_and_releases() {
    let store = MemoryStore::new();
    let fanout = Arc::new(RecordingFanout::default());
    let cycle = cycle_with(
        store.clone(),
        CannedGenerator::returning(vec![finding(
            "Pump 3 overheating",
            "bearing temp trending up",
        )]),
        fanout.clone(),
    );

    let outcome = cycle.run().await.unwrap();
    let CycleOutcome::Completed {
        success,
        discoveries_count,
        notifications_count,
        errors,
    } = outcome
    else {
        panic!("expected completed cycle");
    };
    assert!(success);
    assert_eq!(discoveries_count, 1);
    assert_eq!(notifications_count, 1);
    assert!(errors.is_empty());
    assert_eq!(fanout.dispatched.lock().await.len(), 1);

    let state = store.get_state().await.unwrap();
    assert_eq!(state.lock_acquired_at, None);
    assert!(state.last_run_at.is_some());
    assert!(state.next_run_at.is_some());

    // The discovery was persisted and marked notified.
    let recent = store
        .recent(Utc::now() - Duration::hours(1), 10)
        .await
        .unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].status, DiscoveryStatus::Notified);
}

#[tokio::test]
async fn near_duplicates_of_recent_discoveries_are_suppressed() {
    let store = MemoryStore::new();
    let prior = finding("Pump 3 overheating", "bearing temp trending up");
    store.insert(&prior).await.unwrap();

    let fanout = Arc::new(RecordingFanout::default());
    let cycle = cycle_with(
        store.clone(),
        CannedGenerator::returning(vec![finding(
            "Pump 3 is overheating",
            "completely different words here",
        )]),
        fanout.clone(),
    );

    let outcome = cycle.run().await.unwrap();
    let CycleOutcome::Completed {
        discoveries_count, ..
    } = outcome
    else {
        panic!("expected completed cycle");
    };
    assert_eq!(discoveries_count, 0);
    assert!(fanout.dispatched.lock().await.is_empty());
}

#[tokio::test]
async fn generator_failure_reports_failed_cycle_and_releases_lock() {
    let store = MemoryStore::new();
    let cycle = cycle_with(
        store.clone(),
        CannedGenerator::failing(),
        Arc::new(RecordingFanout::default()),
    );

    let outcome = cycle.run().await.unwrap();
    let CycleOutcome::Completed {
        success, errors, ..
    } = outcome
    else {
        panic!("expected completed cycle");
    };
    assert!(!success);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("provider unavailable"));

    // The lock must be free again even after a failure.
    assert_eq!(store.get_state().await.unwrap().lock_acquired_at, None);
}
