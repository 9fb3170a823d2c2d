//! One scheduled analysis cycle, end to end.
//!
//! `run()` owns the skip checks and the lock; `run_inner()` does the work.
//! Whatever happens inside, the lock is released and the schedule advanced
//! before `run()` returns.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use atrium_common::{ActivityLogEntry, AnalysisState, CycleOutcome, SkipReason};
use atrium_notify::Fanout;
use atrium_store::{ActivityLog, DiscoveryStore, StateStore};

use crate::dedup::SimilarityDeduplicator;
use crate::generate::DiscoveryGenerator;
use crate::lock::{CycleLock, LockAttempt};

#[derive(Debug, Default)]
pub struct CycleStats {
    pub discoveries_count: u32,
    pub suppressed: u32,
    pub notifications_count: u32,
    pub emails_sent: u32,
    pub errors: Vec<String>,
}

impl std::fmt::Display for CycleStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} discovery(ies) ({} suppressed), {} notification(s), {} email(s), {} error(s)",
            self.discoveries_count,
            self.suppressed,
            self.notifications_count,
            self.emails_sent,
            self.errors.len()
        )
    }
}

pub struct AnalysisCycle {
    state: Arc<dyn StateStore>,
    discoveries: Arc<dyn DiscoveryStore>,
    activity: Arc<dyn ActivityLog>,
    generator: Arc<dyn DiscoveryGenerator>,
    fanout: Arc<dyn Fanout>,
    lock: CycleLock,
    dedup: SimilarityDeduplicator,
}

impl AnalysisCycle {
    pub fn new(
        state: Arc<dyn StateStore>,
        discoveries: Arc<dyn DiscoveryStore>,
        activity: Arc<dyn ActivityLog>,
        generator: Arc<dyn DiscoveryGenerator>,
        fanout: Arc<dyn Fanout>,
        lock: CycleLock,
        dedup: SimilarityDeduplicator,
    ) -> Self {
        Self {
            state,
            discoveries,
            activity,
            generator,
            fanout,
            lock,
            dedup,
        }
    }

    /// Respond to one scheduler trigger.
    pub async fn run(&self) -> Result<CycleOutcome> {
        let state = self.state.get_state().await?;

        if !state.enabled {
            info!("Analysis disabled, skipping");
            return Ok(CycleOutcome::Skipped {
                reason: SkipReason::Disabled,
            });
        }

        let now = Utc::now();
        if let Some(next_run_at) = state.next_run_at {
            if now < next_run_at {
                info!(%next_run_at, "Not yet due, skipping");
                return Ok(CycleOutcome::Skipped {
                    reason: SkipReason::NotYetTime,
                });
            }
        }

        match self.lock.try_acquire().await? {
            LockAttempt::Granted => {}
            LockAttempt::Denied { age } => {
                info!(
                    age_secs = age.num_seconds(),
                    "Another cycle is running, skipping"
                );
                return Ok(CycleOutcome::Skipped {
                    reason: SkipReason::AlreadyRunning,
                });
            }
        }

        let execution_id = format!("cycle-{}", Uuid::new_v4());
        let result = self.run_inner(&execution_id, &state).await;

        if let Err(e) = self.lock.release().await {
            error!(error = %e, "Failed to release cycle lock");
        }
        if let Err(e) = self.reschedule().await {
            error!(error = %e, "Failed to advance schedule");
        }

        match result {
            Ok(stats) => {
                info!(execution_id = execution_id.as_str(), %stats, "Analysis cycle finished");
                Ok(CycleOutcome::Completed {
                    success: stats.errors.is_empty(),
                    discoveries_count: stats.discoveries_count,
                    notifications_count: stats.notifications_count,
                    errors: stats.errors,
                })
            }
            Err(e) => {
                error!(execution_id = execution_id.as_str(), error = %format!("{e:#}"), "Analysis cycle failed");
                self.log(ActivityLogEntry::error(
                    &execution_id,
                    format!("Cycle failed: {e:#}"),
                ))
                .await;
                Ok(CycleOutcome::Completed {
                    success: false,
                    discoveries_count: 0,
                    notifications_count: 0,
                    errors: vec![format!("{e:#}")],
                })
            }
        }
    }

    async fn run_inner(&self, execution_id: &str, state: &AnalysisState) -> Result<CycleStats> {
        self.log(ActivityLogEntry::info(execution_id, "Analysis cycle started"))
            .await;

        let now = Utc::now();
        // Dedup comparison set is frozen here; discoveries landing mid-cycle
        // from elsewhere are not consulted again.
        let snapshot = self
            .discoveries
            .recent(now - self.dedup.config().window, self.dedup.config().max_recent)
            .await?;

        let since = state.last_run_at.unwrap_or_else(|| now - state.interval());
        let candidates = self.generator.generate(since).await?;
        let (accepted, suppressed) = self.dedup.filter_new(candidates, &snapshot);

        let mut stats = CycleStats {
            suppressed: suppressed as u32,
            ..CycleStats::default()
        };

        for discovery in accepted {
            if let Err(e) = self.discoveries.insert(&discovery).await {
                stats
                    .errors
                    .push(format!("persisting '{}': {e:#}", discovery.title));
                continue;
            }
            stats.discoveries_count += 1;

            match self.fanout.dispatch(discovery.id, execution_id).await {
                Ok(fanout_stats) => {
                    let delivered =
                        fanout_stats.notifications_created + fanout_stats.notifications_existing;
                    stats.notifications_count += delivered;
                    stats.emails_sent += fanout_stats.emails_sent;
                    stats.errors.extend(fanout_stats.errors);

                    if delivered > 0 {
                        if let Err(e) = self.discoveries.mark_notified(discovery.id).await {
                            stats
                                .errors
                                .push(format!("marking '{}' notified: {e:#}", discovery.title));
                        }
                    }
                }
                // One discovery's fan-out failing wholesale doesn't stop
                // the rest of the batch.
                Err(e) => stats
                    .errors
                    .push(format!("fan-out for '{}': {e:#}", discovery.title)),
            }
        }

        self.log(ActivityLogEntry::info(
            execution_id,
            format!("Cycle complete: {stats}"),
        ))
        .await;

        Ok(stats)
    }

    /// Advance the schedule from a fresh state read, so the lock release
    /// that already happened is not clobbered.
    async fn reschedule(&self) -> Result<()> {
        let mut state = self.state.get_state().await?;
        let now = Utc::now();
        state.last_run_at = Some(now);
        state.next_run_at = Some(now + state.interval());
        self.state.put_state(&state).await
    }

    async fn log(&self, entry: ActivityLogEntry) {
        if let Err(e) = self.activity.append(&entry).await {
            error!(error = %e, "Failed to append activity log entry");
        }
    }
}
