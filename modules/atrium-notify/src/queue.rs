//! The queue seam and the in-process worker.
//!
//! Tasks are submitted to a `TaskQueue`; a durable backend can slot in
//! behind the trait. The in-process implementation drains waves of tasks
//! with bounded concurrency and feeds follow-ups back until the chain
//! settles.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::{stream, StreamExt};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::coordinator::{FanoutCoordinator, StageResult};
use crate::tasks::FanoutTask;

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn submit(&self, task: FanoutTask) -> Result<()>;
}

pub struct InProcessQueue {
    tx: mpsc::UnboundedSender<FanoutTask>,
}

impl InProcessQueue {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FanoutTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl TaskQueue for InProcessQueue {
    async fn submit(&self, task: FanoutTask) -> Result<()> {
        self.tx
            .send(task)
            .map_err(|_| anyhow::anyhow!("fan-out queue closed"))
    }
}

// ---------------------------------------------------------------------------
// Fan-out service
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct FanoutStats {
    pub notifications_created: u32,
    pub notifications_existing: u32,
    pub emails_sent: u32,
    pub skipped: u32,
    pub errors: Vec<String>,
}

impl FanoutStats {
    fn absorb(&mut self, result: &StageResult) {
        match result {
            StageResult::NotificationCreated => self.notifications_created += 1,
            StageResult::NotificationExisting => self.notifications_existing += 1,
            StageResult::EmailSent => self.emails_sent += 1,
            StageResult::Skipped => self.skipped += 1,
            StageResult::Failed { detail, .. } => self.errors.push(detail.clone()),
        }
    }
}

impl std::fmt::Display for FanoutStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} notification(s) created ({} existing), {} email(s) sent, {} skipped, {} failure(s)",
            self.notifications_created,
            self.notifications_existing,
            self.emails_sent,
            self.skipped,
            self.errors.len()
        )
    }
}

/// The engine-facing seam: turn one discovery into its full fan-out chain.
#[async_trait]
pub trait Fanout: Send + Sync {
    async fn dispatch(&self, discovery_id: Uuid, execution_id: &str) -> Result<FanoutStats>;
}

/// Runs fan-out chains on a fresh in-process queue per dispatch. No
/// long-lived worker pool; the chain settles before the call returns.
pub struct FanoutService {
    coordinator: Arc<FanoutCoordinator>,
    concurrency: usize,
}

impl FanoutService {
    pub fn new(coordinator: Arc<FanoutCoordinator>) -> Self {
        Self {
            coordinator,
            concurrency: 4,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

#[async_trait]
impl Fanout for FanoutService {
    async fn dispatch(&self, discovery_id: Uuid, execution_id: &str) -> Result<FanoutStats> {
        let (queue, rx) = InProcessQueue::new();
        for task in self.coordinator.coordinate(discovery_id, execution_id).await? {
            queue.submit(task).await?;
        }

        let stats = drain(&self.coordinator, queue, rx, self.concurrency).await?;
        info!(%discovery_id, execution_id, %stats, "Fan-out chain settled");
        Ok(stats)
    }
}

/// Process the queue in waves until no task produced a follow-up.
async fn drain(
    coordinator: &Arc<FanoutCoordinator>,
    queue: Arc<InProcessQueue>,
    mut rx: mpsc::UnboundedReceiver<FanoutTask>,
    concurrency: usize,
) -> Result<FanoutStats> {
    let mut stats = FanoutStats::default();

    loop {
        let mut wave = Vec::new();
        while let Ok(task) = rx.try_recv() {
            wave.push(task);
        }
        if wave.is_empty() {
            break;
        }

        let outcomes = stream::iter(wave)
            .map(|task| coordinator.handle(task))
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;

        for outcome in outcomes {
            stats.absorb(&outcome.result);
            for follow_up in outcome.follow_ups {
                queue.submit(follow_up).await?;
            }
        }
    }

    Ok(stats)
}
