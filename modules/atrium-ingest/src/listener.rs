//! Time-boxed listener. One invocation consumes the message source for a
//! fixed window, then reports and exits; bounding each invocation's
//! lifetime is what lets the external scheduler start the next one without
//! worrying about the last.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};
use tracing::{info, warn};

use crate::validator::{Admission, BatchValidator, RejectReason, SensorBatch};

/// Raw message feed. `None` means the source closed.
#[async_trait]
pub trait MessageSource: Send {
    async fn next_message(&mut self) -> Result<Option<String>>;
}

/// Newline-delimited JSON on stdin, the shape a broker CLI subscriber
/// pipes in.
pub struct StdinSource {
    lines: tokio::io::Lines<BufReader<Stdin>>,
}

impl StdinSource {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageSource for StdinSource {
    async fn next_message(&mut self) -> Result<Option<String>> {
        Ok(self.lines.next_line().await?)
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ListenerStats {
    pub messages: u32,
    /// Batches carrying a timestamp not seen before.
    pub new_data: u32,
    pub duplicates: u32,
    pub stale: u32,
    pub future_skewed: u32,
    pub unparseable: u32,
    pub malformed: u32,
    pub points_written: usize,
    pub source_errors: u32,
}

impl std::fmt::Display for ListenerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} message(s): {} new, {} duplicate(s), {} stale, {} future-skewed, \
             {} unparseable, {} malformed, {} point(s) written",
            self.messages,
            self.new_data,
            self.duplicates,
            self.stale,
            self.future_skewed,
            self.unparseable,
            self.malformed,
            self.points_written
        )
    }
}

pub struct IngestListener {
    validator: BatchValidator,
    window: Duration,
}

impl IngestListener {
    pub fn new(validator: BatchValidator, window: Duration) -> Self {
        Self { validator, window }
    }

    /// Consume the source until the window closes or it runs dry.
    pub async fn run(&self, source: &mut dyn MessageSource) -> Result<ListenerStats> {
        let deadline = tokio::time::Instant::now() + self.window;
        let mut stats = ListenerStats::default();
        let mut last_message_at: Option<tokio::time::Instant> = None;

        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                info!("Listener window closed");
                break;
            }

            let raw = match tokio::time::timeout(deadline - now, source.next_message()).await {
                Err(_) => {
                    info!("Listener window closed while waiting for a message");
                    break;
                }
                Ok(Ok(None)) => {
                    info!("Message source closed");
                    break;
                }
                Ok(Ok(Some(raw))) => raw,
                Ok(Err(e)) => {
                    warn!(error = %e, "Message source error");
                    stats.source_errors += 1;
                    continue;
                }
            };

            stats.messages += 1;
            if let Some(prev) = last_message_at {
                info!(
                    gap_secs = (tokio::time::Instant::now() - prev).as_secs(),
                    "Message received"
                );
            }
            last_message_at = Some(tokio::time::Instant::now());

            let batch: SensorBatch = match serde_json::from_str(&raw) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "Malformed batch payload");
                    stats.malformed += 1;
                    continue;
                }
            };

            match self.validator.admit(&batch, Utc::now()).await? {
                Admission::Accepted { points_written, .. } => {
                    stats.new_data += 1;
                    stats.points_written += points_written;
                }
                Admission::Rejected(reason) => match reason {
                    RejectReason::Duplicate => stats.duplicates += 1,
                    RejectReason::Stale { .. } => stats.stale += 1,
                    RejectReason::FutureSkewed { .. } => stats.future_skewed += 1,
                    RejectReason::UnparseableTimestamp => stats.unparseable += 1,
                },
            }
        }

        info!(%stats, "Listener run complete");
        Ok(stats)
    }
}
