//! Similarity suppression for freshly generated discoveries.
//!
//! Token-set Jaccard over title and reasoning, compared independently —
//! a rephrased title with identical reasoning is still the same finding.
//! The thresholds are tuned constants; change them in config, not here.

use std::collections::HashSet;

use atrium_common::Discovery;
use chrono::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// Similarity above this (strictly) marks a duplicate.
    pub threshold: f64,
    /// How far back the recency snapshot reaches.
    pub window: Duration,
    /// How many recent discoveries to compare against.
    pub max_recent: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            window: Duration::hours(24),
            max_recent: 3,
        }
    }
}

fn token_set(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|t| t.to_lowercase())
        .collect()
}

/// Jaccard similarity of the whitespace token sets of two strings.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let a = token_set(a);
    let b = token_set(b);
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

pub struct SimilarityDeduplicator {
    config: DedupConfig,
}

impl SimilarityDeduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Is `candidate` a near-repeat of any discovery in `recent`?
    pub fn is_duplicate(&self, candidate: &Discovery, recent: &[Discovery]) -> bool {
        recent.iter().take(self.config.max_recent).any(|prior| {
            let title_sim = jaccard(&candidate.title, &prior.title);
            let reasoning_sim = jaccard(&candidate.reasoning, &prior.reasoning);
            let duplicate =
                title_sim > self.config.threshold || reasoning_sim > self.config.threshold;
            if duplicate {
                debug!(
                    candidate = candidate.title.as_str(),
                    prior = prior.title.as_str(),
                    title_sim,
                    reasoning_sim,
                    "Suppressing near-duplicate discovery"
                );
            }
            duplicate
        })
    }

    /// Partition candidates into accepted and suppressed. Every candidate
    /// is compared against the same recency snapshot; candidates from the
    /// same cycle are not visible to each other's check.
    pub fn filter_new(
        &self,
        candidates: Vec<Discovery>,
        recent_snapshot: &[Discovery],
    ) -> (Vec<Discovery>, usize) {
        let mut accepted: Vec<Discovery> = Vec::new();
        let mut suppressed = 0;

        for candidate in candidates {
            if self.is_duplicate(&candidate, recent_snapshot) {
                suppressed += 1;
            } else {
                accepted.push(candidate);
            }
        }

        (accepted, suppressed)
    }
}
