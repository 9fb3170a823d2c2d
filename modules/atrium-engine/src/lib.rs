//! The scheduled analysis cycle: lock, generate, deduplicate, persist,
//! fan out. One trigger, one cycle, one guaranteed lock release.

pub mod cycle;
pub mod dedup;
pub mod generate;
pub mod lock;

pub use cycle::{AnalysisCycle, CycleStats};
pub use dedup::{jaccard, DedupConfig, SimilarityDeduplicator};
pub use generate::{DiscoveryGenerator, LlmDiscoveryGenerator};
pub use lock::{CycleLock, LockAttempt};
