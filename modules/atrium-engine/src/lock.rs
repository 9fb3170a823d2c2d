//! Execution lock for the analysis cycle.
//!
//! Check-then-set over the state store, not a distributed lock — the
//! deployment assumption is a single scheduler process. The staleness
//! override exists for the crash case: a cycle that died without releasing
//! must not wedge the schedule forever.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::{info, warn};

use atrium_store::StateStore;

/// A healthy cycle finishes well inside this; anything older is presumed
/// dead.
pub const DEFAULT_STALE_AFTER: Duration = Duration::minutes(4);

#[derive(Debug)]
pub enum LockAttempt {
    Granted,
    /// Another cycle holds the lock and it isn't stale yet.
    Denied { age: Duration },
}

pub struct CycleLock {
    state: Arc<dyn StateStore>,
    stale_after: Duration,
}

impl CycleLock {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self {
            state,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Attempt to take the lock. Denial is an expected skip, not an error.
    pub async fn try_acquire(&self) -> Result<LockAttempt> {
        let mut state = self.state.get_state().await?;
        let now = Utc::now();

        if let Some(acquired_at) = state.lock_acquired_at {
            let age = now - acquired_at;
            if age < self.stale_after {
                info!(age_secs = age.num_seconds(), "Cycle lock held, denying");
                return Ok(LockAttempt::Denied { age });
            }
            warn!(
                age_secs = age.num_seconds(),
                "Overriding stale cycle lock from a presumed-dead run"
            );
        }

        state.lock_acquired_at = Some(now);
        self.state.put_state(&state).await?;
        Ok(LockAttempt::Granted)
    }

    /// Unconditionally clear the lock. Every cycle exit path calls this.
    pub async fn release(&self) -> Result<()> {
        self.state.clear_lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_common::AnalysisState;
    use atrium_store::MemoryStore;

    #[tokio::test]
    async fn second_acquire_is_denied_while_held() {
        let store = MemoryStore::new();
        let lock = CycleLock::new(store.clone());

        assert!(matches!(lock.try_acquire().await.unwrap(), LockAttempt::Granted));
        assert!(matches!(
            lock.try_acquire().await.unwrap(),
            LockAttempt::Denied { .. }
        ));
    }

    #[tokio::test]
    async fn release_makes_lock_available_again() {
        let store = MemoryStore::new();
        let lock = CycleLock::new(store.clone());

        assert!(matches!(lock.try_acquire().await.unwrap(), LockAttempt::Granted));
        lock.release().await.unwrap();
        assert!(matches!(lock.try_acquire().await.unwrap(), LockAttempt::Granted));
    }

    #[tokio::test]
    async fn stale_lock_is_overridden() {
        let store = MemoryStore::with_state(AnalysisState {
            lock_acquired_at: Some(Utc::now() - Duration::minutes(5)),
            ..AnalysisState::default()
        });
        let lock = CycleLock::new(store);

        assert!(matches!(lock.try_acquire().await.unwrap(), LockAttempt::Granted));
    }

    #[tokio::test]
    async fn fresh_lock_is_not_overridden() {
        let store = MemoryStore::with_state(AnalysisState {
            lock_acquired_at: Some(Utc::now() - Duration::minutes(3)),
            ..AnalysisState::default()
        });
        let lock = CycleLock::new(store);

        let denied = lock.try_acquire().await.unwrap();
        let LockAttempt::Denied { age } = denied else {
            panic!("expected denial, got {denied:?}");
        };
        assert!(age >= Duration::minutes(3));
    }
}
