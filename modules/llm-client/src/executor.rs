//! Rate-limit aware request executor.
//!
//! Wraps any LLM call with a pre-flight budget check, wait-for-reset
//! backoff, and bounded retry on rate-limit errors only. Carries a
//! broadcast side channel so external logging/alerting can watch budget
//! pressure without being part of the control flow.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::budget::{BudgetSnapshot, RateLimitBudget};
use crate::client::LlmError;
use crate::estimate::TokenEstimate;

/// Budget pressure events. Observability only — subscribers cannot influence
/// the call path.
#[derive(Debug, Clone)]
pub enum BudgetEvent {
    ApproachingLimit(BudgetSnapshot),
    LimitHit(BudgetSnapshot),
    LimitReset(BudgetSnapshot),
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /// Token headroom added to the estimate in the pre-flight check.
    pub buffer_tokens: u64,
    /// Retries after the initial attempt, spent only on rate-limit errors.
    pub max_retries: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            buffer_tokens: 500,
            max_retries: 3,
        }
    }
}

pub struct RequestExecutor {
    budget: Arc<RateLimitBudget>,
    config: ExecutorConfig,
    events: broadcast::Sender<BudgetEvent>,
}

impl RequestExecutor {
    pub fn new(budget: Arc<RateLimitBudget>, config: ExecutorConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            budget,
            config,
            events,
        }
    }

    pub fn budget(&self) -> &Arc<RateLimitBudget> {
        &self.budget
    }

    /// Subscribe to budget pressure events.
    pub fn subscribe(&self) -> broadcast::Receiver<BudgetEvent> {
        self.events.subscribe()
    }

    /// Pre-flight check: would this estimate (plus buffer) overrun the most
    /// constrained dimension?
    pub fn check_if_near_limit(&self, estimate: &TokenEstimate) -> bool {
        self.budget
            .is_near_limit(estimate.tokens, self.config.buffer_tokens)
    }

    /// Execute `call` under the budget. Sleeps before the first attempt when
    /// near-limit; retries (with the same wait policy) only when the call
    /// fails with a rate-limit error. Any other failure propagates at once.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        estimate: &TokenEstimate,
        call: F,
    ) -> Result<T, LlmError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        if self.check_if_near_limit(estimate) {
            let wait = self.budget.wait_until_reset(Utc::now());
            self.emit(BudgetEvent::ApproachingLimit(self.budget.snapshot()));
            info!(
                wait_secs = wait.as_secs(),
                estimate = estimate.tokens,
                "Near rate limit, waiting before call"
            );
            self.sleep_through_reset(wait).await;
        }

        let mut attempt: u32 = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_rate_limit() => {
                    self.emit(BudgetEvent::LimitHit(self.budget.snapshot()));
                    if attempt >= self.config.max_retries {
                        warn!(attempt, "Rate limit retries exhausted");
                        return Err(err);
                    }
                    let wait = match err {
                        LlmError::RateLimited {
                            retry_after: Some(after),
                        } => after.max(std::time::Duration::from_secs(1)),
                        _ => self.budget.wait_until_reset(Utc::now()),
                    };
                    warn!(
                        attempt,
                        wait_secs = wait.as_secs(),
                        "Rate limit hit, backing off"
                    );
                    self.sleep_through_reset(wait).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Sleep out the wait. Only the stale reset times are dropped —
    /// remaining counts stay as the provider last reported them, until the
    /// next response's accounting raises them.
    async fn sleep_through_reset(&self, wait: std::time::Duration) {
        tokio::time::sleep(wait).await;
        self.budget.clear_reset_times();
        self.emit(BudgetEvent::LimitReset(self.budget.snapshot()));
    }

    fn emit(&self, event: BudgetEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::EstimateConfidence;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn estimate(tokens: u64) -> TokenEstimate {
        TokenEstimate {
            tokens,
            confidence: EstimateConfidence::High,
        }
    }

    fn constrained_executor() -> RequestExecutor {
        // 100 input tokens remaining, no known reset time.
        let budget = Arc::new(RateLimitBudget::new(50, 40_000, 8_000));
        budget.record_response(Some(50), Some(100), Some(8_000), None, 0, 0);
        RequestExecutor::new(budget, ExecutorConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn near_limit_sleeps_before_issuing_call() {
        let executor = constrained_executor();
        assert!(executor.check_if_near_limit(&estimate(1_000)));

        let start = tokio::time::Instant::now();
        let called_at = Arc::new(std::sync::Mutex::new(None));
        let called_at_clone = called_at.clone();

        executor
            .execute_with_retry(&estimate(1_000), || {
                let called_at = called_at_clone.clone();
                async move {
                    *called_at.lock().unwrap() = Some(tokio::time::Instant::now());
                    Ok::<_, LlmError>(())
                }
            })
            .await
            .unwrap();

        // No reset time known: the default 60s wait must elapse first.
        let called = called_at.lock().unwrap().expect("call never issued");
        assert!(called.duration_since(start) >= std::time::Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_on_rate_limit_then_succeeds() {
        let budget = Arc::new(RateLimitBudget::new(50, 40_000, 8_000));
        let executor = RequestExecutor::new(budget, ExecutorConfig::default());
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = executor
            .execute_with_retry(&estimate(100), || {
                let attempts = attempts_clone.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(LlmError::RateLimited {
                            retry_after: Some(std::time::Duration::from_secs(2)),
                        })
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_does_not_refill_the_budget() {
        let budget = Arc::new(RateLimitBudget::new(50, 40_000, 8_000));
        budget.record_response(Some(5), Some(100), Some(8_000), None, 0, 0);
        let executor = RequestExecutor::new(budget.clone(), ExecutorConfig::default());
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        executor
            .execute_with_retry(&estimate(1_000), || {
                let attempts = attempts_clone.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(LlmError::RateLimited {
                            retry_after: Some(std::time::Duration::from_secs(2)),
                        })
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        // Sleeping out a short retry-after must not restore the window;
        // only provider accounting raises the remaining counts.
        let snap = budget.snapshot();
        assert_eq!(snap.requests_remaining, 5);
        assert_eq!(snap.input_tokens_remaining, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn non_rate_limit_errors_propagate_without_retry() {
        let budget = Arc::new(RateLimitBudget::new(50, 40_000, 8_000));
        let executor = RequestExecutor::new(budget, ExecutorConfig::default());
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<(), _> = executor
            .execute_with_retry(&estimate(100), || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(LlmError::Api {
                        status: 500,
                        body: "boom".into(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(LlmError::Api { status: 500, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_is_bounded() {
        let budget = Arc::new(RateLimitBudget::new(50, 40_000, 8_000));
        let executor = RequestExecutor::new(
            budget,
            ExecutorConfig {
                buffer_tokens: 500,
                max_retries: 2,
            },
        );
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<(), _> = executor
            .execute_with_retry(&estimate(100), || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(LlmError::RateLimited {
                        retry_after: Some(std::time::Duration::from_secs(1)),
                    })
                }
            })
            .await;

        assert!(result.is_err());
        // Initial attempt + 2 retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn limit_hit_events_reach_subscribers() {
        let budget = Arc::new(RateLimitBudget::new(50, 40_000, 8_000));
        let executor = RequestExecutor::new(budget, ExecutorConfig::default());
        let mut events = executor.subscribe();

        let _ = executor
            .execute_with_retry(&estimate(100), || async {
                Err::<(), _>(LlmError::RateLimited {
                    retry_after: Some(std::time::Duration::from_secs(1)),
                })
            })
            .await;

        let mut saw_hit = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, BudgetEvent::LimitHit(_)) {
                saw_hit = true;
            }
        }
        assert!(saw_hit);
    }
}
