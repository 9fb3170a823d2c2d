//! Moving rate-limit budget, refreshed from provider accounting.
//!
//! One `RateLimitBudget` is created per call site and passed in explicitly —
//! there is no process-global budget, so concurrent tests (and concurrent
//! pipelines) each carry their own.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// The four dimensions a provider meters independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BudgetDimension {
    Requests,
    InputTokens,
    OutputTokens,
    TotalTokens,
}

impl BudgetDimension {
    pub const ALL: [BudgetDimension; 4] = [
        BudgetDimension::Requests,
        BudgetDimension::InputTokens,
        BudgetDimension::OutputTokens,
        BudgetDimension::TotalTokens,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetDimension::Requests => "requests",
            BudgetDimension::InputTokens => "input_tokens",
            BudgetDimension::OutputTokens => "output_tokens",
            BudgetDimension::TotalTokens => "total_tokens",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DimensionState {
    limit: u64,
    remaining: u64,
    resets_at: Option<DateTime<Utc>>,
}

/// Point-in-time copy of the budget, carried on observer events.
#[derive(Debug, Clone)]
pub struct BudgetSnapshot {
    pub requests_remaining: u64,
    pub input_tokens_remaining: u64,
    pub output_tokens_remaining: u64,
    pub total_tokens_remaining: u64,
    pub soonest_reset: Option<DateTime<Utc>>,
}

/// Tracks remaining capacity per dimension. Values are only ever written
/// from the provider's own response accounting; the initial limits are the
/// one local guess allowed.
pub struct RateLimitBudget {
    state: Mutex<[DimensionState; 4]>,
}

impl RateLimitBudget {
    /// Budget seeded with the provider's advertised per-minute limits.
    pub fn new(requests: u64, input_tokens: u64, output_tokens: u64) -> Self {
        let dim = |limit| DimensionState {
            limit,
            remaining: limit,
            resets_at: None,
        };
        Self {
            state: Mutex::new([
                dim(requests),
                dim(input_tokens),
                dim(output_tokens),
                dim(input_tokens + output_tokens),
            ]),
        }
    }

    /// Sensible defaults for a mid-tier Anthropic key.
    pub fn standard_tier() -> Self {
        Self::new(50, 40_000, 8_000)
    }

    /// Apply the provider's post-call accounting: remaining counts and reset
    /// times from response headers, token usage from the usage block.
    pub fn record_response(
        &self,
        requests_remaining: Option<u64>,
        input_remaining: Option<u64>,
        output_remaining: Option<u64>,
        resets_at: Option<DateTime<Utc>>,
        input_used: u64,
        output_used: u64,
    ) {
        let mut dims = self.state.lock().expect("budget mutex poisoned");

        match requests_remaining {
            Some(r) => dims[0].remaining = r,
            None => dims[0].remaining = dims[0].remaining.saturating_sub(1),
        }
        match input_remaining {
            Some(r) => dims[1].remaining = r,
            None => dims[1].remaining = dims[1].remaining.saturating_sub(input_used),
        }
        match output_remaining {
            Some(r) => dims[2].remaining = r,
            None => dims[2].remaining = dims[2].remaining.saturating_sub(output_used),
        }
        dims[3].remaining = dims[1].remaining.saturating_add(dims[2].remaining);

        if resets_at.is_some() {
            for d in dims.iter_mut() {
                d.resets_at = resets_at;
            }
        }
    }

    /// Forget the known reset times after a backoff has slept them out.
    /// Remaining counts are left untouched; only the next
    /// `record_response` may raise them.
    pub fn clear_reset_times(&self) {
        let mut dims = self.state.lock().expect("budget mutex poisoned");
        for d in dims.iter_mut() {
            d.resets_at = None;
        }
    }

    /// Would `estimate + buffer` tokens (and one request) overrun the most
    /// constrained dimension?
    pub fn is_near_limit(&self, estimate_tokens: u64, buffer: u64) -> bool {
        let dims = self.state.lock().expect("budget mutex poisoned");
        let needed = estimate_tokens.saturating_add(buffer);
        dims[0].remaining < 1
            || dims[1].remaining < needed
            || dims[2].remaining < needed.min(dims[2].limit)
            || dims[3].remaining < needed
    }

    /// Time until the soonest known reset, floored at one second. When no
    /// reset time is known, fall back to a full 60-second window.
    pub fn wait_until_reset(&self, now: DateTime<Utc>) -> std::time::Duration {
        let dims = self.state.lock().expect("budget mutex poisoned");
        let soonest = dims.iter().filter_map(|d| d.resets_at).min();
        let wait = match soonest {
            Some(at) => (at - now).max(Duration::seconds(1)),
            None => Duration::seconds(60),
        };
        wait.to_std().unwrap_or(std::time::Duration::from_secs(1))
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let dims = self.state.lock().expect("budget mutex poisoned");
        BudgetSnapshot {
            requests_remaining: dims[0].remaining,
            input_tokens_remaining: dims[1].remaining,
            output_tokens_remaining: dims[2].remaining,
            total_tokens_remaining: dims[3].remaining,
            soonest_reset: dims.iter().filter_map(|d| d.resets_at).min(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_budget_is_not_near_limit() {
        let budget = RateLimitBudget::new(50, 40_000, 8_000);
        assert!(!budget.is_near_limit(1_000, 500));
    }

    #[test]
    fn provider_accounting_overrides_local_decrement() {
        let budget = RateLimitBudget::new(50, 40_000, 8_000);
        budget.record_response(Some(3), Some(900), Some(400), None, 100, 50);
        let snap = budget.snapshot();
        assert_eq!(snap.requests_remaining, 3);
        assert_eq!(snap.input_tokens_remaining, 900);
        assert_eq!(snap.total_tokens_remaining, 1_300);
    }

    #[test]
    fn missing_headers_fall_back_to_usage_decrement() {
        let budget = RateLimitBudget::new(50, 40_000, 8_000);
        budget.record_response(None, None, None, None, 1_000, 200);
        let snap = budget.snapshot();
        assert_eq!(snap.requests_remaining, 49);
        assert_eq!(snap.input_tokens_remaining, 39_000);
        assert_eq!(snap.output_tokens_remaining, 7_800);
    }

    #[test]
    fn near_limit_when_any_dimension_constrained() {
        let budget = RateLimitBudget::new(50, 40_000, 8_000);
        budget.record_response(Some(50), Some(600), Some(8_000), None, 0, 0);
        // 200 + 500 buffer > 600 input remaining
        assert!(budget.is_near_limit(200, 500));
    }

    #[test]
    fn wait_defaults_to_sixty_seconds_without_reset_time() {
        let budget = RateLimitBudget::new(50, 40_000, 8_000);
        assert_eq!(
            budget.wait_until_reset(Utc::now()),
            std::time::Duration::from_secs(60)
        );
    }

    #[test]
    fn clearing_reset_times_does_not_refill_remaining() {
        let budget = RateLimitBudget::new(50, 40_000, 8_000);
        let now = Utc::now();
        budget.record_response(
            Some(2),
            Some(300),
            Some(100),
            Some(now + Duration::seconds(5)),
            0,
            0,
        );

        budget.clear_reset_times();

        let snap = budget.snapshot();
        assert_eq!(snap.requests_remaining, 2);
        assert_eq!(snap.input_tokens_remaining, 300);
        assert_eq!(snap.output_tokens_remaining, 100);
        assert!(snap.soonest_reset.is_none());
        // With the reset time gone, waits fall back to the default window.
        assert_eq!(
            budget.wait_until_reset(now),
            std::time::Duration::from_secs(60)
        );
    }

    #[test]
    fn wait_is_floored_at_one_second() {
        let budget = RateLimitBudget::new(50, 40_000, 8_000);
        let now = Utc::now();
        budget.record_response(Some(0), None, None, Some(now - Duration::seconds(5)), 0, 0);
        assert_eq!(
            budget.wait_until_reset(now),
            std::time::Duration::from_secs(1)
        );
    }
}
