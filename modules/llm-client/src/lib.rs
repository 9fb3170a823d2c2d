//! LLM invocation envelope: wire client, token budgeting, pre-flight
//! estimation, and rate-limit-aware retry.
//!
//! The content the model generates is someone else's problem — this crate
//! only owns *how* calls go out: what they are predicted to cost, whether
//! the moving budget can absorb them, and how 429s are absorbed.

pub mod budget;
pub mod client;
pub mod estimate;
pub mod executor;
pub mod types;

pub use budget::{BudgetDimension, BudgetSnapshot, RateLimitBudget};
pub use client::{ChatClient, LlmError};
pub use estimate::{Capability, EstimateConfidence, TokenEstimate, estimate_request};
pub use executor::{BudgetEvent, ExecutorConfig, RequestExecutor};
pub use types::{ChatRequest, ChatResponse, Usage, WireMessage};
