//! Pre-flight token estimation. A cost model, not a measurement — the real
//! usage always comes back from the provider and is what updates the budget.

use crate::types::ChatRequest;

/// Named analysis capabilities with a fixed base cost each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    TrendAnalysis,
    AnomalyDetection,
    ComfortAssessment,
    EnergyReview,
    NotificationCompose,
    Other,
}

impl Capability {
    /// Base token cost per capability. Unknown capabilities use `Other`.
    fn base_cost(&self) -> u64 {
        match self {
            Capability::TrendAnalysis => 1_200,
            Capability::AnomalyDetection => 900,
            Capability::ComfortAssessment => 700,
            Capability::EnergyReview => 800,
            Capability::NotificationCompose => 400,
            Capability::Other => 600,
        }
    }
}

/// Advisory only — never used to block a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateConfidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy)]
pub struct TokenEstimate {
    pub tokens: u64,
    pub confidence: EstimateConfidence,
}

/// Fixed envelope overhead (message framing, stop sequences, role markers).
const OVERHEAD_TOKENS: u64 = 200;
/// Characters-per-token proxy.
const CHARS_PER_TOKEN: u64 = 4;
/// Safety margin applied to the total.
const MARGIN: f64 = 1.10;

/// Estimate the token cost of a request exercising the given capabilities.
pub fn estimate_request(request: &ChatRequest, capabilities: &[Capability]) -> TokenEstimate {
    let base: u64 = capabilities.iter().map(Capability::base_cost).sum();
    let payload_chars = request.payload_chars() as u64;
    let payload = payload_chars / CHARS_PER_TOKEN;

    let raw = base + payload + OVERHEAD_TOKENS;
    let tokens = (raw as f64 * MARGIN).ceil() as u64;

    // Confidence degrades with request complexity: many capabilities or a
    // large payload make the fixed base costs less representative.
    let confidence = match (capabilities.len(), payload_chars) {
        (0..=1, 0..=20_000) => EstimateConfidence::High,
        (_, 0..=100_000) if capabilities.len() <= 3 => EstimateConfidence::Medium,
        _ => EstimateConfidence::Low,
    };

    TokenEstimate { tokens, confidence }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WireMessage;

    fn request_with_chars(n: usize) -> ChatRequest {
        ChatRequest::new("claude-haiku-4-5").message(WireMessage::user("x".repeat(n)))
    }

    #[test]
    fn estimate_includes_margin_and_overhead() {
        let req = request_with_chars(400); // 100 payload tokens
        let est = estimate_request(&req, &[Capability::TrendAnalysis]);
        // (1200 + 100 + 200) * 1.1 = 1650
        assert_eq!(est.tokens, 1_650);
        assert_eq!(est.confidence, EstimateConfidence::High);
    }

    #[test]
    fn unknown_capability_uses_default_cost() {
        let req = request_with_chars(0);
        let est = estimate_request(&req, &[Capability::Other]);
        assert_eq!(est.tokens, ((600u64 + 200) as f64 * 1.1).ceil() as u64);
    }

    #[test]
    fn complexity_lowers_confidence() {
        let req = request_with_chars(50_000);
        let est = estimate_request(
            &req,
            &[Capability::TrendAnalysis, Capability::AnomalyDetection],
        );
        assert_eq!(est.confidence, EstimateConfidence::Medium);

        let est = estimate_request(
            &req,
            &[
                Capability::TrendAnalysis,
                Capability::AnomalyDetection,
                Capability::ComfortAssessment,
                Capability::EnergyReview,
            ],
        );
        assert_eq!(est.confidence, EstimateConfidence::Low);
    }
}
