//! Discovery generation. The production implementation summarizes the
//! recent telemetry window and asks the model for structured findings;
//! the trait keeps the cycle testable without a provider.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use atrium_common::{
    AtriumError, Discovery, DiscoveryCategory, DiscoveryStatus, MeasurementPoint, Recipient,
    Severity,
};
use atrium_store::PointStore;
use llm_client::{estimate_request, Capability, ChatClient, ChatRequest, RequestExecutor, WireMessage};

#[async_trait]
pub trait DiscoveryGenerator: Send + Sync {
    /// Produce candidate discoveries from telemetry at or after `since`.
    async fn generate(&self, since: DateTime<Utc>) -> Result<Vec<Discovery>>;
}

// ---------------------------------------------------------------------------
// LLM-backed generator
// ---------------------------------------------------------------------------

const ANALYSIS_SYSTEM: &str = "You analyze building telemetry summaries and report findings. \
Respond with a JSON array only. Each element: {\"title\", \"category\" \
(comfort|energy|occupancy|maintenance|anomaly), \"severity\" \
(info|advisory|warning|critical), \"confidence\" (0-1), \"reasoning\", \
\"evidence\" (object), \"recipients\" (array of persona names)}. \
Report nothing when the data looks routine.";

pub struct LlmDiscoveryGenerator {
    points: Arc<dyn PointStore>,
    client: ChatClient,
    executor: Arc<RequestExecutor>,
    model: String,
    /// Personas findings can be addressed to. Unknown names from the model
    /// are dropped; an empty recipient list falls back to the full roster.
    roster: Vec<Recipient>,
}

impl LlmDiscoveryGenerator {
    pub fn new(
        points: Arc<dyn PointStore>,
        client: ChatClient,
        executor: Arc<RequestExecutor>,
        model: &str,
        roster: Vec<Recipient>,
    ) -> Self {
        Self {
            points,
            client,
            executor,
            model: model.to_string(),
            roster,
        }
    }

    fn resolve_recipients(&self, names: &[String]) -> Vec<Recipient> {
        if names.is_empty() {
            return self.roster.clone();
        }
        let resolved: Vec<Recipient> = self
            .roster
            .iter()
            .filter(|r| names.iter().any(|n| n == &r.persona_name))
            .cloned()
            .collect();
        if resolved.is_empty() {
            warn!(?names, "Model named no known personas, using full roster");
            return self.roster.clone();
        }
        resolved
    }
}

#[async_trait]
impl DiscoveryGenerator for LlmDiscoveryGenerator {
    async fn generate(&self, since: DateTime<Utc>) -> Result<Vec<Discovery>> {
        let points = self.points.recent_points(since).await?;
        if points.is_empty() {
            info!("No telemetry in window, skipping analysis call");
            return Ok(Vec::new());
        }

        let summary = summarize(&points);
        let request = ChatRequest::new(&self.model)
            .system(ANALYSIS_SYSTEM)
            .message(WireMessage::user(summary));
        let estimate = estimate_request(
            &request,
            &[Capability::TrendAnalysis, Capability::AnomalyDetection],
        );

        let response = self
            .executor
            .execute_with_retry(&estimate, || {
                self.client.chat(&request, self.executor.budget())
            })
            .await
            .context("analysis call failed")?;

        let text = response.text().context("model returned no text")?;
        let drafts = parse_drafts(&text)?;
        let now = Utc::now();

        Ok(drafts
            .into_iter()
            .map(|draft| Discovery {
                id: Uuid::new_v4(),
                title: draft.title,
                category: draft.category,
                severity: draft.severity,
                confidence: draft.confidence.clamp(0.0, 1.0),
                reasoning: draft.reasoning,
                evidence: draft.evidence,
                recipients: self.resolve_recipients(&draft.recipients),
                status: DiscoveryStatus::New,
                created_at: now,
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct DiscoveryDraft {
    title: String,
    category: DiscoveryCategory,
    severity: Severity,
    confidence: f64,
    reasoning: String,
    #[serde(default)]
    evidence: serde_json::Value,
    #[serde(default)]
    recipients: Vec<String>,
}

/// Extract the JSON array from model output, tolerating code fences and
/// surrounding prose.
fn parse_drafts(text: &str) -> Result<Vec<DiscoveryDraft>> {
    let start = text.find('[');
    let end = text.rfind(']');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(
            AtriumError::Validation("model output contained no JSON array".to_string()).into(),
        );
    };
    if end < start {
        return Err(
            AtriumError::Validation("model output contained no JSON array".to_string()).into(),
        );
    }
    serde_json::from_str(&text[start..=end]).context("parsing model findings")
}

/// Per sensor/field roll-up: count, min, max, latest. Compact enough to
/// keep the prompt within the estimator's high-confidence range.
fn summarize(points: &[MeasurementPoint]) -> String {
    #[derive(Default)]
    struct Roll {
        count: usize,
        min: f64,
        max: f64,
        last: f64,
    }

    let mut rolls: BTreeMap<(String, String), Roll> = BTreeMap::new();
    for p in points {
        let roll = rolls
            .entry((p.sensor_id.clone(), p.field.clone()))
            .or_insert(Roll {
                count: 0,
                min: p.value,
                max: p.value,
                last: p.value,
            });
        roll.count += 1;
        roll.min = roll.min.min(p.value);
        roll.max = roll.max.max(p.value);
        roll.last = p.value;
    }

    let window_start = points.first().map(|p| p.data_ts.to_rfc3339()).unwrap_or_default();
    let window_end = points.last().map(|p| p.data_ts.to_rfc3339()).unwrap_or_default();

    let mut out = format!("Telemetry window {window_start} to {window_end}:\n");
    for ((sensor, field), roll) in rolls {
        out.push_str(&format!(
            "- {sensor} {field}: {} reading(s), min {:.2}, max {:.2}, last {:.2}\n",
            roll.count, roll.min, roll.max, roll.last
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drafts_parse_through_code_fences() {
        let text = "Here are my findings:\n```json\n[{\"title\":\"Pump 3 overheating\",\
                    \"category\":\"maintenance\",\"severity\":\"warning\",\
                    \"confidence\":0.8,\"reasoning\":\"temp rising\"}]\n```";
        let drafts = parse_drafts(text).unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].title, "Pump 3 overheating");
        assert_eq!(drafts[0].category, DiscoveryCategory::Maintenance);
    }

    #[test]
    fn empty_array_means_no_findings() {
        assert!(parse_drafts("[]").unwrap().is_empty());
    }

    #[test]
    fn prose_without_json_is_an_error() {
        assert!(parse_drafts("everything looks routine").is_err());
    }

    #[test]
    fn summary_rolls_up_by_sensor_and_field() {
        let ts = Utc::now();
        let points = vec![
            MeasurementPoint {
                sensor_id: "fcu-01".into(),
                field: "temp".into(),
                value: 21.0,
                data_ts: ts,
                received_ts: ts,
            },
            MeasurementPoint {
                sensor_id: "fcu-01".into(),
                field: "temp".into(),
                value: 23.5,
                data_ts: ts,
                received_ts: ts,
            },
        ];
        let summary = summarize(&points);
        assert!(summary.contains("fcu-01 temp: 2 reading(s), min 21.00, max 23.50, last 23.50"));
    }
}
