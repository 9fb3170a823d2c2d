use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Discovery ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryCategory {
    Comfort,
    Energy,
    Occupancy,
    Maintenance,
    Anomaly,
}

impl std::fmt::Display for DiscoveryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryCategory::Comfort => write!(f, "comfort"),
            DiscoveryCategory::Energy => write!(f, "energy"),
            DiscoveryCategory::Occupancy => write!(f, "occupancy"),
            DiscoveryCategory::Maintenance => write!(f, "maintenance"),
            DiscoveryCategory::Anomaly => write!(f, "anomaly"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Advisory,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStatus {
    New,
    Notified,
}

/// A notification recipient profile. Not an authenticated identity —
/// just a named persona with a role used to slant the notification copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub persona_name: String,
    pub role: String,
}

/// One analysis finding produced by a scheduled cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discovery {
    pub id: Uuid,
    pub title: String,
    pub category: DiscoveryCategory,
    pub severity: Severity,
    /// Model-reported confidence in [0, 1].
    pub confidence: f64,
    pub reasoning: String,
    /// Structured supporting data (sensor readings, time ranges, deltas).
    pub evidence: serde_json::Value,
    pub recipients: Vec<Recipient>,
    pub status: DiscoveryStatus,
    pub created_at: DateTime<Utc>,
}

// --- Notification ---

/// A personalized rendering of one discovery for one persona.
/// Unique per (discovery_id, persona_name) — that pair is the fan-out
/// idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub discovery_id: Uuid,
    pub persona_name: String,
    pub format: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub viewed_at: Option<DateTime<Utc>>,
}

// --- Activity log ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// Append-only audit entry. One execution_id spans a full cycle or a
/// full fan-out chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub execution_id: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ActivityLogEntry {
    pub fn info(execution_id: &str, message: impl Into<String>) -> Self {
        Self::at(execution_id, LogLevel::Info, message)
    }

    pub fn warning(execution_id: &str, message: impl Into<String>) -> Self {
        Self::at(execution_id, LogLevel::Warning, message)
    }

    pub fn error(execution_id: &str, message: impl Into<String>) -> Self {
        Self::at(execution_id, LogLevel::Error, message)
    }

    fn at(execution_id: &str, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

// --- Analysis state ---

/// Process-wide analysis scheduling state. Created once, mutated by every
/// cycle. `lock_acquired_at` non-null means a cycle is believed in-flight;
/// it must become null on every exit path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisState {
    pub enabled: bool,
    /// Human-readable interval: "15min", "30min", "1hour", "6hours", "1day".
    pub interval_spec: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
}

impl Default for AnalysisState {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_spec: "1hour".to_string(),
            last_run_at: None,
            next_run_at: None,
            lock_acquired_at: None,
        }
    }
}

impl AnalysisState {
    /// Parse the interval spec into a duration. Unknown specs fall back to
    /// one hour rather than halting the scheduler.
    pub fn interval(&self) -> Duration {
        parse_interval(&self.interval_spec).unwrap_or_else(|| Duration::hours(1))
    }
}

/// Parse "15min" / "1hour" / "6hours" / "1day" style interval specs.
pub fn parse_interval(spec: &str) -> Option<Duration> {
    let spec = spec.trim().to_lowercase();
    let digits_end = spec.find(|c: char| !c.is_ascii_digit())?;
    let n: i64 = spec[..digits_end].parse().ok()?;
    match spec[digits_end..].trim() {
        "min" | "mins" | "minute" | "minutes" => Some(Duration::minutes(n)),
        "hour" | "hours" => Some(Duration::hours(n)),
        "day" | "days" => Some(Duration::days(n)),
        _ => None,
    }
}

// --- Telemetry ---

/// One validated numeric measurement, stamped with the sensor's own data
/// timestamp. The received timestamp rides along separately — collapsing
/// the two hides staleness regressions downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementPoint {
    pub sensor_id: String,
    pub field: String,
    pub value: f64,
    pub data_ts: DateTime<Utc>,
    pub received_ts: DateTime<Utc>,
}

// --- Persona delivery ---

/// How (and whether) a persona wants email delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryProfile {
    pub persona_name: String,
    pub email: Option<String>,
    pub notifications_enabled: bool,
}

// --- Cycle outcome ---

/// Why a scheduler trigger produced no cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    Disabled,
    AlreadyRunning,
    NotYetTime,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Disabled => write!(f, "disabled"),
            SkipReason::AlreadyRunning => write!(f, "already-running"),
            SkipReason::NotYetTime => write!(f, "not-yet-time"),
        }
    }
}

/// Response to a scheduler trigger. A skip is an expected outcome, not an
/// error; a completed cycle always reports counts even on partial failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Skipped {
        reason: SkipReason,
    },
    Completed {
        success: bool,
        discoveries_count: u32,
        notifications_count: u32,
        errors: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_specs_parse() {
        assert_eq!(parse_interval("15min"), Some(Duration::minutes(15)));
        assert_eq!(parse_interval("1hour"), Some(Duration::hours(1)));
        assert_eq!(parse_interval("6hours"), Some(Duration::hours(6)));
        assert_eq!(parse_interval("1day"), Some(Duration::days(1)));
        assert_eq!(parse_interval("fortnight"), None);
    }

    #[test]
    fn unknown_interval_falls_back_to_one_hour() {
        let state = AnalysisState {
            interval_spec: "whenever".into(),
            ..Default::default()
        };
        assert_eq!(state.interval(), Duration::hours(1));
    }
}
