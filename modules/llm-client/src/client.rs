//! Wire client for the Anthropic messages API, with structured error kinds.
//!
//! Rate-limit detection is layered: HTTP 429 first, then the provider's
//! `error.type` marker, and only as a last resort a message-substring match
//! for third-party proxies that strip structured codes.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use thiserror::Error;
use tracing::debug;

use crate::budget::RateLimitBudget;
use crate::types::{ChatRequest, ChatResponse};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Error)]
pub enum LlmError {
    /// Provider refused the call for quota reasons. Retryable after waiting.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited {
        retry_after: Option<std::time::Duration>,
    },

    /// Provider returned a non-quota API error. Not retryable here.
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// Network-level failure reaching the provider.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response parsed but carried no usable content.
    #[error("empty response from model")]
    Empty,
}

impl LlmError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. })
    }
}

pub struct ChatClient {
    api_key: String,
    http: reqwest::Client,
    base_url: String,
}

impl ChatClient {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.to_string();
        self
    }

    fn headers(&self) -> Result<HeaderMap, LlmError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key).map_err(|_| LlmError::Api {
                status: 0,
                body: "API key contains invalid header characters".into(),
            })?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Issue one chat call. On success the provider's accounting (ratelimit
    /// headers + usage block) is written into `budget` before returning.
    pub async fn chat(
        &self,
        request: &ChatRequest,
        budget: &RateLimitBudget,
    ) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/messages", self.base_url);

        debug!(model = %request.model, "LLM chat request");

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let headers = RateLimitHeaders::parse(response.headers());

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status.as_u16(), &body, &headers));
        }

        let parsed: ChatResponse = response.json().await?;

        let (input_used, output_used) = parsed
            .usage
            .map(|u| (u.input_tokens, u.output_tokens))
            .unwrap_or((0, 0));
        budget.record_response(
            headers.requests_remaining,
            headers.input_tokens_remaining,
            headers.output_tokens_remaining,
            headers.resets_at,
            input_used,
            output_used,
        );

        if parsed.text().is_none() {
            return Err(LlmError::Empty);
        }
        Ok(parsed)
    }
}

// ---------------------------------------------------------------------------
// Rate-limit header parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RateLimitHeaders {
    requests_remaining: Option<u64>,
    input_tokens_remaining: Option<u64>,
    output_tokens_remaining: Option<u64>,
    resets_at: Option<DateTime<Utc>>,
    retry_after: Option<std::time::Duration>,
}

impl RateLimitHeaders {
    fn parse(headers: &HeaderMap) -> Self {
        let get_u64 = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
        };
        let get_ts = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };

        // The soonest reset across the dimensions the provider reports.
        let resets_at = [
            get_ts("anthropic-ratelimit-requests-reset"),
            get_ts("anthropic-ratelimit-input-tokens-reset"),
            get_ts("anthropic-ratelimit-output-tokens-reset"),
        ]
        .into_iter()
        .flatten()
        .min();

        Self {
            requests_remaining: get_u64("anthropic-ratelimit-requests-remaining"),
            input_tokens_remaining: get_u64("anthropic-ratelimit-input-tokens-remaining"),
            output_tokens_remaining: get_u64("anthropic-ratelimit-output-tokens-remaining"),
            resets_at,
            retry_after: get_u64("retry-after").map(std::time::Duration::from_secs),
        }
    }
}

/// Classify a failed response into a structured error kind.
fn classify_failure(status: u16, body: &str, headers: &RateLimitHeaders) -> LlmError {
    if status == 429 {
        return LlmError::RateLimited {
            retry_after: headers.retry_after,
        };
    }
    // Provider-specific structured marker.
    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(body) {
        if parsed["error"]["type"].as_str() == Some("rate_limit_error") {
            return LlmError::RateLimited {
                retry_after: headers.retry_after,
            };
        }
    }
    // Last-resort substring heuristic for proxies that lose the code.
    let lowered = body.to_ascii_lowercase();
    if lowered.contains("rate limit") || lowered.contains("too many requests") {
        return LlmError::RateLimited {
            retry_after: headers.retry_after,
        };
    }
    LlmError::Api {
        status,
        body: body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_429_is_rate_limited() {
        let err = classify_failure(429, "", &RateLimitHeaders::default());
        assert!(err.is_rate_limit());
    }

    #[test]
    fn structured_marker_is_rate_limited() {
        let body = r#"{"error":{"type":"rate_limit_error","message":"slow down"}}"#;
        let err = classify_failure(400, body, &RateLimitHeaders::default());
        assert!(err.is_rate_limit());
    }

    #[test]
    fn substring_fallback_is_rate_limited() {
        let err = classify_failure(
            503,
            "upstream says: rate limit exceeded",
            &RateLimitHeaders::default(),
        );
        assert!(err.is_rate_limit());
    }

    #[test]
    fn other_failures_are_api_errors() {
        let err = classify_failure(500, "internal error", &RateLimitHeaders::default());
        assert!(matches!(err, LlmError::Api { status: 500, .. }));
    }
}
