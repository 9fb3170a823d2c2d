//! Notification composition. The production composer asks the model to
//! write persona-slanted copy; tests substitute a canned implementation.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use atrium_common::{Discovery, Recipient, Severity};
use llm_client::{estimate_request, Capability, ChatClient, ChatRequest, RequestExecutor, WireMessage};

#[derive(Debug, Clone)]
pub struct ComposedMessage {
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
}

#[async_trait]
pub trait NotificationComposer: Send + Sync {
    async fn compose(&self, discovery: &Discovery, recipient: &Recipient) -> Result<ComposedMessage>;
}

// ---------------------------------------------------------------------------
// LLM-backed composer
// ---------------------------------------------------------------------------

const COMPOSE_SYSTEM: &str = "You write short building-operations notifications. \
Given a finding and a recipient role, write 2-4 plain-text paragraphs slanted \
to what that role cares about. No greetings, no sign-off, no markdown.";

pub struct LlmComposer {
    client: ChatClient,
    executor: Arc<RequestExecutor>,
    model: String,
}

impl LlmComposer {
    pub fn new(client: ChatClient, executor: Arc<RequestExecutor>, model: &str) -> Self {
        Self {
            client,
            executor,
            model: model.to_string(),
        }
    }

    fn prompt(discovery: &Discovery, recipient: &Recipient) -> String {
        format!(
            "Finding: {}\nCategory: {}\nSeverity: {:?}\nConfidence: {:.2}\n\n\
             Reasoning:\n{}\n\nEvidence:\n{}\n\nRecipient role: {}",
            discovery.title,
            discovery.category,
            discovery.severity,
            discovery.confidence,
            discovery.reasoning,
            discovery.evidence,
            recipient.role,
        )
    }
}

#[async_trait]
impl NotificationComposer for LlmComposer {
    async fn compose(&self, discovery: &Discovery, recipient: &Recipient) -> Result<ComposedMessage> {
        let request = ChatRequest::new(&self.model)
            .system(COMPOSE_SYSTEM)
            .max_tokens(1024)
            .message(WireMessage::user(Self::prompt(discovery, recipient)));
        let estimate = estimate_request(&request, &[Capability::NotificationCompose]);

        let response = self
            .executor
            .execute_with_retry(&estimate, || {
                self.client.chat(&request, self.executor.budget())
            })
            .await
            .with_context(|| {
                format!(
                    "composing notification for persona {}",
                    recipient.persona_name
                )
            })?;

        let body_text = response.text().context("model returned no text")?;
        Ok(ComposedMessage {
            subject: subject_for(discovery),
            body_html: text_to_html(&body_text),
            body_text,
        })
    }
}

/// Subject line: severity prefix only when it should jump out of an inbox.
pub fn subject_for(discovery: &Discovery) -> String {
    match discovery.severity {
        Severity::Critical => format!("[CRITICAL] {}", discovery.title),
        Severity::Warning => format!("[Warning] {}", discovery.title),
        Severity::Advisory | Severity::Info => discovery.title.clone(),
    }
}

/// Minimal paragraph markup for the HTML alternative part.
pub fn text_to_html(text: &str) -> String {
    let escaped = text
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    escaped
        .split("\n\n")
        .filter(|p| !p.trim().is_empty())
        .map(|p| format!("<p>{}</p>", p.trim().replace('\n', "<br>")))
        .collect()
}
