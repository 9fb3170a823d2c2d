//! The fan-out stage handlers. One coordinator instance serves a whole
//! fan-out chain; each stage is bounded-retry and failure-isolated, so one
//! recipient's bad day never takes a sibling down with it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use atrium_common::{ActivityLogEntry, Discovery, Notification, Recipient};
use atrium_store::{
    ActivityLog, DiscoveryStore, NotificationStore, NotificationUpsert, PersonaDirectory,
};

use crate::compose::NotificationComposer;
use crate::mailer::EmailSender;
use crate::tasks::FanoutTask;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the initial attempt, per notify-persona task.
    pub notify_retries: u32,
    /// Retries after the initial attempt, per send-email task.
    pub email_retries: u32,
    /// Minimum spacing between outbound emails (provider courtesy limit).
    pub min_send_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            notify_retries: 2,
            email_retries: 3,
            min_send_interval: Duration::from_millis(500),
        }
    }
}

/// What one task execution amounted to.
#[derive(Debug)]
pub enum StageResult {
    NotificationCreated,
    /// Upsert hit an existing row — the expected shape of a task retry.
    NotificationExisting,
    EmailSent,
    /// Deliberate no-op (no address, notifications disabled, missing row).
    Skipped,
    /// Retry budget exhausted. Logged, never propagated to siblings.
    Failed { stage: &'static str, detail: String },
}

pub struct TaskOutcome {
    pub result: StageResult,
    pub follow_ups: Vec<FanoutTask>,
}

impl TaskOutcome {
    fn done(result: StageResult) -> Self {
        Self {
            result,
            follow_ups: Vec::new(),
        }
    }
}

pub struct FanoutCoordinator {
    discoveries: Arc<dyn DiscoveryStore>,
    notifications: Arc<dyn NotificationStore>,
    activity: Arc<dyn ActivityLog>,
    personas: Arc<dyn PersonaDirectory>,
    composer: Arc<dyn NotificationComposer>,
    mailer: Arc<dyn EmailSender>,
    policy: RetryPolicy,
    last_send: Mutex<Option<tokio::time::Instant>>,
}

impl FanoutCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        discoveries: Arc<dyn DiscoveryStore>,
        notifications: Arc<dyn NotificationStore>,
        activity: Arc<dyn ActivityLog>,
        personas: Arc<dyn PersonaDirectory>,
        composer: Arc<dyn NotificationComposer>,
        mailer: Arc<dyn EmailSender>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            discoveries,
            notifications,
            activity,
            personas,
            composer,
            mailer,
            policy,
            last_send: Mutex::new(None),
        }
    }

    /// Stage 1: expand a discovery into one notify-persona task per
    /// recipient. Emission is at-least-once; downstream upserts absorb
    /// repeats.
    pub async fn coordinate(
        &self,
        discovery_id: Uuid,
        execution_id: &str,
    ) -> Result<Vec<FanoutTask>> {
        let Some(discovery) = self.discoveries.get(discovery_id).await? else {
            warn!(%discovery_id, "Coordinate called for unknown discovery");
            return Ok(Vec::new());
        };

        let tasks: Vec<FanoutTask> = discovery
            .recipients
            .iter()
            .map(|recipient| FanoutTask::NotifyPersona {
                execution_id: execution_id.to_string(),
                discovery_id,
                recipient: recipient.clone(),
                discovery_snapshot: discovery.clone(),
            })
            .collect();

        self.log(ActivityLogEntry::info(
            execution_id,
            format!(
                "Fan-out started for '{}': {} recipient(s)",
                discovery.title,
                tasks.len()
            ),
        ))
        .await;

        Ok(tasks)
    }

    /// Execute one task. Terminal failures are absorbed into the outcome;
    /// only follow-up tasks flow back to the queue.
    pub async fn handle(&self, task: FanoutTask) -> TaskOutcome {
        match task {
            FanoutTask::NotifyPersona {
                execution_id,
                discovery_id,
                recipient,
                discovery_snapshot,
            } => {
                self.notify_persona(&execution_id, discovery_id, &recipient, &discovery_snapshot)
                    .await
            }
            FanoutTask::SendEmail {
                execution_id,
                notification_id,
                persona_name,
                subject,
                body_text,
                body_html,
            } => {
                self.send_email(
                    &execution_id,
                    notification_id,
                    &persona_name,
                    &subject,
                    &body_text,
                    &body_html,
                )
                .await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stage 2: notify-persona
    // -----------------------------------------------------------------------

    async fn notify_persona(
        &self,
        execution_id: &str,
        discovery_id: Uuid,
        recipient: &Recipient,
        discovery: &Discovery,
    ) -> TaskOutcome {
        // The whole compose-then-persist unit shares one retry budget; the
        // upsert is idempotent, so repeating it after a partial failure is
        // safe.
        let mut attempt = 0;
        let (composed, upsert) = loop {
            match self
                .compose_and_persist(discovery_id, recipient, discovery)
                .await
            {
                Ok(pair) => break pair,
                Err(e) if attempt < self.policy.notify_retries => {
                    attempt += 1;
                    warn!(
                        persona = recipient.persona_name.as_str(),
                        attempt,
                        error = %e,
                        "Notify-persona attempt failed, retrying"
                    );
                }
                Err(e) => {
                    return self
                        .terminal_failure(
                            execution_id,
                            "notify-persona",
                            &recipient.persona_name,
                            &format!("{e:#}"),
                        )
                        .await;
                }
            }
        };

        let result = if upsert.is_created() {
            self.log(ActivityLogEntry::info(
                execution_id,
                format!("Notification created for {}", recipient.persona_name),
            ))
            .await;
            StageResult::NotificationCreated
        } else {
            info!(
                persona = recipient.persona_name.as_str(),
                %discovery_id,
                "Notification already exists, reusing row"
            );
            StageResult::NotificationExisting
        };

        // The email task keys on the persisted row's id, so a replayed
        // notify task re-emits the same email key.
        let row = upsert.into_inner();
        TaskOutcome {
            result,
            follow_ups: vec![FanoutTask::SendEmail {
                execution_id: execution_id.to_string(),
                notification_id: row.id,
                persona_name: row.persona_name,
                subject: composed.subject,
                body_text: composed.body_text,
                body_html: composed.body_html,
            }],
        }
    }

    /// One notify-persona attempt: compose content, then upsert the row.
    async fn compose_and_persist(
        &self,
        discovery_id: Uuid,
        recipient: &Recipient,
        discovery: &Discovery,
    ) -> Result<(crate::compose::ComposedMessage, NotificationUpsert)> {
        let composed = self.composer.compose(discovery, recipient).await?;

        let notification = Notification {
            id: Uuid::new_v4(),
            discovery_id,
            persona_name: recipient.persona_name.clone(),
            format: "email".to_string(),
            content: composed.body_text.clone(),
            sent_at: Utc::now(),
            viewed_at: None,
        };
        let upsert = self
            .notifications
            .upsert(&notification)
            .await
            .context("persisting notification")?;

        Ok((composed, upsert))
    }

    // -----------------------------------------------------------------------
    // Stage 3: send-email
    // -----------------------------------------------------------------------

    async fn send_email(
        &self,
        execution_id: &str,
        notification_id: Uuid,
        persona_name: &str,
        subject: &str,
        body_text: &str,
        body_html: &str,
    ) -> TaskOutcome {
        let profile = match self.personas.delivery_profile(persona_name).await {
            Ok(p) => p,
            Err(e) => {
                return self
                    .terminal_failure(
                        execution_id,
                        "send-email",
                        persona_name,
                        &format!("loading delivery profile: {e:#}"),
                    )
                    .await;
            }
        };

        let address = match profile {
            Some(p) if !p.notifications_enabled => {
                self.log_skip(execution_id, persona_name, "notifications disabled")
                    .await;
                return TaskOutcome::done(StageResult::Skipped);
            }
            Some(p) => match p.email {
                Some(address) => address,
                None => {
                    self.log_skip(execution_id, persona_name, "no email address")
                        .await;
                    return TaskOutcome::done(StageResult::Skipped);
                }
            },
            None => {
                self.log_skip(execution_id, persona_name, "unknown persona")
                    .await;
                return TaskOutcome::done(StageResult::Skipped);
            }
        };

        let mut attempt = 0;
        loop {
            self.throttle().await;
            match self
                .mailer
                .send(&address, subject, body_text, body_html)
                .await
            {
                Ok(()) => {
                    self.log(ActivityLogEntry::info(
                        execution_id,
                        format!("Email sent to {persona_name} for notification {notification_id}"),
                    ))
                    .await;
                    return TaskOutcome::done(StageResult::EmailSent);
                }
                Err(e) if attempt < self.policy.email_retries => {
                    attempt += 1;
                    warn!(
                        persona = persona_name,
                        attempt,
                        error = %e,
                        "Email send failed, retrying"
                    );
                }
                Err(e) => {
                    return self
                        .terminal_failure(
                            execution_id,
                            "send-email",
                            persona_name,
                            &format!("{e:#}"),
                        )
                        .await;
                }
            }
        }
    }

    /// Space outbound sends at least `min_send_interval` apart.
    async fn throttle(&self) {
        let mut last = self.last_send.lock().await;
        if let Some(prev) = *last {
            let next = prev + self.policy.min_send_interval;
            if next > tokio::time::Instant::now() {
                tokio::time::sleep_until(next).await;
            }
        }
        *last = Some(tokio::time::Instant::now());
    }

    // -----------------------------------------------------------------------
    // Logging
    // -----------------------------------------------------------------------

    async fn terminal_failure(
        &self,
        execution_id: &str,
        stage: &'static str,
        persona_name: &str,
        detail: &str,
    ) -> TaskOutcome {
        error!(stage, persona = persona_name, detail, "Fan-out stage failed terminally");
        self.log(ActivityLogEntry::error(
            execution_id,
            format!("{stage} failed for {persona_name}: {detail}"),
        ))
        .await;
        TaskOutcome::done(StageResult::Failed {
            stage,
            detail: format!("{stage}/{persona_name}: {detail}"),
        })
    }

    async fn log_skip(&self, execution_id: &str, persona_name: &str, reason: &str) {
        info!(persona = persona_name, reason, "Email skipped");
        self.log(ActivityLogEntry::info(
            execution_id,
            format!("Email skipped for {persona_name}: {reason}"),
        ))
        .await;
    }

    /// The audit trail must never break the fan-out path.
    async fn log(&self, entry: ActivityLogEntry) {
        if let Err(e) = self.activity.append(&entry).await {
            error!(error = %e, "Failed to append activity log entry");
        }
    }
}
