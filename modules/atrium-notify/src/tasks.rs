//! Fan-out task types. Tasks are plain serializable values so a durable
//! queue can carry them; the idempotency key is what makes at-least-once
//! emission safe.

use atrium_common::{Discovery, Recipient};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FanoutTask {
    /// Compose and persist one persona's notification for a discovery.
    /// Carries a snapshot of the discovery as seen at coordinate time, so
    /// the task is self-contained on a durable queue.
    NotifyPersona {
        execution_id: String,
        discovery_id: Uuid,
        recipient: Recipient,
        discovery_snapshot: Discovery,
    },
    /// Deliver one already-persisted notification by email.
    SendEmail {
        execution_id: String,
        notification_id: Uuid,
        persona_name: String,
        subject: String,
        body_text: String,
        body_html: String,
    },
}

impl FanoutTask {
    /// Stable key for queue-level dedup. Two emissions of the same logical
    /// work always produce the same key.
    pub fn idempotency_key(&self) -> String {
        match self {
            FanoutTask::NotifyPersona {
                discovery_id,
                recipient,
                ..
            } => format!("persona-{}-{}", discovery_id, recipient.persona_name),
            FanoutTask::SendEmail {
                notification_id, ..
            } => format!("email-{notification_id}"),
        }
    }

    pub fn execution_id(&self) -> &str {
        match self {
            FanoutTask::NotifyPersona { execution_id, .. }
            | FanoutTask::SendEmail { execution_id, .. } => execution_id,
        }
    }

    /// Stage name for logs.
    pub fn stage(&self) -> &'static str {
        match self {
            FanoutTask::NotifyPersona { .. } => "notify-persona",
            FanoutTask::SendEmail { .. } => "send-email",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_common::{DiscoveryCategory, DiscoveryStatus, Severity};
    use chrono::Utc;

    fn snapshot(id: Uuid) -> Discovery {
        Discovery {
            id,
            title: "Zone 2 running warm".into(),
            category: DiscoveryCategory::Comfort,
            severity: Severity::Advisory,
            confidence: 0.7,
            reasoning: "space temp above setpoint".into(),
            evidence: serde_json::json!({}),
            recipients: vec![],
            status: DiscoveryStatus::New,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn idempotency_keys_are_stable() {
        let discovery_id = Uuid::new_v4();
        let task = FanoutTask::NotifyPersona {
            execution_id: "exec-1".into(),
            discovery_id,
            recipient: Recipient {
                persona_name: "facilities".into(),
                role: "facilities manager".into(),
            },
            discovery_snapshot: snapshot(discovery_id),
        };
        assert_eq!(
            task.idempotency_key(),
            format!("persona-{discovery_id}-facilities")
        );

        let notification_id = Uuid::new_v4();
        let task = FanoutTask::SendEmail {
            execution_id: "exec-1".into(),
            notification_id,
            persona_name: "facilities".into(),
            subject: "s".into(),
            body_text: "t".into(),
            body_html: "<p>t</p>".into(),
        };
        assert_eq!(task.idempotency_key(), format!("email-{notification_id}"));
    }

    #[test]
    fn tasks_round_trip_through_serde() {
        let discovery_id = Uuid::new_v4();
        let task = FanoutTask::NotifyPersona {
            execution_id: "exec-1".into(),
            discovery_id,
            recipient: Recipient {
                persona_name: "energy".into(),
                role: "energy analyst".into(),
            },
            discovery_snapshot: snapshot(discovery_id),
        };
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains(r#""type":"notify_persona""#));
        let back: FanoutTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back.idempotency_key(), task.idempotency_key());
    }
}
