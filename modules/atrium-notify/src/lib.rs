//! Discovery fan-out: one discovery becomes N per-persona notifications and
//! emails, as chained idempotent tasks on a queue seam. Every stage is
//! retryable in isolation; a repeat of any task collapses on the
//! `(discovery_id, persona_name)` upsert instead of double-notifying.

pub mod compose;
pub mod coordinator;
pub mod mailer;
pub mod queue;
pub mod tasks;

pub use compose::{ComposedMessage, LlmComposer, NotificationComposer};
pub use coordinator::{FanoutCoordinator, RetryPolicy};
pub use mailer::{EmailSender, SmtpMailer};
pub use queue::{Fanout, FanoutService, FanoutStats, InProcessQueue, TaskQueue};
pub use tasks::FanoutTask;
