use thiserror::Error;

/// Domain failures with a stable message shape. Orchestration code carries
/// these inside `anyhow::Error` and adds context as they bubble up.
#[derive(Error, Debug)]
pub enum AtriumError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Email delivery error: {0}")]
    Email(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
