use std::env;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Postgres
    pub database_url: String,

    // LLM provider
    pub anthropic_api_key: String,
    pub analysis_model: String,

    // SMTP delivery
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub smtp_from: String,

    // Ingestion
    pub ingest_topic: String,
    /// How long one listener invocation stays alive before self-terminating.
    pub ingest_window_secs: u64,
}

impl Config {
    /// Load full configuration. Panics with a clear message if required
    /// vars are missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            anthropic_api_key: required_env("ANTHROPIC_API_KEY"),
            analysis_model: env::var("ANALYSIS_MODEL")
                .unwrap_or_else(|_| "claude-haiku-4-5".to_string()),
            smtp_host: required_env("SMTP_HOST"),
            smtp_port: env::var("SMTP_PORT")
                .unwrap_or_else(|_| "587".to_string())
                .parse()
                .expect("SMTP_PORT must be a number"),
            smtp_username: required_env("SMTP_USERNAME"),
            smtp_password: required_env("SMTP_PASSWORD"),
            smtp_from: required_env("SMTP_FROM"),
            ingest_topic: env::var("INGEST_TOPIC")
                .unwrap_or_else(|_| "dt/building/hvac/measuredvalue".to_string()),
            ingest_window_secs: env::var("INGEST_WINDOW_SECS")
                .unwrap_or_else(|_| "55".to_string())
                .parse()
                .expect("INGEST_WINDOW_SECS must be a number"),
        }
    }

    /// Minimal config for the ingestion listener (no LLM or SMTP needed).
    pub fn ingest_from_env() -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            anthropic_api_key: String::new(),
            analysis_model: String::new(),
            smtp_host: String::new(),
            smtp_port: 587,
            smtp_username: String::new(),
            smtp_password: String::new(),
            smtp_from: String::new(),
            ingest_topic: env::var("INGEST_TOPIC")
                .unwrap_or_else(|_| "dt/building/hvac/measuredvalue".to_string()),
            ingest_window_secs: env::var("INGEST_WINDOW_SECS")
                .unwrap_or_else(|_| "55".to_string())
                .parse()
                .expect("INGEST_WINDOW_SECS must be a number"),
        }
    }

    /// Log the config with secrets redacted.
    pub fn log_redacted(&self) {
        tracing::info!(
            model = self.analysis_model.as_str(),
            smtp_host = self.smtp_host.as_str(),
            ingest_topic = self.ingest_topic.as_str(),
            ingest_window_secs = self.ingest_window_secs,
            "Config loaded"
        );
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}
