use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use atrium_common::Config;
use atrium_ingest::{BatchValidator, IngestListener, StdinSource, ValidatorConfig};
use atrium_store::PgStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("atrium=info".parse()?))
        .init();

    info!("Atrium ingest listener starting...");

    let config = Config::ingest_from_env();
    config.log_redacted();

    let store = Arc::new(PgStore::connect(&config.database_url).await?);
    store.migrate().await?;

    let validator = BatchValidator::new(store.clone(), store.clone(), ValidatorConfig::default());
    let listener = IngestListener::new(validator, Duration::from_secs(config.ingest_window_secs));

    // Batches arrive as newline-delimited JSON on stdin, piped from the
    // broker subscriber for the configured topic.
    let mut source = StdinSource::new();
    let stats = listener.run(&mut source).await?;
    info!(%stats, topic = config.ingest_topic.as_str(), "Ingest invocation finished");
    Ok(())
}
