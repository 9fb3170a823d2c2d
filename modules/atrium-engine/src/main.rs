use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use atrium_common::{Config, Recipient};
use atrium_engine::{
    AnalysisCycle, CycleLock, DedupConfig, LlmDiscoveryGenerator, SimilarityDeduplicator,
};
use atrium_notify::{FanoutCoordinator, FanoutService, LlmComposer, RetryPolicy, SmtpMailer};
use atrium_store::PgStore;
use llm_client::{BudgetEvent, ChatClient, ExecutorConfig, RateLimitBudget, RequestExecutor};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("atrium=info".parse()?))
        .init();

    info!("Atrium analysis engine starting...");

    let config = Config::from_env();
    config.log_redacted();

    let store = Arc::new(PgStore::connect(&config.database_url).await?);
    store.migrate().await?;

    let budget = Arc::new(RateLimitBudget::standard_tier());
    let executor = Arc::new(RequestExecutor::new(budget, ExecutorConfig::default()));
    log_budget_pressure(&executor);

    let roster = vec![
        Recipient {
            persona_name: "facilities".to_string(),
            role: "facilities manager".to_string(),
        },
        Recipient {
            persona_name: "energy".to_string(),
            role: "energy analyst".to_string(),
        },
        Recipient {
            persona_name: "operations".to_string(),
            role: "building operations lead".to_string(),
        },
    ];

    let generator = Arc::new(LlmDiscoveryGenerator::new(
        store.clone(),
        ChatClient::new(&config.anthropic_api_key),
        executor.clone(),
        &config.analysis_model,
        roster,
    ));

    let composer = Arc::new(LlmComposer::new(
        ChatClient::new(&config.anthropic_api_key),
        executor.clone(),
        &config.analysis_model,
    ));
    let mailer = Arc::new(SmtpMailer::from_config(&config)?);
    let coordinator = Arc::new(FanoutCoordinator::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        composer,
        mailer,
        RetryPolicy::default(),
    ));
    let fanout = Arc::new(FanoutService::new(coordinator));

    let cycle = AnalysisCycle::new(
        store.clone(),
        store.clone(),
        store.clone(),
        generator,
        fanout,
        CycleLock::new(store.clone()),
        SimilarityDeduplicator::new(DedupConfig::default()),
    );

    let outcome = cycle.run().await?;
    info!(outcome = %serde_json::to_string(&outcome)?, "Trigger handled");
    Ok(())
}

/// Surface budget pressure in the logs without touching the call path.
fn log_budget_pressure(executor: &Arc<RequestExecutor>) {
    let mut events = executor.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                BudgetEvent::ApproachingLimit(s) => info!(?s, "Approaching rate limit"),
                BudgetEvent::LimitHit(s) => info!(?s, "Rate limit hit"),
                BudgetEvent::LimitReset(s) => info!(?s, "Rate limit window reset"),
            }
        }
    });
}
