//! Claim engine node binary

use anyhow::Context;
use claim_core::{ClaimEngine, Config, Error, Ledgers, RoleRegistry};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    // CLAIMS_LOG_JSON=1 switches to structured output
    if std::env::var("CLAIMS_LOG_JSON").is_ok_and(|v| v == "1") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!("Starting claim engine node");

    let config = match std::env::var("CLAIMS_CONFIG") {
        Ok(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => Config::from_env().context("loading config from environment")?,
    };
    tracing::debug!(config = %serde_json::to_string(&config)?, "Configuration loaded");

    let engine = ClaimEngine::open(config, Ledgers::new(), Arc::new(RoleRegistry::new()))
        .await
        .context("opening claim engine")?;

    match engine.initialize_factory().await {
        Ok(record) => tracing::info!(factory = %record.identity, "Factory initialized"),
        Err(Error::AlreadyInitialized(_)) => {
            tracing::info!(factory = %engine.factory_identity(), "Factory already initialized")
        }
        Err(e) => return Err(e.into()),
    }

    let stats = engine.stats()?;
    tracing::info!(
        instances = stats.total_instances,
        events = stats.total_events,
        "Claim engine ready"
    );

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down claim engine node");
    engine.shutdown().await?;
    Ok(())
}
