//! Stale tenant sweeper.
//!
//! Runs the cleanup loop against the configured database until interrupted.
//! Pass `--once` to run a single sweep and exit.

use anyhow::Context;
use mailchat_infra::{CleanupSweeper, PostgresTenantStore, StoreConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mailchat_observability::init();

    let once = std::env::args().skip(1).any(|arg| arg == "--once");

    let config = StoreConfig::from_env().context("loading tenant store configuration")?;
    tracing::info!(config = ?config, "starting tenant sweeper");

    let store = PostgresTenantStore::connect(&config)
        .await
        .context("connecting to the tenant database")?;

    if once {
        let dropped = CleanupSweeper::sweep_once(&store, config.cleanup.age_threshold).await?;
        tracing::info!(dropped, "single sweep finished");
        store.close().await;
        return Ok(());
    }

    let handle = CleanupSweeper::spawn(store.clone(), config.cleanup.clone());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");

    let stats = handle.stats();
    handle
        .shutdown()
        .await
        .context("cleanup sweeper task failed")?;
    tracing::info!(
        runs = stats.runs,
        dropped_total = stats.dropped_total,
        failures = stats.failures,
        "tenant sweeper stopped"
    );

    store.close().await;
    Ok(())
}
