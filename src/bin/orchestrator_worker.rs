//! Orchestrator Worker Binary
//!
//! Runs the poll loop against the configured PostgreSQL queue until Ctrl-C.
//! Configuration comes from `config/orchestrator.toml` plus `ORCHESTRATOR__*`
//! environment overrides; a `.env` file is loaded first when present.

use anyhow::Context;
use resume_orchestrator::config::ConfigManager;
use resume_orchestrator::logging::init_structured_logging;
use resume_orchestrator::Orchestrator;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_manager = ConfigManager::load().context("loading configuration")?;
    init_structured_logging(config_manager.environment());

    let orchestrator = Orchestrator::from_config(config_manager)
        .await
        .context("initializing orchestrator")?;
    let worker = orchestrator.worker();
    info!(worker_id = worker.worker_id(), "Starting orchestrator worker");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(async move {
        let result = worker.run(shutdown_rx).await;
        (worker.stats(), result)
    });

    signal::ctrl_c().await.context("listening for shutdown signal")?;
    info!("Shutdown signal received; finishing in-flight batch");
    let _ = shutdown_tx.send(true);

    let (stats, result) = run.await.context("worker task panicked")?;
    if let Err(e) = &result {
        error!(error = %e, "Worker stopped with error");
    }
    info!(
        batches = stats.batches,
        completed = stats.completed,
        retried = stats.retried,
        failed = stats.failed,
        stale = stats.stale,
        "Orchestrator worker stopped"
    );

    result.map_err(Into::into)
}
