//! Orchestrator worker binary
//!
//! Loads configuration, connects the durable store, recovers steps left
//! running by a previous process, then runs the step worker pool, the sweep
//! loop and the automation poller until SIGINT or SIGTERM.

use anyhow::Context;
use std::sync::Arc;
use task_orchestrator::executor::{EchoExecutor, ExecutorRegistry};
use task_orchestrator::model::AgentType;
use task_orchestrator::shutdown::ShutdownCoordinator;
use task_orchestrator::{Orchestrator, OrchestratorConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OrchestratorConfig::load_default().context("failed to load configuration")?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        version = task_orchestrator::version(),
        database = %config.database.url,
        max_concurrent_steps = config.scheduler.max_concurrent_steps,
        "Starting orchestrator worker"
    );

    // Deployments register their own executors; the echo executor keeps a
    // bare worker runnable for smoke tests.
    let registry = ExecutorRegistry::new().with(AgentType::custom("echo"), Arc::new(EchoExecutor));

    let orchestrator = Arc::new(
        Orchestrator::connect(config, registry)
            .await
            .context("failed to connect the durable store")?,
    );

    let recovered = orchestrator
        .recover_running()
        .await
        .context("startup recovery failed")?;
    tracing::info!(recovered = recovered, "Startup recovery finished");

    let shutdown = ShutdownCoordinator::new();
    let signals = shutdown.install_signal_handlers();

    let workers = orchestrator.spawn_workers(shutdown.clone());
    let sweeper = orchestrator.spawn_sweeper(shutdown.clone());
    let poller = orchestrator.spawn_automation_poller(shutdown.clone());

    shutdown.wait_for_shutdown().await;
    tracing::info!("Waiting for background loops to stop");

    let (workers, sweeper, poller) = tokio::join!(workers, sweeper, poller);
    for (name, result) in [("workers", workers), ("sweeper", sweeper), ("poller", poller)] {
        if let Err(e) = result {
            tracing::error!(task = name, error = %e, "Background loop panicked");
        }
    }
    signals.abort();

    orchestrator.database().clone().close().await;
    tracing::info!("Orchestrator worker stopped");
    Ok(())
}
