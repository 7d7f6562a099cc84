//! Blueprint Watcher - Main entry point

use anyhow::{Context, Result};
use blueprint_watcher::api::{ApiSession, DiscoveryClient, RevisionPoller};
use blueprint_watcher::backup::BackupInvoker;
use blueprint_watcher::config::{Config, Credentials};
use blueprint_watcher::daemon::ShutdownCoordinator;
use blueprint_watcher::inventory::InventoryStore;
use blueprint_watcher::orchestrator::{Orchestrator, OrchestratorSettings};
use blueprint_watcher::state::StateStore;
use blueprint_watcher::transfer::TransferClient;
use blueprint_watcher::utils;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config/config.toml")]
    config: PathBuf,

    /// Environment file with credentials (defaults to ./.env when present)
    #[arg(long, value_name = "FILE")]
    env_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Discovery interval in seconds (overrides config)
    #[arg(long, value_name = "SECS")]
    discovery_interval: Option<u64>,

    /// Run one discovery and one poll cycle, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    let _log_guard = utils::logger::init(log_level, config.log.file.as_deref())?;

    tracing::info!(
        "Starting blueprint-watcher v{} (config: {})",
        env!("CARGO_PKG_VERSION"),
        args.config.display()
    );

    config.credentials = Credentials::from_env(args.env_file.as_deref())?;
    config.validate()?;

    // The document is written back on inventory changes, so it is captured
    // before command-line overrides are applied.
    let inventory_store = InventoryStore::new(&args.config, config.clone());

    let mut settings = OrchestratorSettings::from_config(&config);
    if let Some(secs) = args.discovery_interval.filter(|s| *s > 0) {
        settings.discovery_interval = Duration::from_secs(secs);
    }

    let session = Arc::new(ApiSession::new(&config.api, &config.credentials)?);
    let state = StateStore::open(&config.state.file_path, config.state.max_backups)?;
    let transfer = TransferClient::from_config(&config.transfer, &config.credentials.remote)?;
    let invoker = BackupInvoker::new(config.backup.clone());

    let orchestrator = Arc::new(Orchestrator::new(
        DiscoveryClient::new(session.clone()),
        RevisionPoller::new(session),
        inventory_store,
        state,
        invoker,
        transfer,
        settings,
    ));

    if args.once {
        let discovery = orchestrator.discovery_cycle().await;
        if let Err(e) = &discovery {
            tracing::error!("Discovery failed: {}", e);
        }
        let report = orchestrator.poll_cycle().await;
        for (id, outcome) in &report.outcomes {
            tracing::info!(blueprint_id = %id, "{:?}", outcome);
        }
        discovery?;
        return Ok(());
    }

    // Create shutdown coordinator
    let shutdown_coordinator = ShutdownCoordinator::new();
    let orchestrator_handle = tokio::spawn(orchestrator.run(shutdown_coordinator.token()));

    // Wait for shutdown signal
    shutdown_coordinator.wait_for_signal().await;

    match orchestrator_handle.await {
        Ok(()) => tracing::info!("Shutdown complete"),
        Err(e) => tracing::error!("Orchestrator task panicked: {}", e),
    }

    Ok(())
}
