//! gangwayd: the Gangway daemon.
//!
//! Single binary that assembles all Gangway subsystems:
//! - State store (redb)
//! - In-memory capacity oracle over the configured node inventory
//! - Group registry, one evaluation loop per queue, timeout supervisor
//! - Status snapshot for `gangctl`
//!
//! # Usage
//!
//! ```text
//! gangwayd run --config gangway.toml --data-dir /var/lib/gangway --manifest workloads.toml
//! ```

mod manifest;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info, warn};

use gangway_core::{GangwayConfig, SystemClock};
use gangway_placement::oracle_from_config;
use gangway_scheduler::GangScheduler;
use gangway_state::StateStore;

use crate::manifest::Manifest;

#[derive(Parser)]
#[command(name = "gangwayd", about = "Gangway gang scheduling daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run every queue loop and the timeout supervisor until Ctrl-C.
    Run {
        /// Configuration file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for the state store and status snapshot.
        #[arg(long, default_value = "/var/lib/gangway")]
        data_dir: PathBuf,

        /// Groups and requests to register at startup.
        #[arg(long)]
        manifest: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,gangway=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            manifest,
            log_format,
        } => {
            init_tracing(log_format);
            run(config.as_deref(), &data_dir, manifest.as_deref()).await
        }
    }
}

async fn run(config_path: Option<&Path>, data_dir: &Path, manifest: Option<&Path>) -> anyhow::Result<()> {
    info!("Gangway daemon starting");

    let config = match config_path {
        Some(path) => GangwayConfig::from_file(path)?,
        None => GangwayConfig::default(),
    };

    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("gangway.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    if config.nodes.is_empty() {
        warn!("no [[nodes]] configured; every group will wait for capacity");
    }
    let oracle = Arc::new(oracle_from_config(&config.nodes));
    info!(nodes = config.nodes.len(), "capacity oracle initialized");

    let scheduler = Arc::new(
        GangScheduler::new(config, store, oracle, Arc::new(SystemClock))?
            .with_status_file(data_dir.join("status.json")),
    );

    scheduler.restore().await?;

    if let Some(path) = manifest {
        register_manifest(&scheduler, &Manifest::from_file(path)?).await;
    }
    scheduler.publish_status()?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = scheduler.spawn(shutdown_rx);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C");
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    scheduler.publish_status()?;

    info!("Gangway daemon stopped");
    Ok(())
}

/// Register every manifest request. Rejected registrations are logged
/// and skipped.
async fn register_manifest(scheduler: &GangScheduler, manifest: &Manifest) -> usize {
    let mut registered = 0;
    for (spec, request) in manifest.registrations() {
        let request_id = request.id.clone();
        match scheduler.register_member(&spec, request).await {
            Ok(_) => registered += 1,
            Err(e) => warn!(group = %spec.id, request = %request_id, error = %e, "registration rejected"),
        }
    }
    info!(
        groups = manifest.groups.len(),
        requests = registered,
        "manifest registered"
    );
    registered
}
