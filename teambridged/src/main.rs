//! teambridged: worker daemon bridging a team lead to an external CLI agent.
//!
//! One process per worker: a cooperative poll loop over the shared teams
//! directory. Claims tasks under advisory locks, runs the provider CLI with
//! a hard timeout, reports through the worker's outbox, and answers
//! shutdown/drain requests from the lead.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal as unix_signal, SignalKind as UnixSignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use teambridged::config::BridgeConfig;
use teambridged::runtime::Bridge;

#[derive(Parser, Debug)]
#[command(name = "teambridged", version)]
#[command(about = "Team bridge worker daemon")]
struct Cli {
    /// Path to the bridge configuration (JSON)
    #[arg(long)]
    config: PathBuf,

    /// Override the configured team name
    #[arg(long)]
    team: Option<String>,

    /// Override the configured worker name
    #[arg(long)]
    worker: Option<String>,

    /// Override the configured working directory
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut config = BridgeConfig::load(&cli.config)?;
    if let Some(team) = cli.team {
        config.team_name = team;
    }
    if let Some(worker) = cli.worker {
        config.worker_name = worker;
    }
    if let Some(working_dir) = cli.working_dir {
        config.working_directory = working_dir;
    }
    config.validate().context("invalid bridge configuration")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx);

    let bridge = Bridge::new(config, shutdown_rx)?;
    bridge.run().await
}

/// SIGINT/SIGTERM flip the shutdown flag; the loop (and any running child)
/// picks it up and cleans up best-effort before exiting.
fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm = match unix_signal(UnixSignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("stop signal received");
        let _ = shutdown_tx.send(true);
        // Keep the sender alive so a dropped channel never masquerades as
        // a shutdown.
        std::future::pending::<()>().await;
    });
}
