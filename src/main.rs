//! relayd entry point.
//!
//! Loads the configuration file, starts the service manager, and drives the
//! signal loop: SIGINT/SIGTERM shut down gracefully, SIGHUP reloads the
//! configuration file and applies it as a new snapshot.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relayd::{config, ServiceManager};

/// Multi-service TCP/UDP relay with sequential backend failover.
#[derive(Debug, Parser)]
#[command(name = "relayd", version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long, default_value = "relayd.yaml")]
    config: PathBuf,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(config = %cli.config.display(), "relayd starting");

    let snapshot = config::load_config(&cli.config)?;

    let mut manager = ServiceManager::new();
    manager.apply(&snapshot).await;

    if manager.running() == 0 {
        anyhow::bail!("no service could be started");
    }

    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!(config = %cli.config.display(), "received SIGHUP, reloading configuration");
                match config::load_config(&cli.config) {
                    Ok(snapshot) => manager.apply(&snapshot).await,
                    Err(e) => {
                        error!(error = %format!("{e:#}"), "reload failed, keeping current configuration");
                    }
                }
            }
        }
    }

    manager.shutdown().await;
    info!("shutdown complete");

    Ok(())
}
