//! Device plugin manager daemon

use anyhow::{Context, Result};
use clap::Parser;
use device_plugin_manager::Manager;
use device_plugin_manager_core::{Device, ManagerConfig, logging};
use std::path::PathBuf;
use tracing::info;

/// Device plugin manager - tracks devices advertised by node-local plugins
#[derive(Parser, Debug)]
#[command(name = "dpm-daemon")]
#[command(about = "Accepts device plugin registrations and tracks their devices")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Registration socket path (overrides the configuration file)
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn describe(devices: &[Device]) -> String {
    devices
        .iter()
        .map(|d| format!("{}({})", d.id, d.health))
        .collect::<Vec<_>>()
        .join(", ")
}

fn log_changes(resource_name: &str, added: &[Device], updated: &[Device], removed: &[Device]) {
    if !added.is_empty() {
        info!("{resource_name}: added {}", describe(added));
    }
    if !updated.is_empty() {
        info!("{resource_name}: updated {}", describe(updated));
    }
    if !removed.is_empty() {
        info!("{resource_name}: removed {}", describe(removed));
    }
}

async fn wait_for_signal() -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Failed to create SIGTERM handler")?;

        tokio::select! {
            result = ctrl_c => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received SIGINT (Ctrl+C)");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init(args.verbose);

    info!("Device plugin manager starting...");

    let mut config = match &args.config {
        Some(path) => {
            let config = ManagerConfig::load(path).context("Failed to load configuration")?;
            info!("Loaded config from: {}", path.display());
            config
        }
        None => ManagerConfig::default(),
    };
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }

    let manager = Manager::new(config, log_changes).context("Invalid manager configuration")?;
    manager
        .start()
        .await
        .context("Failed to start device plugin manager")?;

    let waited = wait_for_signal().await;
    manager.stop().await;
    waited?;

    info!("Device plugin manager shutdown complete");
    Ok(())
}
