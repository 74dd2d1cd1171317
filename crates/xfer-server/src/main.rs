//! Transfer Engine Server
//!
//! Main entry point: loads the configuration, seeds an in-memory node
//! store, and runs transfer discovery until interrupted.

mod runtime;

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use xfer_config::Configuration;

use crate::runtime::EngineRuntime;

/// Environment variable naming the config directory
const CONFIG_DIR_ENV: &str = "XFER_CONFIG_DIR";

fn config_dir() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_DIR_ENV).ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config_dir = config_dir();
    let config = Configuration::load(&config_dir)
        .with_context(|| format!("Failed to load configuration from {}", config_dir.display()))?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(config_dir = %config_dir.display(), "Starting transfer engine");

    let runtime = EngineRuntime::build(&config).await?;
    runtime.start();

    info!(
        nodes = runtime.store().node_count(),
        pulses = runtime.bridge_count(),
        "Transfer engine is running"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    runtime.shutdown().await;

    Ok(())
}
