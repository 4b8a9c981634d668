//! tether - multiplayer session broker
//!
//! Binds the reliable and unreliable sockets and serves until Ctrl-C.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::Args;
use std::sync::Arc;
use tether_server::{BrokerServer, BrokerServices, FsFileStore};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting tether v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let config = args.resolve();
    if args.write_config {
        config
            .save_to_path(&args.config)
            .with_context(|| format!("Failed to write {}", args.config.display()))?;
        info!(path = %args.config.display(), "Wrote config");
        return Ok(());
    }

    let mut services = BrokerServices::default();
    if let Some(dir) = &config.data_dir {
        let store = FsFileStore::new(dir)
            .with_context(|| format!("Failed to open data directory {}", dir.display()))?;
        services.files = Some(Arc::new(store));
    }

    let server = BrokerServer::start(config, services).await?;
    info!(
        addr = %server.local_addr(),
        udp = ?server.udp_addr(),
        "Serving; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    server.shutdown().await
}
