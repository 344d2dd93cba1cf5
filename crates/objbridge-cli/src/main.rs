//! objbridge-gateway
//!
//! Serves a demo entry point over the object bridge until the peer sends
//! `shutdown` or the process receives Ctrl-C.
//!
//! Usage: `objbridge-gateway [config.json]`

mod demo;

use anyhow::{Context, Result};
use objbridge_server::{Gateway, GatewayConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args: Vec<String> = std::env::args().collect();
    let config = match args.get(1) {
        Some(path) => GatewayConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => GatewayConfig::default(),
    }
    .with_env_overrides();

    info!(
        "Starting objbridge-gateway on {} (callbacks: {})",
        config.address,
        config.callback_address.as_deref().unwrap_or("disabled")
    );

    let gateway = Gateway::start(config, demo::types(), Arc::new(demo::DemoEntryPoint))
        .await
        .context("Failed to start gateway")?;

    tokio::select! {
        _ = gateway.wait() => info!("Gateway stopped by peer"),
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            gateway.shutdown().await;
        }
    }

    Ok(())
}
