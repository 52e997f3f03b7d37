//! Meeting relay
//!
//! Usage: `locus-relay [config.toml]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use locus_relay::{config::RelayConfig, relay::RelayServer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Locus relay");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = RelayConfig::load(config_path.as_deref()).context("loading relay configuration")?;

    tracing::info!(
        "Identity: {:?}, framing: {:?}, liveness TTL {} ms",
        config.relay.identity,
        config.relay.framing,
        config.relay.liveness_ttl_ms
    );

    let server = RelayServer::bind(config).await.context("binding relay sockets")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received");
        }
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await?;
    Ok(())
}
