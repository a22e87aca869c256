//! distribusd — runs one distribus host.

use anyhow::{Context, Result};

use distribus::{Host, HostOptions, MESSAGE};
use distribus_core::config::DistribusConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = DistribusConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = DistribusConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        DistribusConfig::default()
    });

    let host = Host::new();
    host.config(HostOptions::from(&config.network))?;
    tracing::info!(network_id = ?host.network_id(), "distribusd starting");

    let url = host
        .listen(&config.host.address, config.host.port)
        .await
        .with_context(|| format!("failed to listen on {}:{}", config.host.address, config.host.port))?;
    tracing::info!(%url, "host ready");

    for url in &config.host.join {
        match host.join(url).await {
            Ok(()) => tracing::info!(%url, "joined"),
            Err(e) => tracing::warn!(%url, error = %e, "failed to join"),
        }
    }

    for id in &config.host.peers {
        let peer = host.create(id.as_str())?;
        let name = id.clone();
        peer.on(MESSAGE, move |sender, message| {
            tracing::info!(peer = %name, from = sender, message = %message, "message received");
        });
        tracing::info!(peer = %id, "peer created");
    }

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received");

    host.close().await;
    tracing::info!(connections = ?host.connections(), "distribusd stopped");
    Ok(())
}
