//! weftd — the weft channel fabric daemon.

use anyhow::{Context, Result};

use weft_core::config::FabricConfig;
use weft_fabric::Fabric;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = FabricConfig::load().context("failed to load configuration")?;

    // Optional positional override: weftd <local-port>
    if let Some(arg) = std::env::args().nth(1) {
        config.network.local_port = arg.parse().context("invalid port argument")?;
        config.normalize();
    }

    if config.network.host.is_empty() {
        config.network.host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
    }

    let fabric = Fabric::new(config);
    fabric.start().await?;

    tracing::info!(
        "serving channel fabric at ws://localhost:{}/ (tunnel port {})",
        fabric.local_port(),
        fabric.proxy_port()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");
    fabric.stop().await;

    Ok(())
}
