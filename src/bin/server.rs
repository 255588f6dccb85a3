//! Voice-agent server binary.
//!
//! Binds the media-stream WebSocket ingress and hosts one call session per
//! stream. Configuration comes from the TOML file given as the first
//! argument (falling back to the default path), with API keys overridable
//! from the environment.

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;

use lark::config::AgentConfig;
use lark::server::{AppState, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config =
        AgentConfig::load(config_path.as_deref()).context("loading configuration")?;
    if let Err(e) = config.validate() {
        // Still serves; sessions without working providers apologize and close.
        tracing::warn!("configuration incomplete: {e}");
    }

    let config = Arc::new(config);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("lark voice agent listening on {addr}");

    axum::serve(listener, router(AppState::new(config)))
        .await
        .context("serving media streams")?;
    Ok(())
}
