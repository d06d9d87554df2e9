#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use prahari::config::AuthConfig;
use prahari::server::run_listener;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "prahari", about = "Local Auth issuing IoT session keys")]
struct Cli {
    /// Path to the Auth configuration file.
    #[arg(long, default_value = "prahari.json")]
    config: PathBuf,
    /// Overrides the configured listen address.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = AuthConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let listen_addr = cli.listen.unwrap_or_else(|| config.listen_addr.clone());

    let ctx = config
        .build_context()
        .with_context(|| format!("failed to assemble Auth {}", config.auth_id))?;

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(auth_id = ctx.auth_id, %listen_addr, "accepting entity connections");

    run_listener(Arc::new(ctx), listener)
        .await
        .context("listener terminated")
}
