mod cli;

use std::net::SocketAddr;

use anyhow::Context;
use beach_ring::{config::RelayConfig, serve};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to WARN level if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();

    if let Some(Commands::Listen {
        url,
        participant,
        count,
    }) = cli.command
    {
        return cli::run_listen(url, participant, count).await;
    }

    let mut config = RelayConfig::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    info!(
        "Starting Beach Ring relay on port {} (heartbeat timeout {:?})",
        config.port, config.heartbeat_timeout
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Beach Ring listening on {}", addr);

    serve(listener, config).await
}
