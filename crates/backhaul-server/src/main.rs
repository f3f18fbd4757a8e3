//! Backhaul server binary

use anyhow::{Context, Result};
use backhaul_server::{Server, ServerConfig};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Reverse tunnel server - expose services running behind NAT
#[derive(Parser, Debug)]
#[command(name = "backhaul-server")]
#[command(about = "Reverse tunnel server - expose services running behind NAT")]
#[command(version)]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', env = "BACKHAUL_CONFIG")]
    config: Option<PathBuf>,

    /// Public listener address, where tunneled requests arrive
    #[arg(long, short = 'p', env = "BACKHAUL_PROXY_ADDR")]
    proxy_addr: Option<String>,

    /// Manager listener address, where agents connect
    #[arg(long, short = 'm', env = "BACKHAUL_MANAGER_ADDR")]
    manager_addr: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    config.apply_overrides(args.proxy_addr, args.manager_addr);

    let handle = Server::start(config)
        .await
        .context("Failed to start server")?;
    info!(
        "backhaul ready: proxy on {}, manager on {}",
        handle.proxy_addr, handle.manager_addr
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("received ctrl-c, shutting down");
    handle.shutdown().await;

    Ok(())
}
