//! Backhaul agent binary
//!
//! Registers a domain against a backhaul server and keeps answering
//! tickets until stopped. Reconnects automatically when the server drops
//! the control channel.

use anyhow::{Context, Result};
use backhaul_agent::{run_with_reconnect, AgentConfig};
use clap::Parser;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Reverse tunnel agent - publish a local service through a backhaul server
#[derive(Parser, Debug)]
#[command(name = "backhaul-agent")]
#[command(about = "Reverse tunnel agent - publish a local service through a backhaul server")]
#[command(version)]
struct Args {
    /// Manager endpoint, e.g. wss://relay.example.com:8081
    #[arg(long, short = 's', env = "BACKHAUL_SERVER")]
    server: String,

    /// Domain to register
    #[arg(long, short = 'd', env = "BACKHAUL_DOMAIN")]
    domain: String,

    /// Authentication token
    #[arg(long, short = 't', env = "BACKHAUL_TOKEN")]
    token: Option<String>,

    /// Local address to forward tunneled connections to
    #[arg(long, env = "BACKHAUL_TARGET", default_value = "127.0.0.1:80")]
    target: String,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long)]
    insecure: bool,

    /// Maximum reconnection attempts (0 = infinite)
    #[arg(long, default_value = "0")]
    max_reconnect_attempts: usize,

    /// Initial reconnection delay in seconds
    #[arg(long, default_value = "1")]
    reconnect_delay: u64,

    /// Maximum reconnection delay in seconds
    #[arg(long, default_value = "60")]
    max_reconnect_delay: u64,

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

    let config = AgentConfig {
        server_url: args.server.clone(),
        domain: args.domain.clone(),
        token: args.token,
        target_addr: args.target.clone(),
        insecure: args.insecure,
    };

    info!(
        "registering {} at {}, forwarding to {}",
        args.domain, args.server, args.target
    );

    let session = tokio::spawn(run_with_reconnect(
        config,
        args.max_reconnect_attempts,
        Duration::from_secs(args.reconnect_delay),
        Duration::from_secs(args.max_reconnect_delay),
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
        result = session => {
            result
                .context("agent task panicked")?
                .context("agent stopped")?;
        }
    }

    Ok(())
}
