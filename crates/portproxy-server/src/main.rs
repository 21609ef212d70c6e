//! portproxy: dynamic TCP/UDP port forwarder.
//!
//! Listens on externally reachable ports and relays traffic to internally
//! addressed services, subject to source-IP access control. Mappings come
//! from `config.json` at startup and can be added and removed at runtime
//! from the interactive console.

mod console;
mod forward;
mod public_ip;

use anyhow::Context;
use clap::Parser;
use forward::{ForwardContext, MappingRegistry, Terminator};
use portproxy_core::{AccessController, Configuration};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info};

/// portproxy: dynamic TCP/UDP port forwarder
#[derive(Parser, Debug)]
#[command(name = "portproxy", version, about = "Dynamic TCP/UDP port forwarder")]
struct Cli {
    /// Config file path (default: ./config.json, then ~/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use this address as the host's public IP instead of looking it up
    #[arg(long, conflicts_with = "no_ip_lookup")]
    own_ip: Option<IpAddr>,

    /// Skip public IP discovery; the own-IP rule never matches
    #[arg(long)]
    no_ip_lookup: bool,

    /// Service that returns the caller's public IP as plain text
    #[arg(long, default_value = public_ip::DEFAULT_LOOKUP_URL)]
    ip_lookup_url: String,

    /// Override the configured listen address
    #[arg(long)]
    listen_address: Option<IpAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting portproxy");

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }

    info!("portproxy stopped");
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let (config, source) =
        Configuration::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(path) = &source {
        info!(path = %path.display(), mappings = config.mappings.len(), "config loaded");
    }
    let planned = config
        .plan_mappings()
        .context("invalid mapping in config")?;

    let own_ip = match (cli.own_ip, cli.no_ip_lookup) {
        (Some(ip), _) => Some(ip),
        (None, true) => None,
        (None, false) => public_ip::discover_or_warn(&cli.ip_lookup_url).await,
    };
    if let Some(ip) = own_ip {
        info!(own_ip = %ip, "own public ip");
    }

    let access = AccessController::new(&config.access_policy(), own_ip);
    let listen_address = cli.listen_address.unwrap_or(config.listen_address);
    let ctx = ForwardContext::new(access, Terminator::spawn(), listen_address);
    let mut registry = MappingRegistry::new(ctx);

    let started = registry.add_planned(planned).await;
    info!(started, "configured mappings started");

    console::run(&mut registry, shutdown_signal())
        .await
        .context("console failed")?;

    registry.close_all().await.context("failed to close mappings")?;
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
