//! wled-discovery daemon - Main entry point
//!
//! Finds WLED devices by subnet scan and mDNS, keeps them in a device
//! store, and serves the store over REST and WebSocket.

mod api;
mod config;
mod server;
mod state;
mod ws;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "wled-discovery")]
#[command(about = "WLED device discovery and verification daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "wled-discovery.toml")]
    config: PathBuf,

    /// Bind address for web server
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Scan a network spec (CIDR, range, wildcard, or address), print the results and exit
    #[arg(long, value_name = "SPEC")]
    scan: Option<String>,

    /// Disable passive mDNS discovery
    #[arg(long)]
    no_mdns: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("wled-discovery v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(&args.config)?;

    if let Some(bind) = args.bind {
        config.daemon.bind = bind;
    }
    // A one-shot scan never needs the listener
    if args.no_mdns || args.scan.is_some() {
        config.discovery.mdns_enabled = false;
    }

    info!(
        store = %config.daemon.store_path,
        mdns = config.discovery.mdns_enabled,
        "Configuration loaded"
    );

    let state = state::AppState::new(config.clone()).await?;

    if let Some(spec) = args.scan {
        info!(spec = %spec, "Running single subnet scan");
        let total = state.scanner.start_scan(&spec).await?;
        let progress = state.scanner.wait().await;

        println!(
            "Checked {} of {} addresses, found {} WLED devices:",
            progress.checked,
            total,
            progress.found.len()
        );
        for device in &progress.found {
            println!(
                "  - {} at {}",
                device.display_name.as_deref().unwrap_or("?"),
                device.address
            );
            if let Some(version) = &device.firmware_version {
                println!("    Firmware: {}", version);
            }
            if let Some(brand) = &device.brand {
                println!("    Brand: {}", brand);
            }
        }
    } else {
        server::run(state, &config.daemon.bind, config.daemon.tls.as_ref()).await?;
    }

    Ok(())
}
