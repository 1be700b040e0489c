//! usb-remote Server
//!
//! Device-sharing server that runs on a Raspberry Pi or other Linux host.
//! Exports locally attached USB devices to usb-remote clients over USB/IP.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use server::{ServerConfig, registry_from_config};
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "usb-remote-server")]
#[command(
    author,
    version,
    about = "usb-remote server - Share local USB devices over USB/IP"
)]
#[command(long_about = "
Answers list/find/attach/detach requests from usb-remote clients and binds
devices to usbip-host so they can be attached remotely.

EXAMPLES:
    # Run with default config
    usb-remote-server

    # Run with custom config
    usb-remote-server --config /path/to/config.toml

    # List USB devices without starting server
    usb-remote-server --list-devices

    # Listen on a specific interface and port
    usb-remote-server --host 192.168.1.30 --port 5001

    # Run with debug logging
    usb-remote-server --log-level debug

CONFIGURATION:
    The server looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-remote/server.toml
    3. /etc/usb-remote/server.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Address to listen on (overrides config)
    #[arg(long, value_name = "ADDR")]
    host: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ServerConfig::default();
        let path = ServerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        ServerConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ServerConfig::load_or_default()
    };

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.server.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-remote Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.list_devices {
        return list_devices_mode(&config).await;
    }

    run_service(config).await
}

/// List USB devices and exit
async fn list_devices_mode(config: &ServerConfig) -> Result<()> {
    info!("Listing USB devices...");

    let registry = registry_from_config(config);
    let devices = registry
        .enumerate()
        .await
        .context("Failed to enumerate devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        println!("Found {} USB device(s):\n", devices.len());
        for device in devices {
            let bound = if registry.is_bound(&device.bus_id).await {
                " (bound)"
            } else {
                ""
            };
            println!("  {}{}", device, bound);
        }
    }

    Ok(())
}

/// Serve until Ctrl+C
async fn run_service(config: ServerConfig) -> Result<()> {
    info!("Press Ctrl+C to shutdown");

    server::serve(&config, async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
            Err(e) => error!("Error waiting for Ctrl+C: {}", e),
        }
    })
    .await?;

    info!("Server shutdown complete");
    Ok(())
}
