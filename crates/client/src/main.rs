//! usb-remote Client
//!
//! Command-line front end: lists, finds, attaches and detaches USB devices
//! shared by usb-remote servers, and can run a server itself.

use anyhow::{Context, Result, anyhow};
use clap::{Args as ClapArgs, Parser, Subcommand};
use client::{ClientConfig, ClientError, Dispatcher, HostResolver, PortRegistry};
use common::{UsbipTool, setup_logging};
use protocol::DeviceRequest;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-remote")]
#[command(author, version, about = "usb-remote - Attach USB devices from remote servers")]
#[command(long_about = "
Finds USB devices shared by usb-remote servers on the network and attaches
them locally over USB/IP.

EXAMPLES:
    # List devices on every configured server
    usb-remote list

    # Attach a Raspberry Pi Pico from whichever server has one
    usb-remote attach --id 2e8a:000a

    # Detach it again
    usb-remote detach --id 2e8a:000a

    # Show locally attached devices
    usb-remote ports

    # Run a server on this machine
    usb-remote server --port 5000

CONFIGURATION:
    The client looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-remote/client.toml
    3. /etc/usb-remote/client.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List devices on all servers, or on this machine with --local
    List {
        /// List devices attached to this machine instead
        #[arg(long, conflicts_with = "host")]
        local: bool,

        /// Only contact this server
        #[arg(long, value_name = "HOST")]
        host: Option<String>,
    },

    /// Find devices matching a filter
    Find {
        #[command(flatten)]
        filter: FilterArgs,

        /// Report a match from every server instead of stopping at the first
        #[arg(long)]
        all: bool,

        /// Only contact this server
        #[arg(long, value_name = "HOST")]
        host: Option<String>,
    },

    /// Bind a device on its server and attach it here
    Attach {
        #[command(flatten)]
        filter: FilterArgs,

        /// Fail if more than one server has a matching device
        #[arg(long)]
        unique: bool,

        /// Only contact this server
        #[arg(long, value_name = "HOST")]
        host: Option<String>,
    },

    /// Detach a device here and unbind it on its server
    Detach {
        #[command(flatten)]
        filter: FilterArgs,

        /// Fail if more than one server has a matching device
        #[arg(long)]
        unique: bool,

        /// Only contact this server
        #[arg(long, value_name = "HOST")]
        host: Option<String>,
    },

    /// Show remote devices attached to local ports
    Ports,

    /// Run a device server on this machine
    Server {
        /// Address to listen on
        #[arg(long, value_name = "ADDR")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, value_name = "PORT")]
        port: Option<u16>,
    },
}

#[derive(ClapArgs, Debug, Clone, Default)]
struct FilterArgs {
    /// Vendor:product id, e.g. 2e8a:000a
    #[arg(long, value_name = "VID:PID")]
    id: Option<String>,

    /// Bus id on the server, e.g. 1-1.1
    #[arg(long, value_name = "BUS")]
    bus: Option<String>,

    /// Serial number
    #[arg(long, value_name = "SERIAL")]
    serial: Option<String>,

    /// Substring of the device description (case-insensitive)
    #[arg(long, value_name = "TEXT")]
    desc: Option<String>,
}

impl FilterArgs {
    fn into_request(self, first: bool) -> DeviceRequest {
        DeviceRequest {
            id: self.id,
            bus: self.bus,
            serial: self.serial,
            description: self.desc,
            first,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ClientConfig::default();
        let path = ClientConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        ClientConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ClientConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.client.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-remote Client v{}", env!("CARGO_PKG_VERSION"));

    let Some(command) = args.command else {
        return Err(anyhow!("No command given, see `usb-remote --help`"));
    };

    match command {
        Command::List { local: true, .. } => list_local(&config).await,
        Command::List { host, .. } => list_remote(&config, host.as_deref()).await,
        Command::Find { filter, all, host } => {
            let dispatcher = dispatcher(&config, host.as_deref()).await;
            let matches = dispatcher
                .find(&filter.into_request(!all))
                .await
                .map_err(report)?;
            for found in matches {
                println!("{}", found);
            }
            Ok(())
        }
        Command::Attach {
            filter,
            unique,
            host,
        } => {
            let dispatcher = dispatcher(&config, host.as_deref()).await;
            let attached = dispatcher
                .attach(&filter.into_request(!unique))
                .await
                .map_err(report)?;
            println!("Attached {}", attached);
            Ok(())
        }
        Command::Detach {
            filter,
            unique,
            host,
        } => {
            let dispatcher = dispatcher(&config, host.as_deref()).await;
            let detached = dispatcher
                .detach(&filter.into_request(!unique))
                .await
                .map_err(report)?;
            println!("Detached {} from port {}", detached.device, detached.port);
            Ok(())
        }
        Command::Ports => list_ports(&config).await,
        Command::Server { host, port } => run_server(host, port).await,
    }
}

/// Resolve hosts for this command and build a dispatcher over them
async fn dispatcher(config: &ClientConfig, explicit: Option<&str>) -> Dispatcher {
    let resolver = HostResolver::from_settings(&config.servers);
    let hosts = resolver
        .resolve(explicit, &config.servers.hosts, &config.servers.ranges)
        .await;

    Dispatcher::new(
        hosts,
        config.servers.port,
        config.servers.timeout(),
        UsbipTool::system(config.usbip.clone()),
    )
}

/// Print ambiguous candidates before handing the error to main
fn report(e: ClientError) -> anyhow::Error {
    if let ClientError::Ambiguous(candidates) = &e {
        eprintln!("Matching devices:");
        for candidate in candidates {
            eprintln!("  {}", candidate);
        }
    }
    anyhow::Error::new(e)
}

async fn list_remote(config: &ClientConfig, host: Option<&str>) -> Result<()> {
    let dispatcher = dispatcher(config, host).await;
    let outcome = dispatcher.list().await.map_err(report)?;

    if outcome.devices.is_empty() {
        println!("No USB devices found.");
    }
    for device in &outcome.devices {
        println!("{}", device);
    }
    for (host, e) in &outcome.skipped {
        warn!("Server {} was skipped: {}", host, e);
    }
    Ok(())
}

async fn list_local(config: &ClientConfig) -> Result<()> {
    let server_config = server::ServerConfig {
        usbip: config.usbip.clone(),
        ..server::ServerConfig::default()
    };
    let registry = server::registry_from_config(&server_config);
    let devices = registry
        .enumerate()
        .await
        .context("Failed to enumerate local devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
    }
    for device in devices {
        println!("{}", device);
    }
    Ok(())
}

async fn list_ports(config: &ClientConfig) -> Result<()> {
    let registry = PortRegistry::new(UsbipTool::system(config.usbip.clone()));
    let records = registry
        .list_ports()
        .await
        .context("Failed to read local ports")?;

    if records.is_empty() {
        println!("No remote devices attached.");
    }
    for record in records {
        println!(
            "Port {:02}: {} {} from {}:{} bus {}",
            record.port,
            record.device_id,
            record.description,
            record.server,
            record.remote_port,
            record.remote_bus_id
        );
    }
    Ok(())
}

/// `usb-remote server`: same as the standalone server binary
async fn run_server(host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = server::ServerConfig::load_or_default();
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    config.validate()?;

    info!("Press Ctrl+C to shutdown");
    server::serve(&config, async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
            Err(e) => error!("Error waiting for Ctrl+C: {}", e),
        }
    })
    .await
}
