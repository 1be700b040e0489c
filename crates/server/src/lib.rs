//! usb-remote server library
//!
//! The device-sharing side of usb-remote: a [`DeviceRegistry`] that
//! enumerates and exports local USB devices through the `usbip` tool, and a
//! [`CommandServer`] that answers list/find/attach/detach requests over TCP.
//!
//! The `usb-remote-server` binary and the client's `server` subcommand are
//! both thin wrappers around [`serve`].

pub mod config;
pub mod network;
pub mod registry;

pub use config::ServerConfig;
pub use network::CommandServer;
pub use registry::{DeviceRegistry, RegistryError};

use anyhow::Result;
use common::UsbipTool;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Build the registry described by a configuration
pub fn registry_from_config(config: &ServerConfig) -> DeviceRegistry {
    let tool = UsbipTool::system(config.usbip.clone());
    DeviceRegistry::new(tool, config.usb.sysfs_root.clone())
}

/// Run a command server for `config` until `shutdown` resolves
pub async fn serve<F>(config: &ServerConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let registry = Arc::new(registry_from_config(config));
    let server = CommandServer::from_config(config, registry).await?;
    info!("Serving devices on {}", server.local_addr()?);
    server.run_until(shutdown).await
}
