//! usb-remote client library
//!
//! Discovers device servers, dispatches list/find/attach/detach across
//! them, and keeps local USB/IP port state in step with the servers.
//!
//! # Example
//!
//! ```no_run
//! use client::{ClientConfig, Dispatcher, HostResolver};
//! use common::UsbipTool;
//! use protocol::DeviceRequest;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::default();
//!     let resolver = HostResolver::from_settings(&config.servers);
//!     let hosts = resolver
//!         .resolve(None, &config.servers.hosts, &config.servers.ranges)
//!         .await;
//!
//!     let dispatcher = Dispatcher::new(
//!         hosts,
//!         config.servers.port,
//!         config.servers.timeout(),
//!         UsbipTool::system(config.usbip.clone()),
//!     );
//!     let attached = dispatcher.attach(&DeviceRequest::by_id("2e8a:000a")).await?;
//!     println!("Attached {}", attached);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod network;
pub mod ports;
pub mod resolver;

pub use config::ClientConfig;
pub use dispatcher::{Detached, Dispatcher, HostDevice, ListOutcome};
pub use error::{ClientError, Result};
pub use ports::{PortRecord, PortRegistry, parse_ports};
pub use resolver::{HostEntry, HostProbe, HostResolver, Reachability, TcpProbe, parse_range};
