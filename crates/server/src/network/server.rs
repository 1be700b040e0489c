//! TCP command server
//!
//! Owns the listening socket, accepts connections, and spawns one
//! per-connection handler task for each.

use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::connection::ClientConnection;
use crate::config::ServerConfig;
use crate::registry::DeviceRegistry;

/// Command server for the device protocol
///
/// Every accepted connection carries exactly one request and one response.
/// A failing handler never takes the accept loop down with it.
pub struct CommandServer {
    listener: TcpListener,
    registry: Arc<DeviceRegistry>,
    connection_timeout: Duration,
}

impl CommandServer {
    /// Bind the listening socket
    ///
    /// # Arguments
    /// * `addr` - `host:port` to listen on; port 0 picks a free port
    /// * `registry` - Device registry shared by all connections
    /// * `connection_timeout` - Deadline for reading a request and for writing its response
    pub async fn bind(
        addr: &str,
        registry: Arc<DeviceRegistry>,
        connection_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind command server to {}", addr))?;

        info!("Command server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            registry,
            connection_timeout,
        })
    }

    /// Bind using the `[server]` section of a configuration
    pub async fn from_config(config: &ServerConfig, registry: Arc<DeviceRegistry>) -> Result<Self> {
        Self::bind(
            &config.server.bind_addr(),
            registry,
            config.server.connection_timeout(),
        )
        .await
    }

    /// Get the bound address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Accept connections until the process exits
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves
    ///
    /// Connections already accepted finish on their own tasks.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Server running, waiting for connections...");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    debug!("Accepted connection from {}", peer);
                    let connection = ClientConnection::new(
                        stream,
                        peer,
                        self.registry.clone(),
                        self.connection_timeout,
                    );

                    tokio::spawn(async move {
                        if let Err(e) = connection.run().await {
                            error!("Connection error from {}: {:#}", peer, e);
                        }
                    });
                }
            }
        }

        Ok(())
    }
}
