//! Client Connection Handler
//!
//! One connection carries one exchange: read a request, dispatch it against
//! the device registry, write the response, close. Every failure that can be
//! reported to the client is turned into an error envelope.

use anyhow::{Context, Result};
use protocol::{
    DeviceRequest, Request, Response, decode_request, encode_response, read_message,
    write_message,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use crate::registry::DeviceRegistry;

/// Per-connection handler
pub struct ClientConnection {
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<DeviceRegistry>,
    timeout: Duration,
}

impl ClientConnection {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        registry: Arc<DeviceRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            stream,
            peer,
            registry,
            timeout,
        }
    }

    /// Serve the single exchange on this connection
    pub async fn run(self) -> Result<()> {
        let (reader, mut writer) = self.stream.into_split();

        let response = match tokio::time::timeout(self.timeout, read_message(reader)).await {
            Err(_) => {
                warn!("Timeout reading request from {}", self.peer);
                Response::error("Timed out waiting for request")
            }
            Ok(Err(e)) => {
                warn!("Failed to read request from {}: {}", self.peer, e);
                Response::error(format!("Invalid request: {}", e))
            }
            Ok(Ok(bytes)) => match decode_request(&bytes) {
                Ok(request) => {
                    trace!("Received request: {:?}", request);
                    handle_request(&self.registry, request).await
                }
                Err(e) => {
                    warn!("Failed to decode request from {}: {}", self.peer, e);
                    Response::error(format!("Invalid request: {}", e))
                }
            },
        };

        let bytes = encode_response(&response).context("Failed to encode response")?;
        tokio::time::timeout(self.timeout, write_message(&mut writer, &bytes))
            .await
            .context("Timeout writing response")?
            .context("Failed to write response")?;

        // Half-close so clients reading to EOF terminate
        let _ = writer.shutdown().await;

        debug!("Connection from {} closed", self.peer);
        Ok(())
    }
}

/// Dispatch one request against the registry
///
/// Never fails: registry errors become error responses.
pub async fn handle_request(registry: &DeviceRegistry, request: Request) -> Response {
    let command = request.command();
    let result = match request {
        Request::List => registry.enumerate().await.map(Response::Devices),
        Request::Find(filter) => registry.find(&filter).await.map(Response::Device),
        Request::Attach(filter) => handle_attach(registry, &filter).await,
        Request::Detach(filter) => handle_detach(registry, &filter).await,
    };

    match result {
        Ok(response) => response,
        Err(e) => {
            debug!("{} request failed: {}", command, e);
            Response::error(e.to_string())
        }
    }
}

async fn handle_attach(
    registry: &DeviceRegistry,
    filter: &DeviceRequest,
) -> crate::registry::Result<Response> {
    let device = registry.find(filter).await?;
    info!("Attach request for {} ({})", device.bus_id, device.id());
    registry.bind(&device).await?;
    Ok(Response::Device(device))
}

async fn handle_detach(
    registry: &DeviceRegistry,
    filter: &DeviceRequest,
) -> crate::registry::Result<Response> {
    let device = registry.find(filter).await?;
    info!("Detach request for {} ({})", device.bus_id, device.id());
    registry.unbind(&device).await?;
    Ok(Response::Device(device))
}
