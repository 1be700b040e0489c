//! Server connection
//!
//! One TCP connection per request: connect, send the request, half-close,
//! read the response. The whole exchange shares one deadline.

use protocol::{
    ProtocolError, Request, Response, decode_response, encode_request, read_message,
    write_message,
};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::{ClientError, Result};

/// Perform one request/response exchange with `host:port`
///
/// An error envelope is returned as `Ok(Response::Error(..))`; only
/// transport and decoding failures are errors here.
pub async fn exchange(
    host: &str,
    port: u16,
    request: &Request,
    timeout: Duration,
) -> Result<Response> {
    let bytes = encode_request(request).map_err(|source| ClientError::Protocol {
        host: host.to_string(),
        source,
    })?;

    debug!("Sending {} request to {}:{}", request.command(), host, port);

    let result = tokio::time::timeout(timeout, async {
        let mut stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| connectivity(host, format!("connect failed: {}", e)))?;

        write_message(&mut stream, &bytes)
            .await
            .map_err(|e| protocol_error(host, e))?;
        stream
            .shutdown()
            .await
            .map_err(|e| connectivity(host, format!("shutdown failed: {}", e)))?;

        let reply = read_message(&mut stream)
            .await
            .map_err(|e| protocol_error(host, e))?;
        decode_response(&reply).map_err(|source| ClientError::Protocol {
            host: host.to_string(),
            source,
        })
    })
    .await;

    match result {
        Ok(response) => {
            trace!("Response from {}: {:?}", host, response);
            response
        }
        Err(_) => Err(connectivity(
            host,
            format!("no response within {:?}", timeout),
        )),
    }
}

fn connectivity(host: &str, reason: String) -> ClientError {
    ClientError::Connectivity {
        host: host.to_string(),
        reason,
    }
}

/// I/O failures while framing are connectivity problems, the rest are protocol ones
fn protocol_error(host: &str, e: ProtocolError) -> ClientError {
    match e {
        ProtocolError::Io(io) => connectivity(host, io.to_string()),
        ProtocolError::EmptyMessage => connectivity(host, "connection closed without a response".to_string()),
        source => ClientError::Protocol {
            host: host.to_string(),
            source,
        },
    }
}
