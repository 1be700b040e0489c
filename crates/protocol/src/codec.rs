//! Message serialization and stream I/O
//!
//! Messages are single JSON documents. On a stream each document is
//! terminated by a newline; a reader also accepts EOF as the terminator.
//!
//! # Frame Format
//!
//! ```text
//! {"command":"find","bus":"1-1.1","first":true}\n
//! ```
//!
//! There is no length prefix, so the reader enforces [`MAX_MESSAGE_SIZE`]:
//! a longer message is rejected with [`ProtocolError::MessageTooLarge`]
//! rather than truncated.

use crate::{Request, Response, error::ProtocolError, error::Result};

#[cfg(feature = "async")]
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum accepted message size (1 MiB), terminator excluded
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Encode a request as JSON bytes (no terminator)
///
/// # Example
/// ```
/// use protocol::{Request, encode_request, decode_request};
///
/// let bytes = encode_request(&Request::List).unwrap();
/// assert_eq!(bytes, br#"{"command":"list"}"#);
/// assert_eq!(decode_request(&bytes).unwrap(), Request::List);
/// ```
pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&request.to_value()?)?)
}

/// Decode a request, rejecting unknown commands and unknown fields
pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    let value = parse_document(bytes)?;
    Request::from_value(value)
}

/// Encode a response as JSON bytes (no terminator)
pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&response.to_value()?)?)
}

/// Decode a response by trying every known response shape
///
/// # Example
/// ```
/// use protocol::{Response, decode_response};
///
/// let response = decode_response(br#"{"status":"error","message":"no matching device"}"#).unwrap();
/// assert_eq!(response, Response::error("no matching device"));
/// ```
pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    let value = parse_document(bytes)?;
    Response::from_value(value)
}

fn parse_document(bytes: &[u8]) -> Result<serde_json::Value> {
    let trimmed = bytes.trim_ascii();
    if trimmed.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    if trimmed.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(serde_json::from_slice(trimmed)?)
}

/// Read one message from an async reader
///
/// Stops at the first newline or at EOF. At most `MAX_MESSAGE_SIZE + 1`
/// bytes are buffered.
#[cfg(feature = "async")]
pub async fn read_message<R>(reader: R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let limit = MAX_MESSAGE_SIZE as u64 + 1;
    let mut reader = BufReader::new(reader.take(limit));
    let mut buf = Vec::new();
    reader.read_until(b'\n', &mut buf).await?;

    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            max: MAX_MESSAGE_SIZE,
        });
    }
    if buf.trim_ascii().is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }

    Ok(buf)
}

/// Write one encoded message followed by the newline terminator
#[cfg(feature = "async")]
pub async fn write_message<W>(writer: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            max: MAX_MESSAGE_SIZE,
        });
    }
    writer.write_all(bytes).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
