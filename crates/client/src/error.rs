//! Client error types

use crate::dispatcher::HostDevice;
use protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Connect, send or receive failed, or the exchange timed out
    #[error("Cannot reach server {host}: {reason}")]
    Connectivity { host: String, reason: String },

    /// The server answered with something that is not a valid response
    #[error("Invalid response from {host}: {source}")]
    Protocol {
        host: String,
        #[source]
        source: ProtocolError,
    },

    /// The server answered with an error envelope
    #[error("Server {host} reported: {message}")]
    Server { host: String, message: String },

    #[error("Device not found on any server")]
    NotFoundAnywhere,

    /// More than one device matched where exactly one is needed
    #[error("{} devices match the filter, narrow it down or pass --host", .0.len())]
    Ambiguous(Vec<HostDevice>),

    #[error("Device {bus_id} from {host} is not attached to a local port")]
    NotAttached { host: String, bus_id: String },

    #[error("None of the {count} server(s) could be queried")]
    AllHostsFailed { count: usize },

    /// Server and local state no longer agree and need manual attention
    #[error("Device {bus_id} on {host} left in an inconsistent state: {reason}")]
    StateInconsistency {
        host: String,
        bus_id: String,
        reason: String,
    },

    /// Local usbip invocation failed
    #[error(transparent)]
    Tool(#[from] common::Error),
}

impl ClientError {
    /// The server reported that nothing matched the filter
    pub fn is_no_match(&self) -> bool {
        matches!(self, ClientError::Server { message, .. } if message == NO_MATCHING_DEVICE)
    }
}

/// Error message a server sends when no device satisfies the filter
pub const NO_MATCHING_DEVICE: &str = "no matching device";

pub type Result<T> = std::result::Result<T, ClientError>;
