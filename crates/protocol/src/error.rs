//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload is not valid JSON or does not fit the expected shape
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// Request has no `command` field
    #[error("Request is missing the 'command' field")]
    MissingCommand,

    /// Request names a command this side does not know
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Payload matched none of the known response shapes
    #[error("Unrecognized response: {0}")]
    UnrecognizedResponse(String),

    /// Message exceeds the maximum allowed size
    #[error("Message too large: more than {max} bytes")]
    MessageTooLarge { max: usize },

    /// Peer closed the stream without sending anything
    #[error("Empty message")]
    EmptyMessage,

    /// I/O error while reading or writing a message
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
