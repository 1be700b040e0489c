//! Common error types

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The external tool ran but exited unsuccessfully
    #[error("`{command}` failed ({status}): {stderr}")]
    ExternalTool {
        command: String,
        status: String,
        stderr: String,
    },

    /// The external tool exceeded its deadline and was killed
    #[error("`{command}` did not complete within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// The external tool could not be started at all
    #[error("Failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
