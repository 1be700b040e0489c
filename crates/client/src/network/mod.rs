//! Network subsystem
//!
//! Per-host request/response exchange with device servers.

pub mod connection;

pub use connection::exchange;
