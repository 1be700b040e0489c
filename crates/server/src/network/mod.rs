//! Network subsystem
//!
//! Plain TCP command server for the device protocol.
//!
//! # Architecture
//!
//! ```text
//! CommandServer
//!   ├─> accept connections
//!   └─> spawn ClientConnection per connection
//!         ├─> read one newline-terminated JSON request
//!         ├─> dispatch to DeviceRegistry (list/find/attach/detach)
//!         └─> write one response, close
//! ```

pub mod connection;
pub mod server;

pub use connection::{ClientConnection, handle_request};
pub use server::CommandServer;
