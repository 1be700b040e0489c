//! Protocol library for usb-remote
//!
//! This crate defines the control-plane protocol spoken between the
//! `usb-remote` client and the device-sharing server. It provides the device
//! and filter types, strict request/response schemas, and JSON encoding with
//! bounded stream I/O.
//!
//! # Example
//!
//! ```
//! use protocol::{DeviceRequest, Request, Response, UsbDevice};
//! use protocol::{decode_request, encode_request, decode_response, encode_response};
//!
//! // Client side: ask for a device by vendor:product
//! let request = Request::Find(DeviceRequest::by_id("2e8a:000a"));
//! let bytes = encode_request(&request).unwrap();
//!
//! // Server side
//! assert_eq!(decode_request(&bytes).unwrap(), request);
//! let response = Response::Device(UsbDevice {
//!     vendor_id: 0x2e8a,
//!     product_id: 0x000a,
//!     bus_id: "1-1.1".to_string(),
//!     serial: None,
//!     description: "Raspberry Pi".to_string(),
//! });
//! let bytes = encode_response(&response).unwrap();
//!
//! // Back on the client
//! assert_eq!(decode_response(&bytes).unwrap(), response);
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use codec::{
    MAX_MESSAGE_SIZE, decode_request, decode_response, encode_request, encode_response,
};

#[cfg(feature = "async")]
pub use codec::{read_message, write_message};
pub use error::{ProtocolError, Result};
pub use messages::{Command, Request, Response};
pub use types::{DeviceRequest, UsbDevice};

/// Default TCP port of the command server
pub const DEFAULT_PORT: u16 = 5000;

/// Default server host when nothing else is configured
pub const DEFAULT_HOST: &str = "localhost";
