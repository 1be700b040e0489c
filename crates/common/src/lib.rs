//! Common utilities for usb-remote
//!
//! This crate provides shared functionality between the server and client:
//! error handling, logging setup, and the typed wrapper around the external
//! `usbip` tool that both sides use for kernel-level USB/IP work.

pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usbip;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usbip::{CommandOutput, CommandRunner, SystemRunner, UsbipSettings, UsbipTool};
