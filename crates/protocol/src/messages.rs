//! Protocol message definitions
//!
//! Requests carry a `command` discriminator (`list`, `find`, `attach`,
//! `detach`). Responses carry a `status` discriminator (`success`, `error`);
//! a success payload is either a device list or a single device.
//!
//! The public [`Request`] and [`Response`] enums are converted to and from
//! strict wire shapes. Every wire shape rejects unknown fields so that a
//! client/server version mismatch fails loudly instead of being ignored.

use crate::error::{ProtocolError, Result};
use crate::types::{DeviceRequest, UsbDevice};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request kinds understood by the command server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    List,
    Find,
    Attach,
    Detach,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::List => "list",
            Command::Find => "find",
            Command::Attach => "attach",
            Command::Detach => "detach",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// List every device on the server
    List,
    /// Return the first device matching the filter
    Find(DeviceRequest),
    /// Find, then bind the device for export
    Attach(DeviceRequest),
    /// Find, then unbind the device
    Detach(DeviceRequest),
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Request::List => Command::List,
            Request::Find(_) => Command::Find,
            Request::Attach(_) => Command::Attach,
            Request::Detach(_) => Command::Detach,
        }
    }

    /// The search filter, if this request carries one
    pub fn filter(&self) -> Option<&DeviceRequest> {
        match self {
            Request::List => None,
            Request::Find(f) | Request::Attach(f) | Request::Detach(f) => Some(f),
        }
    }

    /// Build a filtered request for one of the device commands
    pub fn for_command(command: Command, filter: DeviceRequest) -> Self {
        match command {
            Command::List => Request::List,
            Command::Find => Request::Find(filter),
            Command::Attach => Request::Attach(filter),
            Command::Detach => Request::Detach(filter),
        }
    }

    pub(crate) fn to_value(&self) -> Result<Value> {
        let value = match self {
            Request::List => serde_json::to_value(ListRequestFrame {
                command: Command::List,
            })?,
            Request::Find(f) | Request::Attach(f) | Request::Detach(f) => {
                serde_json::to_value(DeviceRequestFrame::new(self.command(), f))?
            }
        };
        Ok(value)
    }

    pub(crate) fn from_value(value: Value) -> Result<Self> {
        let command = match value.get("command") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                return Err(ProtocolError::UnknownCommand(other.to_string()));
            }
            None => return Err(ProtocolError::MissingCommand),
        };

        match command.as_str() {
            "list" => {
                let _: ListRequestFrame = serde_json::from_value(value)?;
                Ok(Request::List)
            }
            "find" | "attach" | "detach" => {
                let frame: DeviceRequestFrame = serde_json::from_value(value)?;
                let command = frame.command;
                Ok(Request::for_command(command, frame.into_filter()))
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

/// A server response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Success with the device list (answer to `list`)
    Devices(Vec<UsbDevice>),
    /// Success with a single device (answer to find/attach/detach)
    Device(UsbDevice),
    /// Failure with a human-readable message
    Error(String),
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error(message.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error(_))
    }

    pub(crate) fn to_value(&self) -> Result<Value> {
        let value = match self {
            Response::Devices(devices) => serde_json::to_value(ListResponseFrame {
                status: SuccessTag::Success,
                data: devices.clone(),
            })?,
            Response::Device(device) => serde_json::to_value(DeviceResponseFrame {
                status: SuccessTag::Success,
                data: device.clone(),
            })?,
            Response::Error(message) => serde_json::to_value(ErrorResponseFrame {
                status: ErrorTag::Error,
                message: message.clone(),
            })?,
        };
        Ok(value)
    }

    /// Try every known response shape and keep the one that validates
    pub(crate) fn from_value(value: Value) -> Result<Self> {
        if let Ok(frame) = serde_json::from_value::<ListResponseFrame>(value.clone()) {
            return Ok(Response::Devices(frame.data));
        }
        if let Ok(frame) = serde_json::from_value::<DeviceResponseFrame>(value.clone()) {
            return Ok(Response::Device(frame.data));
        }
        if let Ok(frame) = serde_json::from_value::<ErrorResponseFrame>(value.clone()) {
            return Ok(Response::Error(frame.message));
        }

        let text = value.to_string();
        let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
        if preview.len() < text.len() {
            preview.push_str("...");
        }
        Err(ProtocolError::UnrecognizedResponse(preview))
    }
}

/// Characters of an unrecognized response kept in the error
const PREVIEW_CHARS: usize = 200;

// Wire shapes. Single-variant tag enums make a frame validate only when the
// discriminator carries the expected value.

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum SuccessTag {
    #[serde(rename = "success")]
    Success,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum ErrorTag {
    #[serde(rename = "error")]
    Error,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListRequestFrame {
    command: Command,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeviceRequestFrame {
    command: Command,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bus: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    serial: Option<String>,
    #[serde(default, alias = "desc", skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default = "default_first")]
    first: bool,
}

fn default_first() -> bool {
    true
}

impl DeviceRequestFrame {
    fn new(command: Command, filter: &DeviceRequest) -> Self {
        Self {
            command,
            id: filter.id.clone(),
            bus: filter.bus.clone(),
            serial: filter.serial.clone(),
            description: filter.description.clone(),
            first: filter.first,
        }
    }

    fn into_filter(self) -> DeviceRequest {
        DeviceRequest {
            id: self.id,
            bus: self.bus,
            serial: self.serial,
            description: self.description,
            first: self.first,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListResponseFrame {
    status: SuccessTag,
    data: Vec<UsbDevice>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeviceResponseFrame {
    status: SuccessTag,
    data: UsbDevice,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ErrorResponseFrame {
    status: ErrorTag,
    message: String,
}
