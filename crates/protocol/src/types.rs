//! Device and search-filter types shared by client and server
//!
//! A [`UsbDevice`] is what servers report; a [`DeviceRequest`] is the filter a
//! client sends to pick one of them out.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A USB device as seen by a sharing server
///
/// `bus_id` together with the host that reported it identifies a single
/// physical device. `vendor_id:product_id` does not: several identical
/// devices may be plugged into the same host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsbDevice {
    /// USB Vendor ID
    #[serde(with = "hex_id")]
    pub vendor_id: u16,
    /// USB Product ID
    #[serde(with = "hex_id")]
    pub product_id: u16,
    /// Topology-based locator on the server, e.g. `1-1.1`
    pub bus_id: String,
    /// Manufacturer serial string (if available)
    #[serde(default)]
    pub serial: Option<String>,
    /// Vendor/product description
    pub description: String,
}

impl UsbDevice {
    /// The `vvvv:pppp` identifier in lowercase hex
    pub fn id(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

impl fmt::Display for UsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:<10} {}", self.id(), self.bus_id, self.description)?;
        if let Some(serial) = &self.serial {
            write!(f, " [serial: {}]", serial)?;
        }
        Ok(())
    }
}

/// Search criteria for find/attach/detach
///
/// Every unset field places no constraint, so the default filter matches
/// every device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    /// `vvvv:pppp`, compared case-insensitively
    pub id: Option<String>,
    /// Exact bus id
    pub bus: Option<String>,
    /// Exact serial number
    pub serial: Option<String>,
    /// Case-insensitive substring of the description
    pub description: Option<String>,
    /// Stop at the first match instead of collecting all of them
    pub first: bool,
}

impl Default for DeviceRequest {
    fn default() -> Self {
        Self {
            id: None,
            bus: None,
            serial: None,
            description: None,
            first: true,
        }
    }
}

impl DeviceRequest {
    /// Filter on `vvvv:pppp`
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Filter on bus id
    pub fn by_bus(bus: impl Into<String>) -> Self {
        Self {
            bus: Some(bus.into()),
            ..Self::default()
        }
    }

    /// True when no field constrains the match
    pub fn is_unconstrained(&self) -> bool {
        self.id.is_none() && self.bus.is_none() && self.serial.is_none() && self.description.is_none()
    }

    /// Check whether a device satisfies every set field
    pub fn matches(&self, device: &UsbDevice) -> bool {
        if let Some(id) = &self.id {
            if !device.id().eq_ignore_ascii_case(id.trim()) {
                return false;
            }
        }

        if let Some(bus) = &self.bus {
            if device.bus_id != *bus {
                return false;
            }
        }

        if let Some(serial) = &self.serial {
            if device.serial.as_deref() != Some(serial.as_str()) {
                return false;
            }
        }

        if let Some(description) = &self.description {
            let needle = description.to_lowercase();
            if !device.description.to_lowercase().contains(&needle) {
                return false;
            }
        }

        true
    }
}

impl fmt::Display for DeviceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(id) = &self.id {
            parts.push(format!("id={}", id));
        }
        if let Some(bus) = &self.bus {
            parts.push(format!("bus={}", bus));
        }
        if let Some(serial) = &self.serial {
            parts.push(format!("serial={}", serial));
        }
        if let Some(description) = &self.description {
            parts.push(format!("description~{}", description));
        }
        if parts.is_empty() {
            write!(f, "<any device>")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

/// Serialize u16 USB identifiers as 4-digit lowercase hex strings
mod hex_id {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &u16, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:04x}", value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u16, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(&s);
        if digits.is_empty() || digits.len() > 4 {
            return Err(serde::de::Error::custom(format!(
                "invalid USB id '{}': expected 1-4 hex digits",
                s
            )));
        }
        u16::from_str_radix(digits, 16)
            .map_err(|_| serde::de::Error::custom(format!("invalid USB id '{}'", s)))
    }
}
