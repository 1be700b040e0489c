//! Device registry
//!
//! The server's view of its locally attached USB devices. Enumeration is
//! delegated to `usbip list -l` on every call, so the registry never holds
//! stale device state; the only thing it owns is the per-bus-id lock map
//! that serializes bind/unbind for a device.
//!
//! Bound state is read from sysfs: a device is exported when its `driver`
//! link points at `usbip-host`. That makes bind and unbind idempotent, which
//! matters when two clients race to attach the same device.

use common::UsbipTool;
use protocol::{DeviceRequest, UsbDevice};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Kernel driver a device is bound to while exported
pub const USBIP_HOST_DRIVER: &str = "usbip-host";

/// One `usbip list -l` block: the busid line and the description line after it
static LOCAL_DEVICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[ \t]*-[ \t]+busid[ \t]+(?P<bus>\S+)[ \t]+\((?P<vid>[0-9a-fA-F]{4}):(?P<pid>[0-9a-fA-F]{4})\)[ \t]*\n[ \t]*(?P<desc>.*?)[ \t]*(?:\([0-9a-fA-F]{4}:[0-9a-fA-F]{4}\))?[ \t]*$",
    )
    .expect("usbip list regex")
});

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no matching device")]
    NotFound,

    #[error("Failed to enumerate devices: {0}")]
    Enumerate(#[source] common::Error),

    #[error("Failed to bind device {bus_id}: {source}")]
    Bind {
        bus_id: String,
        #[source]
        source: common::Error,
    },

    #[error("Failed to unbind device {bus_id}: {source}")]
    Unbind {
        bus_id: String,
        #[source]
        source: common::Error,
    },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Server-local device inventory and export control
#[derive(Debug)]
pub struct DeviceRegistry {
    usbip: UsbipTool,
    sysfs_root: PathBuf,
    /// bus_id -> lock held across the bound check and the bind/unbind call
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeviceRegistry {
    pub fn new(usbip: UsbipTool, sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            usbip,
            sysfs_root: sysfs_root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn sysfs_root(&self) -> &Path {
        &self.sysfs_root
    }

    /// Re-enumerate local devices in the order the tool reports them
    pub async fn enumerate(&self) -> Result<Vec<UsbDevice>> {
        let text = self
            .usbip
            .list_local()
            .await
            .map_err(RegistryError::Enumerate)?;

        let mut devices = parse_local_devices(&text);
        for device in &mut devices {
            device.serial = self.read_serial(&device.bus_id).await;
        }

        debug!("Enumerated {} local device(s)", devices.len());
        Ok(devices)
    }

    /// First device matching the filter, in enumeration order
    pub async fn find(&self, filter: &DeviceRequest) -> Result<UsbDevice> {
        let devices = self.enumerate().await?;
        devices
            .into_iter()
            .find(|device| filter.matches(device))
            .ok_or(RegistryError::NotFound)
    }

    /// Export a device through `usbip-host`; already-bound devices are left alone
    pub async fn bind(&self, device: &UsbDevice) -> Result<()> {
        let lock = self.lock_for(&device.bus_id);
        let _guard = lock.lock().await;

        if self.is_bound(&device.bus_id).await {
            debug!("Device {} already bound, skipping bind", device.bus_id);
            return Ok(());
        }

        self.usbip
            .bind(&device.bus_id)
            .await
            .map_err(|source| RegistryError::Bind {
                bus_id: device.bus_id.clone(),
                source,
            })?;

        info!("Bound device {} ({})", device.bus_id, device.id());
        Ok(())
    }

    /// Return a device to its normal driver; unbound devices are left alone
    pub async fn unbind(&self, device: &UsbDevice) -> Result<()> {
        let lock = self.lock_for(&device.bus_id);
        let _guard = lock.lock().await;

        if !self.is_bound(&device.bus_id).await {
            debug!("Device {} not bound, skipping unbind", device.bus_id);
            return Ok(());
        }

        self.usbip
            .unbind(&device.bus_id)
            .await
            .map_err(|source| RegistryError::Unbind {
                bus_id: device.bus_id.clone(),
                source,
            })?;

        info!("Unbound device {} ({})", device.bus_id, device.id());
        Ok(())
    }

    /// Whether the device's driver link points at `usbip-host`
    pub async fn is_bound(&self, bus_id: &str) -> bool {
        let link = self.sysfs_root.join(bus_id).join("driver");
        match tokio::fs::read_link(&link).await {
            Ok(target) => target
                .file_name()
                .is_some_and(|name| name == USBIP_HOST_DRIVER),
            Err(_) => false,
        }
    }

    async fn read_serial(&self, bus_id: &str) -> Option<String> {
        let path = self.sysfs_root.join(bus_id).join("serial");
        match tokio::fs::read_to_string(&path).await {
            Ok(serial) => {
                let serial = serial.trim();
                (!serial.is_empty()).then(|| serial.to_string())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Failed to read serial from {}: {}", path.display(), e);
                None
            }
        }
    }

    fn lock_for(&self, bus_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(bus_id.to_string()).or_default().clone()
    }
}

/// Parse `usbip list -l` output into devices (serials are not part of it)
pub fn parse_local_devices(text: &str) -> Vec<UsbDevice> {
    LOCAL_DEVICE_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let vendor_id = u16::from_str_radix(&caps["vid"], 16).ok()?;
            let product_id = u16::from_str_radix(&caps["pid"], 16).ok()?;
            Some(UsbDevice {
                vendor_id,
                product_id,
                bus_id: caps["bus"].to_string(),
                serial: None,
                description: caps["desc"].to_string(),
            })
        })
        .collect()
}
