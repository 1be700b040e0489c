//! Server configuration management

use anyhow::{Context, Result, anyhow};
use common::UsbipSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSettings,
    /// How the external usbip tool is invoked
    #[serde(default)]
    pub usbip: UsbipSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address to listen on
    #[serde(default = "ServerSettings::default_host")]
    pub host: String,
    /// TCP port to listen on
    #[serde(default = "ServerSettings::default_port")]
    pub port: u16,
    #[serde(default = "ServerSettings::default_log_level")]
    pub log_level: String,
    /// Deadline for reading a request and writing its response
    #[serde(default = "ServerSettings::default_connection_timeout")]
    pub connection_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            log_level: Self::default_log_level(),
            connection_timeout_ms: Self::default_connection_timeout(),
        }
    }
}

impl ServerSettings {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        protocol::DEFAULT_PORT
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_connection_timeout() -> u64 {
        5000
    }

    /// `host:port` string suitable for binding
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Root of the sysfs USB device tree, used for serials and bound state
    #[serde(default = "UsbSettings::default_sysfs_root")]
    pub sysfs_root: PathBuf,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            sysfs_root: Self::default_sysfs_root(),
        }
    }
}

impl UsbSettings {
    fn default_sysfs_root() -> PathBuf {
        PathBuf::from("/sys/bus/usb/devices")
    }
}

impl ServerConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-remote/server.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.usb.sysfs_root =
            PathBuf::from(shellexpand::tilde(&config.usb.sysfs_root.to_string_lossy()).as_ref());

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-remote").join("server.toml")
        } else {
            PathBuf::from(".config/usb-remote/server.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.server.host.trim().is_empty() {
            return Err(anyhow!("Listen host must not be empty"));
        }

        if self.server.connection_timeout_ms == 0 {
            return Err(anyhow!("connection_timeout_ms must be greater than 0"));
        }

        if self.usbip.program.trim().is_empty() {
            return Err(anyhow!("usbip program must not be empty"));
        }

        if self.usbip.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be greater than 0"));
        }

        Ok(())
    }
}
