//! Client configuration management

use anyhow::{Context, Result, anyhow};
use common::UsbipSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientConfig {
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub servers: ServersSettings,
    /// How the external usbip tool is invoked for local attach/detach/port
    #[serde(default)]
    pub usbip: UsbipSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "ClientSettings::default_log_level")]
    pub log_level: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl ClientSettings {
    fn default_log_level() -> String {
        "warn".to_string()
    }
}

/// Where to look for device servers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServersSettings {
    /// Fixed server hosts, always contacted (no probe)
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Address ranges (`192.168.1.30-192.168.1.40` or `192.168.1.30-40`)
    /// whose responsive addresses are added after the fixed hosts
    #[serde(default)]
    pub ranges: Vec<String>,
    /// Command server port
    #[serde(default = "ServersSettings::default_port")]
    pub port: u16,
    /// Deadline for one request/response exchange
    #[serde(default = "ServersSettings::default_timeout")]
    pub timeout_ms: u64,
    /// Deadline for the TCP connect probe during range scans
    #[serde(default = "ServersSettings::default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

impl Default for ServersSettings {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            ranges: Vec::new(),
            port: Self::default_port(),
            timeout_ms: Self::default_timeout(),
            probe_timeout_ms: Self::default_probe_timeout(),
        }
    }
}

impl ServersSettings {
    fn default_port() -> u16 {
        protocol::DEFAULT_PORT
    }

    fn default_timeout() -> u64 {
        5000
    }

    fn default_probe_timeout() -> u64 {
        100
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl ClientConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-remote/client.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ClientConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        tracing::debug!(
            "Config: {} fixed host(s), {} range(s), port {}",
            config.servers.hosts.len(),
            config.servers.ranges.len(),
            config.servers.port
        );
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                // Print to stderr since logging might not be initialized yet
                eprintln!("Config: {}", e);
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
            config_dir.join("usb-remote").join("client.toml")
        } else {
            PathBuf::from(".config/usb-remote/client.toml")
        }
    }

    /// Validate configuration values
    ///
    /// Range syntax is not checked here: a bad range is reported and skipped
    /// at resolution time so one typo does not disable every other host.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.client.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.client.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.servers.port == 0 {
            return Err(anyhow!("Server port must be greater than 0"));
        }

        for host in &self.servers.hosts {
            if host.trim().is_empty() {
                return Err(anyhow!("Empty host in servers.hosts list"));
            }
        }

        for range in &self.servers.ranges {
            if range.trim().is_empty() {
                return Err(anyhow!("Empty range in servers.ranges list"));
            }
        }

        if self.servers.timeout_ms == 0 {
            return Err(anyhow!("timeout_ms must be greater than 0"));
        }

        if self.servers.probe_timeout_ms == 0 {
            return Err(anyhow!("probe_timeout_ms must be greater than 0"));
        }

        Ok(())
    }
}
