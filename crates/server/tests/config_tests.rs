//! Integration tests for server configuration files
//!
//! - Minimal and full `server.toml`
//! - Save/load through a real file
//! - Invalid configuration handling

use server::ServerConfig;
use std::path::PathBuf;
use std::time::Duration;

const FULL_SERVER_CONFIG: &str = r#"
[server]
host = "192.168.1.30"
port = 5001
log_level = "debug"
connection_timeout_ms = 2500

[usbip]
program = "/usr/sbin/usbip"
use_sudo = false
command_timeout_secs = 20

[usb]
sysfs_root = "/tmp/fake-sysfs"
"#;

#[test]
fn test_full_config_loads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.toml");
    std::fs::write(&path, FULL_SERVER_CONFIG).unwrap();

    let config = ServerConfig::load(Some(path)).unwrap();
    assert_eq!(config.server.bind_addr(), "192.168.1.30:5001");
    assert_eq!(config.server.log_level, "debug");
    assert_eq!(config.server.connection_timeout(), Duration::from_millis(2500));
    assert_eq!(config.usbip.program, "/usr/sbin/usbip");
    assert!(!config.usbip.use_sudo);
    assert_eq!(config.usbip.command_timeout(), Duration::from_secs(20));
    assert_eq!(config.usb.sysfs_root, PathBuf::from("/tmp/fake-sysfs"));
}

#[test]
fn test_empty_file_is_all_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.toml");
    std::fs::write(&path, "").unwrap();

    let config = ServerConfig::load(Some(path)).unwrap();
    assert_eq!(config.server.port, protocol::DEFAULT_PORT);
    assert_eq!(config.server.host, "0.0.0.0");
}

#[test]
fn test_save_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("server.toml");

    let mut config = ServerConfig::default();
    config.server.port = 6123;
    config.usbip.use_sudo = false;
    config.save(&path).unwrap();

    let loaded = ServerConfig::load(Some(path)).unwrap();
    assert_eq!(loaded.server.port, 6123);
    assert!(!loaded.usbip.use_sudo);
}

#[test]
fn test_invalid_log_level_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.toml");
    std::fs::write(&path, "[server]\nlog_level = \"loud\"\n").unwrap();

    let err = ServerConfig::load(Some(path)).unwrap_err();
    assert!(format!("{:#}", err).contains("Invalid log level"));
}

#[test]
fn test_malformed_toml_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.toml");
    std::fs::write(&path, "[server\nport = ").unwrap();

    assert!(ServerConfig::load(Some(path)).is_err());
}

#[test]
fn test_missing_file_rejected() {
    let dir = tempfile::tempdir().unwrap();
    assert!(ServerConfig::load(Some(dir.path().join("absent.toml"))).is_err());
}
