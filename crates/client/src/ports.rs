//! Local port registry
//!
//! Which remote devices are currently imported on this machine, according
//! to `usbip port`. Records are parsed fresh on every call.

use common::UsbipTool;
use regex::Regex;
use std::net::IpAddr;
use std::sync::LazyLock;
use tracing::debug;

/// One `usbip port` entry: the port line, the description line, then the
/// line carrying the `usbip://server:port/bus` locator
static PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^Port[ \t]+(?P<port>\d+):.*\n[ \t]*(?P<description>.*?)[ \t]*\((?P<id>[0-9a-fA-F]{4}:[0-9a-fA-F]{4})\)[ \t]*\n.*?usbip://(?P<server>[^\s/]+?):(?P<remote_port>\d+)/(?P<bus>\S+)",
    )
    .expect("usbip port regex")
});

/// A remote device imported on a local virtual port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRecord {
    /// Local vhci port number, the argument to `usbip detach -p`
    pub port: u16,
    pub description: String,
    /// `vvvv:pppp` in lowercase
    pub device_id: String,
    /// Server address as recorded by the kernel (usually an IP)
    pub server: String,
    /// usbipd port on the server
    pub remote_port: u16,
    /// Bus id of the device on the server
    pub remote_bus_id: String,
}

impl PortRecord {
    /// Whether this record came from `server` (given as IP or hostname)
    ///
    /// `resolved` holds the addresses the server name resolves to.
    pub fn is_from(&self, server: &str, resolved: &[IpAddr]) -> bool {
        if self.server.eq_ignore_ascii_case(server) {
            return true;
        }
        match self.server.parse::<IpAddr>() {
            Ok(ip) => resolved.contains(&ip),
            Err(_) => false,
        }
    }
}

/// Parse `usbip port` output
///
/// Entries that do not have the expected three-line shape are skipped.
pub fn parse_ports(text: &str) -> Vec<PortRecord> {
    PORT_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let server = caps["server"]
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            Some(PortRecord {
                port: caps["port"].parse().ok()?,
                description: caps["description"].to_string(),
                device_id: caps["id"].to_lowercase(),
                server,
                remote_port: caps["remote_port"].parse().ok()?,
                remote_bus_id: caps["bus"].to_string(),
            })
        })
        .collect()
}

/// Reads local port state through `usbip port`
#[derive(Debug, Clone)]
pub struct PortRegistry {
    usbip: UsbipTool,
}

impl PortRegistry {
    pub fn new(usbip: UsbipTool) -> Self {
        Self { usbip }
    }

    /// Every imported device
    pub async fn list_ports(&self) -> common::Result<Vec<PortRecord>> {
        let text = self.usbip.port().await?;
        let records = parse_ports(&text);
        debug!("{} device(s) attached to local ports", records.len());
        Ok(records)
    }

    /// The local port holding `bus_id` from `host`, if any
    pub async fn find_port(&self, host: &str, bus_id: &str) -> common::Result<Option<PortRecord>> {
        let records = self.list_ports().await?;
        Ok(find_in(&records, host, bus_id).await)
    }
}

/// Search parsed records, resolving `host` only when a plain string match fails
pub async fn find_in(records: &[PortRecord], host: &str, bus_id: &str) -> Option<PortRecord> {
    let candidates: Vec<&PortRecord> = records
        .iter()
        .filter(|r| r.remote_bus_id == bus_id)
        .collect();

    if let Some(record) = candidates.iter().find(|r| r.is_from(host, &[])) {
        return Some((*record).clone());
    }
    if candidates.is_empty() {
        return None;
    }

    let resolved = resolve_host(host).await;
    candidates
        .into_iter()
        .find(|r| r.is_from(host, &resolved))
        .cloned()
}

async fn resolve_host(host: &str) -> Vec<IpAddr> {
    match tokio::net::lookup_host((host, 0)).await {
        Ok(addrs) => addrs.map(|a| a.ip()).collect(),
        Err(e) => {
            debug!("Could not resolve {}: {}", host, e);
            Vec::new()
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    /// Strategy for records as the kernel would report them
    fn record_strategy() -> impl Strategy<Value = PortRecord> {
        (
            0u16..=15u16,
            "[A-Za-z][A-Za-z0-9 ,.:_-]{0,40}[A-Za-z0-9]",
            any::<(u16, u16)>(),
            any::<[u8; 4]>(),
            1u16..=65535u16,
            "[1-9]-[1-9](\\.[1-9]){0,3}",
        )
            .prop_map(|(port, description, (vid, pid), ip, remote_port, bus)| PortRecord {
                port,
                description,
                device_id: format!("{:04x}:{:04x}", vid, pid),
                server: Ipv4Addr::from(ip).to_string(),
                remote_port,
                remote_bus_id: bus,
            })
    }

    fn render(records: &[PortRecord]) -> String {
        let mut text = String::from("Imported USB devices\n====================\n");
        for (i, r) in records.iter().enumerate() {
            text.push_str(&format!(
                "Port {:02}: <Port in Use> at High Speed(480Mbps)\n       {} ({})\n       {}-{} -> usbip://{}:{}/{}\n           -> remote bus/dev 001/{:03}\n",
                r.port, r.description, r.device_id, i + 1, r.port, r.server, r.remote_port, r.remote_bus_id, i + 2
            ));
        }
        text
    }

    proptest! {
        /// Property: every rendered entry is parsed back, in order
        #[test]
        fn prop_rendered_table_parses(records in proptest::collection::vec(record_strategy(), 0..8)) {
            let parsed = parse_ports(&render(&records));
            prop_assert_eq!(parsed, records);
        }

        /// Property: the parser never panics and never invents entries without a locator
        #[test]
        fn prop_arbitrary_text_is_safe(text in "\\PC{0,400}") {
            let parsed = parse_ports(&text);
            prop_assert!(parsed.len() <= text.matches("usbip://").count());
        }

        /// Property: uppercase ids are normalized to lowercase
        #[test]
        fn prop_device_id_lowercase(record in record_strategy()) {
            let text = render(std::slice::from_ref(&record)).replace(&record.device_id, &record.device_id.to_uppercase());
            let parsed = parse_ports(&text);
            prop_assert_eq!(parsed.len(), 1);
            prop_assert_eq!(&parsed[0].device_id, &record.device_id);
        }
    }
}
