//! Host resolution
//!
//! Turns the CLI's explicit `--host`, the configured fixed hosts and the
//! configured address ranges into the ordered list of servers a command
//! should contact. Range addresses are only kept when a TCP connect to the
//! command port succeeds within the probe timeout.

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::ServersSettings;

/// Upper bound on the number of addresses a single range may span
pub const MAX_RANGE_HOSTS: u128 = 4096;

/// Probes in flight at once while scanning a range
pub const MAX_CONCURRENT_PROBES: usize = 256;

/// What is known about a host's command port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    /// Not probed (explicit or fixed host, or the localhost fallback)
    Unknown,
    /// A connect probe succeeded
    Open,
    /// A connect probe failed or timed out
    Closed,
}

/// A server to contact, built per command and never cached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub address: String,
    pub reachability: Reachability,
}

impl HostEntry {
    pub fn unprobed(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            reachability: Reachability::Unknown,
        }
    }
}

/// Checks whether something is listening on `addr:port`
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn probe(&self, addr: IpAddr, port: u16, timeout: Duration) -> bool;
}

/// Probe by opening (and immediately dropping) a TCP connection
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl HostProbe for TcpProbe {
    async fn probe(&self, addr: IpAddr, port: u16, timeout: Duration) -> bool {
        let target = SocketAddr::new(addr, port);
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect(target)).await,
            Ok(Ok(_))
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("expected START-END")]
    MissingSeparator,

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("start and end are different address families")]
    FamilyMismatch,

    #[error("start address is greater than end address")]
    Reversed,

    #[error("range spans {0} addresses, limit is {MAX_RANGE_HOSTS}")]
    TooLarge(u128),
}

/// Inclusive range of addresses of one family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    start: IpAddr,
    end: IpAddr,
}

impl AddressRange {
    pub fn start(&self) -> IpAddr {
        self.start
    }

    pub fn end(&self) -> IpAddr {
        self.end
    }

    /// Number of addresses in the range
    pub fn len(&self) -> u128 {
        match (self.start, self.end) {
            (IpAddr::V4(s), IpAddr::V4(e)) => u128::from(u32::from(e) - u32::from(s)) + 1,
            (IpAddr::V6(s), IpAddr::V6(e)) => {
                (u128::from(e) - u128::from(s)).saturating_add(1)
            }
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every address from start to end inclusive, in order
    pub fn addresses(&self) -> Vec<IpAddr> {
        match (self.start, self.end) {
            (IpAddr::V4(s), IpAddr::V4(e)) => (u32::from(s)..=u32::from(e))
                .map(|n| IpAddr::V4(Ipv4Addr::from(n)))
                .collect(),
            (IpAddr::V6(s), IpAddr::V6(e)) => (u128::from(s)..=u128::from(e))
                .map(|n| IpAddr::V6(Ipv6Addr::from(n)))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Parse `START-END`, where END may be just the last segment of START
///
/// `10.0.0.5-20` covers `10.0.0.5` to `10.0.0.20`; `fe80::1-ff` covers
/// `fe80::1` to `fe80::ff`.
pub fn parse_range(spec: &str) -> Result<AddressRange, RangeError> {
    let (start_str, end_str) = spec.split_once('-').ok_or(RangeError::MissingSeparator)?;
    let (start_str, end_str) = (start_str.trim(), end_str.trim());

    let start: IpAddr = start_str
        .parse()
        .map_err(|_| RangeError::InvalidAddress(start_str.to_string()))?;

    let end: IpAddr = match end_str.parse() {
        Ok(end) => end,
        Err(_) if !end_str.is_empty() && !end_str.contains(['.', ':']) => {
            let separator = if start.is_ipv4() { '.' } else { ':' };
            let prefix = match start_str.rfind(separator) {
                Some(i) => &start_str[..=i],
                None => return Err(RangeError::InvalidAddress(end_str.to_string())),
            };
            let spliced = format!("{}{}", prefix, end_str);
            spliced
                .parse()
                .map_err(|_| RangeError::InvalidAddress(spliced))?
        }
        Err(_) => return Err(RangeError::InvalidAddress(end_str.to_string())),
    };

    let ordered = match (start, end) {
        (IpAddr::V4(s), IpAddr::V4(e)) => s <= e,
        (IpAddr::V6(s), IpAddr::V6(e)) => s <= e,
        _ => return Err(RangeError::FamilyMismatch),
    };
    if !ordered {
        return Err(RangeError::Reversed);
    }

    let range = AddressRange { start, end };
    if range.len() > MAX_RANGE_HOSTS {
        return Err(RangeError::TooLarge(range.len()));
    }
    Ok(range)
}

/// Builds the host list for one command
#[derive(Clone)]
pub struct HostResolver {
    probe: Arc<dyn HostProbe>,
    port: u16,
    probe_timeout: Duration,
}

impl std::fmt::Debug for HostResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostResolver")
            .field("port", &self.port)
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

impl HostResolver {
    pub fn new(probe: Arc<dyn HostProbe>, port: u16, probe_timeout: Duration) -> Self {
        Self {
            probe,
            port,
            probe_timeout,
        }
    }

    /// Resolver with real TCP probes
    pub fn from_settings(settings: &ServersSettings) -> Self {
        Self::new(Arc::new(TcpProbe), settings.port, settings.probe_timeout())
    }

    /// Ordered hosts for a command
    ///
    /// An explicit host wins outright. Otherwise fixed hosts come first,
    /// followed by the responsive addresses of each range in order. If
    /// nothing is left, `localhost` is used.
    pub async fn resolve(
        &self,
        explicit: Option<&str>,
        hosts: &[String],
        ranges: &[String],
    ) -> Vec<HostEntry> {
        if let Some(host) = explicit {
            debug!("Using explicit host {}", host);
            return vec![HostEntry::unprobed(host)];
        }

        let mut entries: Vec<HostEntry> = hosts.iter().map(HostEntry::unprobed).collect();

        for spec in ranges {
            entries.extend(self.scan_range(spec).await);
        }

        if entries.is_empty() {
            warn!(
                "No servers configured or found, defaulting to {}",
                protocol::DEFAULT_HOST
            );
            entries.push(HostEntry::unprobed(protocol::DEFAULT_HOST));
        }

        entries
    }

    /// Responsive addresses of one range spec, in address order
    ///
    /// A malformed spec is logged and yields nothing.
    pub async fn scan_range(&self, spec: &str) -> Vec<HostEntry> {
        let range = match parse_range(spec) {
            Ok(range) => range,
            Err(e) => {
                error!("Invalid address range '{}': {}", spec, e);
                return Vec::new();
            }
        };

        debug!(
            "Scanning {} address(es) in {} - {}",
            range.len(),
            range.start(),
            range.end()
        );

        // Each probe holds a socket, keep well under the descriptor limit
        let permits = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
        let handles: Vec<_> = range
            .addresses()
            .into_iter()
            .map(|addr| {
                let probe = self.probe.clone();
                let permits = permits.clone();
                let (port, timeout) = (self.port, self.probe_timeout);
                tokio::spawn(async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return (addr, false);
                    };
                    (addr, probe.probe(addr, port, timeout).await)
                })
            })
            .collect();

        let mut found = Vec::new();
        for handle in handles {
            match handle.await {
                Ok((addr, true)) => {
                    info!("Found server at {}:{}", addr, self.port);
                    found.push(HostEntry {
                        address: addr.to_string(),
                        reachability: Reachability::Open,
                    });
                }
                Ok((addr, false)) => debug!("No response from {}:{}", addr, self.port),
                Err(e) => warn!("Probe task failed: {}", e),
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Answers from a fixed set of open addresses and records every probe
    #[derive(Default)]
    struct FakeProbe {
        open: HashSet<IpAddr>,
        probed: Mutex<Vec<IpAddr>>,
    }

    impl FakeProbe {
        fn open(addrs: &[&str]) -> Self {
            Self {
                open: addrs.iter().map(|a| a.parse().unwrap()).collect(),
                probed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HostProbe for FakeProbe {
        async fn probe(&self, addr: IpAddr, _port: u16, _timeout: Duration) -> bool {
            self.probed.lock().unwrap().push(addr);
            self.open.contains(&addr)
        }
    }

    /// Slow probe that records how many calls overlap
    #[derive(Default)]
    struct CountingProbe {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        total: AtomicUsize,
    }

    #[async_trait]
    impl HostProbe for CountingProbe {
        async fn probe(&self, _addr: IpAddr, _port: u16, _timeout: Duration) -> bool {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.total.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    fn resolver(probe: Arc<FakeProbe>) -> HostResolver {
        HostResolver::new(probe, 5000, Duration::from_millis(100))
    }

    fn ranges(specs: &[&str]) -> Vec<String> {
        specs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_full_range() {
        let range = parse_range("192.168.1.30-192.168.1.33").unwrap();
        assert_eq!(range.len(), 4);
        let addrs: Vec<String> = range.addresses().iter().map(|a| a.to_string()).collect();
        assert_eq!(
            addrs,
            vec!["192.168.1.30", "192.168.1.31", "192.168.1.32", "192.168.1.33"]
        );
    }

    #[test]
    fn test_parse_shorthand_replaces_last_segment() {
        let range = parse_range("10.0.0.5-20").unwrap();
        assert_eq!(range.start(), "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(range.end(), "10.0.0.20".parse::<IpAddr>().unwrap());
        assert_eq!(range.len(), 16);
    }

    #[test]
    fn test_parse_ipv6_shorthand() {
        let range = parse_range("fe80::1-3").unwrap();
        assert_eq!(range.end(), "fe80::3".parse::<IpAddr>().unwrap());
        assert_eq!(range.len(), 3);
    }

    #[test]
    fn test_parse_single_address_range() {
        let range = parse_range(" 10.0.0.7 - 10.0.0.7 ").unwrap();
        assert_eq!(range.len(), 1);
    }

    #[test]
    fn test_parse_crosses_octet_boundary() {
        let range = parse_range("10.0.0.254-10.0.1.1").unwrap();
        let addrs: Vec<String> = range.addresses().iter().map(|a| a.to_string()).collect();
        assert_eq!(addrs, vec!["10.0.0.254", "10.0.0.255", "10.0.1.0", "10.0.1.1"]);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_range("10.0.0.5"), Err(RangeError::MissingSeparator));
        assert_eq!(
            parse_range("10.0.0.5-fe80::1"),
            Err(RangeError::FamilyMismatch)
        );
        assert_eq!(parse_range("10.0.0.9-10.0.0.1"), Err(RangeError::Reversed));
        assert_eq!(parse_range("10.0.0.9-3"), Err(RangeError::Reversed));
        assert!(matches!(
            parse_range("banana-10.0.0.1"),
            Err(RangeError::InvalidAddress(_))
        ));
        assert!(matches!(
            parse_range("10.0.0.1-300"),
            Err(RangeError::InvalidAddress(_))
        ));
        assert!(matches!(
            parse_range("10.0.0.0-10.1.0.0"),
            Err(RangeError::TooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_explicit_host_overrides_everything() {
        let probe = Arc::new(FakeProbe::default());
        let hosts = resolver(probe.clone())
            .resolve(Some("pi5.local"), &ranges(&["10.0.0.1"]), &ranges(&["10.0.0.1-5"]))
            .await;

        assert_eq!(hosts, vec![HostEntry::unprobed("pi5.local")]);
        assert!(probe.probed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_range_keeps_responsive_hosts_in_order() {
        let probe = Arc::new(FakeProbe::open(&["192.168.1.32", "192.168.1.30"]));
        let hosts = resolver(probe.clone())
            .resolve(None, &[], &ranges(&["192.168.1.30-33"]))
            .await;

        let addrs: Vec<&str> = hosts.iter().map(|h| h.address.as_str()).collect();
        assert_eq!(addrs, vec!["192.168.1.30", "192.168.1.32"]);
        assert!(hosts.iter().all(|h| h.reachability == Reachability::Open));
        assert_eq!(probe.probed.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_fixed_hosts_first_and_unprobed() {
        let probe = Arc::new(FakeProbe::open(&["10.0.0.3"]));
        let hosts = resolver(probe.clone())
            .resolve(None, &ranges(&["pi-a", "pi-b"]), &ranges(&["10.0.0.1-3"]))
            .await;

        let addrs: Vec<&str> = hosts.iter().map(|h| h.address.as_str()).collect();
        assert_eq!(addrs, vec!["pi-a", "pi-b", "10.0.0.3"]);
        assert_eq!(hosts[0].reachability, Reachability::Unknown);
        assert_eq!(probe.probed.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_bad_range_is_skipped() {
        let probe = Arc::new(FakeProbe::open(&["10.0.0.2"]));
        let hosts = resolver(probe)
            .resolve(None, &[], &ranges(&["10.0.0.5-fe80::1", "10.0.0.1-2"]))
            .await;

        let addrs: Vec<&str> = hosts.iter().map(|h| h.address.as_str()).collect();
        assert_eq!(addrs, vec!["10.0.0.2"]);
    }

    #[tokio::test]
    async fn test_nothing_found_falls_back_to_localhost() {
        let probe = Arc::new(FakeProbe::default());
        let hosts = resolver(probe)
            .resolve(None, &[], &ranges(&["10.0.0.1-4"]))
            .await;
        assert_eq!(hosts, vec![HostEntry::unprobed("localhost")]);
    }

    #[tokio::test]
    async fn test_tcp_probe_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let addr: IpAddr = "127.0.0.1".parse().unwrap();

        assert!(TcpProbe.probe(addr, port, Duration::from_secs(1)).await);

        drop(listener);
        assert!(!TcpProbe.probe(addr, port, Duration::from_millis(200)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_large_range_probes_are_bounded() {
        let probe = Arc::new(CountingProbe::default());
        let resolver = HostResolver::new(probe.clone(), 5000, Duration::from_millis(100));

        let found = resolver.scan_range("10.0.0.0-10.0.3.255").await;

        assert!(found.is_empty());
        assert_eq!(probe.total.load(Ordering::SeqCst), 1024);
        let peak = probe.peak.load(Ordering::SeqCst);
        assert!(peak <= MAX_CONCURRENT_PROBES, "peak {} over limit", peak);
        assert!(peak > 1);
    }
}
