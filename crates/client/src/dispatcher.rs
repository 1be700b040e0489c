//! Client dispatcher
//!
//! Fans a command out over the resolved hosts and reconciles the result with
//! local state:
//! - `list` queries every host concurrently and tags devices with their host
//! - `find`/`attach`/`detach` with `first` set walk hosts in order and stop
//!   at the first match; without it every host is asked concurrently
//! - `attach` finishes with a local `usbip attach`
//! - `detach` releases the local port before asking the server to unbind

use common::UsbipTool;
use protocol::{DeviceRequest, Request, Response, UsbDevice};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::network::exchange;
use crate::ports::{PortRecord, PortRegistry, find_in};
use crate::resolver::HostEntry;

/// A device together with the server that reported it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDevice {
    pub host: String,
    pub device: UsbDevice,
}

impl fmt::Display for HostDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<16} {}", self.host, self.device)
    }
}

/// Result of a multi-host `list`
#[derive(Debug, Default)]
pub struct ListOutcome {
    /// Devices from every host that answered, in host order
    pub devices: Vec<HostDevice>,
    /// Hosts that could not be listed, with the reason
    pub skipped: Vec<(String, ClientError)>,
}

/// Device detached by [`Dispatcher::detach`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detached {
    pub device: HostDevice,
    /// Local port the device occupied
    pub port: u16,
}

/// Sends commands to device servers on behalf of the CLI
#[derive(Debug, Clone)]
pub struct Dispatcher {
    hosts: Vec<HostEntry>,
    port: u16,
    timeout: Duration,
    usbip: UsbipTool,
    ports: PortRegistry,
}

impl Dispatcher {
    /// # Arguments
    /// * `hosts` - Resolved hosts, in the order they should be tried
    /// * `port` - Command server port
    /// * `timeout` - Deadline for each exchange
    /// * `usbip` - Local usbip tool for attach/detach/port
    pub fn new(hosts: Vec<HostEntry>, port: u16, timeout: Duration, usbip: UsbipTool) -> Self {
        let ports = PortRegistry::new(usbip.clone());
        Self {
            hosts,
            port,
            timeout,
            usbip,
            ports,
        }
    }

    pub fn hosts(&self) -> &[HostEntry] {
        &self.hosts
    }

    /// One exchange with one host; error envelopes become [`ClientError::Server`]
    pub async fn send(&self, host: &str, request: &Request) -> Result<Response> {
        send_to(host, self.port, request, self.timeout).await
    }

    /// Every device on every reachable host
    pub async fn list(&self) -> Result<ListOutcome> {
        let results = self.fan_out(Request::List).await;

        let mut outcome = ListOutcome::default();
        for (host, result) in results {
            match result {
                Ok(Response::Devices(devices)) => {
                    outcome.devices.extend(devices.into_iter().map(|device| HostDevice {
                        host: host.clone(),
                        device,
                    }));
                }
                Ok(other) => {
                    warn!("Unexpected list response from {}: {:?}", host, other);
                    outcome.skipped.push((host.clone(), unexpected(&host)));
                }
                Err(e) => {
                    warn!("Skipping {}: {}", host, e);
                    outcome.skipped.push((host, e));
                }
            }
        }

        if !self.hosts.is_empty() && outcome.skipped.len() == self.hosts.len() {
            return Err(ClientError::AllHostsFailed {
                count: self.hosts.len(),
            });
        }
        Ok(outcome)
    }

    /// Matching devices: the first one with `filter.first`, else one per host
    pub async fn find(&self, filter: &DeviceRequest) -> Result<Vec<HostDevice>> {
        if filter.first {
            return self.first_match(Request::Find(filter.clone())).await.map(|d| vec![d]);
        }

        let matches = self.all_matches(filter).await;
        if matches.is_empty() {
            return Err(ClientError::NotFoundAnywhere);
        }
        Ok(matches)
    }

    /// Bind the device on its server, then attach it locally
    pub async fn attach(&self, filter: &DeviceRequest) -> Result<HostDevice> {
        let bound = if filter.first {
            self.first_match(Request::Attach(filter.clone())).await?
        } else {
            let candidate = self.unique_match(filter).await?;
            let request = Request::Attach(DeviceRequest::by_bus(candidate.device.bus_id.clone()));
            let device = expect_device(&candidate.host, self.send(&candidate.host, &request).await?)?;
            HostDevice {
                host: candidate.host,
                device,
            }
        };

        info!(
            "Server {} bound {}, attaching locally",
            bound.host, bound.device.bus_id
        );

        if let Err(e) = self.usbip.attach(&bound.host, &bound.device.bus_id).await {
            return Err(ClientError::StateInconsistency {
                host: bound.host,
                bus_id: bound.device.bus_id,
                reason: format!("bound on server but local attach failed: {}", e),
            });
        }

        Ok(bound)
    }

    /// Release the local port, then unbind the device on its server
    pub async fn detach(&self, filter: &DeviceRequest) -> Result<Detached> {
        let candidates = if filter.first {
            self.hosts
                .iter()
                .map(|h| h.address.clone())
                .collect::<Vec<_>>()
        } else {
            let candidate = self.unique_match(filter).await?;
            vec![candidate.host]
        };

        let records = self.ports.list_ports().await?;
        let (device, record) = self.locate_attached(&candidates, filter, &records).await?;

        info!(
            "Detaching {} from local port {}",
            device.device.bus_id, record.port
        );
        self.usbip.detach(record.port).await?;

        let request = Request::Detach(DeviceRequest::by_bus(device.device.bus_id.clone()));
        if let Err(e) = self.send(&device.host, &request).await {
            return Err(ClientError::StateInconsistency {
                host: device.host,
                bus_id: device.device.bus_id,
                reason: format!("detached locally but server unbind failed: {}", e),
            });
        }

        Ok(Detached {
            device,
            port: record.port,
        })
    }

    /// Walk `hosts` in order and return the first matching device that
    /// occupies a local port
    ///
    /// Every device on a host that satisfies the filter is a candidate, so
    /// the attached one is found even when identical devices share a host.
    async fn locate_attached(
        &self,
        hosts: &[String],
        filter: &DeviceRequest,
        records: &[PortRecord],
    ) -> Result<(HostDevice, PortRecord)> {
        let mut not_attached = None;

        for host in hosts {
            let devices = match self.send(host, &Request::List).await {
                Ok(Response::Devices(devices)) => devices,
                Ok(other) => {
                    debug!("Unexpected list response from {}: {:?}", host, other);
                    continue;
                }
                Err(e) => {
                    debug!("{}: {}", host, e);
                    continue;
                }
            };

            for device in devices.into_iter().filter(|d| filter.matches(d)) {
                if let Some(record) = find_in(records, host, &device.bus_id).await {
                    let device = HostDevice {
                        host: host.clone(),
                        device,
                    };
                    return Ok((device, record));
                }
                debug!("{} from {} is not attached locally", device.bus_id, host);
                not_attached.get_or_insert(ClientError::NotAttached {
                    host: host.clone(),
                    bus_id: device.bus_id,
                });
            }
        }

        Err(not_attached.unwrap_or(ClientError::NotFoundAnywhere))
    }

    /// Sequential early-exit search
    ///
    /// A server error other than "no matching device" (for example a failed
    /// bind) is returned if no host succeeds.
    async fn first_match(&self, request: Request) -> Result<HostDevice> {
        let mut hard_failure = None;

        for entry in &self.hosts {
            let host = &entry.address;
            match self.send(host, &request).await.and_then(|r| expect_device(host, r)) {
                Ok(device) => {
                    debug!("{} matched on {}", device.bus_id, host);
                    return Ok(HostDevice {
                        host: host.clone(),
                        device,
                    });
                }
                Err(e) if e.is_no_match() => debug!("No match on {}", host),
                Err(e @ ClientError::Server { .. }) => {
                    warn!("{}", e);
                    hard_failure.get_or_insert(e);
                }
                Err(e) => warn!("Skipping {}: {}", host, e),
            }
        }

        Err(hard_failure.unwrap_or(ClientError::NotFoundAnywhere))
    }

    /// Concurrent `find` on every host, matches in host order
    async fn all_matches(&self, filter: &DeviceRequest) -> Vec<HostDevice> {
        let results = self.fan_out(Request::Find(filter.clone())).await;

        results
            .into_iter()
            .filter_map(|(host, result)| match result.and_then(|r| expect_device(&host, r)) {
                Ok(device) => Some(HostDevice { host, device }),
                Err(e) => {
                    debug!("No match from {}: {}", host, e);
                    None
                }
            })
            .collect()
    }

    async fn unique_match(&self, filter: &DeviceRequest) -> Result<HostDevice> {
        let mut matches = self.all_matches(filter).await;
        match matches.len() {
            0 => Err(ClientError::NotFoundAnywhere),
            1 => Ok(matches.remove(0)),
            _ => Err(ClientError::Ambiguous(matches)),
        }
    }

    /// Send `request` to every host at once, results in host order
    async fn fan_out(&self, request: Request) -> Vec<(String, Result<Response>)> {
        let handles: Vec<_> = self
            .hosts
            .iter()
            .map(|entry| {
                let host = entry.address.clone();
                let request = request.clone();
                let (port, timeout) = (self.port, self.timeout);
                tokio::spawn(async move {
                    let result = send_to(&host, port, &request, timeout).await;
                    (host, result)
                })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (entry, handle) in self.hosts.iter().zip(handles) {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => results.push((
                    entry.address.clone(),
                    Err(ClientError::Connectivity {
                        host: entry.address.clone(),
                        reason: format!("request task failed: {}", e),
                    }),
                )),
            }
        }
        results
    }
}

async fn send_to(host: &str, port: u16, request: &Request, timeout: Duration) -> Result<Response> {
    match exchange(host, port, request, timeout).await? {
        Response::Error(message) => Err(ClientError::Server {
            host: host.to_string(),
            message,
        }),
        response => Ok(response),
    }
}

fn expect_device(host: &str, response: Response) -> Result<UsbDevice> {
    match response {
        Response::Device(device) => Ok(device),
        _ => Err(unexpected(host)),
    }
}

fn unexpected(host: &str) -> ClientError {
    ClientError::Server {
        host: host.to_string(),
        message: "unexpected response shape".to_string(),
    }
}
