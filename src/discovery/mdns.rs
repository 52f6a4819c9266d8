//! mDNS-based LAN discovery using mdns-sd.
//!
//! Each session registers `<peer id>.<service>.local.` with its listener port
//! and the peer id as a TXT property. Browsing resolves every instance of the
//! same service type.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use mdns_sd::{Receiver, ServiceDaemon, ServiceEvent, ServiceInfo};

use super::{
    normalize_service_type, Advertisement, BrowseEvent, BrowseStream, Directory, DiscoveryError,
    ServiceEndpoint,
};

const PROP_PEER_ID: &str = "peer_id";
const PROP_VERSION: &str = "version";

/// Directory backed by a multicast DNS daemon
#[derive(Clone)]
pub struct MdnsDirectory {
    daemon: ServiceDaemon,
}

impl MdnsDirectory {
    pub fn new() -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
        Ok(MdnsDirectory { daemon })
    }

    /// Stop the daemon thread
    pub fn shutdown(&self) {
        if let Err(e) = self.daemon.shutdown() {
            log::warn!("mDNS: failed to shut down daemon: {}", e);
        }
    }
}

impl Directory for MdnsDirectory {
    fn browse(&self, service_type: &str) -> Result<Box<dyn BrowseStream>, DiscoveryError> {
        let ty = normalize_service_type(service_type);
        let receiver = self
            .daemon
            .browse(&ty)
            .map_err(|e| DiscoveryError::Daemon(e.to_string()))?;

        Ok(Box::new(MdnsBrowse {
            daemon: self.daemon.clone(),
            service_type: ty,
            receiver,
        }))
    }

    fn advertise(
        &self,
        service_type: &str,
        name: &str,
        addr: SocketAddr,
    ) -> Result<Advertisement, DiscoveryError> {
        let ty = normalize_service_type(service_type);
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "peershare-node".into());

        let properties = [
            (PROP_PEER_ID.to_string(), name.to_string()),
            (
                PROP_VERSION.to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            ),
        ];

        let info = ServiceInfo::new(
            &ty,
            name,
            &format!("{host}.local."),
            "",
            addr.port(),
            &properties[..],
        )
        .map_err(|e| DiscoveryError::InvalidService(e.to_string()))?
        .enable_addr_auto();

        let fullname = info.get_fullname().to_string();
        self.daemon
            .register(info)
            .map_err(|e| DiscoveryError::Daemon(e.to_string()))?;

        log::info!("mDNS: advertising {} on port {}", fullname, addr.port());

        let daemon = self.daemon.clone();
        Ok(Advertisement::new(name, move || {
            if let Err(e) = daemon.unregister(&fullname) {
                log::warn!("mDNS: failed to unregister {}: {}", fullname, e);
            }
        }))
    }
}

struct MdnsBrowse {
    daemon: ServiceDaemon,
    service_type: String,
    receiver: Receiver<ServiceEvent>,
}

impl BrowseStream for MdnsBrowse {
    fn recv(&mut self, timeout: Duration) -> Result<Option<BrowseEvent>, DiscoveryError> {
        let event = match self.receiver.recv_timeout(timeout) {
            Ok(event) => event,
            Err(_) if self.receiver.is_disconnected() => return Err(DiscoveryError::Closed),
            Err(_) => return Ok(None),
        };

        match event {
            ServiceEvent::ServiceResolved(info) => {
                let name = match instance_name(info.get_fullname(), &self.service_type) {
                    Some(name) => name,
                    None => {
                        log::debug!("mDNS: ignoring {}", info.get_fullname());
                        return Ok(None);
                    }
                };
                let port = info.get_port();
                let mut addrs: Vec<SocketAddr> = info
                    .get_addresses()
                    .iter()
                    .map(|ip| SocketAddr::new(*ip, port))
                    .collect();
                // IPv4 first, then a stable order
                addrs.sort_by_key(|a| (matches!(a.ip(), IpAddr::V6(_)), *a));

                if addrs.is_empty() {
                    return Ok(None);
                }
                log::debug!("mDNS: resolved {} at {:?}", name, addrs);
                Ok(Some(BrowseEvent::Resolved(ServiceEndpoint {
                    name,
                    service_type: self.service_type.clone(),
                    addrs,
                })))
            }
            ServiceEvent::ServiceRemoved(_ty, fullname) => {
                log::debug!("mDNS: service removed: {}", fullname);
                Ok(instance_name(&fullname, &self.service_type)
                    .map(|name| BrowseEvent::Removed { name }))
            }
            ServiceEvent::SearchStopped(_) => Err(DiscoveryError::Closed),
            _ => Ok(None),
        }
    }
}

impl Drop for MdnsBrowse {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.stop_browse(&self.service_type) {
            log::debug!("mDNS: stop browse {} failed: {}", self.service_type, e);
        }
    }
}

/// `ABC._demo._tcp.local.` under `_demo._tcp.local.` yields `ABC`
fn instance_name(fullname: &str, service_type: &str) -> Option<String> {
    let name = fullname.strip_suffix(service_type)?.strip_suffix('.')?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
