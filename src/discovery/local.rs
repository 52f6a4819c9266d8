//! In-process directory
//!
//! Sessions sharing one `LocalDirectory` see each other's advertisements
//! without any network multicast. Used for loopback runs and tests.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{
    normalize_service_type, Advertisement, BrowseEvent, BrowseStream, Directory, DiscoveryError,
    ServiceEndpoint,
};

#[derive(Default)]
struct Registry {
    /// (service type, instance name) -> endpoint
    adverts: BTreeMap<(String, String), ServiceEndpoint>,
    subscribers: Vec<(String, Sender<BrowseEvent>)>,
}

impl Registry {
    fn notify(&mut self, service_type: &str, event: BrowseEvent) {
        self.subscribers
            .retain(|(ty, tx)| ty != service_type || tx.send(event.clone()).is_ok());
    }
}

#[derive(Clone, Default)]
pub struct LocalDirectory {
    inner: Arc<Mutex<Registry>>,
}

impl LocalDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instance names currently advertised under `service_type`
    pub fn advertised(&self, service_type: &str) -> Vec<String> {
        let ty = normalize_service_type(service_type);
        self.lock()
            .adverts
            .keys()
            .filter(|(t, _)| *t == ty)
            .map(|(_, name)| name.clone())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Directory for LocalDirectory {
    fn browse(&self, service_type: &str) -> Result<Box<dyn BrowseStream>, DiscoveryError> {
        let ty = normalize_service_type(service_type);
        let (tx, rx) = mpsc::channel();

        let mut registry = self.lock();
        for ((t, _), endpoint) in registry.adverts.iter() {
            if *t == ty {
                let _ = tx.send(BrowseEvent::Resolved(endpoint.clone()));
            }
        }
        registry.subscribers.push((ty, tx));

        Ok(Box::new(LocalBrowse { receiver: rx }))
    }

    fn advertise(
        &self,
        service_type: &str,
        name: &str,
        addr: SocketAddr,
    ) -> Result<Advertisement, DiscoveryError> {
        if name.is_empty() {
            return Err(DiscoveryError::InvalidService("empty instance name".into()));
        }

        let ty = normalize_service_type(service_type);
        let endpoint = ServiceEndpoint {
            name: name.to_string(),
            service_type: ty.clone(),
            addrs: vec![reachable(addr)],
        };
        let key = (ty.clone(), name.to_string());

        {
            let mut registry = self.lock();
            registry.adverts.insert(key.clone(), endpoint.clone());
            registry.notify(&ty, BrowseEvent::Resolved(endpoint));
        }
        log::debug!("Local directory: advertising {} under {}", name, ty);

        let inner = Arc::clone(&self.inner);
        Ok(Advertisement::new(name, move || {
            let mut registry = inner.lock().unwrap_or_else(|e| e.into_inner());
            if registry.adverts.remove(&key).is_some() {
                let (ty, name) = key;
                registry.notify(&ty, BrowseEvent::Removed { name });
            }
        }))
    }
}

struct LocalBrowse {
    receiver: Receiver<BrowseEvent>,
}

impl BrowseStream for LocalBrowse {
    fn recv(&mut self, timeout: Duration) -> Result<Option<BrowseEvent>, DiscoveryError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(DiscoveryError::Closed),
        }
    }
}

/// Listener bound to the unspecified address is reached over loopback
fn reachable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}
