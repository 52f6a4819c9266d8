//! Peer discovery
//!
//! Browsing and advertising go through the [`Directory`] trait so the session
//! can run over real mDNS ([`MdnsDirectory`]) or an in-process registry
//! ([`LocalDirectory`]).
//!
//! [`Discovery`] owns a browse on a background thread. Every change in the
//! set of discovered endpoints republishes the whole set; a failed browse is
//! restarted with bounded backoff.

mod local;
mod mdns;

pub use local::LocalDirectory;
pub use mdns::MdnsDirectory;

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::metrics::Metrics;

// ============================================================================
// Constants
// ============================================================================

/// First delay before restarting a failed browse
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Upper bound on the restart delay
pub const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// How often the browse thread checks for shutdown
const RECV_TIMEOUT: Duration = Duration::from_millis(200);

// ============================================================================
// Types
// ============================================================================

/// A discovered, resolved service instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// Instance name; the remote's peer id
    pub name: String,
    /// Service type it was advertised under
    pub service_type: String,
    /// Reachable addresses, preferred first
    pub addrs: Vec<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseEvent {
    Resolved(ServiceEndpoint),
    Removed { name: String },
}

/// A running browse
pub trait BrowseStream: Send {
    /// Wait up to `timeout` for the next change
    ///
    /// `Ok(None)` on timeout. An error ends the browse; the caller restarts it.
    fn recv(&mut self, timeout: Duration) -> Result<Option<BrowseEvent>, DiscoveryError>;
}

/// External browse/advertise primitives
pub trait Directory: Send + Sync {
    fn browse(&self, service_type: &str) -> Result<Box<dyn BrowseStream>, DiscoveryError>;

    fn advertise(
        &self,
        service_type: &str,
        name: &str,
        addr: SocketAddr,
    ) -> Result<Advertisement, DiscoveryError>;
}

/// Live advertisement; withdrawn when dropped
pub struct Advertisement {
    name: String,
    withdraw: Option<Box<dyn FnOnce() + Send>>,
}

impl Advertisement {
    pub fn new(name: impl Into<String>, withdraw: impl FnOnce() + Send + 'static) -> Self {
        Advertisement {
            name: name.into(),
            withdraw: Some(Box::new(withdraw)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Advertisement {
    fn drop(&mut self) {
        if let Some(withdraw) = self.withdraw.take() {
            log::debug!("Withdrawing advertisement {}", self.name);
            withdraw();
        }
    }
}

impl fmt::Debug for Advertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Advertisement").field("name", &self.name).finish()
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// Background browse that republishes the full result set on every change
pub struct Discovery {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Discovery {
    pub fn start<F>(
        directory: Arc<dyn Directory>,
        service_type: &str,
        metrics: Arc<Metrics>,
        publish: F,
    ) -> Result<Self, DiscoveryError>
    where
        F: FnMut(Vec<ServiceEndpoint>) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let service_type = service_type.to_string();

        let handle = thread::Builder::new()
            .name("peershare-discovery".to_string())
            .spawn({
                let stop = Arc::clone(&stop);
                move || browse_loop(directory, service_type, metrics, stop, publish)
            })
            .map_err(|e| DiscoveryError::Io(e.to_string()))?;

        Ok(Discovery {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop browsing and wait for the thread to exit
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Discovery thread panicked");
            }
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}

fn browse_loop<F>(
    directory: Arc<dyn Directory>,
    service_type: String,
    metrics: Arc<Metrics>,
    stop: Arc<AtomicBool>,
    mut publish: F,
) where
    F: FnMut(Vec<ServiceEndpoint>),
{
    let mut backoff = INITIAL_BACKOFF;
    let mut results: BTreeMap<String, ServiceEndpoint> = BTreeMap::new();

    while !stop.load(Ordering::SeqCst) {
        let mut stream = match directory.browse(&service_type) {
            Ok(stream) => {
                log::info!("Browsing for {}", service_type);
                stream
            }
            Err(e) => {
                log::warn!("Browse for {} failed: {} (retrying in {:?})", service_type, e, backoff);
                Metrics::incr(&metrics.discovery_restarts_total);
                sleep_unless_stopped(backoff, &stop);
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        while !stop.load(Ordering::SeqCst) {
            match stream.recv(RECV_TIMEOUT) {
                Ok(Some(event)) => {
                    backoff = INITIAL_BACKOFF;
                    if apply(&mut results, event) {
                        publish(results.values().cloned().collect());
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Browse for {} stopped: {} (restarting)", service_type, e);
                    Metrics::incr(&metrics.discovery_restarts_total);
                    if !results.is_empty() {
                        results.clear();
                        publish(Vec::new());
                    }
                    sleep_unless_stopped(backoff, &stop);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    break;
                }
            }
        }
    }

    log::debug!("Browse for {} finished", service_type);
}

/// Apply one change; true if the set changed
fn apply(results: &mut BTreeMap<String, ServiceEndpoint>, event: BrowseEvent) -> bool {
    match event {
        BrowseEvent::Resolved(endpoint) => {
            if results.get(&endpoint.name) == Some(&endpoint) {
                return false;
            }
            log::debug!("Discovered {} at {:?}", endpoint.name, endpoint.addrs);
            results.insert(endpoint.name.clone(), endpoint);
            true
        }
        BrowseEvent::Removed { name } => {
            let removed = results.remove(&name).is_some();
            if removed {
                log::debug!("Lost {}", name);
            }
            removed
        }
    }
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let step = Duration::from_millis(50);
    let mut slept = Duration::ZERO;
    while slept < total && !stop.load(Ordering::SeqCst) {
        thread::sleep(step);
        slept += step;
    }
}

/// Fully qualify a service type: `_demo._tcp` becomes `_demo._tcp.local.`
pub fn normalize_service_type(service_type: &str) -> String {
    let trimmed = service_type.trim_end_matches('.');
    if trimmed.ends_with(".local") {
        format!("{}.", trimmed)
    } else {
        format!("{}.local.", trimmed)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Backend daemon could not be started or reached
    Daemon(String),
    /// Service type or instance name rejected
    InvalidService(String),
    /// Browse channel closed
    Closed,
    Io(String),
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryError::Daemon(e) => write!(f, "discovery daemon error: {}", e),
            DiscoveryError::InvalidService(e) => write!(f, "invalid service: {}", e),
            DiscoveryError::Closed => write!(f, "browse closed"),
            DiscoveryError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for DiscoveryError {}
