//! Public session handle
//!
//! A [`Session`] advertises the local peer, discovers others under the same
//! service name, keeps an authenticated connection to each and reports what
//! happens through an [`EventSink`].
//!
//! ```no_run
//! use std::sync::{mpsc, Arc};
//! use peershare::{LocalDirectory, PeerInfo, Session, SessionConfig, SessionEvent};
//!
//! let info = PeerInfo::new([("name", "Tim")]);
//! let config = SessionConfig::new(info, "_demo._tcp", "1234", "IDENTITY");
//! let (tx, rx) = mpsc::channel();
//!
//! let mut session = Session::new(config, Arc::new(LocalDirectory::new()), tx);
//! session.start_sharing().unwrap();
//! session.send_to_all(b"hello".to_vec());
//!
//! if let Ok(SessionEvent::PeersChanged(peers)) = rx.recv() {
//!     println!("{} peers", peers.len());
//! }
//! session.stop_sharing();
//! ```

use std::net::SocketAddr;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;

use mio::{Poll, Waker};

use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::coordinator::{Command, Coordinator, LISTENER_TOKEN, WAKER_TOKEN};
use crate::discovery::{Directory, Discovery};
use crate::error::SessionError;
use crate::listener::Listener;
use crate::metrics::Metrics;
use crate::peer::PeerInfo;

// ============================================================================
// Notifications
// ============================================================================

/// Notification delivered to the application
#[derive(Debug)]
pub enum SessionEvent {
    /// The set of connected, identified peers changed
    PeersChanged(Vec<PeerInfo>),
    /// A peer presented its identity
    PeerJoined(PeerInfo),
    /// Application payload from a connected peer
    Message { from: PeerInfo, data: Vec<u8> },
    Error(SessionError),
}

/// Receiver of session notifications
///
/// Called on the coordinator thread; implementations should hand events off
/// rather than block.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: SessionEvent);
}

impl EventSink for Sender<SessionEvent> {
    fn deliver(&self, event: SessionEvent) {
        if self.send(event).is_err() {
            log::trace!("Event receiver dropped");
        }
    }
}

// ============================================================================
// Mailbox
// ============================================================================

/// Sender side of the coordinator's queue
#[derive(Clone)]
struct Mailbox {
    tx: Sender<Command>,
    waker: Arc<Waker>,
}

impl Mailbox {
    fn post(&self, command: Command) -> Result<(), SessionError> {
        self.tx
            .send(command)
            .map_err(|_| SessionError::Disconnected)?;
        self.waker.wake()?;
        Ok(())
    }
}

struct Running {
    mailbox: Mailbox,
    coordinator: thread::JoinHandle<()>,
    discovery: Discovery,
    local_addr: SocketAddr,
}

// ============================================================================
// Session
// ============================================================================

pub struct Session {
    config: SessionConfig,
    directory: Arc<dyn Directory>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    running: Option<Running>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        directory: Arc<dyn Directory>,
        sink: impl EventSink + 'static,
    ) -> Self {
        config.validate();
        Session {
            config,
            directory,
            sink: Arc::new(sink),
            clock: Arc::new(SystemClock),
            metrics: Arc::new(Metrics::new()),
            running: None,
        }
    }

    /// Replace the time source used for heartbeat and prune decisions
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.config.peer_info
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn is_sharing(&self) -> bool {
        self.running.is_some()
    }

    /// Address the listener is bound to while sharing
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Start advertising, browsing and the control loop
    pub fn start_sharing(&mut self) -> Result<(), SessionError> {
        if self.running.is_some() {
            return Err(SessionError::AlreadySharing);
        }

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let mut listener = Listener::bind(
            poll.registry(),
            LISTENER_TOKEN,
            self.config.bind_addr,
            Arc::clone(&self.directory),
            &self.config.service_name,
            self.config.peer_id(),
        )?;
        listener.ensure_advertised();
        let local_addr = listener.local_addr();

        let coordinator = Coordinator::new(
            self.config.clone(),
            poll.registry().try_clone()?,
            Some(listener),
            Arc::clone(&self.sink),
            Arc::clone(&self.clock),
            Arc::clone(&self.metrics),
        );

        let (tx, rx) = mpsc::channel();
        let mailbox = Mailbox { tx, waker };

        let handle = thread::Builder::new()
            .name("peershare-coordinator".to_string())
            .spawn(move || coordinator.run(poll, rx))?;

        let publisher = mailbox.clone();
        let discovery = match Discovery::start(
            Arc::clone(&self.directory),
            &self.config.service_name,
            Arc::clone(&self.metrics),
            move |results| {
                if publisher.post(Command::Discovered(results)).is_err() {
                    log::debug!("Coordinator gone; dropping discovery results");
                }
            },
        ) {
            Ok(discovery) => discovery,
            Err(e) => {
                let _ = mailbox.post(Command::Stop);
                let _ = handle.join();
                return Err(e.into());
            }
        };

        log::info!(
            "Sharing as {} under {} on {}",
            self.config.peer_id(),
            self.config.service_name,
            local_addr
        );

        self.running = Some(Running {
            mailbox,
            coordinator: handle,
            discovery,
            local_addr,
        });
        Ok(())
    }

    /// Stop everything and close every connection
    ///
    /// When this returns the control loop has exited and the sink has seen an
    /// empty peer list. Does nothing if not sharing.
    pub fn stop_sharing(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };

        running.discovery.stop();
        if let Err(e) = running.mailbox.post(Command::Stop) {
            log::debug!("Stop not delivered: {}", e);
        }
        if running.coordinator.join().is_err() {
            log::error!("Coordinator thread panicked");
        }
        log::info!("Stopped sharing as {}", self.config.peer_id());
    }

    /// Send `payload` to the peer with id `to`; dropped if not connected
    pub fn send(&self, to: &str, payload: impl Into<Vec<u8>>) {
        self.post(Command::Send {
            to: to.to_string(),
            payload: payload.into(),
        });
    }

    /// Send `payload` to every connection (non-ready ones drop it)
    pub fn send_to_all(&self, payload: impl Into<Vec<u8>>) {
        self.post(Command::SendToAll(payload.into()));
    }

    fn post(&self, command: Command) {
        match self.running.as_ref() {
            Some(running) => {
                if let Err(e) = running.mailbox.post(command) {
                    log::warn!("Dropping send: {}", e);
                }
            }
            None => log::debug!("Not sharing; dropping send"),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_sharing();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::LocalDirectory;

    fn session(directory: &LocalDirectory, sink: impl EventSink + 'static) -> Session {
        let config = SessionConfig::new(
            PeerInfo::with_id("A", [("name", "Tim")]),
            "_test1._tcp",
            "1234",
            "IDENTITY",
        )
        .with_bind_addr("127.0.0.1:0".parse().unwrap());
        Session::new(config, Arc::new(directory.clone()), sink)
    }

    #[test]
    fn test_double_start_rejected() {
        let directory = LocalDirectory::new();
        let (tx, _rx) = mpsc::channel::<SessionEvent>();
        let mut session = session(&directory, tx);

        session.start_sharing().unwrap();
        assert!(matches!(
            session.start_sharing(),
            Err(SessionError::AlreadySharing)
        ));
        session.stop_sharing();
    }

    #[test]
    fn test_start_advertises_and_stop_withdraws() {
        let directory = LocalDirectory::new();
        let (tx, rx) = mpsc::channel();
        let mut session = session(&directory, tx);

        session.start_sharing().unwrap();
        assert!(session.is_sharing());
        assert!(session.local_addr().is_some());
        assert_eq!(directory.advertised("_test1._tcp"), vec!["A".to_string()]);

        session.stop_sharing();
        assert!(!session.is_sharing());
        assert!(directory.advertised("_test1._tcp").is_empty());
        assert!(rx
            .try_iter()
            .any(|e| matches!(e, SessionEvent::PeersChanged(peers) if peers.is_empty())));
    }

    #[test]
    fn test_restart_after_stop() {
        let directory = LocalDirectory::new();
        let (tx, _rx) = mpsc::channel::<SessionEvent>();
        let mut session = session(&directory, tx);

        session.start_sharing().unwrap();
        session.stop_sharing();
        session.start_sharing().unwrap();
        assert!(session.is_sharing());
    }

    #[test]
    fn test_send_while_stopped_is_dropped() {
        let directory = LocalDirectory::new();
        let (tx, _rx) = mpsc::channel::<SessionEvent>();
        let session = session(&directory, tx);

        session.send("B", b"hello".to_vec());
        session.send_to_all(b"hello".to_vec());
        assert_eq!(
            session.metrics().frames_sent_total.load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }
}
