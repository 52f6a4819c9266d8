//! Session coordinator
//!
//! The single owner of every connection record, the last discovery result
//! set and the active peer set. It runs on one thread around a `mio::Poll`;
//! sockets, the mailbox waker and the control-loop deadline all feed the same
//! loop, so no state here is ever locked.
//!
//! # Control Cycle
//!
//! Every `heartbeat_interval`:
//! 1. heartbeat every record
//! 2. cancel records stuck in `Preparing`, or `Ready` without a heartbeat,
//!    for longer than `connection_timeout`
//! 3. re-bind a lost listener and retry a failed advertisement
//! 4. reconnect to eligible discovered endpoints
//! 5. republish the active peer set if it changed
//!
//! Every connection, discovery or listener event also drops terminal records
//! and republishes the peer set.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Instant;

use mio::event::Event;
use mio::{Events, Poll, Registry, Token};

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::connection::{ConnectionEvent, ConnectionState, Endpoint, PeerConnection};
use crate::discovery::{normalize_service_type, ServiceEndpoint};
use crate::error::SessionError;
use crate::framing::MessageKind;
use crate::listener::Listener;
use crate::metrics::Metrics;
use crate::peer::PeerInfo;
use crate::secure::PresharedKey;
use crate::session::{EventSink, SessionEvent};

// ============================================================================
// Constants
// ============================================================================

/// mio token for the listening socket
pub(crate) const LISTENER_TOKEN: Token = Token(0);

/// mio token for the mailbox waker
pub(crate) const WAKER_TOKEN: Token = Token(1);

/// First token handed to a connection
const FIRST_CONNECTION_TOKEN: usize = 2;

// ============================================================================
// Mailbox Commands
// ============================================================================

/// Work posted to the coordinator from other threads
#[derive(Debug)]
pub(crate) enum Command {
    Send { to: String, payload: Vec<u8> },
    SendToAll(Vec<u8>),
    /// Full discovery result set (not a diff)
    Discovered(Vec<ServiceEndpoint>),
    Stop,
}

// ============================================================================
// Coordinator
// ============================================================================

pub(crate) struct Coordinator {
    config: SessionConfig,
    psk: PresharedKey,
    /// Fully-qualified form of `config.service_name`
    service_type: String,
    registry: Registry,
    listener: Option<Listener>,
    connections: BTreeMap<Token, PeerConnection>,
    next_token: usize,
    browse_results: Vec<ServiceEndpoint>,
    /// Index of the address to try first on the next dial, per endpoint
    dial_cursor: HashMap<Endpoint, usize>,
    active_peers: Vec<PeerInfo>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    next_check: Instant,
}

impl Coordinator {
    pub(crate) fn new(
        config: SessionConfig,
        registry: Registry,
        listener: Option<Listener>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let next_check = clock.now() + config.heartbeat_interval;
        Coordinator {
            psk: config.preshared_key(),
            service_type: normalize_service_type(&config.service_name),
            config,
            registry,
            listener,
            connections: BTreeMap::new(),
            next_token: FIRST_CONNECTION_TOKEN,
            browse_results: Vec::new(),
            dial_cursor: HashMap::new(),
            active_peers: Vec::new(),
            sink,
            clock,
            metrics,
            next_check,
        }
    }

    /// Event loop; returns after a `Stop` command or when every sender is gone
    pub(crate) fn run(mut self, mut poll: Poll, inbox: Receiver<Command>) {
        let mut events = Events::with_capacity(1024);
        log::info!("Coordinator for {} running", self.config.peer_id());

        loop {
            let timeout = self.next_check.saturating_duration_since(self.clock.now());

            if let Err(e) = poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("Poll failed: {}", e);
                self.sink.deliver(SessionEvent::Error(SessionError::Io(e)));
                self.shutdown();
                return;
            }

            self.process_events(&events);

            loop {
                match inbox.try_recv() {
                    Ok(Command::Stop) | Err(TryRecvError::Disconnected) => {
                        self.shutdown();
                        return;
                    }
                    Ok(command) => self.handle_command(command),
                    Err(TryRecvError::Empty) => break,
                }
            }

            let now = self.clock.now();
            if now >= self.next_check {
                self.run_control_cycle();
                self.next_check = now + self.config.heartbeat_interval;
            }
        }
    }

    pub(crate) fn process_events(&mut self, events: &Events) {
        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => self.accept_inbound(),
                WAKER_TOKEN => {}
                token => self.connection_event(token, event),
            }
        }
    }

    pub(crate) fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { to, payload } => {
                let targets: Vec<Token> = self
                    .connections
                    .iter()
                    .filter(|(_, c)| c.peer_info().map(|p| p.peer_id()) == Some(to.as_str()))
                    .map(|(token, _)| *token)
                    .collect();
                if targets.is_empty() {
                    log::debug!("No connection to {}; dropping {} bytes", to, payload.len());
                }
                for token in targets {
                    self.send_data(token, &payload);
                }
            }
            Command::SendToAll(payload) => {
                let tokens: Vec<Token> = self.connections.keys().copied().collect();
                for token in tokens {
                    self.send_data(token, &payload);
                }
            }
            Command::Discovered(results) => {
                log::debug!("Discovery published {} endpoints", results.len());
                self.browse_results = results;
                self.dial_cursor.retain(|endpoint, _| {
                    self.browse_results
                        .iter()
                        .any(|c| service_endpoint(c) == *endpoint)
                });
                self.connect_eligible();
            }
            Command::Stop => self.shutdown(),
        }
        self.prune_terminal();
        self.refresh_peers();
    }

    /// One pass of the periodic control loop
    pub(crate) fn run_control_cycle(&mut self) {
        let now = self.clock.now();
        log::trace!("Control cycle: {} connections", self.connections.len());

        for conn in self.connections.values_mut() {
            let ready = conn.state() == ConnectionState::Ready;
            match conn.send_heartbeat() {
                Ok(()) if ready => Metrics::incr(&self.metrics.frames_sent_total),
                Ok(()) => {}
                Err(e) => log::debug!("Heartbeat to {} failed: {}", conn.endpoint(), e),
            }
        }

        let timeout = self.config.connection_timeout;
        for conn in self.connections.values_mut() {
            if conn.is_stale(now, timeout) {
                log::info!(
                    "Pruning {:?} connection to {} (no progress for {:?})",
                    conn.state(),
                    conn.endpoint(),
                    timeout
                );
                Metrics::incr(&self.metrics.connections_pruned_total);
                conn.cancel(&self.registry);
            }
        }
        self.prune_terminal();

        if let Some(listener) = self.listener.as_mut() {
            if !listener.is_listening() {
                Metrics::incr(&self.metrics.discovery_restarts_total);
                if let Err(e) = listener.restart(&self.registry) {
                    log::warn!("Listener restart failed: {} (retrying next cycle)", e);
                }
            }
            listener.ensure_advertised();
        }

        self.connect_eligible();
        self.refresh_peers();
    }

    #[cfg(test)]
    pub(crate) fn connections(&self) -> impl Iterator<Item = &PeerConnection> {
        self.connections.values()
    }

    #[cfg(test)]
    pub(crate) fn active_peers(&self) -> &[PeerInfo] {
        &self.active_peers
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    fn accept_inbound(&mut self) {
        let listener = match self.listener.as_mut() {
            Some(listener) => listener,
            None => return,
        };

        let accepted = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("Listener failed: {} (restarting)", e);
                Metrics::incr(&self.metrics.discovery_restarts_total);
                if let Err(e) = listener.restart(&self.registry) {
                    log::warn!("Listener restart failed: {} (retrying next cycle)", e);
                }
                return;
            }
        };

        let now = self.clock.now();
        for (stream, addr) in accepted {
            let endpoint = Endpoint::Address(addr);
            if self.connections.values().any(|c| *c.endpoint() == endpoint) {
                log::debug!("Dropping duplicate inbound connection from {}", addr);
                Metrics::incr(&self.metrics.connections_deduplicated_total);
                continue;
            }

            let token = self.allocate_token();
            let mut conn = match PeerConnection::accept(
                token,
                stream,
                addr,
                self.psk.clone(),
                &self.config.peer_info,
                self.config.max_message_size,
                now,
            ) {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("Rejecting inbound connection from {}: {}", addr, e);
                    continue;
                }
            };
            if let Err(e) = conn.register(&self.registry) {
                log::warn!("Failed to register inbound connection from {}: {}", addr, e);
                continue;
            }

            log::info!("Accepted connection from {}", addr);
            Metrics::incr(&self.metrics.connections_accepted_total);
            self.connections.insert(token, conn);
        }

        self.refresh_peers();
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Apply the tie-break and dedup rules to the last discovery results
    fn connect_eligible(&mut self) {
        let local_id = self.config.peer_id();
        let candidates: Vec<ServiceEndpoint> = self
            .browse_results
            .iter()
            .filter(|c| c.service_type == self.service_type)
            .filter(|c| c.name.as_str() < local_id)
            .filter(|c| {
                let endpoint = service_endpoint(c);
                !self.connections.values().any(|conn| *conn.endpoint() == endpoint)
            })
            .cloned()
            .collect();

        for candidate in candidates {
            self.open_outbound(&candidate);
        }
    }

    /// Dial one of the candidate's addresses
    ///
    /// Each dial starts one past the address used last time, so an address
    /// that only fails asynchronously does not block the others.
    fn open_outbound(&mut self, candidate: &ServiceEndpoint) {
        let endpoint = service_endpoint(candidate);
        let now = self.clock.now();
        let token = self.allocate_token();
        let count = candidate.addrs.len();
        let start = self.dial_cursor.get(&endpoint).copied().unwrap_or(0);

        for offset in 0..count {
            let index = (start + offset) % count;
            let addr = &candidate.addrs[index];
            let mut conn = match PeerConnection::connect(
                token,
                endpoint.clone(),
                *addr,
                self.psk.clone(),
                &self.config.peer_info,
                self.config.max_message_size,
                now,
            ) {
                Ok(conn) => conn,
                Err(e) => {
                    log::debug!("Connect to {} at {} failed: {}", endpoint, addr, e);
                    continue;
                }
            };
            if let Err(e) = conn.register(&self.registry) {
                log::warn!("Failed to register connection to {}: {}", endpoint, e);
                continue;
            }

            log::info!("Connecting to {} at {}", endpoint, addr);
            Metrics::incr(&self.metrics.connections_initiated_total);
            self.dial_cursor.insert(endpoint, index + 1);
            self.connections.insert(token, conn);
            return;
        }
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    // ------------------------------------------------------------------------
    // Connection Events
    // ------------------------------------------------------------------------

    fn connection_event(&mut self, token: Token, event: &Event) {
        let readable = event.is_readable() || event.is_read_closed() || event.is_error();
        let writable = event.is_writable() || event.is_write_closed();
        let now = self.clock.now();

        let events = match self.connections.get_mut(&token) {
            Some(conn) => conn.handle_event(readable, writable, now),
            None => return,
        };
        if events.is_empty() {
            return;
        }

        for event in events {
            self.apply_connection_event(token, event);
        }
        self.prune_terminal();
        self.refresh_peers();
    }

    fn apply_connection_event(&mut self, token: Token, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(state) => match state {
                ConnectionState::Waiting => {
                    if let Some(conn) = self.connections.get_mut(&token) {
                        log::info!("{} unreachable; will retry on a later cycle", conn.endpoint());
                        conn.cancel(&self.registry);
                    }
                }
                ConnectionState::Failed => {
                    Metrics::incr(&self.metrics.handshake_failures_total);
                }
                _ => {}
            },
            ConnectionEvent::Identified(info) => {
                Metrics::incr(&self.metrics.frames_received_total);
                log::info!("Peer joined: {}", info.peer_id());
                self.sink.deliver(SessionEvent::PeerJoined(info));
            }
            ConnectionEvent::Received { kind, payload } => {
                Metrics::incr(&self.metrics.frames_received_total);
                let from = self
                    .connections
                    .get(&token)
                    .and_then(|c| c.peer_info())
                    .cloned();
                match from {
                    Some(from) => {
                        log::trace!("{} bytes of {} from {}", payload.len(), kind, from.peer_id());
                        self.sink.deliver(SessionEvent::Message {
                            from,
                            data: payload,
                        });
                    }
                    None => log::debug!("Dropping {} frame from unidentified peer", kind),
                }
            }
            ConnectionEvent::Error(e) => {
                if e.is_protocol_violation() {
                    Metrics::incr(&self.metrics.protocol_violations_total);
                    log::warn!("{}", e);
                } else {
                    self.sink.deliver(SessionEvent::Error(e));
                }
            }
        }
    }

    fn send_data(&mut self, token: Token, payload: &[u8]) {
        if let Some(conn) = self.connections.get_mut(&token) {
            let ready = conn.state() == ConnectionState::Ready;
            match conn.send(MessageKind::DATA, payload) {
                Ok(()) if ready => Metrics::incr(&self.metrics.frames_sent_total),
                Ok(()) => {}
                Err(e) => log::warn!("Send to {} rejected: {}", conn.endpoint(), e),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------------

    /// Drop every record in a terminal state
    fn prune_terminal(&mut self) {
        let registry = &self.registry;
        self.connections.retain(|_, conn| {
            if conn.state().is_terminal() {
                conn.cancel(registry);
                log::debug!("Removed {:?} connection to {}", conn.state(), conn.endpoint());
                false
            } else {
                true
            }
        });
    }

    /// Recompute the active peer set; notify only on change
    fn refresh_peers(&mut self) {
        let mut peers: Vec<PeerInfo> = Vec::new();
        for conn in self.connections.values() {
            if conn.state() != ConnectionState::Ready {
                continue;
            }
            if let Some(info) = conn.peer_info() {
                if !peers.contains(info) {
                    peers.push(info.clone());
                }
            }
        }

        if peers != self.active_peers {
            log::info!("Active peers: {}", peers.len());
            self.active_peers = peers.clone();
            self.sink.deliver(SessionEvent::PeersChanged(peers));
        }
    }

    fn shutdown(&mut self) {
        log::info!(
            "Coordinator for {} stopping ({} connections)",
            self.config.peer_id(),
            self.connections.len()
        );
        for conn in self.connections.values_mut() {
            conn.cancel(&self.registry);
        }
        self.connections.clear();
        if let Some(mut listener) = self.listener.take() {
            listener.close(&self.registry);
        }
        self.browse_results.clear();
        self.active_peers.clear();
        self.sink.deliver(SessionEvent::PeersChanged(Vec::new()));
    }
}

fn service_endpoint(candidate: &ServiceEndpoint) -> Endpoint {
    Endpoint::Service {
        name: candidate.name.clone(),
        service_type: candidate.service_type.clone(),
    }
}

// ============================================================================
// Tests
// ============================================================================
