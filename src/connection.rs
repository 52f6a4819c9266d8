//! One secure, framed stream to one remote participant
//!
//! A `PeerConnection` is driven entirely by the coordinator's event loop:
//! readiness events go in, `ConnectionEvent`s come out. It never touches
//! shared session state.
//!
//! # State Machine
//!
//! ```text
//! Preparing ──► Ready ──► Cancelled
//!     ├─► Waiting ──► Cancelled
//!     └─► Failed
//! ```
//!
//! `Waiting` means the transport could not be reached at all. It is never
//! retried in place; the coordinator cancels it and reconnects on a later
//! discovery pass.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use socket2::{SockRef, TcpKeepalive};

use crate::error::SessionError;
use crate::framing::{encode_frame, Frame, FrameDecoder, MessageKind};
use crate::peer::PeerInfo;
use crate::secure::{PresharedKey, Role, SecureChannel};

/// Socket read chunk size
const READ_BUF_SIZE: usize = 16 * 1024;

/// Idle time before the kernel starts keepalive probes
const KEEPALIVE_IDLE: Duration = Duration::from_secs(2);

// ============================================================================
// Types
// ============================================================================

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport or secure-channel setup in progress
    Preparing,
    /// Handshake complete, frames flow
    Ready,
    /// Remote unreachable
    Waiting,
    /// Setup failed (terminal)
    Failed,
    /// Closed locally or by the remote (terminal)
    Cancelled,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Cancelled)
    }
}

/// Remote endpoint identifier used for deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Discovered service instance we connected to
    Service { name: String, service_type: String },
    /// Source address of an accepted connection
    Address(SocketAddr),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Service { name, service_type } => write!(f, "{}.{}", name, service_type),
            Endpoint::Address(addr) => write!(f, "{}", addr),
        }
    }
}

/// Something the coordinator must react to
#[derive(Debug)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// Remote identity arrived (possibly replacing an earlier one)
    Identified(PeerInfo),
    /// Application frame
    Received { kind: MessageKind, payload: Vec<u8> },
    /// Failure to report to the session's error channel
    Error(SessionError),
}

// ============================================================================
// Peer Connection
// ============================================================================

pub struct PeerConnection {
    token: Token,
    endpoint: Endpoint,
    remote_addr: SocketAddr,
    /// `None` once released
    stream: Option<TcpStream>,
    /// Outbound connect has not completed yet
    connecting: bool,
    channel: SecureChannel,
    decoder: FrameDecoder,
    state: ConnectionState,
    /// Serialized local `PeerInfo`, sent once on reaching `Ready`
    local_identity: Vec<u8>,
    peer_info: Option<PeerInfo>,
    created_at: Instant,
    last_heartbeat: Instant,
    /// Bytes accepted for sending but not yet written
    outbound: Vec<u8>,
    max_payload: u32,
}

impl PeerConnection {
    /// Start an outbound connection to a discovered endpoint
    pub fn connect(
        token: Token,
        endpoint: Endpoint,
        addr: SocketAddr,
        psk: PresharedKey,
        local: &PeerInfo,
        max_payload: u32,
        now: Instant,
    ) -> Result<Self, SessionError> {
        let stream = TcpStream::connect(addr).map_err(|source| SessionError::Connection {
            endpoint: endpoint.to_string(),
            source,
        })?;
        Self::build(token, endpoint, addr, stream, true, Role::Initiator, psk, local, max_payload, now)
    }

    /// Wrap an accepted inbound stream
    pub fn accept(
        token: Token,
        stream: TcpStream,
        addr: SocketAddr,
        psk: PresharedKey,
        local: &PeerInfo,
        max_payload: u32,
        now: Instant,
    ) -> Result<Self, SessionError> {
        configure_stream(&stream, addr);
        Self::build(
            token,
            Endpoint::Address(addr),
            addr,
            stream,
            false,
            Role::Responder,
            psk,
            local,
            max_payload,
            now,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        token: Token,
        endpoint: Endpoint,
        remote_addr: SocketAddr,
        stream: TcpStream,
        connecting: bool,
        role: Role,
        psk: PresharedKey,
        local: &PeerInfo,
        max_payload: u32,
        now: Instant,
    ) -> Result<Self, SessionError> {
        let channel = SecureChannel::new(role, psk, max_payload).map_err(|source| {
            SessionError::Handshake {
                endpoint: endpoint.to_string(),
                source,
            }
        })?;
        let hello = channel.hello().map_err(|source| SessionError::Handshake {
            endpoint: endpoint.to_string(),
            source,
        })?;

        Ok(PeerConnection {
            token,
            endpoint,
            remote_addr,
            stream: Some(stream),
            connecting,
            channel,
            decoder: FrameDecoder::new(max_payload),
            state: ConnectionState::Preparing,
            local_identity: local.to_bytes()?,
            peer_info: None,
            created_at: now,
            last_heartbeat: now,
            outbound: hello,
            max_payload,
        })
    }

    /// Register the stream with the event loop
    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => registry.register(
                stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ),
            None => Ok(()),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer_info(&self) -> Option<&PeerInfo> {
        self.peer_info.as_ref()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }

    pub fn is_initiator(&self) -> bool {
        self.channel.role() == Role::Initiator
    }

    /// Whether the connect or dead-peer timeout has expired
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        match self.state {
            ConnectionState::Preparing => now.saturating_duration_since(self.created_at) > timeout,
            ConnectionState::Ready => now.saturating_duration_since(self.last_heartbeat) > timeout,
            _ => false,
        }
    }

    /// Handle a readiness event from the poll loop
    pub fn handle_event(
        &mut self,
        readable: bool,
        writable: bool,
        now: Instant,
    ) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        if self.state.is_terminal() || self.stream.is_none() {
            return events;
        }

        if self.connecting {
            if !writable && !readable {
                return events;
            }
            match self.finish_connect() {
                Ok(true) => {}
                Ok(false) => return events,
                Err(e) => {
                    log::debug!("Connect to {} failed: {}", self.endpoint, e);
                    self.transition(ConnectionState::Waiting, &mut events);
                    return events;
                }
            }
        }

        if readable {
            self.read_ready(now, &mut events);
        }

        if !self.state.is_terminal() {
            if let Err(e) = self.flush() {
                self.stream_failed(e, &mut events);
            }
        }

        events
    }

    /// Send one frame; silently dropped unless `Ready`
    pub fn send(&mut self, kind: MessageKind, payload: &[u8]) -> Result<(), SessionError> {
        if self.state != ConnectionState::Ready {
            log::trace!("Dropping {} frame to {} in state {:?}", kind, self.endpoint, self.state);
            return Ok(());
        }

        let frame = encode_frame(kind, payload, self.max_payload)?;
        let record = self.channel.seal(&frame).map_err(|source| SessionError::Record {
            endpoint: self.endpoint.to_string(),
            source,
        })?;
        self.outbound.extend_from_slice(&record);

        if let Err(e) = self.flush() {
            log::debug!("Write to {} failed: {}", self.endpoint, e);
            self.state = ConnectionState::Cancelled;
            self.stream = None;
        }
        Ok(())
    }

    pub fn send_heartbeat(&mut self) -> Result<(), SessionError> {
        let frame = Frame::heartbeat();
        self.send(frame.kind, &frame.payload)
    }

    /// Release the stream and move to `Cancelled`
    ///
    /// Idempotent; a `Failed` connection stays `Failed`. Returns true if the
    /// state changed.
    pub fn cancel(&mut self, registry: &Registry) -> bool {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = registry.deregister(&mut stream) {
                log::trace!("Deregister {} failed: {}", self.endpoint, e);
            }
        }
        self.outbound.clear();

        if self.state.is_terminal() {
            return false;
        }
        log::debug!("Cancelled connection to {}", self.endpoint);
        self.state = ConnectionState::Cancelled;
        true
    }

    /// Seal `plaintext` as one record and write it straight to the socket,
    /// bypassing frame encoding; `corrupt` flips the last tag byte
    #[cfg(test)]
    pub(crate) fn write_raw_record(&mut self, plaintext: &[u8], corrupt: bool) -> io::Result<()> {
        let mut record = self
            .channel
            .seal(plaintext)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        if corrupt {
            if let Some(last) = record.last_mut() {
                *last ^= 0xFF;
            }
        }
        match self.stream.as_mut() {
            Some(stream) => stream.write_all(&record),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Ok(true) once connected, Ok(false) if still in progress
    fn finish_connect(&mut self) -> io::Result<bool> {
        let stream = match self.stream.as_ref() {
            Some(stream) => stream,
            None => return Ok(false),
        };

        if let Some(e) = stream.take_error()? {
            return Err(e);
        }
        match stream.peer_addr() {
            Ok(addr) => {
                log::debug!("Connected to {} at {}", self.endpoint, addr);
                configure_stream(stream, addr);
                self.connecting = false;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read_ready(&mut self, now: Instant, events: &mut Vec<ConnectionEvent>) {
        let mut buf = [0u8; READ_BUF_SIZE];

        loop {
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => return,
            };

            let len = match stream.read(&mut buf) {
                Ok(0) => {
                    self.stream_closed(events);
                    return;
                }
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.stream_failed(e, events);
                    return;
                }
            };

            if !self.receive(&buf[..len], now, events) {
                return;
            }
        }
    }

    /// Feed raw bytes through the channel and decoder; false if the connection died
    fn receive(&mut self, bytes: &[u8], now: Instant, events: &mut Vec<ConnectionEvent>) -> bool {
        let output = match self.channel.read(bytes) {
            Ok(output) => output,
            Err(source) if self.channel.is_established() => {
                log::warn!("Protocol violation from {}: {}", self.endpoint, source);
                events.push(ConnectionEvent::Error(SessionError::Record {
                    endpoint: self.endpoint.to_string(),
                    source,
                }));
                self.release();
                self.transition(ConnectionState::Cancelled, events);
                return false;
            }
            Err(source) => {
                log::warn!("Secure channel with {} failed: {}", self.endpoint, source);
                events.push(ConnectionEvent::Error(SessionError::Handshake {
                    endpoint: self.endpoint.to_string(),
                    source,
                }));
                self.fail(events);
                return false;
            }
        };

        self.outbound.extend_from_slice(&output.outgoing);

        if output.established {
            log::info!("Secure channel established with {}", self.endpoint);
            self.transition(ConnectionState::Ready, events);
            let identity = self.local_identity.clone();
            if let Err(e) = self.send(MessageKind::IDENTITY, &identity) {
                events.push(ConnectionEvent::Error(e));
            }
        }

        if output.plaintext.is_empty() {
            return true;
        }

        let frames = match self.decoder.feed(&output.plaintext) {
            Ok(frames) => frames,
            Err(e) => {
                log::warn!("Protocol violation from {}: {}", self.endpoint, e);
                events.push(ConnectionEvent::Error(e.into()));
                self.release();
                self.transition(ConnectionState::Cancelled, events);
                return false;
            }
        };

        for frame in frames {
            self.dispatch(frame, now, events);
        }
        true
    }

    fn dispatch(&mut self, frame: Frame, now: Instant, events: &mut Vec<ConnectionEvent>) {
        match frame.kind {
            MessageKind::HEARTBEAT => {
                log::trace!("Heartbeat from {}", self.endpoint);
                self.last_heartbeat = now;
            }
            MessageKind::IDENTITY => match PeerInfo::from_bytes(&frame.payload) {
                Ok(info) => {
                    log::debug!("{} identified as {}", self.endpoint, info.peer_id());
                    self.peer_info = Some(info.clone());
                    events.push(ConnectionEvent::Identified(info));
                }
                Err(e) => {
                    log::warn!("Ignoring unreadable identity from {}: {}", self.endpoint, e);
                }
            },
            kind => events.push(ConnectionEvent::Received {
                kind,
                payload: frame.payload,
            }),
        }
    }

    /// Write as much of the outbound buffer as the socket takes
    fn flush(&mut self) -> io::Result<()> {
        if self.connecting {
            return Ok(());
        }
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Ok(()),
        };

        let mut written = 0;
        while written < self.outbound.len() {
            match stream.write(&self.outbound[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.outbound.drain(..written);
        Ok(())
    }

    fn stream_closed(&mut self, events: &mut Vec<ConnectionEvent>) {
        if self.state == ConnectionState::Preparing {
            let source = io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "remote closed the stream during the handshake",
            );
            self.setup_failed(source, events);
        } else {
            log::info!("Connection to {} closed by remote", self.endpoint);
            self.release();
            self.transition(ConnectionState::Cancelled, events);
        }
    }

    fn stream_failed(&mut self, source: io::Error, events: &mut Vec<ConnectionEvent>) {
        if self.state == ConnectionState::Preparing {
            self.setup_failed(source, events);
        } else {
            log::info!("Connection to {} lost: {}", self.endpoint, source);
            self.release();
            self.transition(ConnectionState::Cancelled, events);
        }
    }

    fn setup_failed(&mut self, source: io::Error, events: &mut Vec<ConnectionEvent>) {
        log::warn!("Connection to {} failed during setup: {}", self.endpoint, source);
        events.push(ConnectionEvent::Error(SessionError::Connection {
            endpoint: self.endpoint.to_string(),
            source,
        }));
        self.fail(events);
    }

    fn fail(&mut self, events: &mut Vec<ConnectionEvent>) {
        self.release();
        self.transition(ConnectionState::Failed, events);
    }

    /// Drop the stream; deregistration happens implicitly on close
    fn release(&mut self) {
        self.stream = None;
        self.outbound.clear();
    }

    fn transition(&mut self, state: ConnectionState, events: &mut Vec<ConnectionEvent>) {
        if self.state == state || self.state.is_terminal() {
            return;
        }
        log::debug!("{}: {:?} -> {:?}", self.endpoint, self.state, state);
        self.state = state;
        events.push(ConnectionEvent::StateChanged(state));
    }
}

/// Disable Nagle and enable kernel keepalive on a connected stream
fn configure_stream(stream: &TcpStream, addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
    }
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    // mio 0.8 streams only implement AsRawFd, so borrow the fd for SockRef
    // SAFETY: the fd is owned by `stream`, which outlives this borrow.
    let fd = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
    if let Err(e) = SockRef::from(&fd).set_tcp_keepalive(&keepalive) {
        log::debug!("Failed to enable keepalive for {}: {}", addr, e);
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("token", &self.token)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("peer", &self.peer_info.as_ref().map(|p| p.peer_id()))
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{encode_header, FrameError, FrameHeader};
    use crate::secure::SecureError;
    use mio::net::TcpListener;
    use mio::{Events, Poll};

    const LISTENER: Token = Token(0);
    const CLIENT: Token = Token(1);
    const SERVER: Token = Token(2);

    struct Pair {
        poll: Poll,
        client: PeerConnection,
        server: Option<PeerConnection>,
        listener: TcpListener,
    }

    fn pair(client_secret: &str, server_secret: &str) -> Pair {
        let poll = Poll::new().unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let endpoint = Endpoint::Service {
            name: "B".to_string(),
            service_type: "_test._tcp".to_string(),
        };
        let mut client = PeerConnection::connect(
            CLIENT,
            endpoint,
            addr,
            PresharedKey::derive(client_secret, "IDENTITY"),
            &PeerInfo::with_id("A", [("name", "Tim")]),
            1024,
            Instant::now(),
        )
        .unwrap();
        client.register(poll.registry()).unwrap();

        Pair {
            poll,
            client,
            server: None,
            listener,
        }
        .with_server_secret(server_secret)
    }

    impl Pair {
        fn with_server_secret(mut self, secret: &str) -> Self {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut events = Events::with_capacity(16);
            while self.server.is_none() && Instant::now() < deadline {
                self.poll
                    .poll(&mut events, Some(Duration::from_millis(50)))
                    .unwrap();
                for event in events.iter() {
                    if event.token() == LISTENER {
                        if let Ok((stream, addr)) = self.listener.accept() {
                            let mut conn = PeerConnection::accept(
                                SERVER,
                                stream,
                                addr,
                                PresharedKey::derive(secret, "IDENTITY"),
                                &PeerInfo::with_id("B", [("name", "Eddy")]),
                                1024,
                                Instant::now(),
                            )
                            .unwrap();
                            conn.register(self.poll.registry()).unwrap();
                            // Hello is only flushed on events; kick it once.
                            let _ = conn.handle_event(false, true, Instant::now());
                            self.server = Some(conn);
                        }
                    } else if event.token() == CLIENT {
                        let _ = self.client.handle_event(
                            event.is_readable(),
                            event.is_writable(),
                            Instant::now(),
                        );
                    }
                }
            }
            assert!(self.server.is_some(), "listener never accepted");
            self
        }

        /// Pump events until `done` or the deadline; returns collected events per side
        fn pump(
            &mut self,
            mut done: impl FnMut(&PeerConnection, &PeerConnection, &[ConnectionEvent]) -> bool,
        ) -> (Vec<ConnectionEvent>, Vec<ConnectionEvent>) {
            let mut client_events = Vec::new();
            let mut server_events = Vec::new();
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut events = Events::with_capacity(16);

            loop {
                let server = self.server.as_mut().unwrap();
                if done(&self.client, server, &server_events) || Instant::now() >= deadline {
                    break;
                }
                self.poll
                    .poll(&mut events, Some(Duration::from_millis(50)))
                    .unwrap();
                for event in events.iter() {
                    let now = Instant::now();
                    if event.token() == CLIENT {
                        client_events.extend(self.client.handle_event(
                            event.is_readable(),
                            event.is_writable(),
                            now,
                        ));
                    } else if event.token() == SERVER {
                        server_events.extend(server.handle_event(
                            event.is_readable(),
                            event.is_writable(),
                            now,
                        ));
                    }
                }
            }
            (client_events, server_events)
        }
    }

    fn both_identified(c: &PeerConnection, s: &PeerConnection, _: &[ConnectionEvent]) -> bool {
        c.peer_info().is_some() && s.peer_info().is_some()
    }

    #[test]
    fn test_handshake_then_identity_exchange() {
        let mut pair = pair("1234", "1234");

        let (client_events, server_events) = pair.pump(both_identified);

        assert_eq!(pair.client.state(), ConnectionState::Ready);
        assert_eq!(pair.client.peer_info().unwrap().peer_id(), "B");
        let server = pair.server.as_ref().unwrap();
        assert_eq!(server.state(), ConnectionState::Ready);
        assert_eq!(server.peer_info().unwrap().attribute("name"), Some("Tim"));

        assert!(client_events
            .iter()
            .any(|e| matches!(e, ConnectionEvent::StateChanged(ConnectionState::Ready))));
        assert!(server_events
            .iter()
            .any(|e| matches!(e, ConnectionEvent::Identified(info) if info.peer_id() == "A")));
    }

    #[test]
    fn test_data_and_heartbeat_delivery() {
        let mut pair = pair("1234", "1234");
        pair.pump(both_identified);

        let before = pair.server.as_ref().unwrap().last_heartbeat();
        pair.client.send_heartbeat().unwrap();
        pair.client.send(MessageKind::DATA, b"hello").unwrap();

        let (_, received) = pair.pump(|_, _, events| {
            events
                .iter()
                .any(|e| matches!(e, ConnectionEvent::Received { .. }))
        });

        assert!(pair.server.as_ref().unwrap().last_heartbeat() > before);
        assert!(received.iter().any(|e| matches!(
            e,
            ConnectionEvent::Received { kind, payload }
                if *kind == MessageKind::DATA && payload == b"hello"
        )));
    }

    #[test]
    fn test_mismatched_secret_fails_both_sides() {
        let mut pair = pair("1234", "wrong");

        let (client_events, server_events) =
            pair.pump(|c, s, _| c.state().is_terminal() && s.state().is_terminal());

        assert_eq!(pair.client.state(), ConnectionState::Failed);
        assert_eq!(pair.server.as_ref().unwrap().state(), ConnectionState::Failed);
        assert!(pair.client.peer_info().is_none());
        assert!(client_events
            .iter()
            .any(|e| matches!(e, ConnectionEvent::Error(_))));
        assert!(server_events
            .iter()
            .any(|e| matches!(e, ConnectionEvent::Error(_))));
    }

    #[test]
    fn test_oversized_frame_cancels_connection() {
        let mut pair = pair("1234", "1234");
        pair.pump(both_identified);

        let header = encode_header(FrameHeader {
            kind: MessageKind::DATA,
            length: 1_000_000,
        });
        pair.client.write_raw_record(&header, false).unwrap();

        let (_, server_events) = pair.pump(|_, s, _| s.state().is_terminal());

        assert_eq!(pair.server.as_ref().unwrap().state(), ConnectionState::Cancelled);
        assert!(server_events.iter().any(|e| matches!(
            e,
            ConnectionEvent::Error(SessionError::Protocol(FrameError::PayloadTooLarge { .. }))
        )));
        assert!(server_events
            .iter()
            .any(|e| matches!(e, ConnectionEvent::StateChanged(ConnectionState::Cancelled))));
    }

    #[test]
    fn test_tampered_record_cancels_connection() {
        let mut pair = pair("1234", "1234");
        pair.pump(both_identified);

        let frame = encode_frame(MessageKind::DATA, b"hello", 1024).unwrap();
        pair.client.write_raw_record(&frame, true).unwrap();

        let (_, server_events) = pair.pump(|_, s, _| s.state().is_terminal());

        assert_eq!(pair.server.as_ref().unwrap().state(), ConnectionState::Cancelled);
        assert!(server_events.iter().any(|e| matches!(
            e,
            ConnectionEvent::Error(SessionError::Record {
                source: SecureError::AuthenticationFailed,
                ..
            })
        )));
        assert!(!server_events
            .iter()
            .any(|e| matches!(e, ConnectionEvent::Received { .. })));
    }

    #[test]
    fn test_streams_use_keepalive() {
        let mut pair = pair("1234", "1234");
        pair.pump(both_identified);

        let client = pair.client.stream.as_ref().unwrap();
        let server = pair.server.as_ref().unwrap().stream.as_ref().unwrap();
        // SAFETY: both fds are owned by streams that outlive these borrows.
        let client_fd = unsafe { BorrowedFd::borrow_raw(client.as_raw_fd()) };
        let server_fd = unsafe { BorrowedFd::borrow_raw(server.as_raw_fd()) };
        assert!(SockRef::from(&client_fd).keepalive().unwrap());
        assert!(SockRef::from(&server_fd).keepalive().unwrap());
        assert!(client.nodelay().unwrap());
    }

    #[test]
    fn test_send_before_ready_is_dropped() {
        let mut pair = pair("1234", "1234");
        assert_eq!(pair.client.state(), ConnectionState::Preparing);
        pair.client.send(MessageKind::DATA, b"early").unwrap();
        assert_eq!(pair.client.state(), ConnectionState::Preparing);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut pair = pair("1234", "1234");
        let registry = pair.poll.registry().try_clone().unwrap();

        assert!(pair.client.cancel(&registry));
        assert!(!pair.client.cancel(&registry));
        assert_eq!(pair.client.state(), ConnectionState::Cancelled);
    }

    #[test]
    fn test_staleness() {
        let mut pair = pair("1234", "1234");
        let created = pair.client.created_at();
        let timeout = Duration::from_secs(10);

        assert!(!pair.client.is_stale(created + Duration::from_secs(9), timeout));
        assert!(pair.client.is_stale(created + Duration::from_secs(11), timeout));

        let registry = pair.poll.registry().try_clone().unwrap();
        pair.client.cancel(&registry);
        assert!(!pair.client.is_stale(created + Duration::from_secs(11), timeout));
    }

    #[test]
    fn test_endpoint_display() {
        let service = Endpoint::Service {
            name: "ABC".to_string(),
            service_type: "_demo._tcp".to_string(),
        };
        assert_eq!(service.to_string(), "ABC._demo._tcp");
        let addr = Endpoint::Address("127.0.0.1:9000".parse().unwrap());
        assert_eq!(addr.to_string(), "127.0.0.1:9000");
    }
}
