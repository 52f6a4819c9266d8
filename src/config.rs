//! Session configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::framing::DEFAULT_MAX_PAYLOAD;
use crate::peer::PeerInfo;
use crate::secure::PresharedKey;

// ============================================================================
// Constants
// ============================================================================

/// Seconds between heartbeats to connected peers
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Seconds without a heartbeat (or without reaching ready) before a connection is dropped
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Listen on every interface, ephemeral port
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:0";

// ============================================================================
// Session Config
// ============================================================================

/// Immutable configuration for one session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Information about the local participant
    pub peer_info: PeerInfo,
    /// Agreed service name, e.g. `_demo._tcp`
    pub service_name: String,
    /// Shared secret every participant must know
    pub secret: String,
    /// Identity label bound into the key derivation
    pub identity: String,
    /// Interval between heartbeats and connectivity checks
    pub heartbeat_interval: Duration,
    /// Connect timeout and dead-peer timeout
    pub connection_timeout: Duration,
    /// Address the listener binds to
    pub bind_addr: SocketAddr,
    /// Largest accepted payload per frame
    pub max_message_size: u32,
}

impl SessionConfig {
    pub fn new(
        peer_info: PeerInfo,
        service_name: impl Into<String>,
        secret: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        SessionConfig {
            peer_info,
            service_name: service_name.into(),
            secret: secret.into(),
            identity: identity.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            max_message_size: DEFAULT_MAX_PAYLOAD,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_max_message_size(mut self, max: u32) -> Self {
        self.max_message_size = max;
        self
    }

    /// Local peer id, also the advertised instance name
    pub fn peer_id(&self) -> &str {
        self.peer_info.peer_id()
    }

    /// Credential derived from the secret and identity label
    pub fn preshared_key(&self) -> PresharedKey {
        PresharedKey::derive(&self.secret, &self.identity)
    }

    /// Report suspicious settings; returns the number of warnings logged
    ///
    /// Nothing here is fatal.
    pub fn validate(&self) -> usize {
        let mut warnings = 0;

        if self.heartbeat_interval >= self.connection_timeout {
            log::warn!(
                "heartbeat interval {:?} is not shorter than connection timeout {:?}; \
                 connections will be considered stale",
                self.heartbeat_interval,
                self.connection_timeout
            );
            warnings += 1;
        }

        if self.heartbeat_interval.is_zero() {
            log::warn!("heartbeat interval is zero; the control loop will spin");
            warnings += 1;
        }

        if self.service_name.is_empty() {
            log::warn!("empty service name; no peers will be discovered");
            warnings += 1;
        }

        warnings
    }
}
