//! Session error type

use std::fmt;
use std::io;

use crate::discovery::DiscoveryError;
use crate::framing::FrameError;
use crate::secure::SecureError;

/// Errors surfaced by the session and its connections
#[derive(Debug)]
pub enum SessionError {
    /// `start_sharing` called while already sharing
    AlreadySharing,
    /// Listener socket could not be bound
    Bind(io::Error),
    /// Event loop setup or polling failed
    Io(io::Error),
    /// Advertisement or browsing failed
    Discovery(DiscoveryError),
    /// Secure-channel handshake with `endpoint` failed
    Handshake { endpoint: String, source: SecureError },
    /// Stream with `endpoint` failed before becoming ready
    Connection { endpoint: String, source: io::Error },
    /// Malformed frame
    Protocol(FrameError),
    /// Record rejected on an established channel with `endpoint`
    Record { endpoint: String, source: SecureError },
    /// Identity record could not be encoded or decoded
    Serialization(String),
    /// Coordinator thread is gone
    Disconnected,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::AlreadySharing => write!(f, "session is already sharing"),
            SessionError::Bind(e) => write!(f, "failed to bind listener: {}", e),
            SessionError::Io(e) => write!(f, "event loop error: {}", e),
            SessionError::Discovery(e) => write!(f, "discovery error: {}", e),
            SessionError::Handshake { endpoint, source } => {
                write!(f, "handshake with {} failed: {}", endpoint, source)
            }
            SessionError::Connection { endpoint, source } => {
                write!(f, "connection to {} failed: {}", endpoint, source)
            }
            SessionError::Protocol(e) => write!(f, "protocol violation: {}", e),
            SessionError::Record { endpoint, source } => {
                write!(f, "bad record from {}: {}", endpoint, source)
            }
            SessionError::Serialization(e) => write!(f, "serialization error: {}", e),
            SessionError::Disconnected => write!(f, "session coordinator is not running"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Bind(e) | SessionError::Io(e) => Some(e),
            SessionError::Discovery(e) => Some(e),
            SessionError::Handshake { source, .. } | SessionError::Record { source, .. } => {
                Some(source)
            }
            SessionError::Connection { source, .. } => Some(source),
            SessionError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl SessionError {
    /// Violations that cancel one live connection and are only logged
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, SessionError::Protocol(_) | SessionError::Record { .. })
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Io(e)
    }
}

impl From<DiscoveryError> for SessionError {
    fn from(e: DiscoveryError) -> Self {
        SessionError::Discovery(e)
    }
}

impl From<FrameError> for SessionError {
    fn from(e: FrameError) -> Self {
        SessionError::Protocol(e)
    }
}
