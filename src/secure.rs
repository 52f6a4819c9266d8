//! Pre-shared-key authenticated record layer
//!
//! Every connection runs over this channel. Both ends must hold the same
//! `(secret, identity)` pair; anything else fails before a single application
//! frame is exchanged.
//!
//! # Handshake
//!
//! ```text
//! Initiator                                      Responder
//!   │── Hello (version, identity, nonce_i) ────────►│
//!   │◄──────── Hello (version, identity, nonce_r) ──│
//!   │                                               │
//!   │   keys = HKDF-SHA256(salt = nonce_i || nonce_r, ikm = PSK)
//!   │                                               │
//!   │── Finished (sealed) ─────────────────────────►│
//!   │◄───────────────────────── Finished (sealed) ──│
//! ```
//!
//! Hellos are sent without waiting for the peer, so neither side stalls.
//!
//! # Record Format
//!
//! ```text
//! ┌─────────────┬──────────────────────────────────────┐
//! │ Length (4B) │ Body (hello: bincode, else AES-GCM)  │
//! └─────────────┴──────────────────────────────────────┘
//! ```
//!
//! Sealed bodies use AES-128-GCM with a 96-bit per-direction counter nonce.

use std::fmt;

use ring::rand::{SecureRandom, SystemRandom};
use ring::{aead, hkdf, hmac};
use serde::{Deserialize, Serialize};

use crate::framing::HEADER_LEN;

// ============================================================================
// Constants
// ============================================================================

/// Handshake protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of each side's handshake nonce
pub const NONCE_LEN: usize = 32;

/// Length of the record header (4 bytes for length)
pub const RECORD_HEADER_LEN: usize = 4;

/// AES-GCM authentication tag length
pub const TAG_LEN: usize = 16;

/// Upper bound on a Hello body
const MAX_HELLO_LEN: usize = 1024;

const FINISHED_LABEL: &[u8] = b"peershare finished";
const INITIATOR_KEY_LABEL: &[u8] = b"peershare initiator key";
const RESPONDER_KEY_LABEL: &[u8] = b"peershare responder key";

// ============================================================================
// Pre-shared Key
// ============================================================================

/// Credential derived from `(secret, identity)`
///
/// The key is `HMAC-SHA256(key = secret, message = identity)`.
#[derive(Clone)]
pub struct PresharedKey {
    key: [u8; 32],
    identity: String,
}

impl PresharedKey {
    pub fn derive(secret: &str, identity: &str) -> Self {
        let mac_key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
        let tag = hmac::sign(&mac_key, identity.as_bytes());

        let mut key = [0u8; 32];
        key.copy_from_slice(tag.as_ref());

        PresharedKey {
            key,
            identity: identity.to_string(),
        }
    }

    /// Identity label bound into the key
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresharedKey")
            .field("identity", &self.identity)
            .field("key", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// Handshake Messages
// ============================================================================

/// Which end of the connection we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection (outbound)
    Initiator,
    /// Accepted the connection (inbound)
    Responder,
}

impl Role {
    fn tag(self) -> u8 {
        match self {
            Role::Initiator => 0x01,
            Role::Responder => 0x02,
        }
    }

    fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Hello {
    version: u8,
    identity: String,
    nonce: [u8; NONCE_LEN],
}

fn frame_record(body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

// ============================================================================
// Record Keys
// ============================================================================

/// One direction's AEAD key plus its nonce counter
struct RecordKey {
    key: aead::LessSafeKey,
    counter: u64,
}

impl RecordKey {
    fn derive(prk: &hkdf::Prk, label: &[u8]) -> Result<Self, SecureError> {
        let info = [label];
        let okm = prk
            .expand(&info, &aead::AES_128_GCM)
            .map_err(|_| SecureError::Crypto)?;

        Ok(RecordKey {
            key: aead::LessSafeKey::new(aead::UnboundKey::from(okm)),
            counter: 0,
        })
    }

    fn next_nonce(&mut self) -> Result<aead::Nonce, SecureError> {
        let mut nonce = [0u8; aead::NONCE_LEN];
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(SecureError::NonceExhausted)?;
        Ok(aead::Nonce::assume_unique_for_key(nonce))
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SecureError> {
        let nonce = self.next_nonce()?;
        let mut in_out = Vec::with_capacity(plaintext.len() + TAG_LEN);
        in_out.extend_from_slice(plaintext);
        self.key
            .seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut in_out)
            .map_err(|_| SecureError::Crypto)?;
        Ok(in_out)
    }

    fn open(&mut self, mut body: Vec<u8>) -> Result<Vec<u8>, SecureError> {
        let nonce = self.next_nonce()?;
        let len = self
            .key
            .open_in_place(nonce, aead::Aad::empty(), &mut body)
            .map_err(|_| SecureError::AuthenticationFailed)?
            .len();
        body.truncate(len);
        Ok(body)
    }
}

// ============================================================================
// Secure Channel
// ============================================================================

enum Phase {
    AwaitingHello,
    AwaitingFinished { expected: Vec<u8> },
    Established,
}

/// Bytes produced by feeding received data into the channel
#[derive(Debug, Default)]
pub struct ChannelOutput {
    /// Bytes to write back to the peer (handshake replies)
    pub outgoing: Vec<u8>,
    /// Decrypted application bytes
    pub plaintext: Vec<u8>,
    /// Set once, when the handshake completes during this call
    pub established: bool,
}

/// Sans-I/O PSK channel: bytes in, bytes out
pub struct SecureChannel {
    role: Role,
    psk: PresharedKey,
    local_nonce: [u8; NONCE_LEN],
    phase: Phase,
    sealer: Option<RecordKey>,
    opener: Option<RecordKey>,
    /// Raw bytes not yet forming a complete record
    inbound: Vec<u8>,
    max_record: usize,
}

impl SecureChannel {
    /// Create a channel; `max_payload` bounds a single application frame
    pub fn new(role: Role, psk: PresharedKey, max_payload: u32) -> Result<Self, SecureError> {
        let mut local_nonce = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut local_nonce)
            .map_err(|_| SecureError::Random)?;

        Ok(SecureChannel {
            role,
            psk,
            local_nonce,
            phase: Phase::AwaitingHello,
            sealer: None,
            opener: None,
            inbound: Vec::new(),
            max_record: HEADER_LEN + max_payload as usize + TAG_LEN,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_established(&self) -> bool {
        matches!(self.phase, Phase::Established)
    }

    /// Our opening Hello record
    pub fn hello(&self) -> Result<Vec<u8>, SecureError> {
        let hello = Hello {
            version: PROTOCOL_VERSION,
            identity: self.psk.identity().to_string(),
            nonce: self.local_nonce,
        };
        let body = bincode::serialize(&hello).map_err(|e| SecureError::Encoding(e.to_string()))?;
        Ok(frame_record(&body))
    }

    /// Feed bytes received from the peer
    ///
    /// Any error is fatal for the channel.
    pub fn read(&mut self, bytes: &[u8]) -> Result<ChannelOutput, SecureError> {
        self.inbound.extend_from_slice(bytes);

        let mut out = ChannelOutput::default();
        while let Some(body) = self.next_record()? {
            match self.phase {
                Phase::AwaitingHello => self.receive_hello(&body, &mut out)?,
                Phase::AwaitingFinished { .. } => self.receive_finished(body, &mut out)?,
                Phase::Established => {
                    let opener = self.opener.as_mut().ok_or(SecureError::NotEstablished)?;
                    out.plaintext.extend(opener.open(body)?);
                }
            }
        }

        Ok(out)
    }

    /// Seal application bytes into one record
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SecureError> {
        if !self.is_established() {
            return Err(SecureError::NotEstablished);
        }
        let sealer = self.sealer.as_mut().ok_or(SecureError::NotEstablished)?;
        Ok(frame_record(&sealer.seal(plaintext)?))
    }

    fn next_record(&mut self) -> Result<Option<Vec<u8>>, SecureError> {
        if self.inbound.len() < RECORD_HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([
            self.inbound[0],
            self.inbound[1],
            self.inbound[2],
            self.inbound[3],
        ]) as usize;

        let limit = match self.phase {
            Phase::AwaitingHello => MAX_HELLO_LEN,
            _ => self.max_record,
        };
        if length > limit {
            return Err(SecureError::RecordTooLarge(length));
        }

        let total = RECORD_HEADER_LEN + length;
        if self.inbound.len() < total {
            return Ok(None);
        }

        let body = self.inbound[RECORD_HEADER_LEN..total].to_vec();
        self.inbound.drain(..total);
        Ok(Some(body))
    }

    fn receive_hello(&mut self, body: &[u8], out: &mut ChannelOutput) -> Result<(), SecureError> {
        let hello: Hello =
            bincode::deserialize(body).map_err(|e| SecureError::MalformedHello(e.to_string()))?;

        if hello.version != PROTOCOL_VERSION {
            return Err(SecureError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: hello.version,
            });
        }
        if hello.identity != self.psk.identity() {
            return Err(SecureError::IdentityMismatch {
                remote: hello.identity,
            });
        }

        let (initiator_nonce, responder_nonce) = match self.role {
            Role::Initiator => (self.local_nonce, hello.nonce),
            Role::Responder => (hello.nonce, self.local_nonce),
        };

        let mut transcript = Vec::with_capacity(NONCE_LEN * 2);
        transcript.extend_from_slice(&initiator_nonce);
        transcript.extend_from_slice(&responder_nonce);

        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, &transcript).extract(self.psk.as_bytes());
        let initiator_key = RecordKey::derive(&prk, INITIATOR_KEY_LABEL)?;
        let responder_key = RecordKey::derive(&prk, RESPONDER_KEY_LABEL)?;

        let (mut sealer, opener) = match self.role {
            Role::Initiator => (initiator_key, responder_key),
            Role::Responder => (responder_key, initiator_key),
        };

        let finished = sealer.seal(&finished_body(self.role, &transcript))?;
        out.outgoing.extend(frame_record(&finished));

        self.sealer = Some(sealer);
        self.opener = Some(opener);
        self.phase = Phase::AwaitingFinished {
            expected: finished_body(self.role.peer(), &transcript),
        };
        Ok(())
    }

    fn receive_finished(&mut self, body: Vec<u8>, out: &mut ChannelOutput) -> Result<(), SecureError> {
        let opener = self.opener.as_mut().ok_or(SecureError::NotEstablished)?;
        let plaintext = opener.open(body)?;

        let verified = match &self.phase {
            Phase::AwaitingFinished { expected } => plaintext == *expected,
            _ => false,
        };
        if !verified {
            return Err(SecureError::AuthenticationFailed);
        }

        self.phase = Phase::Established;
        out.established = true;
        Ok(())
    }
}

fn finished_body(sender: Role, transcript: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(FINISHED_LABEL.len() + 1 + transcript.len());
    body.extend_from_slice(FINISHED_LABEL);
    body.push(sender.tag());
    body.extend_from_slice(transcript);
    body
}

// ============================================================================
// Error Types
// ============================================================================

/// Secure channel failures; all are fatal for the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecureError {
    /// System CSPRNG failed
    Random,
    /// Key schedule or sealing failed
    Crypto,
    /// Hello could not be serialized
    Encoding(String),
    /// Peer's Hello could not be parsed
    MalformedHello(String),
    /// Peer speaks another handshake version
    VersionMismatch { local: u8, remote: u8 },
    /// Peer presented a different PSK identity label
    IdentityMismatch { remote: String },
    /// Record failed authentication (wrong key or tampering)
    AuthenticationFailed,
    /// Declared record length exceeds the limit
    RecordTooLarge(usize),
    /// Application data before the handshake completed
    NotEstablished,
    /// Nonce counter wrapped
    NonceExhausted,
}

impl fmt::Display for SecureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecureError::Random => write!(f, "system random generator failed"),
            SecureError::Crypto => write!(f, "cryptographic operation failed"),
            SecureError::Encoding(e) => write!(f, "hello encoding error: {}", e),
            SecureError::MalformedHello(e) => write!(f, "malformed hello: {}", e),
            SecureError::VersionMismatch { local, remote } => {
                write!(f, "protocol version mismatch: local {} remote {}", local, remote)
            }
            SecureError::IdentityMismatch { remote } => {
                write!(f, "unknown psk identity '{}'", remote)
            }
            SecureError::AuthenticationFailed => write!(f, "record authentication failed"),
            SecureError::RecordTooLarge(size) => write!(f, "record too large: {} bytes", size),
            SecureError::NotEstablished => write!(f, "secure channel not established"),
            SecureError::NonceExhausted => write!(f, "record nonce space exhausted"),
        }
    }
}

impl std::error::Error for SecureError {}

// ============================================================================
// Tests
// ============================================================================
