//! Message framing for peer connections
//!
//! Every message on an established connection is a fixed 8-byte header
//! followed by the raw payload.
//!
//! # Wire Format
//!
//! Both header fields are big-endian (network byte order):
//! ```text
//! ┌──────────────┬────────────────┬──────────────────────────┐
//! │ Kind (4B BE) │ Length (4B BE) │ Payload (Length bytes)   │
//! └──────────────┴────────────────┴──────────────────────────┘
//! ```
//!
//! Kinds `0` (heartbeat) and `1` (identity) are reserved by the session
//! protocol. Every application payload travels as kind `2` (data); the framer
//! never interprets payload bytes.

use std::fmt;

// ============================================================================
// Constants
// ============================================================================

/// Length of the frame header (kind + length)
pub const HEADER_LEN: usize = 8;

/// Default upper bound on a single payload (4 MiB)
pub const DEFAULT_MAX_PAYLOAD: u32 = 4 * 1024 * 1024;

// ============================================================================
// Message Kinds
// ============================================================================

/// Message kind carried in the first header field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKind(pub u32);

impl MessageKind {
    /// Liveness probe, zero-length payload
    pub const HEARTBEAT: MessageKind = MessageKind(0);
    /// Serialized `PeerInfo` of the sender
    pub const IDENTITY: MessageKind = MessageKind(1);
    /// Opaque application bytes
    pub const DATA: MessageKind = MessageKind(2);

    /// Whether this kind is consumed by the session protocol itself
    pub fn is_reserved(&self) -> bool {
        *self == MessageKind::HEARTBEAT || *self == MessageKind::IDENTITY
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MessageKind::HEARTBEAT => write!(f, "heartbeat"),
            MessageKind::IDENTITY => write!(f, "identity"),
            MessageKind::DATA => write!(f, "data"),
            MessageKind(other) => write!(f, "kind({})", other),
        }
    }
}

// ============================================================================
// Header Encoding/Decoding
// ============================================================================

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: MessageKind,
    pub length: u32,
}

/// Encode a header into its fixed 8-byte wire form
pub fn encode_header(header: FrameHeader) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..4].copy_from_slice(&header.kind.0.to_be_bytes());
    buf[4..8].copy_from_slice(&header.length.to_be_bytes());
    buf
}

/// Decode a header from its fixed 8-byte wire form
pub fn decode_header(buf: &[u8; HEADER_LEN]) -> FrameHeader {
    FrameHeader {
        kind: MessageKind(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])),
        length: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
    }
}

/// Try to read a header from the front of `buf` without consuming anything
///
/// Returns `Ok(None)` when fewer than `HEADER_LEN` bytes are available.
pub fn parse_header(buf: &[u8], max_payload: u32) -> Result<Option<FrameHeader>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let mut raw = [0u8; HEADER_LEN];
    raw.copy_from_slice(&buf[..HEADER_LEN]);
    let header = decode_header(&raw);

    if header.length > max_payload {
        return Err(FrameError::PayloadTooLarge {
            length: header.length as usize,
            max: max_payload,
        });
    }

    Ok(Some(header))
}

// ============================================================================
// Frames
// ============================================================================

/// A complete decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: MessageKind, payload: impl Into<Vec<u8>>) -> Self {
        Frame {
            kind,
            payload: payload.into(),
        }
    }

    pub fn heartbeat() -> Self {
        Frame::new(MessageKind::HEARTBEAT, Vec::new())
    }
}

/// Encode a frame: `[kind BE][length BE][payload]`
pub fn encode_frame(
    kind: MessageKind,
    payload: &[u8],
    max_payload: u32,
) -> Result<Vec<u8>, FrameError> {
    if payload.len() > max_payload as usize {
        return Err(FrameError::PayloadTooLarge {
            length: payload.len(),
            max: max_payload,
        });
    }

    let header = encode_header(FrameHeader {
        kind,
        length: payload.len() as u32,
    });

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(payload);
    Ok(buf)
}

// ============================================================================
// Streaming Decoder
// ============================================================================

/// Resumable frame decoder over a continuous byte stream
///
/// Bytes may be pushed in arbitrary chunks; frames come out once complete.
#[derive(Debug)]
pub struct FrameDecoder {
    /// Bytes received but not yet consumed
    buf: Vec<u8>,
    /// Header of the frame whose payload is still arriving
    pending: Option<FrameHeader>,
    max_payload: u32,
}

impl FrameDecoder {
    pub fn new(max_payload: u32) -> Self {
        FrameDecoder {
            buf: Vec::new(),
            pending: None,
            max_payload,
        }
    }

    /// Append raw stream bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered, not yet decoded bytes
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Declared payload length of the frame currently being assembled
    pub fn pending_length(&self) -> Option<u32> {
        self.pending.map(|h| h.length)
    }

    /// Decode the next complete frame, if any
    ///
    /// An oversized declared length is a protocol violation; the decoder
    /// should not be used after it returns an error.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let header = match self.pending {
            Some(header) => header,
            None => match parse_header(&self.buf, self.max_payload)? {
                Some(header) => {
                    self.buf.drain(..HEADER_LEN);
                    self.pending = Some(header);
                    header
                }
                None => return Ok(None),
            },
        };

        let length = header.length as usize;
        if self.buf.len() < length {
            return Ok(None);
        }

        let payload: Vec<u8> = self.buf.drain(..length).collect();
        self.pending = None;

        Ok(Some(Frame {
            kind: header.kind,
            payload,
        }))
    }

    /// Push bytes and drain every frame that became complete
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, FrameError> {
        self.push(bytes);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Framing protocol violations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Declared or supplied payload exceeds the configured maximum
    PayloadTooLarge { length: usize, max: u32 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::PayloadTooLarge { length, max } => {
                write!(f, "payload too large: {} bytes (max {})", length, max)
            }
        }
    }
}

impl std::error::Error for FrameError {}

// ============================================================================
// Tests
// ============================================================================
