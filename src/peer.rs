//! Peer identity record exchanged during the handshake

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SessionError;

/// Identity a participant presents to others
///
/// Serialized as `{"peerID": "...", "info": {...}}` inside identity frames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(rename = "peerID")]
    peer_id: String,
    #[serde(rename = "info")]
    attributes: BTreeMap<String, String>,
}

impl PeerInfo {
    /// Create a record with a freshly generated, never reused id
    pub fn new<K, V>(attributes: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self::with_id(generate_peer_id(), attributes)
    }

    /// Create a record with an explicit id
    pub fn with_id<K, V>(
        peer_id: impl Into<String>,
        attributes: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        PeerInfo {
            peer_id: peer_id.into(),
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SessionError> {
        serde_json::to_vec(self).map_err(|e| SessionError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionError> {
        serde_json::from_slice(bytes).map_err(|e| SessionError::Serialization(e.to_string()))
    }
}

/// Random UUID (version 4), upper-case hyphenated
pub fn generate_peer_id() -> String {
    Uuid::new_v4()
        .hyphenated()
        .encode_upper(&mut Uuid::encode_buffer())
        .to_string()
}
