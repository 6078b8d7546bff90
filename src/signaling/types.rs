use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::{self, Utf8Bytes};

use crate::registry::RegistryError;

/// Signaling errors shared by the server and the client
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("connection failed: {0}")]
    Connection(#[from] tungstenite::Error),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("not connected to signaling server")]
    NotConnected,

    #[error("malformed message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("connection has not joined a session")]
    NotJoined,

    #[error("connection already joined session {0}")]
    AlreadyJoined(SessionId),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

const SESSION_ID_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SESSION_ID_LEN: usize = 8;
const HEX_CHARS: &[u8] = b"0123456789abcdef";

/// Session identifier. Generated ids are 8 lowercase alphanumerics, but any
/// string received on the wire is accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let id = (0..SESSION_ID_LEN)
            .map(|_| SESSION_ID_CHARS[rng.random_range(0..SESSION_ID_CHARS.len())] as char)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Peer identifier ("peer_" + 8 hex when generated)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn generate() -> Self {
        let value: u32 = rand::rng().random();
        let mut id = String::with_capacity(13);
        id.push_str("peer_");
        for i in 0..8 {
            let nibble = ((value >> (28 - i * 4)) & 0xF) as usize;
            id.push(HEX_CHARS[nibble] as char);
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Username handed out when a peer does not pick one: `User_` followed by
    /// the first 8 characters after the `peer_` prefix.
    pub fn default_username(&self) -> String {
        let suffix = self.0.strip_prefix("peer_").unwrap_or(&self.0);
        let end = suffix
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(suffix.len());
        format!("User_{}", &suffix[..end])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Wrapper for outbound WebSocket frames using tungstenite's Utf8Bytes.
///
/// Cloning is O(1), so one relayed frame is shared by every recipient queue.
#[derive(Debug, Clone)]
pub struct OutboundMessage(Utf8Bytes);

impl OutboundMessage {
    /// Create a new outbound message from any string type
    pub fn new(s: impl Into<Utf8Bytes>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Get the inner Utf8Bytes for tungstenite Message::Text
    pub fn into_inner(self) -> Utf8Bytes {
        self.0
    }
}

impl From<String> for OutboundMessage {
    fn from(s: String) -> Self {
        Self(Utf8Bytes::from(s))
    }
}
