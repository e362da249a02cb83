//! JSON wire messages exchanged between clients and the rendezvous server, and between two
//!  peer sessions.

use std::fmt::{Debug, Display, Formatter};

use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;


/// Opaque peer identifier, either assigned by the rendezvous server or taken from the client's
///  `peerid` cookie.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);
impl PeerId {
    pub fn new(id: impl Into<String>) -> PeerId {
        PeerId(id.into())
    }

    pub fn random() -> PeerId {
        PeerId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdentity {
    pub id: PeerId,
    pub display_name: String,
    pub device_label: String,
    pub rtc_supported: bool,
}

/// Opaque signaling content, forwarded by the rendezvous server without interpretation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice: Option<Value>,
}

/// Messages the rendezvous server originates. Relayed peer frames are not part of this enum,
///  they arrive as arbitrary JSON objects with a `sender` field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Peers { peers: Vec<PeerIdentity> },
    PeerJoined { peer: PeerIdentity },
    PeerLeft {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    Ping,
    DisplayName { peer: PeerIdentity },
    Signal {
        sender: PeerId,
        #[serde(flatten)]
        payload: SignalPayload,
    },
}
impl ServerMessage {
    const TYPES: [&'static str; 6] = ["peers", "peer-joined", "peer-left", "ping", "display-name", "signal"];

    pub fn is_server_message_type(msg_type: &str) -> bool {
        Self::TYPES.contains(&msg_type)
    }

    pub fn to_text(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Pong,
    Disconnect,
    Signal {
        to: PeerId,
        #[serde(flatten)]
        payload: SignalPayload,
    },
}
impl ClientMessage {
    pub fn to_text(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub name: String,
    pub mime: String,
    pub size: u64,
}

/// Control frames of the session protocol between two peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerFrame {
    PeerRequested,
    PeerAccepted,
    PeerDeclined,
    PeerDisconnected,
    Header(FileHeader),
    Partition { offset: u64 },
    PartitionReceived { offset: u64 },
    PartitionResend { offset: u64 },
    Progress { progress: f64 },
    TransferComplete,
    /// `message` is the base64 encoded UTF-8 text
    Text { message: String },
}
impl PeerFrame {
    pub fn text(message: &str) -> PeerFrame {
        PeerFrame::Text { message: encode_text(message) }
    }

    pub fn to_value(&self) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn to_text(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> anyhow::Result<PeerFrame> {
        serde_json::from_str(text)
            .with_context(|| format!("malformed peer frame: {}", text))
    }
}

pub fn encode_text(text: &str) -> String {
    STANDARD.encode(text.as_bytes())
}

pub fn decode_text(encoded: &str) -> anyhow::Result<String> {
    let raw = STANDARD.decode(encoded)?;
    Ok(String::from_utf8(raw)?)
}
