//! Bridge Envelope Codec
//!
//! Every message crossing a bridge link is wrapped in an [`Envelope`]. The
//! envelope tags the payload with its type and the instance that originated
//! it, which is what lets the receiving side tell control traffic from relay
//! traffic and drop its own messages when they come back.
//!
//! # Wire format
//!
//! ```json
//! {"type":"data","sourceId":"relay-a","content":"hello","timestamp":1700000000000}
//! ```
//!
//! The legacy bare strings `HEARTBEAT` and `HEARTBEAT_ACK` are accepted for
//! the heartbeat pair only, and are recognized before any JSON decoding.
//! Older peers that send `bridge-message` / `bridge-handshake` types or a
//! `source` field instead of `sourceId` are decoded as well, and so are
//! untagged `{"sender":...,"data":...}` publications, as data envelopes.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::RelayError;


/// Legacy plain-text heartbeat
pub const LEGACY_HEARTBEAT: &str = "HEARTBEAT";

/// Legacy plain-text heartbeat acknowledgment
pub const LEGACY_HEARTBEAT_ACK: &str = "HEARTBEAT_ACK";

/// Envelope type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeType {
    /// Relay payload originating from a client
    #[serde(alias = "bridge-message")]
    Data,
    /// Sent once by each side when a link connects
    #[serde(alias = "bridge-handshake")]
    Handshake,
    /// Liveness probe
    Heartbeat,
    /// Liveness probe reply
    HeartbeatAck,
}

impl EnvelopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::Data => "data",
            EnvelopeType::Handshake => "handshake",
            EnvelopeType::Heartbeat => "heartbeat",
            EnvelopeType::HeartbeatAck => "heartbeat-ack",
        }
    }
}

impl std::fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged unit of bridge traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    /// Relay instance that originated the message
    pub source_id: String,
    /// Opaque payload
    pub content: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

/// Wire shape accepted on decode. Only `type` is mandatory for control
/// envelopes; `data` additionally requires `content`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: EnvelopeType,
    #[serde(default, alias = "source")]
    source_id: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    timestamp: Option<u64>,
}

/// Untagged publication shape used by older pub/sub peers
#[derive(Deserialize)]
struct LegacyPublication {
    sender: String,
    data: String,
}

impl From<LegacyPublication> for Envelope {
    fn from(publication: LegacyPublication) -> Self {
        Self {
            kind: EnvelopeType::Data,
            source_id: publication.sender,
            content: publication.data,
            timestamp: 0,
        }
    }
}

impl Envelope {
    fn new(kind: EnvelopeType, source_id: &str, content: String) -> Self {
        Self {
            kind,
            source_id: source_id.to_string(),
            content,
            timestamp: now_millis(),
        }
    }

    /// Relay payload from `source_id`
    pub fn data(source_id: &str, content: impl Into<String>) -> Self {
        Self::new(EnvelopeType::Data, source_id, content.into())
    }

    /// Link handshake; `content` names the endpoint the link feeds
    pub fn handshake(source_id: &str, endpoint: &str) -> Self {
        Self::new(EnvelopeType::Handshake, source_id, endpoint.to_string())
    }

    pub fn heartbeat(source_id: &str) -> Self {
        Self::new(EnvelopeType::Heartbeat, source_id, String::new())
    }

    pub fn heartbeat_ack(source_id: &str) -> Self {
        Self::new(EnvelopeType::HeartbeatAck, source_id, String::new())
    }

    /// Whether this envelope was originated by `instance_id`
    pub fn is_from(&self, instance_id: &str) -> bool {
        self.source_id == instance_id
    }

    /// Encode as a single JSON text frame
    pub fn encode(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(|e| RelayError::Encode(e.to_string()))
    }

    /// Decode a JSON envelope, rejecting anything that is not one
    pub fn decode(text: &str) -> Result<Self, RelayError> {
        let wire: WireEnvelope = serde_json::from_str(text)?;
        Self::from_wire(wire)
    }

    fn from_wire(wire: WireEnvelope) -> Result<Self, RelayError> {
        let content = match (wire.kind, wire.content) {
            (_, Some(content)) => content,
            (EnvelopeType::Data, None) => {
                return Err(RelayError::Decode(
                    "data envelope without content".to_string(),
                ))
            }
            (_, None) => String::new(),
        };

        Ok(Self {
            kind: wire.kind,
            source_id: wire.source_id.unwrap_or_default(),
            content,
            timestamp: wire.timestamp.unwrap_or(0),
        })
    }
}

/// Classified inbound bridge payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A well-formed envelope
    Envelope(Envelope),
    /// Bare `HEARTBEAT` string
    LegacyHeartbeat,
    /// Bare `HEARTBEAT_ACK` string
    LegacyHeartbeatAck,
    /// Text that is not an envelope at all
    Raw(String),
}

/// Classify one inbound bridge frame.
///
/// An untagged object with string `sender` and `data` fields is a data
/// envelope. Any other text that is not a JSON object carrying a `type` field
/// is [`Inbound::Raw`]. A JSON object that does carry `type` but fails the envelope schema (unknown
/// type, wrong field types, data without content) is a decode error.
pub fn classify(text: &str) -> Result<Inbound, RelayError> {
    match text {
        LEGACY_HEARTBEAT => return Ok(Inbound::LegacyHeartbeat),
        LEGACY_HEARTBEAT_ACK => return Ok(Inbound::LegacyHeartbeatAck),
        _ => {}
    }

    if !text.trim_start().starts_with('{') {
        return Ok(Inbound::Raw(text.to_string()));
    }

    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return Ok(Inbound::Raw(text.to_string())),
    };

    let tagged = value
        .as_object()
        .is_some_and(|obj| obj.contains_key("type"));
    if !tagged {
        return Ok(match serde_json::from_value::<LegacyPublication>(value) {
            Ok(publication) => Inbound::Envelope(publication.into()),
            Err(_) => Inbound::Raw(text.to_string()),
        });
    }

    let wire: WireEnvelope = serde_json::from_value(value)?;
    Envelope::from_wire(wire).map(Inbound::Envelope)
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
