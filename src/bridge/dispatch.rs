//! Inbound envelope dispatch and loop prevention
//!
//! Every frame received on a bridge link is turned into exactly one
//! [`Action`]. Bridged data is only ever applied to the local registry, never
//! forwarded to another bridge.

use crate::config::StrategyKind;
use crate::envelope::{classify, Envelope, EnvelopeType, Inbound, LEGACY_HEARTBEAT_ACK};
use crate::error::RelayError;

/// What the owner of a link must do with one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Remember the peer's instance id
    RecordPeer(String),
    /// Send this frame back on the same link
    Reply(String),
    /// Disarm the heartbeat deadline
    HeartbeatAck,
    /// Broadcast the envelope's content to the link's registry
    Broadcast(Envelope),
    /// Broadcast untagged text as-is to the link's registry
    BroadcastRaw(String),
    /// Drop the frame
    Discard(&'static str),
}

/// Per-link dispatcher
#[derive(Debug, Clone)]
pub struct Dispatcher {
    instance_id: String,
    kind: StrategyKind,
}

impl Dispatcher {
    pub fn new(instance_id: impl Into<String>, kind: StrategyKind) -> Self {
        Self {
            instance_id: instance_id.into(),
            kind,
        }
    }

    /// Decide what to do with one inbound frame.
    ///
    /// A malformed envelope is a decode error; the caller drops the frame and
    /// keeps the link.
    pub fn dispatch(&self, text: &str) -> Result<Action, RelayError> {
        let action = match classify(text)? {
            Inbound::LegacyHeartbeat => match self.kind {
                StrategyKind::Direct => Action::Reply(LEGACY_HEARTBEAT_ACK.to_string()),
                StrategyKind::Pubsub => Action::Discard("heartbeat"),
            },
            Inbound::LegacyHeartbeatAck => match self.kind {
                StrategyKind::Direct => Action::HeartbeatAck,
                StrategyKind::Pubsub => Action::Discard("heartbeat_ack"),
            },
            Inbound::Raw(text) => Action::BroadcastRaw(text),
            Inbound::Envelope(envelope) => self.dispatch_envelope(envelope)?,
        };
        Ok(action)
    }

    fn dispatch_envelope(&self, envelope: Envelope) -> Result<Action, RelayError> {
        // On a shared channel every one of our own publications comes back
        if envelope.is_from(&self.instance_id)
            && (self.kind == StrategyKind::Pubsub || envelope.kind == EnvelopeType::Data)
        {
            return Ok(Action::Discard("self_echo"));
        }

        let action = match (envelope.kind, self.kind) {
            (EnvelopeType::Data, _) => Action::Broadcast(envelope),
            (EnvelopeType::Handshake, _) if envelope.source_id.is_empty() => {
                Action::Discard("anonymous_handshake")
            }
            (EnvelopeType::Handshake, _) => Action::RecordPeer(envelope.source_id),
            (EnvelopeType::Heartbeat, StrategyKind::Direct) => {
                Action::Reply(Envelope::heartbeat_ack(&self.instance_id).encode()?)
            }
            (EnvelopeType::Heartbeat, StrategyKind::Pubsub) => Action::Discard("heartbeat"),
            (EnvelopeType::HeartbeatAck, StrategyKind::Direct) => Action::HeartbeatAck,
            (EnvelopeType::HeartbeatAck, StrategyKind::Pubsub) => Action::Discard("heartbeat_ack"),
        };
        Ok(action)
    }
}
