//! Bridge Link state machine
//!
//! ```text
//!  Disconnected ──> Connecting ──> Connected
//!        ^              │              │
//!        └──────────────┴──────────────┘
//! ```
//!
//! Any other transition is rejected. Each entry into `Connecting` starts a
//! new epoch; transport and timer events carry the epoch they were created
//! for, and the owner discards events whose epoch is no longer current.

use tracing::{debug, warn};

use crate::config::StrategyKind;
use crate::envelope::Envelope;
use crate::error::RelayError;
use crate::relay::{LinkId, ListenerId};

use super::heartbeat::HeartbeatMonitor;
use super::strategy::LinkSink;

/// Bridge link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
        }
    }

    fn can_transition(self, to: LinkState) -> bool {
        matches!(
            (self, to),
            (LinkState::Disconnected, LinkState::Connecting)
                | (LinkState::Connecting, LinkState::Connected)
                | (LinkState::Connecting, LinkState::Disconnected)
                | (LinkState::Connected, LinkState::Disconnected)
        )
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical connection between two relay instances
pub struct BridgeLink {
    id: LinkId,
    name: String,
    kind: StrategyKind,
    endpoint: ListenerId,
    state: LinkState,
    epoch: u64,
    sink: Option<LinkSink>,
    heartbeat: Option<HeartbeatMonitor>,
    peer_id: Option<String>,
}

impl BridgeLink {
    pub fn new(id: LinkId, name: impl Into<String>, kind: StrategyKind, endpoint: ListenerId) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            endpoint,
            state: LinkState::Disconnected,
            epoch: 0,
            sink: None,
            heartbeat: None,
            peer_id: None,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StrategyKind {
        self.kind
    }

    /// Listener whose registry this link feeds
    pub fn endpoint(&self) -> ListenerId {
        self.endpoint
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether an event tagged with `epoch` belongs to the current connection
    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn set_peer_id(&mut self, peer_id: String) {
        if self.peer_id.as_deref() != Some(peer_id.as_str()) {
            debug!("Bridge '{}': peer is '{}'", self.name, peer_id);
            self.peer_id = Some(peer_id);
        }
    }

    pub fn heartbeat_mut(&mut self) -> Option<&mut HeartbeatMonitor> {
        self.heartbeat.as_mut()
    }

    /// Checked state transition. Illegal transitions are logged and refused.
    pub fn transition(&mut self, to: LinkState) -> bool {
        if !self.state.can_transition(to) {
            warn!(
                "Bridge '{}': rejected transition {} -> {}",
                self.name, self.state, to
            );
            return false;
        }
        debug!("Bridge '{}': {} -> {}", self.name, self.state, to);
        self.state = to;
        true
    }

    /// Enter `Connecting` and return the new epoch
    pub fn begin_connect(&mut self) -> Option<u64> {
        if !self.transition(LinkState::Connecting) {
            return None;
        }
        self.epoch += 1;
        Some(self.epoch)
    }

    /// Enter `Connected` on `sink`: release its reader, send `handshake`, then
    /// start the heartbeat monitor if one is given.
    pub fn establish(
        &mut self,
        mut sink: LinkSink,
        handshake: &Envelope,
        heartbeat: Option<HeartbeatMonitor>,
    ) -> Result<(), RelayError> {
        if !self.transition(LinkState::Connected) {
            return Err(RelayError::NotConnected(self.name.clone()));
        }
        sink.open();
        self.sink = Some(sink);
        self.send(handshake)?;
        self.heartbeat = heartbeat;
        Ok(())
    }

    /// Enter `Disconnected`. The heartbeat monitor is stopped before the
    /// transport is handed back; dropping the returned sink terminates it.
    pub fn disconnect(&mut self) -> Option<LinkSink> {
        if !self.transition(LinkState::Disconnected) {
            return None;
        }
        if let Some(mut heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
        self.sink.take()
    }

    /// Send an envelope. Rejected unless connected.
    pub fn send(&self, envelope: &Envelope) -> Result<(), RelayError> {
        let text = envelope.encode()?;
        self.send_text(text)
    }

    /// Send an already encoded frame. Rejected unless connected.
    pub fn send_text(&self, text: String) -> Result<(), RelayError> {
        match (&self.sink, self.state) {
            (Some(sink), LinkState::Connected) => sink.send_text(text),
            _ => {
                warn!(
                    "Bridge '{}': send rejected while {}",
                    self.name, self.state
                );
                Err(RelayError::NotConnected(self.name.clone()))
            }
        }
    }
}
