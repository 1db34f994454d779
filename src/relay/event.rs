//! Reactor events
//!
//! Everything that can change relay state arrives at the reactor as one of
//! these events, on a single queue.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::WebSocketStream;

use crate::bridge::LinkSink;
use crate::error::RelayError;
use crate::registry::{ClientConnection, ClientId};

use super::RelaySnapshot;

/// Index of a listener endpoint within its relay
pub type ListenerId = usize;

/// Sender half of the reactor queue
pub type EventSender = mpsc::UnboundedSender<RelayEvent>;

/// Bridge link identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

impl LinkId {
    pub fn next() -> Self {
        LinkId(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

pub enum RelayEvent {
    /// A client finished the WebSocket handshake on a listener
    ClientConnected {
        listener: ListenerId,
        conn: ClientConnection,
    },
    /// Text message from a client
    ClientMessage {
        listener: ListenerId,
        client: ClientId,
        text: String,
    },
    /// Client session ended
    ClientClosed {
        listener: ListenerId,
        client: ClientId,
    },
    /// A peer relay opened a direct bridge on a listener's bridge path
    BridgeAccepted {
        listener: ListenerId,
        addr: SocketAddr,
        ws: WebSocketStream<TcpStream>,
    },
    /// Outcome of a supervisor's connect attempt
    ConnectFinished {
        link: LinkId,
        epoch: u64,
        result: Result<LinkSink, RelayError>,
    },
    /// Inbound frame on a bridge link
    LinkFrame {
        link: LinkId,
        epoch: u64,
        text: String,
    },
    /// Bridge transport closed or failed
    LinkClosed {
        link: LinkId,
        epoch: u64,
        error: Option<RelayError>,
    },
    /// An accepted bridge link received nothing within its idle deadline
    LinkIdle { link: LinkId, seq: u64 },
    /// Heartbeat period elapsed
    HeartbeatTick { link: LinkId, epoch: u64 },
    /// Heartbeat ack deadline elapsed
    HeartbeatExpired { link: LinkId, epoch: u64, seq: u64 },
    /// Reconnect delay elapsed
    ReconnectDue { link: LinkId },
    /// State query
    Snapshot(oneshot::Sender<RelaySnapshot>),
    /// Ordered shutdown
    Shutdown,
}

impl RelayEvent {
    /// Short name for trace logging
    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::ClientConnected { .. } => "client_connected",
            RelayEvent::ClientMessage { .. } => "client_message",
            RelayEvent::ClientClosed { .. } => "client_closed",
            RelayEvent::BridgeAccepted { .. } => "bridge_accepted",
            RelayEvent::ConnectFinished { .. } => "connect_finished",
            RelayEvent::LinkFrame { .. } => "link_frame",
            RelayEvent::LinkClosed { .. } => "link_closed",
            RelayEvent::LinkIdle { .. } => "link_idle",
            RelayEvent::HeartbeatTick { .. } => "heartbeat_tick",
            RelayEvent::HeartbeatExpired { .. } => "heartbeat_expired",
            RelayEvent::ReconnectDue { .. } => "reconnect_due",
            RelayEvent::Snapshot(_) => "snapshot",
            RelayEvent::Shutdown => "shutdown",
        }
    }
}
