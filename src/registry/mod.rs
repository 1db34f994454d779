//! Listener Registry
//!
//! Tracks the open client connections of one listener endpoint and fans
//! messages out to them. Membership mirrors transport state: a connection is
//! removed as soon as its session ends or a send to it fails.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::envelope::Envelope;
use crate::error::RelayError;

/// Process-unique client identifier
pub type ClientId = u64;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next client id
pub fn next_client_id() -> ClientId {
    NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Frame queued for a client session's writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Close,
}

/// Handle to one connected client
///
/// The handle is open while the session task still drains its outbound
/// queue. Sends never block: a full queue counts as a failed send.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    id: ClientId,
    addr: SocketAddr,
    tx: mpsc::Sender<ClientFrame>,
}

impl ClientConnection {
    pub fn new(addr: SocketAddr, tx: mpsc::Sender<ClientFrame>) -> Self {
        Self {
            id: next_client_id(),
            addr,
            tx,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a text frame for this client
    pub fn send(&self, text: impl Into<String>) -> Result<(), RelayError> {
        self.tx
            .try_send(ClientFrame::Text(text.into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    RelayError::ClientSend(format!("client {} queue full", self.id))
                }
                mpsc::error::TrySendError::Closed(_) => {
                    RelayError::ClientSend(format!("client {} closed", self.id))
                }
            })
    }

    /// Ask the session to close the socket
    pub fn close(&self) {
        let _ = self.tx.try_send(ClientFrame::Close);
    }
}

/// Outcome of a local broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: Vec<ClientId>,
}

/// Open client connections of one named endpoint
#[derive(Debug)]
pub struct ListenerRegistry {
    name: String,
    port: u16,
    welcome: String,
    clients: HashMap<ClientId, ClientConnection>,
}

impl ListenerRegistry {
    pub fn new(name: impl Into<String>, port: u16, welcome: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port,
            welcome: welcome.into(),
            clients: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Add a connection and send it the welcome notification.
    ///
    /// A connection whose welcome cannot be queued is not registered.
    pub fn register(&mut self, conn: ClientConnection) -> Result<(), RelayError> {
        if !self.welcome.is_empty() {
            conn.send(self.welcome.clone())?;
        }
        debug!(
            "Client {} ({}) registered on '{}'",
            conn.id(),
            conn.addr(),
            self.name
        );
        self.clients.insert(conn.id(), conn);
        Ok(())
    }

    /// Remove a connection. Absent ids are ignored.
    pub fn unregister(&mut self, id: ClientId) -> Option<ClientConnection> {
        let removed = self.clients.remove(&id);
        if removed.is_some() {
            debug!("Client {} unregistered from '{}'", id, self.name);
        }
        removed
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    /// Send a text to one client, dropping it from the registry on failure
    pub fn send_to(&mut self, id: ClientId, text: impl Into<String>) -> Result<(), RelayError> {
        let Some(conn) = self.clients.get(&id) else {
            return Err(RelayError::ClientSend(format!("client {} not registered", id)));
        };
        if let Err(e) = conn.send(text) {
            warn!("Dropping client {} from '{}': {}", id, self.name, e);
            self.clients.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    /// Send an envelope's content to every client except `excluding`
    pub fn broadcast_local(
        &mut self,
        envelope: &Envelope,
        excluding: Option<ClientId>,
    ) -> BroadcastReport {
        self.broadcast_raw(&envelope.content, excluding)
    }

    /// Send text as-is to every client except `excluding`.
    ///
    /// Failing clients are removed after the pass so one slow or closed
    /// connection cannot abort delivery to the others.
    pub fn broadcast_raw(&mut self, text: &str, excluding: Option<ClientId>) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for (id, conn) in &self.clients {
            if Some(*id) == excluding {
                continue;
            }
            match conn.send(text) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    trace!("Broadcast on '{}' skipped client {}: {}", self.name, id, e);
                    report.dropped.push(*id);
                }
            }
        }

        for id in &report.dropped {
            self.clients.remove(id);
        }
        if !report.dropped.is_empty() {
            warn!(
                "Dropped {} unreachable client(s) from '{}'",
                report.dropped.len(),
                self.name
            );
        }

        report
    }

    /// Close every client and empty the registry
    pub fn close_all(&mut self) -> usize {
        let count = self.clients.len();
        for (_, conn) in self.clients.drain() {
            conn.close();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn client(capacity: usize) -> (ClientConnection, mpsc::Receiver<ClientFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ClientConnection::new(addr(), tx), rx)
    }

    fn texts(rx: &mut mpsc::Receiver<ClientFrame>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let ClientFrame::Text(t) = frame {
                out.push(t);
            }
        }
        out
    }

    #[test]
    fn test_client_ids_are_unique() {
        let (a, _ra) = client(1);
        let (b, _rb) = client(1);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_register_sends_welcome() {
        let mut registry = ListenerRegistry::new("wss", 8080, "hi there");
        let (conn, mut rx) = client(4);
        registry.register(conn).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(texts(&mut rx), vec!["hi there".to_string()]);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let mut registry = ListenerRegistry::new("wss", 8080, "");
        let (conn, _rx) = client(4);
        let id = conn.id();
        registry.register(conn).unwrap();

        assert!(registry.unregister(id).is_some());
        assert!(registry.unregister(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let mut registry = ListenerRegistry::new("wss", 8080, "");
        let (a, mut ra) = client(4);
        let (b, mut rb) = client(4);
        let (c, mut rc) = client(4);
        let sender = a.id();
        registry.register(a).unwrap();
        registry.register(b).unwrap();
        registry.register(c).unwrap();

        let report = registry.broadcast_local(&Envelope::data("relay-a", "hello"), Some(sender));

        assert_eq!(report.delivered, 2);
        assert!(report.dropped.is_empty());
        assert!(texts(&mut ra).is_empty());
        assert_eq!(texts(&mut rb), vec!["hello".to_string()]);
        assert_eq!(texts(&mut rc), vec!["hello".to_string()]);
    }

    #[test]
    fn test_failed_send_does_not_abort_broadcast() {
        let mut registry = ListenerRegistry::new("wss", 8080, "");
        let (a, ra) = client(4);
        let (b, mut rb) = client(4);
        let dead = a.id();
        registry.register(a).unwrap();
        registry.register(b).unwrap();
        drop(ra);

        let report = registry.broadcast_raw("ping", None);

        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, vec![dead]);
        assert!(!registry.contains(dead));
        assert_eq!(registry.len(), 1);
        assert_eq!(texts(&mut rb), vec!["ping".to_string()]);
    }

    #[test]
    fn test_full_queue_counts_as_failed_send() {
        let mut registry = ListenerRegistry::new("wss", 8080, "");
        let (slow, _rx) = client(1);
        let id = slow.id();
        registry.register(slow).unwrap();

        assert_eq!(registry.broadcast_raw("one", None).delivered, 1);
        let report = registry.broadcast_raw("two", None);
        assert_eq!(report.dropped, vec![id]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_send_to_unknown_client_fails() {
        let mut registry = ListenerRegistry::new("wss", 8080, "");
        assert!(matches!(
            registry.send_to(999_999, "x"),
            Err(RelayError::ClientSend(_))
        ));
    }

    #[test]
    fn test_close_all_empties_registry() {
        let mut registry = ListenerRegistry::new("wss", 8080, "");
        let (a, mut ra) = client(4);
        registry.register(a).unwrap();

        assert_eq!(registry.close_all(), 1);
        assert!(registry.is_empty());
        assert_eq!(ra.try_recv().unwrap(), ClientFrame::Close);
    }
}
