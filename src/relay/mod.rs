//! Relay Reactor
//!
//! One relay instance: its listener endpoints, the registries behind them and
//! the bridge links that feed them. All state is owned by a single reactor
//! task that consumes [`RelayEvent`]s from one queue, so registries and links
//! are mutated without locks. Socket I/O, connect attempts and timers run in
//! their own tasks and post back into the queue.

mod event;

pub use event::{EventSender, LinkId, ListenerId, RelayEvent};

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn};

use crate::bridge::{
    build_strategy, spawn_ws_link, Action, BridgeLink, ConnectOutcome, Dispatcher, LinkEvents,
    LinkState, ReconnectSupervisor, StrategyKind,
};
use crate::config::{Config, ConfigError, ListenerConfig};
use crate::envelope::Envelope;
use crate::error::RelayError;
use crate::metrics::Metrics;
use crate::registry::{BroadcastReport, ClientConnection, ClientId, ListenerRegistry};
use crate::timer::Timer;
use crate::transport::{self, AcceptorConfig};

/// How long a closing bridge transport may take to flush its close frame
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Point-in-time view of one listener endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSnapshot {
    pub name: String,
    pub addr: SocketAddr,
    pub clients: usize,
}

/// Point-in-time view of one bridge link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub id: LinkId,
    pub name: String,
    pub kind: StrategyKind,
    pub state: LinkState,
    pub peer_id: Option<String>,
    /// Consecutive failed attempts since the last successful connect
    pub attempts: u32,
    /// Inbound direct link accepted on a bridge path
    pub accepted: bool,
}

/// Point-in-time view of a relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySnapshot {
    pub instance_id: String,
    pub listeners: Vec<ListenerSnapshot>,
    pub links: Vec<LinkSnapshot>,
}

impl RelaySnapshot {
    /// First link with the given name
    pub fn link(&self, name: &str) -> Option<&LinkSnapshot> {
        self.links.iter().find(|l| l.name == name)
    }

    pub fn listener(&self, name: &str) -> Option<&ListenerSnapshot> {
        self.listeners.iter().find(|l| l.name == name)
    }

    /// Links accepted from peers
    pub fn accepted_links(&self) -> impl Iterator<Item = &LinkSnapshot> {
        self.links.iter().filter(|l| l.accepted)
    }
}

/// A configured, not yet started relay
pub struct Relay {
    config: Config,
    metrics: Arc<Metrics>,
}

impl Relay {
    pub fn new(config: Config) -> Self {
        Self::with_metrics(config, Arc::new(Metrics::new()))
    }

    pub fn with_metrics(config: Config, metrics: Arc<Metrics>) -> Self {
        Self { config, metrics }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Validate, bind every listener and start the reactor.
    ///
    /// Configuration and bind errors are returned before any task is
    /// spawned; once this returns the relay only stops on shutdown.
    pub async fn start(self) -> Result<RelayHandle, RelayError> {
        self.config.validate()?;

        let instance_id = self.config.relay.get_instance_id();
        let capacity = self.config.relay.outbound_channel_capacity;
        let (events, rx) = mpsc::unbounded_channel();

        let mut supervisors = BTreeMap::new();
        for bridge in self.config.enabled_bridges() {
            let endpoint = self.config.listener_index(&bridge.endpoint).ok_or_else(|| {
                ConfigError::Validation(format!(
                    "Bridge '{}' feeds unknown listener '{}'",
                    bridge.name, bridge.endpoint
                ))
            })?;
            let strategy = build_strategy(bridge)?;
            let link = BridgeLink::new(LinkId::next(), &bridge.name, bridge.strategy, endpoint);
            let supervisor = ReconnectSupervisor::new(
                link,
                strategy,
                bridge,
                instance_id.clone(),
                events.clone(),
            );
            supervisors.insert(supervisor.link().id(), supervisor);
        }

        let mut bound = Vec::with_capacity(self.config.listener.len());
        for listener in &self.config.listener {
            let tcp = transport::bind(listener.bind).await?;
            let addr = tcp
                .local_addr()
                .map_err(|source| RelayError::Bind {
                    addr: listener.bind,
                    source,
                })?;
            info!("Listener '{}' on ws://{}", listener.name, addr);
            bound.push((tcp, addr));
        }

        let mut endpoints = Vec::with_capacity(bound.len());
        let mut acceptors = Vec::with_capacity(bound.len());
        let mut local_addrs = Vec::with_capacity(bound.len());
        for (index, (listener_config, (tcp, addr))) in
            self.config.listener.into_iter().zip(bound).enumerate()
        {
            acceptors.push(transport::spawn_acceptor(
                tcp,
                AcceptorConfig {
                    listener: index,
                    bridge_path: listener_config.bridge_path.clone(),
                    outbound_channel_capacity: capacity,
                },
                events.clone(),
            ));
            local_addrs.push((listener_config.name.clone(), addr));
            endpoints.push(Endpoint::new(listener_config, addr));
        }

        let reactor = Reactor {
            direct: Dispatcher::new(&instance_id, StrategyKind::Direct),
            pubsub: Dispatcher::new(&instance_id, StrategyKind::Pubsub),
            instance_id: instance_id.clone(),
            endpoints,
            supervisors,
            accepted: BTreeMap::new(),
            acceptors,
            events: events.clone(),
            metrics: self.metrics,
        };
        let task = tokio::spawn(reactor.run(rx));

        info!("Relay '{}' started", instance_id);

        Ok(RelayHandle {
            instance_id,
            events,
            local_addrs,
            task,
        })
    }
}

/// Handle to a running relay
pub struct RelayHandle {
    instance_id: String,
    events: EventSender,
    local_addrs: Vec<(String, SocketAddr)>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Bound address of a listener
    pub fn local_addr(&self, listener: &str) -> Option<SocketAddr> {
        self.local_addrs
            .iter()
            .find(|(name, _)| name == listener)
            .map(|(_, addr)| *addr)
    }

    /// Current state, or `None` once the reactor has stopped
    pub async fn snapshot(&self) -> Option<RelaySnapshot> {
        let (tx, rx) = oneshot::channel();
        self.events.send(RelayEvent::Snapshot(tx)).ok()?;
        rx.await.ok()
    }

    /// Ordered shutdown: bridge links, then acceptors, then clients
    pub async fn shutdown(self) {
        if self.events.send(RelayEvent::Shutdown).is_ok() {
            if let Err(e) = self.task.await {
                warn!("Relay reactor ended abnormally: {}", e);
            }
        }
    }
}

struct Endpoint {
    config: ListenerConfig,
    addr: SocketAddr,
    registry: ListenerRegistry,
}

impl Endpoint {
    fn new(config: ListenerConfig, addr: SocketAddr) -> Self {
        let registry = ListenerRegistry::new(
            config.name.clone(),
            addr.port(),
            config.render_welcome(addr.port()),
        );
        Self {
            config,
            addr,
            registry,
        }
    }
}

/// Inbound direct link accepted on a bridge path.
///
/// The accepting side never heartbeats; it relies on the initiator's
/// heartbeats arriving within the listener's idle deadline.
struct AcceptedLink {
    link: BridgeLink,
    idle_after: Option<Duration>,
    idle: Option<Timer>,
    idle_seq: u64,
}

impl AcceptedLink {
    fn new(link: BridgeLink, idle_after: Option<Duration>) -> Self {
        Self {
            link,
            idle_after,
            idle: None,
            idle_seq: 0,
        }
    }

    /// Restart the idle deadline after inbound traffic
    fn touch(&mut self, events: &EventSender) {
        let Some(after) = self.idle_after else {
            return;
        };
        self.idle_seq += 1;
        self.idle = Some(Timer::once(
            after,
            events.clone(),
            RelayEvent::LinkIdle {
                link: self.link.id(),
                seq: self.idle_seq,
            },
        ));
    }
}

struct Reactor {
    instance_id: String,
    endpoints: Vec<Endpoint>,
    supervisors: BTreeMap<LinkId, ReconnectSupervisor>,
    accepted: BTreeMap<LinkId, AcceptedLink>,
    direct: Dispatcher,
    pubsub: Dispatcher,
    acceptors: Vec<JoinHandle<()>>,
    events: EventSender,
    metrics: Arc<Metrics>,
}

impl Reactor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RelayEvent>) {
        for supervisor in self.supervisors.values_mut() {
            supervisor.start();
        }

        while let Some(event) = rx.recv().await {
            trace!("Relay '{}' event {}", self.instance_id, event.name());
            match event {
                RelayEvent::ClientConnected { listener, conn } => {
                    self.on_client_connected(listener, conn)
                }
                RelayEvent::ClientMessage {
                    listener,
                    client,
                    text,
                } => self.on_client_message(listener, client, text),
                RelayEvent::ClientClosed { listener, client } => {
                    if let Some(endpoint) = self.endpoints.get_mut(listener) {
                        if endpoint.registry.unregister(client).is_some() {
                            self.metrics.client_disconnected(endpoint.registry.name());
                        }
                    }
                }
                RelayEvent::BridgeAccepted { listener, addr, ws } => {
                    self.on_bridge_accepted(listener, addr, ws)
                }
                RelayEvent::ConnectFinished {
                    link,
                    epoch,
                    result,
                } => {
                    let Some(supervisor) = self.supervisors.get_mut(&link) else {
                        continue;
                    };
                    if supervisor.on_connect_finished(epoch, result) == ConnectOutcome::Connected
                    {
                        self.metrics.link_connected();
                    }
                }
                RelayEvent::LinkFrame { link, epoch, text } => self.on_link_frame(link, epoch, text),
                RelayEvent::LinkClosed { link, epoch, error } => {
                    self.on_link_closed(link, epoch, error)
                }
                RelayEvent::LinkIdle { link, seq } => self.on_link_idle(link, seq),
                RelayEvent::HeartbeatTick { link, epoch } => {
                    if let Some(supervisor) = self.supervisors.get_mut(&link) {
                        supervisor.on_heartbeat_tick(epoch);
                    }
                }
                RelayEvent::HeartbeatExpired { link, epoch, seq } => {
                    let Some(supervisor) = self.supervisors.get_mut(&link) else {
                        continue;
                    };
                    if supervisor.on_heartbeat_expired(epoch, seq) {
                        self.metrics.heartbeat_timed_out();
                        self.metrics.link_disconnected();
                    }
                }
                RelayEvent::ReconnectDue { link } => {
                    let Some(supervisor) = self.supervisors.get_mut(&link) else {
                        continue;
                    };
                    if supervisor.on_retry_due() {
                        self.metrics.reconnect_attempted();
                    }
                }
                RelayEvent::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                RelayEvent::Shutdown => {
                    self.shutdown().await;
                    break;
                }
            }
        }
    }

    fn on_client_connected(&mut self, listener: ListenerId, conn: ClientConnection) {
        let Some(endpoint) = self.endpoints.get_mut(listener) else {
            return;
        };
        let id = conn.id();
        match endpoint.registry.register(conn) {
            Ok(()) => self.metrics.client_connected(endpoint.registry.name()),
            Err(e) => debug!("Client {} not registered: {}", id, e),
        }
    }

    /// Echo to the sender, fan out to the endpoint's other clients, then
    /// forward one data envelope over every link feeding the endpoint
    fn on_client_message(&mut self, listener: ListenerId, client: ClientId, text: String) {
        let Some(endpoint) = self.endpoints.get_mut(listener) else {
            return;
        };
        if !endpoint.registry.contains(client) {
            return;
        }
        self.metrics.message_received();
        debug!(
            "Message from client {} on '{}' ({} bytes)",
            client,
            endpoint.registry.name(),
            text.len()
        );

        if let Some(echo) = endpoint.config.render_echo(endpoint.addr.port(), &text) {
            if endpoint.registry.send_to(client, echo).is_err() {
                self.metrics.client_send_dropped(1);
                self.metrics.client_disconnected(endpoint.registry.name());
            }
        }

        let envelope = Envelope::data(&self.instance_id, text);
        let report = endpoint.registry.broadcast_local(&envelope, Some(client));
        record_drops(&self.metrics, endpoint.registry.name(), &report);

        let encoded = match envelope.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Message from client {} not bridged: {}", client, e);
                return;
            }
        };

        let supervised = self.supervisors.values().map(|s| s.link());
        let accepted = self.accepted.values().map(|entry| &entry.link);
        for link in supervised.chain(accepted) {
            if link.endpoint() != listener {
                continue;
            }
            if link.send_text(encoded.clone()).is_ok() {
                self.metrics.bridge_message_sent(link.kind().as_str());
            }
        }
    }

    fn on_bridge_accepted(
        &mut self,
        listener: ListenerId,
        addr: SocketAddr,
        ws: WebSocketStream<TcpStream>,
    ) {
        let Some(endpoint) = self.endpoints.get(listener) else {
            return;
        };
        let idle_after = endpoint.config.bridge_idle_deadline();
        let id = LinkId::next();
        let mut link = BridgeLink::new(
            id,
            format!("{}<-{}", endpoint.registry.name(), addr),
            StrategyKind::Direct,
            listener,
        );
        let Some(epoch) = link.begin_connect() else {
            return;
        };

        let sink = spawn_ws_link(ws, LinkEvents::new(id, epoch, self.events.clone()));
        let handshake = Envelope::handshake(&self.instance_id, endpoint.registry.name());
        match link.establish(sink, &handshake, None) {
            Ok(()) => {
                info!("Bridge '{}': accepted from {}", link.name(), addr);
                self.metrics.link_connected();
                let mut entry = AcceptedLink::new(link, idle_after);
                entry.touch(&self.events);
                self.accepted.insert(id, entry);
            }
            Err(e) => warn!("Bridge '{}': handshake failed: {}", link.name(), e),
        }
    }

    fn on_link_frame(&mut self, id: LinkId, epoch: u64, text: String) {
        let (link, accepted) = match self.supervisors.get_mut(&id) {
            Some(supervisor) => (supervisor.link_mut(), false),
            None => match self.accepted.get_mut(&id) {
                Some(entry) => {
                    entry.touch(&self.events);
                    (&mut entry.link, true)
                }
                None => return,
            },
        };
        if !link.is_current(epoch) || !link.is_connected() {
            trace!("Bridge '{}': dropping frame of epoch {}", link.name(), epoch);
            return;
        }
        let dispatcher = match link.kind() {
            StrategyKind::Direct => &self.direct,
            StrategyKind::Pubsub => &self.pubsub,
        };
        let known_peer = link.peer_id().is_some();
        apply_frame(link, dispatcher, &mut self.endpoints, &self.metrics, text);

        if accepted && !known_peer {
            if let Some(peer) = link.peer_id().map(str::to_string) {
                self.retire_superseded(id, &peer);
            }
        }
    }

    /// A peer that reconnects leaves its previous accepted link behind when
    /// the old transport died silently. Keep only the newest one.
    fn retire_superseded(&mut self, current: LinkId, peer: &str) {
        let Some(endpoint) = self.accepted.get(&current).map(|e| e.link.endpoint()) else {
            return;
        };
        let stale: Vec<LinkId> = self
            .accepted
            .iter()
            .filter(|(id, entry)| {
                **id != current
                    && entry.link.endpoint() == endpoint
                    && entry.link.peer_id() == Some(peer)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in stale {
            if let Some(mut entry) = self.accepted.remove(&id) {
                info!(
                    "Bridge '{}': superseded by a newer link from '{}'",
                    entry.link.name(),
                    peer
                );
                drop(entry.link.disconnect());
                self.metrics.link_disconnected();
            }
        }
    }

    fn on_link_idle(&mut self, id: LinkId, seq: u64) {
        let Some(entry) = self.accepted.get(&id) else {
            return;
        };
        if entry.idle_seq != seq {
            return;
        }
        if let Some(mut entry) = self.accepted.remove(&id) {
            warn!(
                "Bridge '{}': nothing received for {:?}, dropping",
                entry.link.name(),
                entry.idle_after.unwrap_or_default()
            );
            drop(entry.link.disconnect());
            self.metrics.link_disconnected();
        }
    }

    fn on_link_closed(&mut self, id: LinkId, epoch: u64, error: Option<RelayError>) {
        if let Some(supervisor) = self.supervisors.get_mut(&id) {
            if supervisor.on_transport_lost(epoch, error) {
                self.metrics.link_disconnected();
            }
            return;
        }

        let Some(entry) = self.accepted.get(&id) else {
            return;
        };
        if !entry.link.is_current(epoch) {
            return;
        }
        if let Some(AcceptedLink { mut link, .. }) = self.accepted.remove(&id) {
            match error {
                Some(e) => warn!("Bridge '{}': transport lost: {}", link.name(), e),
                None => info!("Bridge '{}': closed by peer", link.name()),
            }
            drop(link.disconnect());
            self.metrics.link_disconnected();
        }
    }

    fn snapshot(&self) -> RelaySnapshot {
        let listeners = self
            .endpoints
            .iter()
            .map(|endpoint| ListenerSnapshot {
                name: endpoint.registry.name().to_string(),
                addr: endpoint.addr,
                clients: endpoint.registry.len(),
            })
            .collect();

        let supervised = self.supervisors.values().map(|supervisor| {
            link_snapshot(supervisor.link(), supervisor.reconnect().attempts(), false)
        });
        let accepted = self
            .accepted
            .values()
            .map(|entry| link_snapshot(&entry.link, 0, true));

        RelaySnapshot {
            instance_id: self.instance_id.clone(),
            listeners,
            links: supervised.chain(accepted).collect(),
        }
    }

    async fn shutdown(&mut self) {
        info!("Relay '{}' shutting down", self.instance_id);

        for supervisor in self.supervisors.values_mut() {
            if supervisor.shutdown(SHUTDOWN_GRACE).await {
                self.metrics.link_disconnected();
            }
        }
        for (_, mut entry) in std::mem::take(&mut self.accepted) {
            drop(entry.idle.take());
            if let Some(sink) = entry.link.disconnect() {
                sink.close(SHUTDOWN_GRACE).await;
                self.metrics.link_disconnected();
            }
        }

        for acceptor in self.acceptors.drain(..) {
            acceptor.abort();
        }
        for endpoint in &mut self.endpoints {
            let closed = endpoint.registry.close_all();
            for _ in 0..closed {
                self.metrics.client_disconnected(endpoint.registry.name());
            }
            info!(
                "Listener '{}' closed ({} client(s))",
                endpoint.registry.name(),
                closed
            );
        }

        info!("Relay '{}' stopped", self.instance_id);
    }
}

/// Apply one inbound bridge frame. Bridged data reaches the local registry
/// only, rendered through the listener's relay template, and is never
/// forwarded onto another link.
fn apply_frame(
    link: &mut BridgeLink,
    dispatcher: &Dispatcher,
    endpoints: &mut [Endpoint],
    metrics: &Metrics,
    text: String,
) {
    let action = match dispatcher.dispatch(&text) {
        Ok(action) => action,
        Err(e) => {
            warn!("Bridge '{}': dropping frame: {}", link.name(), e);
            metrics.envelope_dropped("decode");
            return;
        }
    };

    match action {
        Action::RecordPeer(peer_id) => link.set_peer_id(peer_id),
        Action::Reply(frame) => {
            if let Err(e) = link.send_text(frame) {
                debug!("Bridge '{}': reply not sent: {}", link.name(), e);
            }
        }
        Action::HeartbeatAck => {
            if let Some(heartbeat) = link.heartbeat_mut() {
                heartbeat.on_ack();
            }
        }
        Action::Broadcast(envelope) => {
            let Some(endpoint) = endpoints.get_mut(link.endpoint()) else {
                return;
            };
            let text = endpoint.config.render_relay(
                endpoint.addr.port(),
                &envelope.source_id,
                &envelope.content,
            );
            let report = endpoint.registry.broadcast_raw(&text, None);
            debug!(
                "Bridge '{}': applied message from '{}' to {} client(s)",
                link.name(),
                envelope.source_id,
                report.delivered
            );
            metrics.bridge_message_applied(link.kind().as_str());
            record_drops(metrics, endpoint.registry.name(), &report);
        }
        Action::BroadcastRaw(text) => {
            let Some(endpoint) = endpoints.get_mut(link.endpoint()) else {
                return;
            };
            let report = endpoint.registry.broadcast_raw(&text, None);
            metrics.bridge_message_applied(link.kind().as_str());
            record_drops(metrics, endpoint.registry.name(), &report);
        }
        Action::Discard(reason) => {
            trace!("Bridge '{}': discarded frame ({})", link.name(), reason);
            metrics.envelope_dropped(reason);
        }
    }
}

fn record_drops(metrics: &Metrics, listener: &str, report: &BroadcastReport) {
    if report.dropped.is_empty() {
        return;
    }
    metrics.client_send_dropped(report.dropped.len());
    for _ in &report.dropped {
        metrics.client_disconnected(listener);
    }
}

fn link_snapshot(link: &BridgeLink, attempts: u32, accepted: bool) -> LinkSnapshot {
    LinkSnapshot {
        id: link.id(),
        name: link.name().to_string(),
        kind: link.kind(),
        state: link.state(),
        peer_id: link.peer_id().map(str::to_string),
        attempts,
        accepted,
    }
}
