//! Integration Tests for wsrelay
//!
//! These tests start in-process relays on loopback ports and drive them with
//! real WebSocket clients, checking local fan-out and bridging between
//! relays over both bridge strategies.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use wsrelay::config::{
    BridgeConfig, BrokerKind, Config, HeartbeatConfig, ListenerConfig, RelayConfig, StrategyKind,
};
use wsrelay::envelope::Envelope;
use wsrelay::relay::RelaySnapshot;
use wsrelay::{LinkState, Metrics, Relay, RelayError, RelayHandle};

// Atomic port counter to avoid port conflicts between tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(29000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn local(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn relay_config(instance_id: &str, port: u16, bridges: Vec<BridgeConfig>) -> Config {
    Config {
        relay: RelayConfig {
            instance_id: Some(instance_id.to_string()),
            ..Default::default()
        },
        listener: vec![ListenerConfig::new("wss", local(port))],
        bridge: bridges,
        ..Default::default()
    }
}

fn direct_bridge(name: &str, peer_port: u16) -> BridgeConfig {
    BridgeConfig {
        name: name.to_string(),
        endpoint: "wss".to_string(),
        url: Some(format!("ws://127.0.0.1:{}/bridge", peer_port)),
        connect_timeout: Duration::from_secs(1),
        startup_delay: Duration::from_millis(20),
        base_delay: Duration::from_millis(200),
        ..Default::default()
    }
}

fn pubsub_bridge(broker: &str) -> BridgeConfig {
    BridgeConfig {
        name: "bus".to_string(),
        strategy: StrategyKind::Pubsub,
        endpoint: "wss".to_string(),
        broker: BrokerKind::Memory,
        broker_url: Some(broker.to_string()),
        channel: "relay:test".to_string(),
        startup_delay: Duration::from_millis(20),
        base_delay: Duration::from_millis(200),
        ..Default::default()
    }
}

async fn start(config: Config) -> RelayHandle {
    Relay::new(config).start().await.expect("relay failed to start")
}

/// Start a relay, retrying while a previous owner of the port lets go of it
async fn start_on_reused_port(config: Config) -> RelayHandle {
    for _ in 0..50 {
        match Relay::new(config.clone()).start().await {
            Ok(handle) => return handle,
            Err(RelayError::Bind { .. }) => sleep(Duration::from_millis(50)).await,
            Err(e) => panic!("relay failed to start: {}", e),
        }
    }
    panic!("port never became free");
}

async fn wait_for(handle: &RelayHandle, what: &str, check: impl Fn(&RelaySnapshot) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(snapshot) = handle.snapshot().await {
            if check(&snapshot) {
                return;
            }
        }
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(20)).await;
    }
}

fn link_is(snapshot: &RelaySnapshot, name: &str, state: LinkState) -> bool {
    snapshot.link(name).is_some_and(|link| link.state == state)
}

fn accepted_count(snapshot: &RelaySnapshot) -> usize {
    snapshot
        .accepted_links()
        .filter(|link| link.state == LinkState::Connected)
        .count()
}

/// WebSocket client of a relay listener
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    /// Connect and consume the welcome notification
    async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{}/", addr))
            .await
            .expect("Failed to connect");
        let mut client = Self { ws };
        let welcome = client.recv().await;
        assert_eq!(
            welcome,
            format!("Welcome to the WebSocket server on port {}!", addr.port())
        );
        client
    }

    async fn send(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .expect("Failed to send");
    }

    async fn recv(&mut self) -> String {
        loop {
            match timeout(Duration::from_secs(3), self.ws.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => return text.to_string(),
                Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
                other => panic!("expected a text frame, got {:?}", other),
            }
        }
    }

    async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(Ok(Message::Text(text)))) = timeout(window, self.ws.next()).await {
            panic!("unexpected frame {:?}", text);
        }
    }
}

// =============================================================================
// Local behaviour
// =============================================================================

#[tokio::test]
async fn test_message_is_echoed_and_broadcast_locally() {
    let port = next_port();
    let relay = start(relay_config("relay-local", port, vec![])).await;

    let mut sender = TestClient::connect(local(port)).await;
    let mut other = TestClient::connect(local(port)).await;

    sender.send("hi all").await;
    assert_eq!(sender.recv().await, format!("Echo from {}: hi all", port));
    assert_eq!(other.recv().await, "hi all");
    sender.expect_silence(Duration::from_millis(200)).await;

    let snapshot = relay.snapshot().await.unwrap();
    assert_eq!(snapshot.listener("wss").unwrap().clients, 2);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_disconnected_client_leaves_registry() {
    let port = next_port();
    let relay = start(relay_config("relay-leave", port, vec![])).await;

    let client = TestClient::connect(local(port)).await;
    wait_for(&relay, "one client", |s| s.listener("wss").unwrap().clients == 1).await;

    drop(client);
    wait_for(&relay, "no clients", |s| s.listener("wss").unwrap().clients == 0).await;

    relay.shutdown().await;
}

#[tokio::test]
async fn test_bind_conflict_is_fatal() {
    let port = next_port();
    let _taken = TcpListener::bind(local(port)).await.unwrap();

    let result = Relay::new(relay_config("relay-bind", port, vec![]))
        .start()
        .await;
    assert!(matches!(result, Err(RelayError::Bind { .. })));
}

#[tokio::test]
async fn test_invalid_config_is_fatal() {
    let port = next_port();
    let mut bridge = direct_bridge("to-nowhere", next_port());
    bridge.endpoint = "missing".to_string();

    let result = Relay::new(relay_config("relay-bad", port, vec![bridge]))
        .start()
        .await;
    assert!(matches!(result, Err(RelayError::Config(_))));
}

// =============================================================================
// Direct bridge
// =============================================================================

#[tokio::test]
async fn test_direct_bridge_relays_both_ways() {
    let port_a = next_port();
    let port_b = next_port();
    let relay_b = start(relay_config("relay-b", port_b, vec![])).await;
    let relay_a = start(relay_config(
        "relay-a",
        port_a,
        vec![direct_bridge("to-b", port_b)],
    ))
    .await;

    wait_for(&relay_a, "link to-b connected", |s| {
        link_is(s, "to-b", LinkState::Connected)
    })
    .await;
    wait_for(&relay_b, "accepted link", |s| accepted_count(s) == 1).await;

    let mut a1 = TestClient::connect(local(port_a)).await;
    let mut a2 = TestClient::connect(local(port_a)).await;
    let mut b1 = TestClient::connect(local(port_b)).await;
    let mut b2 = TestClient::connect(local(port_b)).await;

    a1.send("hello").await;
    assert_eq!(a1.recv().await, format!("Echo from {}: hello", port_a));
    assert_eq!(a2.recv().await, "hello");
    // Peers see the relay tagged with the originating instance
    assert_eq!(b1.recv().await, "From relay-a: hello");
    assert_eq!(b2.recv().await, "From relay-a: hello");

    b1.send("world").await;
    assert_eq!(b1.recv().await, format!("Echo from {}: world", port_b));
    assert_eq!(b2.recv().await, "world");
    assert_eq!(a1.recv().await, "From relay-b: world");
    assert_eq!(a2.recv().await, "From relay-b: world");

    // Nothing comes back around
    for client in [&mut a1, &mut a2, &mut b1, &mut b2] {
        client.expect_silence(Duration::from_millis(200)).await;
    }

    // Each side learned the other's id from its handshake
    let a = relay_a.snapshot().await.unwrap();
    assert_eq!(a.link("to-b").unwrap().peer_id.as_deref(), Some("relay-b"));
    let b = relay_b.snapshot().await.unwrap();
    let accepted = b.accepted_links().next().unwrap();
    assert_eq!(accepted.peer_id.as_deref(), Some("relay-a"));

    relay_a.shutdown().await;
    relay_b.shutdown().await;
}

#[tokio::test]
async fn test_direct_bridge_outage_and_resume() {
    let port_a = next_port();
    let port_b = next_port();
    let config_b = relay_config("relay-b", port_b, vec![]);
    let relay_b = start(config_b.clone()).await;
    let relay_a = start(relay_config(
        "relay-a",
        port_a,
        vec![direct_bridge("to-b", port_b)],
    ))
    .await;

    wait_for(&relay_a, "link to-b connected", |s| {
        link_is(s, "to-b", LinkState::Connected)
    })
    .await;

    relay_b.shutdown().await;
    wait_for(&relay_a, "link to-b lost", |s| {
        !link_is(s, "to-b", LinkState::Connected)
    })
    .await;

    // During the outage messages are only handled locally
    let mut a1 = TestClient::connect(local(port_a)).await;
    a1.send("lost").await;
    assert_eq!(a1.recv().await, format!("Echo from {}: lost", port_a));

    let relay_b = start_on_reused_port(config_b).await;
    wait_for(&relay_a, "link to-b reconnected", |s| {
        link_is(s, "to-b", LinkState::Connected)
    })
    .await;
    wait_for(&relay_b, "accepted link", |s| accepted_count(s) == 1).await;

    let mut b1 = TestClient::connect(local(port_b)).await;
    a1.send("again").await;
    assert_eq!(a1.recv().await, format!("Echo from {}: again", port_a));
    // No replay of what was sent during the outage
    assert_eq!(b1.recv().await, "From relay-a: again");

    relay_a.shutdown().await;
    relay_b.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_acked_by_peer_keeps_link() {
    let port_a = next_port();
    let port_b = next_port();
    let relay_b = start(relay_config("relay-b", port_b, vec![])).await;

    let mut bridge = direct_bridge("to-b", port_b);
    bridge.heartbeat = HeartbeatConfig {
        enabled: true,
        interval: Duration::from_millis(100),
        timeout: Duration::from_millis(80),
    };
    let metrics = Arc::new(Metrics::new());
    let relay_a = Relay::with_metrics(relay_config("relay-a", port_a, vec![bridge]), metrics.clone())
        .start()
        .await
        .unwrap();

    wait_for(&relay_a, "link to-b connected", |s| {
        link_is(s, "to-b", LinkState::Connected)
    })
    .await;
    sleep(Duration::from_millis(600)).await;

    let snapshot = relay_a.snapshot().await.unwrap();
    assert!(link_is(&snapshot, "to-b", LinkState::Connected));
    assert_eq!(metrics.heartbeat_timeouts.get(), 0);
    assert_eq!(metrics.reconnect_attempts.get(), 1);

    relay_a.shutdown().await;
    relay_b.shutdown().await;
}

/// Peer that accepts bridge connections and never answers anything
async fn silent_peer(port: u16) -> Arc<AtomicUsize> {
    let accepted = Arc::new(AtomicUsize::new(0));
    let listener = TcpListener::bind(local(port)).await.unwrap();
    let counter = accepted.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                continue;
            };
            let counter = counter.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });
    accepted
}

#[tokio::test]
async fn test_missed_heartbeat_drops_and_reconnects() {
    let port_a = next_port();
    let port_peer = next_port();
    let accepted = silent_peer(port_peer).await;

    let mut bridge = direct_bridge("to-silent", port_peer);
    bridge.heartbeat = HeartbeatConfig {
        enabled: true,
        interval: Duration::from_millis(150),
        timeout: Duration::from_millis(100),
    };
    let metrics = Arc::new(Metrics::new());
    let relay_a = Relay::with_metrics(relay_config("relay-a", port_a, vec![bridge]), metrics.clone())
        .start()
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while accepted.load(Ordering::SeqCst) < 2 {
        assert!(Instant::now() < deadline, "no reconnect after missed heartbeat");
        sleep(Duration::from_millis(20)).await;
    }
    assert!(metrics.heartbeat_timeouts.get() >= 1);

    relay_a.shutdown().await;
}

#[tokio::test]
async fn test_accepted_link_applies_raw_and_tagged_frames() {
    let port_b = next_port();
    let relay_b = start(relay_config("relay-b", port_b, vec![])).await;
    let mut b1 = TestClient::connect(local(port_b)).await;

    let (mut peer, _) = connect_async(format!("ws://127.0.0.1:{}/bridge", port_b))
        .await
        .unwrap();
    wait_for(&relay_b, "accepted link", |s| accepted_count(s) == 1).await;

    let tagged = Envelope::data("relay-x", "tagged").encode().unwrap();
    for frame in [
        "untagged".to_string(),
        r#"{"type":"gossip"}"#.to_string(),
        tagged,
        Envelope::data("relay-b", "own").encode().unwrap(),
    ] {
        peer.send(Message::Text(frame.into())).await.unwrap();
    }

    assert_eq!(b1.recv().await, "untagged");
    assert_eq!(b1.recv().await, "From relay-x: tagged");
    b1.expect_silence(Duration::from_millis(200)).await;

    // The malformed frame did not take the link down
    let snapshot = relay_b.snapshot().await.unwrap();
    assert_eq!(accepted_count(&snapshot), 1);

    // The relay's own handshake arrived on the peer's side
    let first = loop {
        match timeout(Duration::from_secs(2), peer.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => break text.to_string(),
            Ok(Some(Ok(_))) => continue,
            other => panic!("expected handshake, got {:?}", other),
        }
    };
    let handshake = Envelope::decode(&first).unwrap();
    assert_eq!(handshake.source_id, "relay-b");

    relay_b.shutdown().await;
}

type PeerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a bridge to `port` the way a peer relay would and send its handshake
async fn bridge_peer(port: u16, peer_id: &str) -> PeerSocket {
    let (mut peer, _) = connect_async(format!("ws://127.0.0.1:{}/bridge", port))
        .await
        .unwrap();
    let handshake = Envelope::handshake(peer_id, "wss").encode().unwrap();
    peer.send(Message::Text(handshake)).await.unwrap();
    peer
}

/// Read past any frames until the relay closes the socket
async fn expect_closed(peer: &mut PeerSocket) {
    loop {
        match timeout(Duration::from_secs(3), peer.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return,
            Ok(Some(Ok(_))) => continue,
            Err(_) => panic!("bridge socket was never closed"),
        }
    }
}

fn idle_config(instance_id: &str, port: u16, idle: Duration) -> Config {
    let mut config = relay_config(instance_id, port, vec![]);
    config.listener[0].bridge_idle_timeout = idle;
    config
}

#[tokio::test]
async fn test_silent_accepted_link_is_dropped() {
    let port_b = next_port();
    let relay_b = start(idle_config("relay-b", port_b, Duration::from_millis(300))).await;

    let mut peer = bridge_peer(port_b, "relay-p").await;
    wait_for(&relay_b, "peer handshake", |s| {
        s.accepted_links()
            .any(|l| l.peer_id.as_deref() == Some("relay-p"))
    })
    .await;

    // The peer stops talking without closing its socket
    wait_for(&relay_b, "idle link dropped", |s| accepted_count(s) == 0).await;
    expect_closed(&mut peer).await;

    // Client traffic no longer has a link to queue on
    let mut b1 = TestClient::connect(local(port_b)).await;
    b1.send("after").await;
    assert_eq!(b1.recv().await, format!("Echo from {}: after", port_b));

    relay_b.shutdown().await;
}

#[tokio::test]
async fn test_heartbeating_accepted_link_outlives_idle_deadline() {
    let port_b = next_port();
    let relay_b = start(idle_config("relay-b", port_b, Duration::from_millis(300))).await;

    let mut peer = bridge_peer(port_b, "relay-p").await;
    wait_for(&relay_b, "accepted link", |s| accepted_count(s) == 1).await;

    for _ in 0..8 {
        let heartbeat = Envelope::heartbeat("relay-p").encode().unwrap();
        peer.send(Message::Text(heartbeat)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
    }

    let snapshot = relay_b.snapshot().await.unwrap();
    assert_eq!(accepted_count(&snapshot), 1);

    relay_b.shutdown().await;
}

#[tokio::test]
async fn test_reconnected_peer_supersedes_stale_accepted_link() {
    let port_b = next_port();
    let relay_b = start(relay_config("relay-b", port_b, vec![])).await;

    let mut stale = bridge_peer(port_b, "relay-p").await;
    wait_for(&relay_b, "first link", |s| {
        s.accepted_links()
            .any(|l| l.peer_id.as_deref() == Some("relay-p"))
    })
    .await;
    let first = relay_b.snapshot().await.unwrap().accepted_links().next().unwrap().id;

    let _fresh = bridge_peer(port_b, "relay-p").await;
    wait_for(&relay_b, "one link per peer", |s| {
        let links: Vec<_> = s.accepted_links().collect();
        links.len() == 1 && links[0].id != first
    })
    .await;
    expect_closed(&mut stale).await;

    relay_b.shutdown().await;
}

// =============================================================================
// Pub/sub bridge
// =============================================================================

#[tokio::test]
async fn test_pubsub_applies_once_per_peer_and_never_to_self() {
    let broker = "integration-pubsub";
    let ports = [next_port(), next_port(), next_port()];
    let metrics_x = Arc::new(Metrics::new());

    let relay_x = Relay::with_metrics(
        relay_config("relay-x", ports[0], vec![pubsub_bridge(broker)]),
        metrics_x.clone(),
    )
    .start()
    .await
    .unwrap();
    let relay_y = start(relay_config("relay-y", ports[1], vec![pubsub_bridge(broker)])).await;
    let relay_z = start(relay_config("relay-z", ports[2], vec![pubsub_bridge(broker)])).await;

    for relay in [&relay_x, &relay_y, &relay_z] {
        wait_for(relay, "bus connected", |s| {
            link_is(s, "bus", LinkState::Connected)
        })
        .await;
    }

    let mut x1 = TestClient::connect(local(ports[0])).await;
    let mut y1 = TestClient::connect(local(ports[1])).await;
    let mut z1 = TestClient::connect(local(ports[2])).await;

    x1.send("ping").await;
    assert_eq!(x1.recv().await, format!("Echo from {}: ping", ports[0]));
    assert_eq!(y1.recv().await, "From relay-x: ping");
    assert_eq!(z1.recv().await, "From relay-x: ping");

    for client in [&mut x1, &mut y1, &mut z1] {
        client.expect_silence(Duration::from_millis(200)).await;
    }
    assert!(
        metrics_x
            .envelopes_dropped
            .with_label_values(&["self_echo"])
            .get()
            >= 1
    );

    relay_x.shutdown().await;
    relay_y.shutdown().await;
    relay_z.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let port = next_port();
    let relay = start(relay_config("relay-stop", port, vec![])).await;
    let mut client = TestClient::connect(local(port)).await;

    relay.shutdown().await;

    match timeout(Duration::from_secs(2), client.ws.next()).await {
        Ok(None) | Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) => {}
        other => panic!("expected the connection to close, got {:?}", other),
    }
}
