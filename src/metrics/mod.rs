//! Prometheus metrics for wsrelay
//!
//! Exposes metrics at /metrics endpoint for monitoring and observability.

use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

mod server;

pub use server::MetricsServer;

/// All wsrelay metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Client metrics
    pub clients_total: IntCounter,
    pub clients_current: IntGauge,
    pub clients_by_listener: IntGaugeVec,
    pub client_sends_dropped: IntCounter,

    // Message metrics
    pub messages_received: IntCounter,
    pub bridge_messages_sent: IntCounterVec,
    pub bridge_messages_applied: IntCounterVec,
    pub envelopes_dropped: IntCounterVec,

    // Bridge link metrics
    pub bridge_links_connected: IntGauge,
    pub reconnect_attempts: IntCounter,
    pub heartbeat_timeouts: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        // Client metrics
        let clients_total = IntCounter::with_opts(Opts::new(
            "wsrelay_clients_total",
            "Total number of client connections since startup",
        ))
        .unwrap();

        let clients_current = IntGauge::with_opts(Opts::new(
            "wsrelay_clients_current",
            "Current number of connected clients",
        ))
        .unwrap();

        let clients_by_listener = IntGaugeVec::new(
            Opts::new(
                "wsrelay_clients_by_listener",
                "Current connected clients by listener",
            ),
            &["listener"],
        )
        .unwrap();

        let client_sends_dropped = IntCounter::with_opts(Opts::new(
            "wsrelay_client_sends_dropped_total",
            "Sends to local clients that failed (client removed)",
        ))
        .unwrap();

        // Message metrics
        let messages_received = IntCounter::with_opts(Opts::new(
            "wsrelay_messages_received_total",
            "Text messages received from local clients",
        ))
        .unwrap();

        let bridge_messages_sent = IntCounterVec::new(
            Opts::new(
                "wsrelay_bridge_messages_sent_total",
                "Data envelopes sent over bridge links",
            ),
            &["strategy"],
        )
        .unwrap();

        let bridge_messages_applied = IntCounterVec::new(
            Opts::new(
                "wsrelay_bridge_messages_applied_total",
                "Bridge messages broadcast to local clients",
            ),
            &["strategy"],
        )
        .unwrap();

        let envelopes_dropped = IntCounterVec::new(
            Opts::new(
                "wsrelay_envelopes_dropped_total",
                "Inbound bridge frames dropped by reason",
            ),
            &["reason"],
        )
        .unwrap();

        // Bridge link metrics
        let bridge_links_connected = IntGauge::with_opts(Opts::new(
            "wsrelay_bridge_links_connected",
            "Bridge links currently connected",
        ))
        .unwrap();

        let reconnect_attempts = IntCounter::with_opts(Opts::new(
            "wsrelay_reconnect_attempts_total",
            "Bridge connect attempts made by reconnection supervisors",
        ))
        .unwrap();

        let heartbeat_timeouts = IntCounter::with_opts(Opts::new(
            "wsrelay_heartbeat_timeouts_total",
            "Bridge links dropped after a missed heartbeat acknowledgment",
        ))
        .unwrap();

        // Register all metrics
        registry.register(Box::new(clients_total.clone())).unwrap();
        registry
            .register(Box::new(clients_current.clone()))
            .unwrap();
        registry
            .register(Box::new(clients_by_listener.clone()))
            .unwrap();
        registry
            .register(Box::new(client_sends_dropped.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_received.clone()))
            .unwrap();
        registry
            .register(Box::new(bridge_messages_sent.clone()))
            .unwrap();
        registry
            .register(Box::new(bridge_messages_applied.clone()))
            .unwrap();
        registry
            .register(Box::new(envelopes_dropped.clone()))
            .unwrap();
        registry
            .register(Box::new(bridge_links_connected.clone()))
            .unwrap();
        registry
            .register(Box::new(reconnect_attempts.clone()))
            .unwrap();
        registry
            .register(Box::new(heartbeat_timeouts.clone()))
            .unwrap();

        Metrics {
            registry,
            clients_total,
            clients_current,
            clients_by_listener,
            client_sends_dropped,
            messages_received,
            bridge_messages_sent,
            bridge_messages_applied,
            envelopes_dropped,
            bridge_links_connected,
            reconnect_attempts,
            heartbeat_timeouts,
        }
    }

    // Helper methods for common operations

    pub fn client_connected(&self, listener: &str) {
        self.clients_total.inc();
        self.clients_current.inc();
        self.clients_by_listener.with_label_values(&[listener]).inc();
    }

    pub fn client_disconnected(&self, listener: &str) {
        self.clients_current.dec();
        self.clients_by_listener.with_label_values(&[listener]).dec();
    }

    pub fn client_send_dropped(&self, count: usize) {
        self.client_sends_dropped.inc_by(count as u64);
    }

    pub fn message_received(&self) {
        self.messages_received.inc();
    }

    pub fn bridge_message_sent(&self, strategy: &str) {
        self.bridge_messages_sent.with_label_values(&[strategy]).inc();
    }

    pub fn bridge_message_applied(&self, strategy: &str) {
        self.bridge_messages_applied
            .with_label_values(&[strategy])
            .inc();
    }

    pub fn envelope_dropped(&self, reason: &str) {
        self.envelopes_dropped.with_label_values(&[reason]).inc();
    }

    pub fn link_connected(&self) {
        self.bridge_links_connected.inc();
    }

    pub fn link_disconnected(&self) {
        self.bridge_links_connected.dec();
    }

    pub fn reconnect_attempted(&self) {
        self.reconnect_attempts.inc();
    }

    pub fn heartbeat_timed_out(&self) {
        self.heartbeat_timeouts.inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
