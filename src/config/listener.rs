//! Listener endpoint configuration

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

/// One WebSocket listener endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Endpoint name, referenced by bridges
    pub name: String,

    /// TCP bind address
    pub bind: SocketAddr,

    /// Request path on which peer relays open direct bridges
    #[serde(default = "default_bridge_path")]
    pub bridge_path: String,

    /// Welcome sent to each new client; `{port}` and `{name}` are expanded.
    /// Empty disables it.
    #[serde(default = "default_welcome")]
    pub welcome: String,

    /// Echo sent back to a client for each message; `{port}`, `{name}` and
    /// `{message}` are expanded. Empty disables it.
    #[serde(default = "default_echo")]
    pub echo: String,

    /// Text delivered to clients for a message relayed from a peer;
    /// `{source}`, `{port}`, `{name}` and `{message}` are expanded. Empty
    /// delivers the bare message, as does a message with no known source.
    #[serde(default = "default_relay")]
    pub relay: String,

    /// Accepted bridge links that receive nothing for this long are dropped.
    /// Must exceed the peers' heartbeat interval plus timeout; zero disables.
    #[serde(default = "default_bridge_idle_timeout", with = "humantime_serde")]
    pub bridge_idle_timeout: Duration,
}

fn default_bridge_path() -> String {
    "/bridge".to_string()
}

fn default_welcome() -> String {
    "Welcome to the WebSocket server on port {port}!".to_string()
}

fn default_echo() -> String {
    "Echo from {port}: {message}".to_string()
}

fn default_relay() -> String {
    "From {source}: {message}".to_string()
}

fn default_bridge_idle_timeout() -> Duration {
    Duration::from_secs(35)
}

impl ListenerConfig {
    pub fn new(name: impl Into<String>, bind: SocketAddr) -> Self {
        Self {
            name: name.into(),
            bind,
            bridge_path: default_bridge_path(),
            welcome: default_welcome(),
            echo: default_echo(),
            relay: default_relay(),
            bridge_idle_timeout: default_bridge_idle_timeout(),
        }
    }

    /// Welcome text for a listener bound to `port`
    pub fn render_welcome(&self, port: u16) -> String {
        self.welcome
            .replace("{port}", &port.to_string())
            .replace("{name}", &self.name)
    }

    /// Echo text for `message`, or `None` when echo is disabled
    pub fn render_echo(&self, port: u16, message: &str) -> Option<String> {
        if self.echo.is_empty() {
            return None;
        }
        // Expand {message} last so client text is never treated as a template
        Some(
            self.echo
                .replace("{port}", &port.to_string())
                .replace("{name}", &self.name)
                .replace("{message}", message),
        )
    }

    /// Client-facing text for `message` relayed from the peer `source`
    pub fn render_relay(&self, port: u16, source: &str, message: &str) -> String {
        if self.relay.is_empty() || source.is_empty() {
            return message.to_string();
        }
        self.relay
            .replace("{port}", &port.to_string())
            .replace("{name}", &self.name)
            .replace("{source}", source)
            .replace("{message}", message)
    }

    /// Idle deadline for accepted bridge links, if enabled
    pub fn bridge_idle_deadline(&self) -> Option<Duration> {
        (!self.bridge_idle_timeout.is_zero()).then_some(self.bridge_idle_timeout)
    }
}
