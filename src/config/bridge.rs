//! Bridge Configuration
//!
//! Configuration structures for bridge links between relay instances.

use std::time::Duration;

use serde::Deserialize;

/// Bridge transport strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Persistent WebSocket to a peer relay's bridge path
    #[default]
    Direct,
    /// Shared channel on a publish/subscribe broker
    #[serde(alias = "pub-sub")]
    Pubsub,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Direct => "direct",
            StrategyKind::Pubsub => "pubsub",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publish/subscribe broker backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// Redis PUBLISH/SUBSCRIBE
    #[default]
    Redis,
    /// In-process broker shared by name
    Memory,
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerKind::Redis => write!(f, "redis"),
            BrokerKind::Memory => write!(f, "memory"),
        }
    }
}

/// Liveness probing of direct links
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Time between heartbeats
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Time allowed for the acknowledgment
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration for a single bridge link
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Unique name for this bridge
    pub name: String,

    /// Whether this bridge is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Transport strategy
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Name of the listener this bridge feeds
    pub endpoint: String,

    /// Peer bridge URL for direct links (ws://host:port/bridge)
    #[serde(default)]
    pub url: Option<String>,

    /// Broker backend for pubsub links
    #[serde(default)]
    pub broker: BrokerKind,

    /// Broker URL (redis://host:port) or memory broker name
    #[serde(default)]
    pub broker_url: Option<String>,

    /// Broker channel shared by every relay on this bridge
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Connect attempt timeout
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Delay before the first connect attempt
    #[serde(default = "default_startup_delay", with = "humantime_serde")]
    pub startup_delay: Duration,

    /// Delay between connect attempts
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Consecutive attempts before the delay escalates
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Multiplier applied to `base_delay` once `max_attempts` is reached
    #[serde(default = "default_escalation")]
    pub escalation: u32,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

fn default_true() -> bool {
    true
}

fn default_channel() -> String {
    "relay:bridge".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_startup_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_base_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_attempts() -> u32 {
    10
}

fn default_escalation() -> u32 {
    3
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            enabled: true,
            strategy: StrategyKind::default(),
            endpoint: String::new(),
            url: None,
            broker: BrokerKind::default(),
            broker_url: None,
            channel: default_channel(),
            connect_timeout: default_connect_timeout(),
            startup_delay: default_startup_delay(),
            base_delay: default_base_delay(),
            max_attempts: default_max_attempts(),
            escalation: default_escalation(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Whether this link runs a heartbeat monitor
    pub fn uses_heartbeat(&self) -> bool {
        self.heartbeat.enabled && self.strategy == StrategyKind::Direct
    }

    /// Name of the memory broker, defaulting to the channel
    pub fn memory_broker_name(&self) -> &str {
        self.broker_url.as_deref().unwrap_or(&self.channel)
    }

    /// Check the fields that depend on the strategy
    pub fn validate(&self) -> Result<(), String> {
        match self.strategy {
            StrategyKind::Direct => match self.url.as_deref() {
                Some(url) if url.starts_with("ws://") || url.starts_with("wss://") => {}
                Some(url) => {
                    return Err(format!(
                        "Bridge '{}' has invalid url '{}' (expected ws://host:port/path)",
                        self.name, url
                    ))
                }
                None => {
                    return Err(format!(
                        "Bridge '{}' uses the direct strategy and needs a url",
                        self.name
                    ))
                }
            },
            StrategyKind::Pubsub => {
                if self.broker == BrokerKind::Redis && self.broker_url.is_none() {
                    return Err(format!(
                        "Bridge '{}' uses a redis broker and needs a broker_url",
                        self.name
                    ));
                }
                if self.channel.is_empty() {
                    return Err(format!("Bridge '{}' has an empty channel", self.name));
                }
            }
        }

        if self.max_attempts == 0 {
            return Err(format!("Bridge '{}': max_attempts must be >= 1", self.name));
        }
        if self.escalation == 0 {
            return Err(format!("Bridge '{}': escalation must be >= 1", self.name));
        }
        if self.uses_heartbeat() && self.heartbeat.timeout >= self.heartbeat.interval {
            return Err(format!(
                "Bridge '{}': heartbeat timeout must be shorter than its interval",
                self.name
            ));
        }

        Ok(())
    }
}
