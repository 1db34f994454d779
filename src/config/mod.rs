//! Configuration Module
//!
//! Provides TOML-based configuration for wsrelay with support for:
//! - Listener endpoints
//! - Bridge links (direct and pubsub) with reconnect and heartbeat policy
//! - Relay identity and per-client queue sizing
//! - Metrics endpoint
//! - Environment variable overrides (WSRELAY__* prefix)

use std::collections::HashSet;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use bridge::{BridgeConfig, BrokerKind, HeartbeatConfig, StrategyKind};
pub use listener::ListenerConfig;
pub use metrics::MetricsConfig;

mod bridge;
mod listener;
mod metrics;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Relay identity and queue sizing
    pub relay: RelayConfig,
    /// Listener endpoints
    #[serde(default)]
    pub listener: Vec<ListenerConfig>,
    /// Bridge links
    #[serde(default)]
    pub bridge: Vec<BridgeConfig>,
    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Relay instance configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Instance id carried as `sourceId` on every envelope this relay sends.
    /// Defaults to `<hostname>-<pid>`.
    pub instance_id: Option<String>,
    /// Per-client outbound queue capacity. A client whose queue is full is
    /// dropped from its listener.
    #[serde(default = "default_outbound_channel_capacity")]
    pub outbound_channel_capacity: usize,
}

fn default_outbound_channel_capacity() -> usize {
    1024
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            outbound_channel_capacity: default_outbound_channel_capacity(),
        }
    }
}

impl RelayConfig {
    /// Get the instance id, generating one from the hostname if not set
    pub fn get_instance_id(&self) -> String {
        self.instance_id.clone().unwrap_or_else(|| {
            let pid = std::process::id();
            hostname::get()
                .map(|h| format!("{}-{}", h.to_string_lossy(), pid))
                .unwrap_or_else(|_| format!("relay-{}", pid))
        })
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `WSRELAY__` prefix with double underscores for nesting:
    ///    - `WSRELAY__RELAY__INSTANCE_ID=relay-a` overrides `relay.instance_id`
    ///    - `WSRELAY__LOG__LEVEL=debug` overrides `log.level`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default(
                "relay.outbound_channel_capacity",
                default_outbound_channel_capacity() as i64,
            )?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("WSRELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listener.is_empty() {
            return Err(ConfigError::Validation(
                "at least one [[listener]] is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for listener in &self.listener {
            if !names.insert(listener.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate listener name '{}'",
                    listener.name
                )));
            }
            if !listener.bridge_path.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "Listener '{}' bridge_path must start with '/'",
                    listener.name
                )));
            }
            if self.metrics.conflicts_with(listener.bind) {
                return Err(ConfigError::Validation(format!(
                    "Listener '{}' and the metrics endpoint both bind port {}",
                    listener.name,
                    listener.bind.port()
                )));
            }
        }

        if self.relay.outbound_channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "relay.outbound_channel_capacity must be >= 1".to_string(),
            ));
        }

        let mut bridge_names = HashSet::new();
        for bridge in self.enabled_bridges() {
            if !bridge_names.insert(bridge.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate bridge name '{}'",
                    bridge.name
                )));
            }
            if !names.contains(bridge.endpoint.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Bridge '{}' references unknown listener '{}'",
                    bridge.name, bridge.endpoint
                )));
            }
            bridge.validate().map_err(ConfigError::Validation)?;
        }

        Ok(())
    }

    /// Bridges that are not disabled
    pub fn enabled_bridges(&self) -> impl Iterator<Item = &BridgeConfig> {
        self.bridge.iter().filter(|b| b.enabled)
    }

    /// Index of the listener named `name`
    pub fn listener_index(&self, name: &str) -> Option<usize> {
        self.listener.iter().position(|l| l.name == name)
    }
}
