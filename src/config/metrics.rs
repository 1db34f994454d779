//! Metrics endpoint configuration

use std::net::SocketAddr;

use serde::Deserialize;

/// `[metrics]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve the Prometheus endpoint
    pub enabled: bool,
    /// HTTP bind address for /metrics and /health
    pub bind: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    /// Whether the enabled endpoint would take the same port as a listener
    /// bound to `addr`. Ephemeral (port 0) binds never conflict.
    pub fn conflicts_with(&self, addr: SocketAddr) -> bool {
        if !self.enabled || addr.port() == 0 || self.bind.port() != addr.port() {
            return false;
        }
        self.bind.ip() == addr.ip() || self.bind.ip().is_unspecified() || addr.ip().is_unspecified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_on(bind: &str) -> MetricsConfig {
        MetricsConfig {
            enabled: true,
            bind: bind.parse().unwrap(),
        }
    }

    #[test]
    fn test_wildcard_bind_conflicts_with_any_listener_on_its_port() {
        let metrics = enabled_on("0.0.0.0:9090");
        assert!(metrics.conflicts_with("127.0.0.1:9090".parse().unwrap()));
        assert!(!metrics.conflicts_with("127.0.0.1:8080".parse().unwrap()));
    }

    #[test]
    fn test_distinct_addresses_share_a_port() {
        let metrics = enabled_on("127.0.0.1:9090");
        assert!(!metrics.conflicts_with("10.0.0.1:9090".parse().unwrap()));
        assert!(metrics.conflicts_with("0.0.0.0:9090".parse().unwrap()));
    }

    #[test]
    fn test_disabled_or_ephemeral_never_conflicts() {
        let mut metrics = enabled_on("127.0.0.1:0");
        assert!(!metrics.conflicts_with("127.0.0.1:0".parse().unwrap()));

        metrics.bind = "127.0.0.1:9090".parse().unwrap();
        metrics.enabled = false;
        assert!(!metrics.conflicts_with("127.0.0.1:9090".parse().unwrap()));
    }
}
