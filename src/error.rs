//! Relay error types
//!
//! Every failure the relay can observe maps to one of these kinds. Only
//! [`RelayError::Bind`] and [`RelayError::Config`] are fatal; everything else
//! is recovered by the component that observes it.

use std::fmt;
use std::net::SocketAddr;

use crate::config::ConfigError;

/// Errors produced by the relay and its bridge links
#[derive(Debug)]
pub enum RelayError {
    /// Peer or broker unreachable while establishing a bridge link
    TransportConnect(String),
    /// Read/write failure on an established bridge link
    TransportIo(String),
    /// Malformed envelope payload (frame dropped, link kept)
    Decode(String),
    /// Envelope could not be serialized
    Encode(String),
    /// Heartbeat acknowledgment not received before the deadline
    LivenessTimeout,
    /// Send to a local client failed (client dropped from its registry)
    ClientSend(String),
    /// Send attempted on a link that is not connected
    NotConnected(String),
    /// Listener endpoint could not be bound at startup
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    /// Invalid configuration
    Config(ConfigError),
}

impl RelayError {
    /// Whether this error must stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Bind { .. } | RelayError::Config(_))
    }

    /// Whether this error ends an established bridge link
    pub fn ends_link(&self) -> bool {
        matches!(
            self,
            RelayError::TransportConnect(_)
                | RelayError::TransportIo(_)
                | RelayError::LivenessTimeout
        )
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::TransportConnect(msg) => write!(f, "Transport connect failed: {}", msg),
            RelayError::TransportIo(msg) => write!(f, "Transport I/O error: {}", msg),
            RelayError::Decode(msg) => write!(f, "Decode error: {}", msg),
            RelayError::Encode(msg) => write!(f, "Encode error: {}", msg),
            RelayError::LivenessTimeout => write!(f, "Heartbeat deadline missed"),
            RelayError::ClientSend(msg) => write!(f, "Client send failed: {}", msg),
            RelayError::NotConnected(link) => write!(f, "Link '{}' is not connected", link),
            RelayError::Bind { addr, source } => write!(f, "Failed to bind {}: {}", addr, source),
            RelayError::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Bind { source, .. } => Some(source),
            RelayError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for RelayError {
    fn from(e: ConfigError) -> Self {
        RelayError::Config(e)
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_startup_errors_are_fatal() {
        let bind = RelayError::Bind {
            addr: "127.0.0.1:8080".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(bind.is_fatal());
        assert!(RelayError::Config(ConfigError::Validation("x".into())).is_fatal());

        assert!(!RelayError::TransportConnect("refused".into()).is_fatal());
        assert!(!RelayError::TransportIo("reset".into()).is_fatal());
        assert!(!RelayError::Decode("bad".into()).is_fatal());
        assert!(!RelayError::LivenessTimeout.is_fatal());
        assert!(!RelayError::ClientSend("closed".into()).is_fatal());
    }

    #[test]
    fn test_liveness_timeout_ends_link_like_io_error() {
        assert!(RelayError::LivenessTimeout.ends_link());
        assert!(RelayError::TransportIo("reset".into()).ends_link());
        assert!(!RelayError::Decode("bad".into()).ends_link());
        assert!(!RelayError::ClientSend("closed".into()).ends_link());
    }
}
