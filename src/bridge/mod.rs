//! Bridge Engine
//!
//! Connects the listener pools of separate relay instances so they behave as
//! one broadcast domain. A bridge link carries [`Envelope`](crate::envelope::Envelope)s
//! over one of two strategies:
//! - **direct**: a persistent WebSocket to the peer relay's bridge path
//! - **pubsub**: a shared channel on a Redis or in-process broker
//!
//! # Loop Prevention
//!
//! Every envelope carries the `sourceId` of the relay that originated it.
//! A relay drops data envelopes carrying its own id, and on pubsub links any
//! envelope carrying its own id. Data received from a bridge is applied to
//! the local registry only and never forwarded to another bridge.
//!
//! # Example Configuration
//!
//! ```toml
//! [[bridge]]
//! name = "to-east"
//! endpoint = "wss"
//! url = "ws://east.example.com:8081/bridge"
//! base_delay = "5s"
//! heartbeat = { interval = "30s", timeout = "5s" }
//!
//! [[bridge]]
//! name = "bus"
//! strategy = "pubsub"
//! endpoint = "wss"
//! broker_url = "redis://127.0.0.1:6379"
//! channel = "relay:bridge"
//! ```

mod direct;
mod dispatch;
mod heartbeat;
mod link;
mod pubsub;
mod strategy;
mod supervisor;


use std::sync::Arc;

pub use direct::{spawn_ws_link, DirectStrategy};
pub use dispatch::{Action, Dispatcher};
pub use heartbeat::HeartbeatMonitor;
pub use link::{BridgeLink, LinkState};
pub use pubsub::{
    BrokerPublisher, MemoryBroker, MessageStream, PubSubBroker, PubSubStrategy, RedisBroker,
};
pub use strategy::{BridgeStrategy, LinkEvents, LinkFrame, LinkSink};
pub use supervisor::{ConnectOutcome, ReconnectState, ReconnectSupervisor};

// Re-export config types from the config module for convenience
pub use crate::config::{BridgeConfig, BrokerKind, HeartbeatConfig, StrategyKind};

use crate::config::ConfigError;
use crate::error::RelayError;

/// Build the strategy a bridge is configured for
pub fn build_strategy(config: &BridgeConfig) -> Result<Arc<dyn BridgeStrategy>, RelayError> {
    match config.strategy {
        StrategyKind::Direct => {
            let url = config.url.as_deref().ok_or_else(|| {
                ConfigError::Validation(format!("Bridge '{}' needs a url", config.name))
            })?;
            Ok(Arc::new(DirectStrategy::new(url)))
        }
        StrategyKind::Pubsub => {
            let broker: Arc<dyn PubSubBroker> = match config.broker {
                BrokerKind::Memory => MemoryBroker::shared(config.memory_broker_name()),
                BrokerKind::Redis => {
                    let url = config.broker_url.as_deref().ok_or_else(|| {
                        ConfigError::Validation(format!(
                            "Bridge '{}' needs a broker_url",
                            config.name
                        ))
                    })?;
                    Arc::new(RedisBroker::open(url)?)
                }
            };
            Ok(Arc::new(PubSubStrategy::new(broker, config.channel.clone())))
        }
    }
}
