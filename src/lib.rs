//! wsrelay - WebSocket message relay with bridged listener pools
//!
//! Clients connect to named WebSocket listeners. A message sent on one
//! listener is echoed to its sender, broadcast to the listener's other
//! clients and carried over bridge links to peer relays, which apply it to
//! their own listeners. Bridges run either directly over a WebSocket or
//! through a shared publish/subscribe channel.

pub mod bridge;
pub mod config;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod timer;
pub mod transport;

pub use bridge::{BridgeConfig, BridgeLink, LinkState, StrategyKind};
pub use config::Config;
pub use envelope::{Envelope, EnvelopeType};
pub use error::RelayError;
pub use metrics::{Metrics, MetricsServer};
pub use registry::ListenerRegistry;
pub use relay::{Relay, RelayHandle, RelaySnapshot};
