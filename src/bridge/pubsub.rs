//! Publish/subscribe bridge strategy
//!
//! Every relay on a pubsub bridge publishes its envelopes to one shared
//! channel and subscribes to the same channel. Each subscriber therefore also
//! receives its own publications; those are dropped by the dispatcher on
//! `sourceId`.
//!
//! Two brokers are provided: [`RedisBroker`] for multi-process deployments
//! and [`MemoryBroker`] for relays sharing one process.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use redis::AsyncCommands;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::{ConfigError, StrategyKind};
use crate::error::RelayError;

use super::strategy::{BridgeStrategy, LinkEvents, LinkFrame, LinkSink};

/// Payloads delivered on a subscribed channel
pub type MessageStream = BoxStream<'static, String>;

/// Publishing half of a broker connection
#[async_trait]
pub trait BrokerPublisher: Send {
    async fn publish(&mut self, channel: &str, payload: String) -> Result<(), RelayError>;
}

/// A publish/subscribe broker
#[async_trait]
pub trait PubSubBroker: Send + Sync {
    fn name(&self) -> String;

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, RelayError>;

    async fn publisher(&self) -> Result<Box<dyn BrokerPublisher>, RelayError>;
}

// ============================================================================
// In-process broker
// ============================================================================

const MEMORY_BROKER_CAPACITY: usize = 1024;

static MEMORY_BROKERS: OnceLock<Mutex<HashMap<String, Arc<MemoryBroker>>>> = OnceLock::new();

/// In-process broker built on a tokio broadcast channel
#[derive(Debug)]
pub struct MemoryBroker {
    name: String,
    tx: Arc<Mutex<broadcast::Sender<(String, String)>>>,
}

impl MemoryBroker {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(MEMORY_BROKER_CAPACITY);
        Self {
            name: name.into(),
            tx: Arc::new(Mutex::new(tx)),
        }
    }

    /// The process-wide broker registered under `name`
    pub fn shared(name: &str) -> Arc<MemoryBroker> {
        let brokers = MEMORY_BROKERS.get_or_init(|| Mutex::new(HashMap::new()));
        brokers
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryBroker::new(name)))
            .clone()
    }

    /// End every current subscription, as if the broker restarted
    pub fn reset(&self) {
        let (tx, _) = broadcast::channel(MEMORY_BROKER_CAPACITY);
        *self.tx.lock() = tx;
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.lock().receiver_count()
    }
}

struct MemoryPublisher {
    tx: Arc<Mutex<broadcast::Sender<(String, String)>>>,
}

#[async_trait]
impl BrokerPublisher for MemoryPublisher {
    async fn publish(&mut self, channel: &str, payload: String) -> Result<(), RelayError> {
        // No subscribers is not an error, same as a PUBLISH reaching nobody
        let _ = self.tx.lock().send((channel.to_string(), payload));
        Ok(())
    }
}

#[async_trait]
impl PubSubBroker for MemoryBroker {
    fn name(&self) -> String {
        format!("memory:{}", self.name)
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, RelayError> {
        let rx = self.tx.lock().subscribe();
        let channel = channel.to_string();
        let stream = futures_util::stream::unfold(rx, move |mut rx| {
            let channel = channel.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((ch, payload)) if ch == channel => return Some((payload, rx)),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Memory broker subscriber lagged, {} messages lost", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn publisher(&self) -> Result<Box<dyn BrokerPublisher>, RelayError> {
        Ok(Box::new(MemoryPublisher {
            tx: self.tx.clone(),
        }))
    }
}

// ============================================================================
// Redis broker
// ============================================================================

/// Redis PUBLISH/SUBSCRIBE broker
#[derive(Debug, Clone)]
pub struct RedisBroker {
    url: String,
    client: redis::Client,
}

impl RedisBroker {
    /// Parse the broker URL. A malformed URL is a configuration error; an
    /// unreachable server is only detected on connect.
    pub fn open(url: &str) -> Result<Self, RelayError> {
        let client = redis::Client::open(url).map_err(|e| {
            ConfigError::Validation(format!("invalid broker_url '{}': {}", url, e))
        })?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

struct RedisPublisher {
    conn: redis::aio::MultiplexedConnection,
}

#[async_trait]
impl BrokerPublisher for RedisPublisher {
    async fn publish(&mut self, channel: &str, payload: String) -> Result<(), RelayError> {
        let _receivers: i64 = self
            .conn
            .publish(channel, payload)
            .await
            .map_err(|e| RelayError::TransportIo(format!("redis publish: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl PubSubBroker for RedisBroker {
    fn name(&self) -> String {
        self.url.clone()
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, RelayError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| RelayError::TransportConnect(format!("{}: {}", self.url, e)))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| RelayError::TransportConnect(format!("{}: {}", self.url, e)))?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        warn!("Dropping undecodable redis payload: {}", e);
                        None
                    }
                }
            });
        Ok(stream.boxed())
    }

    async fn publisher(&self) -> Result<Box<dyn BrokerPublisher>, RelayError> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RelayError::TransportConnect(format!("{}: {}", self.url, e)))?;
        Ok(Box::new(RedisPublisher { conn }))
    }
}

// ============================================================================
// Strategy
// ============================================================================

/// Bridges through a shared broker channel
pub struct PubSubStrategy {
    broker: Arc<dyn PubSubBroker>,
    channel: String,
}

impl PubSubStrategy {
    pub fn new(broker: Arc<dyn PubSubBroker>, channel: impl Into<String>) -> Self {
        Self {
            broker,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl BridgeStrategy for PubSubStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Pubsub
    }

    fn describe(&self) -> String {
        format!("{} channel '{}'", self.broker.name(), self.channel)
    }

    /// Connected means both the subscription and the publisher are up
    async fn connect(&self, events: LinkEvents) -> Result<LinkSink, RelayError> {
        let mut subscription = self.broker.subscribe(&self.channel).await?;
        let mut publisher = self.broker.publisher().await?;
        debug!("{}: subscribed to {}", events.link(), self.describe());

        let (tx, mut rx) = mpsc::unbounded_channel::<LinkFrame>();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        let channel = self.channel.clone();
        let writer_events = events.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    LinkFrame::Text(payload) => {
                        if let Err(e) = publisher.publish(&channel, payload).await {
                            writer_events.closed(Some(e));
                            return;
                        }
                    }
                    LinkFrame::Close => return,
                }
            }
        });

        let reader = tokio::spawn(async move {
            if gate_rx.await.is_err() {
                return;
            }
            while let Some(payload) = subscription.next().await {
                if !events.frame(payload) {
                    return;
                }
            }
            events.closed(Some(RelayError::TransportIo(
                "broker subscription closed".to_string(),
            )));
        });

        Ok(LinkSink::new(tx, gate_tx, writer, reader))
    }
}
