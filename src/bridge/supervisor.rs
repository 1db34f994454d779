//! Reconnection Supervisor
//!
//! Owns one [`BridgeLink`] and drives its connect attempts. Whenever the link
//! falls back to `Disconnected` a retry is scheduled: `base_delay` for the
//! first `max_attempts` consecutive failures, then one retry after
//! `escalation × base_delay` with the counter reset. It never gives up.
//!
//! At most one attempt exists at a time: a retry is only scheduled while the
//! link is disconnected, no connect is in flight and no retry is pending.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, HeartbeatConfig};
use crate::envelope::Envelope;
use crate::error::RelayError;
use crate::relay::{EventSender, RelayEvent};
use crate::timer::Timer;

use super::heartbeat::HeartbeatMonitor;
use super::link::{BridgeLink, LinkState};
use super::strategy::{BridgeStrategy, LinkEvents, LinkSink};

/// Retry counter and delay policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectState {
    attempts: u32,
    base_delay: Duration,
    max_attempts: u32,
    escalation: u32,
}

impl ReconnectState {
    pub fn new(base_delay: Duration, max_attempts: u32, escalation: u32) -> Self {
        Self {
            attempts: 0,
            base_delay,
            max_attempts: max_attempts.max(1),
            escalation: escalation.max(1),
        }
    }

    /// Delay before the next attempt, counting this failure
    pub fn next_delay(&mut self) -> Duration {
        if self.attempts < self.max_attempts {
            self.attempts += 1;
            self.base_delay
        } else {
            self.attempts = 0;
            self.base_delay * self.escalation
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Result of applying a connect attempt's outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    Failed,
    /// Result belonged to an older epoch and was discarded
    Stale,
}

pub struct ReconnectSupervisor {
    link: BridgeLink,
    strategy: Arc<dyn BridgeStrategy>,
    reconnect: ReconnectState,
    startup_delay: Duration,
    connect_timeout: Duration,
    heartbeat: Option<HeartbeatConfig>,
    instance_id: String,
    endpoint_name: String,
    events: EventSender,
    retry: Option<Timer>,
    in_flight: Option<JoinHandle<()>>,
    shut_down: bool,
}

impl ReconnectSupervisor {
    pub fn new(
        link: BridgeLink,
        strategy: Arc<dyn BridgeStrategy>,
        config: &BridgeConfig,
        instance_id: impl Into<String>,
        events: EventSender,
    ) -> Self {
        Self {
            link,
            strategy,
            reconnect: ReconnectState::new(
                config.base_delay,
                config.max_attempts,
                config.escalation,
            ),
            startup_delay: config.startup_delay,
            connect_timeout: config.connect_timeout,
            heartbeat: config.uses_heartbeat().then(|| config.heartbeat.clone()),
            instance_id: instance_id.into(),
            endpoint_name: config.endpoint.clone(),
            events,
            retry: None,
            in_flight: None,
            shut_down: false,
        }
    }

    pub fn link(&self) -> &BridgeLink {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut BridgeLink {
        &mut self.link
    }

    pub fn reconnect(&self) -> &ReconnectState {
        &self.reconnect
    }

    pub fn strategy(&self) -> &dyn BridgeStrategy {
        self.strategy.as_ref()
    }

    pub fn has_pending_retry(&self) -> bool {
        self.retry.is_some()
    }

    pub fn is_connecting(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Schedule the first attempt after the startup delay
    pub fn start(&mut self) {
        info!(
            "Bridge '{}': {} via {}, first attempt in {:?}",
            self.link.name(),
            self.strategy.kind(),
            self.strategy.describe(),
            self.startup_delay
        );
        self.retry = Some(Timer::once(
            self.startup_delay,
            self.events.clone(),
            RelayEvent::ReconnectDue {
                link: self.link.id(),
            },
        ));
    }

    /// Retry timer fired: start a connect attempt. Returns whether one was
    /// started.
    pub fn on_retry_due(&mut self) -> bool {
        self.retry = None;
        if self.shut_down || self.in_flight.is_some() {
            return false;
        }
        let Some(epoch) = self.link.begin_connect() else {
            return false;
        };

        debug!(
            "Bridge '{}': connecting to {} (epoch {})",
            self.link.name(),
            self.strategy.describe(),
            epoch
        );

        let link = self.link.id();
        let strategy = self.strategy.clone();
        let events = self.events.clone();
        let connect_timeout = self.connect_timeout;

        self.in_flight = Some(tokio::spawn(async move {
            let link_events = LinkEvents::new(link, epoch, events.clone());
            let result =
                match tokio::time::timeout(connect_timeout, strategy.connect(link_events)).await {
                    Ok(result) => result,
                    Err(_) => Err(RelayError::TransportConnect(format!(
                        "timed out after {:?}",
                        connect_timeout
                    ))),
                };
            let _ = events.send(RelayEvent::ConnectFinished {
                link,
                epoch,
                result,
            });
        }));
        true
    }

    /// Apply the outcome of the attempt started for `epoch`
    pub fn on_connect_finished(
        &mut self,
        epoch: u64,
        result: Result<LinkSink, RelayError>,
    ) -> ConnectOutcome {
        if !self.link.is_current(epoch) || self.link.state() != LinkState::Connecting {
            debug!(
                "Bridge '{}': discarding connect result of epoch {}",
                self.link.name(),
                epoch
            );
            return ConnectOutcome::Stale;
        }
        self.in_flight = None;

        let sink = match result {
            Ok(sink) => sink,
            Err(e) => {
                warn!("Bridge '{}': connect failed: {}", self.link.name(), e);
                self.link.transition(LinkState::Disconnected);
                self.schedule_retry();
                return ConnectOutcome::Failed;
            }
        };

        let heartbeat = self.heartbeat.as_ref().map(|hb| {
            HeartbeatMonitor::start(
                self.link.id(),
                epoch,
                hb.interval,
                hb.timeout,
                self.events.clone(),
            )
        });
        let handshake = Envelope::handshake(&self.instance_id, &self.endpoint_name);

        match self.link.establish(sink, &handshake, heartbeat) {
            Ok(()) => {
                self.reconnect.reset();
                info!(
                    "Bridge '{}': connected to {}",
                    self.link.name(),
                    self.strategy.describe()
                );
                ConnectOutcome::Connected
            }
            Err(e) => {
                warn!("Bridge '{}': handshake failed: {}", self.link.name(), e);
                drop(self.link.disconnect());
                self.schedule_retry();
                ConnectOutcome::Failed
            }
        }
    }

    /// Transport of `epoch` closed. Returns whether the link was connected.
    pub fn on_transport_lost(&mut self, epoch: u64, error: Option<RelayError>) -> bool {
        if !self.link.is_current(epoch) || !self.link.is_connected() {
            return false;
        }
        match error {
            Some(e) => warn!("Bridge '{}': transport lost: {}", self.link.name(), e),
            None => info!("Bridge '{}': closed by peer", self.link.name()),
        }
        drop(self.link.disconnect());
        self.schedule_retry();
        true
    }

    /// Heartbeat period elapsed: send a heartbeat and arm its deadline
    pub fn on_heartbeat_tick(&mut self, epoch: u64) {
        if !self.link.is_current(epoch) || !self.link.is_connected() {
            return;
        }
        let Some(heartbeat) = self.link.heartbeat_mut() else {
            return;
        };
        let seq = heartbeat.on_tick();
        let probe = Envelope::heartbeat(&self.instance_id);
        match self.link.send(&probe) {
            Ok(()) => debug!("Bridge '{}': heartbeat {} sent", self.link.name(), seq),
            Err(e) => debug!("Bridge '{}': heartbeat {} not sent: {}", self.link.name(), seq, e),
        }
    }

    /// Ack deadline elapsed. Returns true if the link was dropped for it.
    pub fn on_heartbeat_expired(&mut self, epoch: u64, seq: u64) -> bool {
        if !self.link.is_current(epoch) || !self.link.is_connected() {
            return false;
        }
        let expired = self
            .link
            .heartbeat_mut()
            .is_some_and(|heartbeat| heartbeat.on_deadline(seq));
        if !expired {
            return false;
        }

        warn!(
            "Bridge '{}': {} (heartbeat {}), terminating transport",
            self.link.name(),
            RelayError::LivenessTimeout,
            seq
        );
        drop(self.link.disconnect());
        self.schedule_retry();
        true
    }

    fn schedule_retry(&mut self) {
        if self.shut_down
            || self.link.state() != LinkState::Disconnected
            || self.in_flight.is_some()
            || self.retry.is_some()
        {
            return;
        }

        let delay = self.reconnect.next_delay();
        info!(
            "Bridge '{}': reconnecting in {:?} (attempt {}/{})",
            self.link.name(),
            delay,
            self.reconnect.attempts(),
            self.reconnect.max_attempts()
        );
        self.retry = Some(Timer::once(
            delay,
            self.events.clone(),
            RelayEvent::ReconnectDue {
                link: self.link.id(),
            },
        ));
    }

    /// Stop for good: timers first, then the transport. Returns whether the
    /// link was connected.
    pub async fn shutdown(&mut self, grace: Duration) -> bool {
        self.shut_down = true;
        self.retry = None;
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }

        let was_connected = self.link.is_connected();
        if self.link.state() != LinkState::Disconnected {
            if let Some(sink) = self.link.disconnect() {
                sink.close(grace).await;
            }
        }
        info!("Bridge '{}': stopped", self.link.name());
        was_connected
    }
}
