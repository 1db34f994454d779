//! Heartbeat Monitor
//!
//! Probes a connected direct link. Every `interval` the reactor is told to
//! send a heartbeat; sending arms an ack deadline of `timeout`. An ack before
//! the deadline disarms it. A deadline that fires for the outstanding
//! heartbeat means the peer is gone.
//!
//! The monitor owns its two timers, so stopping or dropping it cancels both.

use std::time::Duration;

use tokio::time::Instant;

use crate::relay::{EventSender, LinkId, RelayEvent};
use crate::timer::Timer;

pub struct HeartbeatMonitor {
    link: LinkId,
    epoch: u64,
    timeout: Duration,
    events: EventSender,
    ticker: Option<Timer>,
    deadline: Option<Timer>,
    pending: Option<u64>,
    next_seq: u64,
    last_sent: Option<Instant>,
    last_ack: Option<Instant>,
}

impl HeartbeatMonitor {
    /// Start probing `link` for the connection `epoch`
    pub fn start(
        link: LinkId,
        epoch: u64,
        interval: Duration,
        timeout: Duration,
        events: EventSender,
    ) -> Self {
        let ticker = Timer::every(interval, events.clone(), move || RelayEvent::HeartbeatTick {
            link,
            epoch,
        });
        Self {
            link,
            epoch,
            timeout,
            events,
            ticker: Some(ticker),
            deadline: None,
            pending: None,
            next_seq: 1,
            last_sent: None,
            last_ack: None,
        }
    }

    /// A heartbeat is being sent: arm the ack deadline and return its sequence
    pub fn on_tick(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending = Some(seq);
        self.last_sent = Some(Instant::now());
        self.deadline = Some(Timer::once(
            self.timeout,
            self.events.clone(),
            RelayEvent::HeartbeatExpired {
                link: self.link,
                epoch: self.epoch,
                seq,
            },
        ));
        seq
    }

    /// Ack received. Returns whether a heartbeat was outstanding.
    pub fn on_ack(&mut self) -> bool {
        self.last_ack = Some(Instant::now());
        self.deadline = None;
        self.pending.take().is_some()
    }

    /// Deadline fired for `seq`. Returns true if that heartbeat is still
    /// unacknowledged, i.e. the link must be dropped.
    pub fn on_deadline(&mut self, seq: u64) -> bool {
        if self.pending == Some(seq) {
            self.pending = None;
            self.deadline = None;
            true
        } else {
            false
        }
    }

    /// Cancel both timers
    pub fn stop(&mut self) {
        self.ticker = None;
        self.deadline = None;
        self.pending = None;
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    pub fn is_awaiting_ack(&self) -> bool {
        self.pending.is_some()
    }

    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }
}
