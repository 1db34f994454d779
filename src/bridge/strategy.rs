//! Bridge strategy contract
//!
//! A strategy knows how to open one bridge transport. An open transport is
//! represented by a [`LinkSink`] for outbound frames and a [`LinkEvents`]
//! handle through which its reader posts inbound frames and closure to the
//! reactor.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::StrategyKind;
use crate::error::RelayError;
use crate::relay::{EventSender, LinkId, RelayEvent};

/// Outbound frame for a transport writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFrame {
    Text(String),
    Close,
}

/// Outbound half of an open bridge transport.
///
/// The transport's reader is held back until [`LinkSink::open`] so that no
/// inbound frame reaches the reactor before the link is marked connected.
/// Dropping the sink aborts both transport tasks.
#[derive(Debug)]
pub struct LinkSink {
    tx: mpsc::UnboundedSender<LinkFrame>,
    gate: Option<oneshot::Sender<()>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl LinkSink {
    pub fn new(
        tx: mpsc::UnboundedSender<LinkFrame>,
        gate: oneshot::Sender<()>,
        writer: JoinHandle<()>,
        reader: JoinHandle<()>,
    ) -> Self {
        Self {
            tx,
            gate: Some(gate),
            writer: Some(writer),
            reader: Some(reader),
        }
    }

    /// Release the reader
    pub fn open(&mut self) {
        if let Some(gate) = self.gate.take() {
            let _ = gate.send(());
        }
    }

    /// Queue a text frame for the writer
    pub fn send_text(&self, text: String) -> Result<(), RelayError> {
        self.tx
            .send(LinkFrame::Text(text))
            .map_err(|_| RelayError::TransportIo("transport writer stopped".to_string()))
    }

    /// Close gracefully: flush queued frames and a close frame, waiting at
    /// most `grace` for the writer before aborting.
    pub async fn close(mut self, grace: Duration) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        let _ = self.tx.send(LinkFrame::Close);
        if let Some(writer) = self.writer.take() {
            let abort = writer.abort_handle();
            if tokio::time::timeout(grace, writer).await.is_err() {
                abort.abort();
            }
        }
    }
}

impl Drop for LinkSink {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Handle through which a transport reports to the reactor
#[derive(Clone)]
pub struct LinkEvents {
    link: LinkId,
    epoch: u64,
    tx: EventSender,
}

impl LinkEvents {
    pub fn new(link: LinkId, epoch: u64, tx: EventSender) -> Self {
        Self { link, epoch, tx }
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    /// Post an inbound frame. Returns false once the reactor is gone.
    pub fn frame(&self, text: String) -> bool {
        self.tx
            .send(RelayEvent::LinkFrame {
                link: self.link,
                epoch: self.epoch,
                text,
            })
            .is_ok()
    }

    /// Report that the transport closed
    pub fn closed(&self, error: Option<RelayError>) {
        let _ = self.tx.send(RelayEvent::LinkClosed {
            link: self.link,
            epoch: self.epoch,
            error,
        });
    }
}

/// A way of opening bridge transports
#[async_trait]
pub trait BridgeStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Human-readable target, for logs
    fn describe(&self) -> String;

    /// Open a transport. Inbound traffic is reported through `events` once
    /// the returned sink is opened.
    async fn connect(&self, events: LinkEvents) -> Result<LinkSink, RelayError>;
}
