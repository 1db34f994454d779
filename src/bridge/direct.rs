//! Direct WebSocket bridge strategy
//!
//! One persistent WebSocket to a peer relay's bridge path. Every envelope is
//! one text frame.

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, trace, warn};

use crate::config::StrategyKind;
use crate::error::RelayError;

use super::strategy::{BridgeStrategy, LinkEvents, LinkFrame, LinkSink};

/// Opens a WebSocket to `url`
#[derive(Debug, Clone)]
pub struct DirectStrategy {
    url: String,
}

impl DirectStrategy {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BridgeStrategy for DirectStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Direct
    }

    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn connect(&self, events: LinkEvents) -> Result<LinkSink, RelayError> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| RelayError::TransportConnect(format!("{}: {}", self.url, e)))?;
        debug!("{}: WebSocket open to {}", events.link(), self.url);
        Ok(spawn_ws_link(ws, events))
    }
}

/// Drive an open WebSocket as a bridge transport.
///
/// Used for both initiated and accepted direct links. The writer drains the
/// sink's queue into text frames; the reader waits for the sink to be opened
/// and then posts every text frame to the reactor.
pub fn spawn_ws_link<S>(ws: S, events: LinkEvents) -> LinkSink
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Send
        + Unpin
        + 'static,
{
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<LinkFrame>();
    let (gate_tx, gate_rx) = oneshot::channel::<()>();

    let writer_events = events.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                LinkFrame::Text(text) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        writer_events.closed(Some(RelayError::TransportIo(e.to_string())));
                        return;
                    }
                }
                LinkFrame::Close => {
                    let _ = write.send(Message::Close(None)).await;
                    let _ = write.close().await;
                    return;
                }
            }
        }
    });

    let reader = tokio::spawn(async move {
        if gate_rx.await.is_err() {
            return;
        }

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    trace!("{}: frame {} bytes", events.link(), text.len());
                    if !events.frame(text) {
                        return;
                    }
                }
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => {
                        if !events.frame(text) {
                            return;
                        }
                    }
                    Err(_) => warn!("{}: dropping non-UTF-8 binary frame", events.link()),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    events.closed(Some(RelayError::TransportIo(e.to_string())));
                    return;
                }
            }
        }

        events.closed(None);
    });

    LinkSink::new(tx, gate_tx, writer, reader)
}
