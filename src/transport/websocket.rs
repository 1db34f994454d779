//! WebSocket Transport
//!
//! Accepts WebSocket connections on a listener endpoint and routes them by
//! request path: the bridge path yields a peer relay's direct bridge link,
//! any other path a client session.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

use crate::registry::{ClientConnection, ClientFrame};
use crate::relay::{EventSender, ListenerId, RelayEvent};

/// Complete the WebSocket handshake and return the stream with the request
/// path it was opened on
pub async fn accept(
    stream: TcpStream,
) -> Result<(WebSocketStream<TcpStream>, String), tokio_tungstenite::tungstenite::Error> {
    let mut path = String::new();
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, response: Response| {
        path = req.uri().path().to_string();
        Ok(response)
    })
    .await?;
    Ok((ws, path))
}

/// Route one accepted TCP connection
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    listener: ListenerId,
    bridge_path: &str,
    capacity: usize,
    events: EventSender,
) {
    let (ws, path) = match accept(stream).await {
        Ok(accepted) => accepted,
        Err(e) => {
            debug!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    if path == bridge_path {
        debug!("Bridge connection from {} on {}", addr, path);
        let _ = events.send(RelayEvent::BridgeAccepted { listener, addr, ws });
    } else {
        debug!("WebSocket handshake complete for {}", addr);
        run_client_session(ws, addr, listener, capacity, events).await;
    }
}

/// Pump one client's socket until either side closes.
///
/// Inbound text is posted to the reactor; outbound frames come from the
/// queue owned by the client's registry entry. The session ends when the
/// socket closes or when the registry drops the connection.
pub async fn run_client_session(
    ws: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    listener: ListenerId,
    capacity: usize,
    events: EventSender,
) {
    let (tx, mut rx) = mpsc::channel(capacity);
    let conn = ClientConnection::new(addr, tx);
    let client = conn.id();

    if events
        .send(RelayEvent::ClientConnected { listener, conn })
        .is_err()
    {
        return;
    }

    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(ClientFrame::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        debug!("Write to client {} failed: {}", client, e);
                        break;
                    }
                }
                Some(ClientFrame::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    trace!("Client {} sent {} bytes", client, text.len());
                    if events
                        .send(RelayEvent::ClientMessage { listener, client, text })
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    // Binary frames carrying UTF-8 are relayed as text
                    if let Ok(text) = String::from_utf8(data) {
                        if events
                            .send(RelayEvent::ClientMessage { listener, client, text })
                            .is_err()
                        {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Client {} read error: {}", client, e);
                    break;
                }
            },
        }
    }

    let _ = events.send(RelayEvent::ClientClosed { listener, client });
    debug!("Client {} ({}) disconnected", client, addr);
}
