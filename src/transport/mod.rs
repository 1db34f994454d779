//! Transport Layer
//!
//! Binds listener endpoints and runs their accept loops.

mod websocket;

pub use websocket::{accept, handle_connection, run_client_session};

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::RelayError;
use crate::relay::{EventSender, ListenerId};

/// Per-endpoint accept settings
#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    pub listener: ListenerId,
    pub bridge_path: String,
    pub outbound_channel_capacity: usize,
}

/// Bind a listener endpoint. Failure is fatal at startup.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, RelayError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| RelayError::Bind { addr, source })
}

/// Configure a TCP stream
pub fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)
}

/// Run the accept loop of one endpoint until aborted
pub fn spawn_acceptor(
    listener: TcpListener,
    config: AcceptorConfig,
    events: EventSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("New TCP connection from {}", addr);
                    if let Err(e) = configure_stream(&stream) {
                        debug!("Failed to configure stream from {}: {}", addr, e);
                    }
                    let events = events.clone();
                    let bridge_path = config.bridge_path.clone();
                    let listener_id = config.listener;
                    let capacity = config.outbound_channel_capacity;
                    tokio::spawn(async move {
                        handle_connection(stream, addr, listener_id, &bridge_path, capacity, events)
                            .await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept TCP connection: {}", e);
                }
            }
        }
    })
}
