use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use mobile_proxy_core::{SERVER_FULL_NOTICE, TunnelMessage};

use crate::correlation::CorrelationTable;
use crate::error::RelayError;

/// Write half of a device's WebSocket.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;

/// A device's live tunnel: the write half of its WebSocket plus a liveness flag.
pub struct TunnelConnection {
    pub client_id: String,
    ws_tx: Mutex<FrameSink>,
    live: AtomicBool,
}

impl TunnelConnection {
    pub fn new(client_id: String, ws_tx: FrameSink) -> Self {
        Self {
            client_id,
            ws_tx: Mutex::new(ws_tx),
            live: AtomicBool::new(true),
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Send one text frame to the device.
    pub async fn send_text(&self, text: String) -> Result<(), RelayError> {
        if !self.is_live() {
            return Err(RelayError::TransportWrite(
                tungstenite::Error::AlreadyClosed,
            ));
        }
        self.ws_tx
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(RelayError::TransportWrite)
    }

    /// Close the tunnel. Later calls do nothing.
    pub async fn close(&self) {
        if self.live.swap(false, Ordering::AcqRel) {
            let _ = self.ws_tx.lock().await.close().await;
        }
    }

    /// Tell the device the server is full, then close with "try again later".
    pub async fn reject(&self) {
        if !self.live.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut ws_tx = self.ws_tx.lock().await;
        let _ = ws_tx
            .send(Message::Text(SERVER_FULL_NOTICE.to_string().into()))
            .await;
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Again,
                reason: String::from("server full").into(),
            })))
            .await;
        let _ = ws_tx.close().await;
    }
}

struct Clients {
    connections: HashMap<String, Arc<TunnelConnection>>,
    live: usize,
}

/// Live tunnels keyed by client id, with a ceiling on how many may be connected.
pub struct ClientRegistry {
    clients: RwLock<Clients>,
    max_clients: usize,
}

impl ClientRegistry {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: RwLock::new(Clients {
                connections: HashMap::new(),
                live: 0,
            }),
            max_clients,
        }
    }

    /// Admit a connection. A second registration under the same client id
    /// replaces the mapping but leaves the earlier connection open.
    pub async fn register(&self, connection: Arc<TunnelConnection>) -> Result<(), RelayError> {
        let mut clients = self.clients.write().await;
        if clients.live >= self.max_clients {
            warn!(
                client_id = %connection.client_id,
                max_clients = self.max_clients,
                "client limit reached, connection refused"
            );
            return Err(RelayError::AdmissionRejected);
        }

        let client_id = connection.client_id.clone();
        if clients.connections.insert(client_id.clone(), connection).is_some() {
            warn!(client_id = %client_id, "client id registered twice, previous tunnel left open");
        }
        clients.live += 1;

        info!(client_id = %client_id, live = clients.live, "client registered");
        Ok(())
    }

    pub async fn lookup(&self, client_id: &str) -> Option<Arc<TunnelConnection>> {
        self.clients.read().await.connections.get(client_id).cloned()
    }

    /// Remove and close a client's tunnel. Unknown ids are ignored.
    pub async fn unregister(&self, client_id: &str) {
        let removed = {
            let mut clients = self.clients.write().await;
            let removed = clients.connections.remove(client_id);
            if removed.is_some() {
                clients.live = clients.live.saturating_sub(1);
            }
            removed
        };

        match removed {
            Some(connection) => {
                connection.close().await;
                info!(client_id = %client_id, "client unregistered");
            }
            None => debug!(client_id = %client_id, "client already unregistered"),
        }
    }

    pub async fn is_full(&self) -> bool {
        self.clients.read().await.live >= self.max_clients
    }

    pub async fn live_count(&self) -> usize {
        self.clients.read().await.live
    }
}

/// Read a device's frames until the tunnel fails or closes, routing replies
/// into the correlation table. The client is unregistered on the way out.
pub async fn handle_client_messages<S>(
    client_id: &str,
    mut ws_rx: S,
    registry: &ClientRegistry,
    correlation: &CorrelationTable,
) where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "WebSocket read error");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                debug!(client_id = %client_id, len = text.len(), "reply frame received");
                let reply = match serde_json::from_str::<TunnelMessage>(text.as_str()) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(client_id = %client_id, error = %e, "failed to parse client message");
                        continue;
                    }
                };
                if let Err(e) = correlation.deliver(&reply.message_id, reply.data).await {
                    warn!(
                        client_id = %client_id,
                        message_id = %reply.message_id,
                        error = %e,
                        "reply dropped"
                    );
                }
            }
            Message::Close(frame) => {
                info!(client_id = %client_id, ?frame, "client closed the tunnel");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {
                warn!(client_id = %client_id, "client sent an unsupported frame type");
            }
        }
    }

    registry.unregister(client_id).await;
}
