use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use mobile_proxy_core::{ReplyPayload, RequestEnvelope, TunnelMessage};

use crate::correlation::{CorrelationTable, MessageId};
use crate::error::RelayError;
use crate::tunnel::{self, ClientRegistry, FrameSink, TunnelConnection};

/// Limits of the relay engine.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub max_clients: usize,
    pub pool_size: usize,
    pub reply_timeout: Duration,
    /// `None` waits for a free correlation slot indefinitely.
    pub allocation_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_clients: 200,
            pool_size: 20,
            reply_timeout: Duration::from_secs(10),
            allocation_timeout: None,
        }
    }
}

/// The relay engine: connected devices plus the requests waiting on them.
/// Built once at startup and shared by the HTTP and tunnel handlers.
pub struct Relay {
    pub registry: ClientRegistry,
    pub correlation: CorrelationTable,
}

impl Relay {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            registry: ClientRegistry::new(config.max_clients),
            correlation: CorrelationTable::new(
                config.pool_size,
                config.reply_timeout,
                config.allocation_timeout,
            ),
        }
    }

    /// Send `envelope` to `client_id` and wait for its reply. One attempt, no retries.
    ///
    /// The exchange runs on its own task, so dropping the returned future (the HTTP
    /// caller hung up) still ends in a reply or a timeout, and the slot is released.
    pub async fn forward(
        self: &Arc<Self>,
        client_id: &str,
        envelope: &RequestEnvelope,
    ) -> Result<ReplyPayload, RelayError> {
        let data = serde_json::to_string(envelope)?;

        let connection = self
            .registry
            .lookup(client_id)
            .await
            .ok_or_else(|| RelayError::ClientNotFound(client_id.to_string()))?;

        let relay = self.clone();
        let reply = tokio::spawn(async move { relay.relay_once(&connection, data).await }).await??;

        Ok(ReplyPayload::decode(&reply)?)
    }

    async fn relay_once(
        &self,
        connection: &TunnelConnection,
        data: String,
    ) -> Result<String, RelayError> {
        let message_id = self.correlation.allocate().await?;
        let in_flight = self.correlation.active_count().await;
        debug!(
            client_id = %connection.client_id,
            message_id = %message_id,
            in_flight,
            "relaying request"
        );

        let reply = self.exchange(connection, &message_id, data).await;
        self.correlation.release(&message_id).await;
        reply
    }

    async fn exchange(
        &self,
        connection: &TunnelConnection,
        message_id: &MessageId,
        data: String,
    ) -> Result<String, RelayError> {
        let frame = serde_json::to_string(&TunnelMessage {
            message_id: message_id.to_string(),
            data,
        })?;
        connection.send_text(frame).await?;
        self.correlation.await_reply(message_id).await
    }

    /// Admit a device whose client id has been read, then serve its tunnel until it ends.
    pub async fn attach<S>(&self, client_id: String, ws_tx: FrameSink, ws_rx: S)
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let connection = Arc::new(TunnelConnection::new(client_id.clone(), ws_tx));
        if self.registry.register(connection.clone()).await.is_err() {
            connection.reject().await;
            return;
        }

        tunnel::handle_client_messages(&client_id, ws_rx, &self.registry, &self.correlation)
            .await;
        let live = self.registry.live_count().await;
        info!(client_id = %client_id, live, "tunnel session ended");
    }
}
