//! Device-side tunnel client for the mobile proxy.
//!
//! Holds one WebSocket to the server, announces a client id, and answers every
//! relayed HTTP request by forwarding it to a local HTTP service.
//!
//! # Example
//!
//! ```no_run
//! use mobile_proxy_client::TunnelClient;
//! use std::net::SocketAddr;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let local_addr: SocketAddr = "127.0.0.1:8000".parse()?;
//!
//! let handle = TunnelClient::new("ws://proxy.example.com:3000", "abc123", local_addr)
//!     .connect()
//!     .await?;
//!
//! println!("Reachable at /mobile/{}/", handle.client_id());
//! tokio::signal::ctrl_c().await?;
//! handle.close().await;
//! # Ok(())
//! # }
//! ```

pub use mobile_proxy_core;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::CONTENT_TYPE;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use mobile_proxy_core::{ReplyPayload, RequestEnvelope, TUNNEL_WS_PATH, TunnelMessage};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// A handle to a running tunnel. Dropping it leaves the tunnel running in the background.
pub struct TunnelHandle {
    client_id: String,
    task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl TunnelHandle {
    /// The id under which the server routes `/mobile/{client_id}/...` to this device.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Whether the tunnel loop has exited, e.g. because the server closed it.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the tunnel and wait for the loop to exit.
    pub async fn close(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

/// Builder for configuring and connecting a tunnel client.
pub struct TunnelClient {
    server_url: String,
    client_id: String,
    local_addr: SocketAddr,
}

impl TunnelClient {
    pub fn new(
        server_url: impl Into<String>,
        client_id: impl Into<String>,
        local_addr: SocketAddr,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            client_id: client_id.into(),
            local_addr,
        }
    }

    /// Connect to the server, announce the client id and start answering requests.
    ///
    /// The connection is attempted once; when it drops the handle's loop ends.
    pub async fn connect(self) -> Result<TunnelHandle> {
        let ws_url = format!(
            "{}/{}",
            self.server_url.trim_end_matches('/'),
            TUNNEL_WS_PATH.trim_start_matches('/')
        );

        info!(url = %ws_url, client_id = %self.client_id, "connecting to tunnel server");

        let (mut ws, _response) = connect_async(&ws_url)
            .await
            .context("failed to connect to tunnel server")?;

        ws.send(Message::Text(self.client_id.clone().into()))
            .await
            .context("failed to send client id")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let local_addr = self.local_addr;

        let task = tokio::spawn(async move {
            if let Err(e) = tunnel_loop(ws, local_addr, shutdown_rx).await {
                error!(error = %e, "tunnel loop exited with error");
            }
        });

        Ok(TunnelHandle {
            client_id: self.client_id,
            task,
            shutdown_tx,
        })
    }
}

/// Main loop: answer each request frame concurrently, so replies may go out of order.
async fn tunnel_loop(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    local_addr: SocketAddr,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let (ws_tx, mut ws_rx) = ws.split();
    let ws_tx = Arc::new(Mutex::new(ws_tx));

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("tunnel shutting down");
                let mut tx = ws_tx.lock().await;
                let _ = tx.close().await;
                return Ok(());
            }
            frame = ws_rx.next() => {
                let Some(frame) = frame else {
                    warn!("tunnel WebSocket closed by server");
                    return Ok(());
                };
                match frame? {
                    Message::Text(text) => {
                        let Ok(msg) = serde_json::from_str::<TunnelMessage>(text.as_str()) else {
                            // Anything that is not an envelope is a notice, e.g. "server full".
                            warn!(notice = %text.as_str(), "server notice");
                            continue;
                        };
                        let ws_tx = ws_tx.clone();
                        tokio::spawn(async move {
                            handle_request_message(msg, local_addr, ws_tx).await;
                        });
                    }
                    Message::Ping(data) => {
                        let mut tx = ws_tx.lock().await;
                        let _ = tx.send(Message::Pong(data)).await;
                    }
                    Message::Close(frame) => {
                        info!(?frame, "server closed tunnel");
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Decode a request envelope, proxy to local, and send back the reply under the same id.
async fn handle_request_message(
    msg: TunnelMessage,
    local_addr: SocketAddr,
    ws_tx: Arc<Mutex<WsSink>>,
) {
    let message_id = msg.message_id;
    let reply = match serde_json::from_str::<RequestEnvelope>(&msg.data) {
        Ok(envelope) => {
            debug!(%message_id, method = %envelope.method, path = %envelope.path, "relayed request");
            match proxy_to_local(local_addr, &envelope).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(%message_id, error = %e, "local proxy failed");
                    ReplyPayload::new(502, format!("{e:#}"))
                }
            }
        }
        Err(e) => {
            warn!(%message_id, error = %e, "failed to decode request envelope");
            ReplyPayload::new(400, "invalid request envelope")
        }
    };

    let data = match reply.encode() {
        Ok(data) => data,
        Err(e) => {
            warn!(%message_id, error = %e, "failed to encode reply");
            return;
        }
    };
    let frame = match serde_json::to_string(&TunnelMessage {
        message_id: message_id.clone(),
        data,
    }) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(%message_id, error = %e, "failed to encode reply frame");
            return;
        }
    };

    let mut tx = ws_tx.lock().await;
    if let Err(e) = tx.send(Message::Text(frame.into())).await {
        warn!(%message_id, error = %e, "failed to send reply frame");
    }
}

/// Forward a relayed request to the local service and collect its response.
async fn proxy_to_local(local_addr: SocketAddr, envelope: &RequestEnvelope) -> Result<ReplyPayload> {
    let stream = TcpStream::connect(local_addr)
        .await
        .context("failed to connect to local service")?;

    let io = TokioIo::new(stream);

    let (mut sender, conn) = http1::Builder::new()
        .handshake::<_, Full<Bytes>>(io)
        .await
        .context("HTTP handshake with local service failed")?;

    // Drive the connection in the background
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!(error = %e, "local HTTP connection error");
        }
    });

    let method: hyper::Method = envelope.method.parse().context("invalid HTTP method")?;

    let mut builder = Request::builder().method(method).uri(&envelope.path);

    for (name, value) in &envelope.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let hyper_req = builder
        .body(Full::new(Bytes::from(envelope.body.clone())))
        .context("failed to build request")?;

    let resp: Response<Incoming> = sender
        .send_request(hyper_req)
        .await
        .context("local service request failed")?;

    let http_code = resp.status().as_u16();
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let body = resp
        .into_body()
        .collect()
        .await
        .context("failed to read local response body")?
        .to_bytes();

    let mut reply = ReplyPayload::new(http_code, String::from_utf8_lossy(&body));
    reply.content_type = content_type;
    Ok(reply)
}
