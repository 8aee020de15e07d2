use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use mobile_proxy_core::{PROXY_PATH_PREFIX, ReplyPayload, RequestEnvelope, TUNNEL_WS_PATH};

use crate::error::RelayError;
use crate::relay::{Relay, RelayConfig};
use crate::tunnel::{FrameSink, TunnelConnection};

pub struct ServerConfig {
    pub listen: String,
    pub relay: RelayConfig,
}

pub async fn run(config: ServerConfig) -> Result<()> {
    let addr: SocketAddr = config.listen.parse().context("invalid listen address")?;
    let relay = Arc::new(Relay::new(&config.relay));

    let listener = TcpListener::bind(addr).await?;
    info!(
        addr = %addr,
        max_clients = config.relay.max_clients,
        pool_size = relay.correlation.capacity(),
        "mobile proxy listening"
    );

    serve(listener, relay).await
}

/// Accept HTTP connections on `listener` until it fails.
pub async fn serve(listener: TcpListener, relay: Arc<Relay>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let relay = relay.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);

            let service = service_fn(move |req: Request<Incoming>| {
                let relay = relay.clone();
                async move { handle_request(req, relay, peer).await }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                if !e.is_incomplete_message() {
                    error!(peer = %peer, error = %e, "connection error");
                }
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    relay: Arc<Relay>,
    peer: SocketAddr,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_owned();

    if path == TUNNEL_WS_PATH && is_websocket_upgrade(&req) {
        info!(peer = %peer, "tunnel client connecting");
        return handle_tunnel_upgrade(req, relay).await;
    }

    if path == "/" && req.method() == Method::GET {
        return Ok(response(StatusCode::OK, "Hello, World!"));
    }

    let Some((client_id, rest)) = split_proxy_path(&path) else {
        return Ok(response(StatusCode::NOT_FOUND, "Not Found"));
    };
    let client_id = client_id.to_owned();
    let rest = rest.to_owned();
    info!(client_id = %client_id, method = %req.method(), "received request for client");

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(client_id = %client_id, error = %e, "failed to read request body");
            return Ok(response(StatusCode::BAD_REQUEST, "bad request"));
        }
    };

    let envelope = build_envelope(
        &parts.method,
        &parts.headers,
        &rest,
        parts.uri.query(),
        &body,
    );

    match relay.forward(&client_id, &envelope).await {
        Ok(reply) => Ok(reply_to_response(reply)),
        Err(e) => {
            warn!(client_id = %client_id, error = %e, "request relay failed");
            Ok(error_response(&e))
        }
    }
}

/// Split `/mobile/{client_id}/{rest...}` into the client id and the remaining path.
fn split_proxy_path(path: &str) -> Option<(&str, &str)> {
    let remainder = path.strip_prefix(PROXY_PATH_PREFIX)?.strip_prefix('/')?;
    let (client_id, rest) = remainder.split_once('/').unwrap_or((remainder, ""));
    if client_id.is_empty() {
        return None;
    }
    Some((client_id, rest))
}

/// Describe an inbound HTTP request the way the device expects it.
fn build_envelope(
    method: &Method,
    headers: &HeaderMap,
    rest: &str,
    query: Option<&str>,
    body: &[u8],
) -> RequestEnvelope {
    let mut path = format!("/{}", rest.trim_start_matches('/'));
    if let Some(query) = query {
        path.push('?');
        path.push_str(query);
    }

    let mut forwarded: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        if name.as_str() == ":path" {
            continue;
        }
        let value = String::from_utf8_lossy(value.as_bytes());
        forwarded
            .entry(name.as_str().to_owned())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }

    RequestEnvelope {
        path,
        headers: forwarded,
        body: String::from_utf8_lossy(body).into_owned(),
        method: method.to_string(),
    }
}

/// Turn a device reply into the response for the original caller.
fn reply_to_response(reply: ReplyPayload) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(reply.http_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    if let Some(content_type) = &reply.content_type {
        builder = builder.header(CONTENT_TYPE, content_type.as_str());
    }

    builder
        .body(Full::new(Bytes::from(reply.body)))
        .unwrap_or_else(|e| {
            warn!(error = %e, "device reply could not be turned into a response");
            response(StatusCode::INTERNAL_SERVER_ERROR, "invalid response from client")
        })
}

fn error_response(e: &RelayError) -> Response<Full<Bytes>> {
    response(e.status(), e.public_message())
}

/// Handle a WebSocket upgrade request from a device.
async fn handle_tunnel_upgrade(
    req: Request<Incoming>,
    relay: Arc<Relay>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let (response, fut) = match hyper_tungstenite_upgrade(req) {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "WebSocket upgrade failed");
            return Ok(self::response(
                StatusCode::BAD_REQUEST,
                "WebSocket upgrade failed",
            ));
        }
    };

    tokio::spawn(async move {
        match fut.await {
            Ok(ws) => handle_tunnel_client(ws, relay).await,
            Err(e) => error!(error = %e, "WebSocket upgrade future failed"),
        }
    });

    Ok(response)
}

/// Read the client id handshake, then hand the tunnel to the relay.
async fn handle_tunnel_client(
    ws: WebSocketStream<TokioIo<hyper::upgrade::Upgraded>>,
    relay: Arc<Relay>,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let ws_tx: FrameSink = Box::pin(ws_tx);

    if relay.registry.is_full().await {
        warn!("client limit reached, refusing tunnel before handshake");
        TunnelConnection::new(String::new(), ws_tx).reject().await;
        return;
    }

    let client_id = loop {
        let Some(msg) = ws_rx.next().await else {
            warn!("client disconnected before sending its id");
            return;
        };
        match msg {
            Ok(Message::Text(text)) => break text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(id) => break id,
                Err(e) => {
                    warn!(error = %e, "client id is not valid UTF-8");
                    return;
                }
            },
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(other) => {
                debug!(frame = ?other, "tunnel closed during handshake");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to read client id");
                return;
            }
        }
    };

    if client_id.is_empty() {
        warn!("client sent an empty id");
        return;
    }

    info!(client_id = %client_id, "new tunnel connection");
    relay.attach(client_id, ws_tx, ws_rx).await;
}

/// Perform a manual hyper WebSocket upgrade using tungstenite.
#[allow(clippy::type_complexity)]
fn hyper_tungstenite_upgrade(
    req: Request<Incoming>,
) -> Result<(
    Response<Full<Bytes>>,
    impl std::future::Future<Output = Result<WebSocketStream<TokioIo<hyper::upgrade::Upgraded>>>>,
)> {
    use hyper::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
    use tungstenite::handshake::derive_accept_key;

    let key = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .ok_or_else(|| anyhow::anyhow!("missing Sec-WebSocket-Key header"))?
        .to_str()?
        .to_string();

    let accept_key = derive_accept_key(key.as_bytes());

    let response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header(SEC_WEBSOCKET_ACCEPT, accept_key)
        .body(Full::new(Bytes::new()))?;

    let upgrade_fut = async move {
        let upgraded = hyper::upgrade::on(req).await?;
        let ws = WebSocketStream::from_raw_socket(
            TokioIo::new(upgraded),
            tungstenite::protocol::Role::Server,
            None,
        )
        .await;
        Ok(ws)
    };

    Ok((response, upgrade_fut))
}

fn is_websocket_upgrade<T>(req: &Request<T>) -> bool {
    req.headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("text/plain"));
    response
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::SinkExt;
    use hyper::header::HeaderValue;
    use mobile_proxy_core::{SERVER_FULL_NOTICE, TunnelMessage};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio_tungstenite::{MaybeTlsStream, connect_async};

    use super::*;

    type DeviceSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    #[test]
    fn test_split_proxy_path() {
        assert_eq!(split_proxy_path("/mobile/abc123/foo"), Some(("abc123", "foo")));
        assert_eq!(
            split_proxy_path("/mobile/abc123/foo/bar"),
            Some(("abc123", "foo/bar"))
        );
        assert_eq!(split_proxy_path("/mobile/abc123/"), Some(("abc123", "")));
        assert_eq!(split_proxy_path("/mobile/abc123"), Some(("abc123", "")));
        assert_eq!(split_proxy_path("/mobile/"), None);
        assert_eq!(split_proxy_path("/mobile"), None);
        assert_eq!(split_proxy_path("/mobileabc/foo"), None);
        assert_eq!(split_proxy_path("/other/abc/foo"), None);
    }

    #[test]
    fn test_build_envelope() {
        let mut headers = HeaderMap::new();
        headers.insert("x-token", HeaderValue::from_static("secret"));
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("*/*"));

        let envelope = build_envelope(&Method::POST, &headers, "foo/bar", None, b"payload");
        assert_eq!(envelope.path, "/foo/bar");
        assert_eq!(envelope.method, "POST");
        assert_eq!(envelope.body, "payload");
        assert_eq!(envelope.headers["x-token"], "secret");
        assert_eq!(envelope.headers["accept"], "text/html, */*");

        let envelope = build_envelope(&Method::GET, &HeaderMap::new(), "", Some("a=1"), b"");
        assert_eq!(envelope.path, "/?a=1");
        assert!(envelope.headers.is_empty());
    }

    #[tokio::test]
    async fn test_reply_to_response() {
        let reply = ReplyPayload::new(201, "created").with_content_type("application/json");
        let response = reply_to_response(reply);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"created");

        let response = reply_to_response(ReplyPayload::new(204, ""));
        assert!(response.headers().get(CONTENT_TYPE).is_none());
    }

    async fn start(config: RelayConfig) -> (SocketAddr, Arc<Relay>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = Arc::new(Relay::new(&config));
        tokio::spawn(serve(listener, relay.clone()));
        (addr, relay)
    }

    async fn connect_device(addr: SocketAddr, client_id: &str, relay: &Relay) -> DeviceSocket {
        let (mut ws, _) = connect_async(format!("ws://{addr}{TUNNEL_WS_PATH}"))
            .await
            .unwrap();
        ws.send(Message::Text(client_id.to_string().into()))
            .await
            .unwrap();
        while relay.registry.lookup(client_id).await.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        ws
    }

    async fn next_request(ws: &mut DeviceSocket) -> (TunnelMessage, RequestEnvelope) {
        loop {
            if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                let msg: TunnelMessage = serde_json::from_str(text.as_str()).unwrap();
                let envelope = serde_json::from_str(&msg.data).unwrap();
                return (msg, envelope);
            }
        }
    }

    async fn reply(ws: &mut DeviceSocket, message_id: String, data: &str) {
        let frame = serde_json::to_string(&TunnelMessage {
            message_id,
            data: data.to_string(),
        })
        .unwrap();
        ws.send(Message::Text(frame.into())).await.unwrap();
    }

    async fn http(
        addr: SocketAddr,
        method: Method,
        path: &str,
        body: &'static str,
    ) -> (StatusCode, HeaderMap, String) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .unwrap();
        tokio::spawn(conn);

        let request = Request::builder()
            .method(method)
            .uri(path)
            .header("host", addr.to_string())
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap();
        let response = sender.send_request(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn root_and_unknown_paths() {
        let (addr, _relay) = start(RelayConfig::default()).await;

        let (status, _, body) = http(addr, Method::GET, "/", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Hello, World!");

        let (status, _, _) = http(addr, Method::GET, "/nowhere", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn request_round_trips_through_device() {
        let (addr, relay) = start(RelayConfig::default()).await;
        let mut device = connect_device(addr, "abc123", &relay).await;

        let call = tokio::spawn(http(addr, Method::GET, "/mobile/abc123/foo", ""));

        let (msg, envelope) = next_request(&mut device).await;
        assert_eq!(envelope.path, "/foo");
        assert_eq!(envelope.method, "GET");
        assert_eq!(envelope.body, "");
        assert!(!envelope.headers.contains_key(":path"));

        reply(&mut device, msg.message_id, r#"{"http_code":200,"body":"hi"}"#).await;

        let (status, _, body) = call.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "hi");
        assert_eq!(relay.correlation.pooled_count(), 20);
    }

    #[tokio::test]
    async fn out_of_order_replies_reach_their_callers() {
        let (addr, relay) = start(RelayConfig::default()).await;
        let mut device = connect_device(addr, "abc123", &relay).await;

        let first = tokio::spawn(http(addr, Method::POST, "/mobile/abc123/one", "1"));
        let (first_msg, first_env) = next_request(&mut device).await;
        let second = tokio::spawn(http(addr, Method::POST, "/mobile/abc123/two", "2"));
        let (second_msg, second_env) = next_request(&mut device).await;
        assert_eq!(first_env.body, "1");
        assert_eq!(second_env.body, "2");

        reply(
            &mut device,
            second_msg.message_id,
            r#"{"http_code":202,"Content-Type":"text/plain","body":"second"}"#,
        )
        .await;
        reply(&mut device, first_msg.message_id, r#"{"http_code":201,"body":"first"}"#).await;

        let (status, headers, body) = second.await.unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(headers[CONTENT_TYPE], "text/plain");
        assert_eq!(body, "second");

        let (status, _, body) = first.await.unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, "first");
    }

    #[tokio::test]
    async fn unknown_client_gets_400() {
        let (addr, _relay) = start(RelayConfig::default()).await;
        let (status, _, body) = http(addr, Method::GET, "/mobile/zzz/foo", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Client not found");
    }

    #[tokio::test]
    async fn silent_device_gets_500_after_timeout() {
        let config = RelayConfig {
            reply_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let (addr, relay) = start(config).await;
        let _device = connect_device(addr, "quiet", &relay).await;

        let (status, _, body) = http(addr, Method::GET, "/mobile/quiet/foo", "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "Failed to read response from WebSocket");
        assert_eq!(relay.correlation.pooled_count(), 20);
        assert_eq!(relay.correlation.active_count().await, 0);
    }

    #[tokio::test]
    async fn caller_hanging_up_frees_the_slot() {
        let config = RelayConfig {
            reply_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        let (addr, relay) = start(config).await;
        let mut device = connect_device(addr, "abc123", &relay).await;

        let mut caller = TcpStream::connect(addr).await.unwrap();
        caller
            .write_all(b"GET /mobile/abc123/foo HTTP/1.1\r\nhost: x\r\n\r\n")
            .await
            .unwrap();
        next_request(&mut device).await;
        assert_eq!(relay.correlation.active_count().await, 1);
        drop(caller);

        for _ in 0..200 {
            if relay.correlation.pooled_count() == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(relay.correlation.pooled_count(), 20);
        assert_eq!(relay.correlation.active_count().await, 0);
    }

    #[tokio::test]
    async fn reply_without_http_code_gets_500() {
        let (addr, relay) = start(RelayConfig::default()).await;
        let mut device = connect_device(addr, "abc123", &relay).await;

        let call = tokio::spawn(http(addr, Method::GET, "/mobile/abc123/foo", ""));
        let (msg, _) = next_request(&mut device).await;
        reply(&mut device, msg.message_id, r#"{"body":"x"}"#).await;

        let (status, _, body) = call.await.unwrap();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "http_code not found or invalid");
    }

    #[tokio::test]
    async fn full_server_turns_devices_away() {
        let config = RelayConfig {
            max_clients: 2,
            ..Default::default()
        };
        let (addr, relay) = start(config).await;
        let _first = connect_device(addr, "first", &relay).await;
        let _second = connect_device(addr, "second", &relay).await;

        let (mut third, _) = connect_async(format!("ws://{addr}{TUNNEL_WS_PATH}"))
            .await
            .unwrap();
        let notice = third.next().await.unwrap().unwrap();
        assert_eq!(notice, Message::Text(SERVER_FULL_NOTICE.to_string().into()));
        assert!(matches!(
            third.next().await,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None
        ));
        assert_eq!(relay.registry.live_count().await, 2);
    }

    #[tokio::test]
    async fn disconnect_frees_a_place() {
        let config = RelayConfig {
            max_clients: 1,
            ..Default::default()
        };
        let (addr, relay) = start(config).await;
        let mut first = connect_device(addr, "first", &relay).await;
        first.close(None).await.unwrap();

        while relay.registry.live_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let _second = connect_device(addr, "second", &relay).await;
        assert!(relay.registry.lookup("first").await.is_none());
        assert_eq!(relay.registry.live_count().await, 1);
    }
}
