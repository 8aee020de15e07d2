mod reply;

pub use reply::{ReplyError, ReplyPayload};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Frame exchanged over the tunnel after the client id handshake, in both directions.
///
/// Server → client: `data` is a serialized [`RequestEnvelope`].
/// Client → server: `data` is a serialized [`ReplyPayload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelMessage {
    pub message_id: String,
    pub data: String,
}

/// An HTTP request as seen by the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub method: String,
}

/// WebSocket path on which devices open their tunnel.
pub const TUNNEL_WS_PATH: &str = "/ws";

/// Path prefix of the proxy endpoint: `/mobile/{client_id}/{rest...}`.
pub const PROXY_PATH_PREFIX: &str = "/mobile";

/// Text frame sent to a device before closing it when admission is refused.
pub const SERVER_FULL_NOTICE: &str = "Server is full. Please try again later.";

/// Default server port.
pub const DEFAULT_PORT: u16 = 3000;
