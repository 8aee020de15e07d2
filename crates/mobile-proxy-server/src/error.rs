use hyper::StatusCode;
use mobile_proxy_core::{ReplyError, SERVER_FULL_NOTICE};

/// Everything that can go wrong between accepting a proxied request and answering it.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("client limit reached")]
    AdmissionRejected,
    #[error("client {0} not found")]
    ClientNotFound(String),
    #[error("failed to serialize envelope: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to write to tunnel: {0}")]
    TransportWrite(#[source] tungstenite::Error),
    #[error("reply for message {0} was lost")]
    TransportRead(String),
    #[error("no reply for message {0} in time")]
    CorrelationTimeout(String),
    #[error("no correlation slot freed up in time")]
    AllocationTimeout,
    #[error("malformed reply: {0}")]
    MalformedReply(#[from] ReplyError),
    #[error("relay task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::ClientNotFound(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Fixed body text returned to the HTTP caller.
    pub fn public_message(&self) -> &'static str {
        match self {
            RelayError::AdmissionRejected => SERVER_FULL_NOTICE,
            RelayError::ClientNotFound(_) => "Client not found",
            RelayError::Serialization(_) => "Failed to marshal JSON",
            RelayError::TransportWrite(_) => "Failed to relay to WebSocket",
            RelayError::TransportRead(_) | RelayError::CorrelationTimeout(_) => {
                "Failed to read response from WebSocket"
            }
            RelayError::AllocationTimeout => "No relay slot available",
            RelayError::MalformedReply(ReplyError::Json(_)) => "Failed to unmarshal JSON response",
            RelayError::MalformedReply(ReplyError::InvalidHttpCode) => {
                "http_code not found or invalid"
            }
            RelayError::Join(_) => "Internal Server Error",
        }
    }
}
