use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("reply data is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http_code not found or invalid")]
    InvalidHttpCode,
}

/// The inner `data` of a device reply: what the HTTP caller will receive.
///
/// Wire format:
/// ```text
/// {"http_code": 200, "content-type": "text/plain", "body": "hi"}
/// ```
/// `http_code` is required. The content type key is matched without regard
/// to case (`Content-Type` and `content-type` are both seen in the field).
/// A missing or non-string `body` reads as empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyPayload {
    pub http_code: u16,
    #[serde(rename = "content-type", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub body: String,
}

impl ReplyPayload {
    pub fn new(http_code: u16, body: impl Into<String>) -> Self {
        Self {
            http_code,
            content_type: None,
            body: body.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Serialize into the string carried by `TunnelMessage::data`.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse the string carried by `TunnelMessage::data`.
    pub fn decode(data: &str) -> Result<Self, ReplyError> {
        let object: Map<String, Value> = serde_json::from_str(data)?;

        let http_code = object
            .get("http_code")
            .and_then(Value::as_f64)
            .and_then(status_from_number)
            .ok_or(ReplyError::InvalidHttpCode)?;

        let content_type = object
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("content-type"))
            .and_then(|(_, value)| value.as_str())
            .filter(|value| !value.is_empty())
            .map(str::to_owned);

        let body = object
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        Ok(Self {
            http_code,
            content_type,
            body,
        })
    }
}

// Fractional codes are truncated; anything outside the three-digit range is unusable.
fn status_from_number(code: f64) -> Option<u16> {
    let code = code.trunc();
    (100.0..=999.0).contains(&code).then_some(code as u16)
}
