use std::time::Duration;

/// Terminal failure of a streaming session, or a configuration error raised
/// before any session starts.
///
/// Every variant except `Config` is reported inside `StreamOutcome` rather
/// than returned as `Err`, so callers can still render partial content.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StreamError {
    /// Endpoint answered with a non-success status.
    #[error("{message}")]
    Http { status: u16, message: String },
    /// Connection could not be established or a body read failed.
    #[error("network error: {message}")]
    Transport { message: String },
    /// Success status but nothing to read.
    #[error("no response body")]
    NoResponseBody,
    /// Byte stream did not follow line-oriented SSE framing.
    #[error("malformed stream: {message}")]
    Protocol { message: String },
    /// No bytes arrived for longer than the configured idle timeout.
    #[error("stream stalled: no data received for {idle_ms} ms")]
    IdleTimeout { idle_ms: u64 },
    /// Invalid controller configuration.
    #[error("config error: {0}")]
    Config(String),
}

impl StreamError {
    /// Creates a transport-level error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a protocol-level error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn idle_timeout(idle: Duration) -> Self {
        Self::IdleTimeout {
            idle_ms: u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// HTTP status for `Http` errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub(crate) const RATE_LIMIT_MESSAGE: &str =
    "Rate limit exceeded. Please wait a moment before trying again.";
pub(crate) const CREDITS_EXHAUSTED_MESSAGE: &str =
    "Usage credits exhausted. Please add credits to continue.";

/// Builds the error for a non-success response from its status and body.
///
/// A JSON body carrying `error` (string or `{ "message": .. }`) or `message`
/// wins; otherwise 429 and 402 get friendly text and anything else falls back
/// to `HTTP <status>`.
pub(crate) fn http_status_error(status: u16, body: &str) -> StreamError {
    let message = message_from_error_body(body).unwrap_or_else(|| match status {
        429 => RATE_LIMIT_MESSAGE.to_string(),
        402 => CREDITS_EXHAUSTED_MESSAGE.to_string(),
        _ => format!("HTTP {status}"),
    });
    StreamError::Http { status, message }
}

fn message_from_error_body(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let message = match value.get("error") {
        Some(serde_json::Value::String(text)) => Some(text.as_str()),
        Some(error) => error.get("message").and_then(|v| v.as_str()),
        None => None,
    }
    .or_else(|| value.get("message").and_then(|v| v.as_str()))?;
    let message = message.trim();
    (!message.is_empty()).then(|| message.to_string())
}
