//! Chat error types

use thiserror::Error;

/// Chat error with classification.
///
/// `Display` is the bare message so it can be surfaced to the UI verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ChatError {
    pub kind: ChatErrorKind,
    pub message: String,
}

impl ChatError {
    pub fn new(kind: ChatErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ChatErrorKind::Network, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ChatErrorKind::RateLimit, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(ChatErrorKind::ServerError, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ChatErrorKind::Auth, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ChatErrorKind::InvalidRequest, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ChatErrorKind::MalformedPayload, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ChatErrorKind::Timeout, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ChatErrorKind::Unsupported, message)
    }

    pub fn stopped() -> Self {
        Self::new(ChatErrorKind::EngineStopped, "Conversation engine is not running")
    }

    /// Classify a non-2xx HTTP reply.
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = extract_error_message(body).unwrap_or_else(|| body.trim().to_string());
        match status {
            401 | 403 => Self::auth(format!("Authentication failed (HTTP {status}): {detail}")),
            429 => Self::rate_limit(format!("Rate limit exceeded: {detail}")),
            400 => Self::invalid_request(format!("Invalid request: {detail}")),
            500..=599 => Self::server_error(format!("Server error (HTTP {status}): {detail}")),
            _ => Self::network(format!("HTTP {status}: {detail}")),
        }
    }
}

/// Pull `error.message` out of an OpenAI-style error body, if it has one.
fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")?
        .get("message")?
        .as_str()
        .map(str::to_string)
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ChatError::network(format!("Request timeout: {e}"))
        } else if e.is_connect() {
            ChatError::network(format!("Connection failed: {e}"))
        } else {
            ChatError::network(format!("Request failed: {e}"))
        }
    }
}

/// Error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatErrorKind {
    /// Connection refused, DNS, aborted transfers
    Network,
    /// Rate limited (429)
    RateLimit,
    /// Server error (5xx)
    ServerError,
    /// Authentication failed (401, 403)
    Auth,
    /// Bad request (400)
    InvalidRequest,
    /// Null JSON, empty content with no tool calls
    MalformedPayload,
    /// Inactivity timeout or the sync call's own deadline
    Timeout,
    /// Reply shape the engine cannot use in this mode
    Unsupported,
    /// The engine task is gone
    EngineStopped,
}

impl ChatErrorKind {
    /// Whether re-prompting the same history may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::RateLimit | Self::ServerError | Self::Timeout
        )
    }
}
