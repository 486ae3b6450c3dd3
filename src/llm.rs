//! Chat-completions backend abstraction
//!
//! Wire codec, stream decoding and the HTTP transport seam used by the
//! conversation engine.

mod codec;
mod error;
mod http;
mod sse;
mod text;
mod tool_calls;
mod types;

#[cfg(test)]
mod proptests;

pub use codec::{build_request_body, parse_final_reply, ParseOutcome, Reply, EMPTY_CONTENT, INVALID_JSON};
pub use error::{ChatError, ChatErrorKind};
pub use http::ReqwestTransport;
pub use sse::{parse_stream_event, StreamContext, StreamDelta, StreamEvent, StreamOutcome};
pub use text::{remove_code_blocks, remove_tags};
pub use tool_calls::{
    normalize_tool_calls, NormalizedToolCalls, PartialArguments, ShapeRejection, ToolCallAccumulator,
    ToolCallDelta, ToolCallDraft,
};
pub use types::*;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::fmt;
use std::sync::Arc;

/// Response body as a stream of byte chunks
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, ChatError>>;

/// Outbound POST to the chat-completions endpoint
#[derive(Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Build a chat-completions request with the standard headers.
    pub fn chat(url: &str, api_key: Option<&str>, body: Vec<u8>, streaming: bool) -> Self {
        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        if streaming {
            headers.push(("Accept".to_string(), "text/event-stream".to_string()));
        }
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            headers.push(("Authorization".to_string(), format!("Bearer {key}")));
        }
        Self {
            url: url.to_string(),
            headers,
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(key, value)| {
                if key.eq_ignore_ascii_case("authorization") {
                    (key.as_str(), "***")
                } else {
                    (key.as_str(), value.as_str())
                }
            })
            .collect();
        f.debug_struct("HttpRequest")
            .field("url", &self.url)
            .field("headers", &headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Status line plus a body that arrives incrementally
pub struct HttpResponse {
    pub status: u16,
    pub body: ByteStream,
}

impl HttpResponse {
    pub fn new(status: u16, body: ByteStream) -> Self {
        Self { status, body }
    }

    /// A response whose body is already fully known.
    pub fn from_bytes(status: u16, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        Self::new(status, stream::once(async move { Ok(body) }).boxed())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Read the whole body.
    pub async fn collect(mut self) -> Result<Vec<u8>, ChatError> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf)
    }

    /// Turn a non-2xx reply into a classified error.
    pub async fn error_for_status(self) -> Result<Self, ChatError> {
        if self.is_success() {
            return Ok(self);
        }
        let status = self.status;
        let body = self.collect().await.unwrap_or_default();
        Err(ChatError::from_status(status, &String::from_utf8_lossy(&body)))
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// HTTP seam between the engine and the network
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue the request and return once the status line is known.
    /// Dropping the returned body aborts the transfer.
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, ChatError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, ChatError> {
        (**self).post(request).await
    }
}

/// Logging wrapper for transports
pub struct LoggingTransport {
    inner: Arc<dyn Transport>,
}

impl LoggingTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Transport for LoggingTransport {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, ChatError> {
        let url = request.url.clone();
        let body_len = request.body.len();
        let start = std::time::Instant::now();
        let result = self.inner.post(request).await;
        let duration = start.elapsed();

        match &result {
            Ok(response) => {
                tracing::info!(
                    %url,
                    body_len,
                    status = response.status,
                    duration_ms = %duration.as_millis(),
                    "Chat request answered"
                );
            }
            Err(e) => {
                tracing::error!(
                    %url,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    retryable = e.kind.is_retryable(),
                    "Chat request failed"
                );
            }
        }

        result
    }
}
