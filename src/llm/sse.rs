//! Server-Sent Events decoding for streamed chat completions
//!
//! Bytes arrive in arbitrary chunks. [`StreamContext`] buffers them, cuts
//! complete events at blank lines and folds each event's `delta` into the
//! reply assembled so far.

use super::tool_calls::{parse_deltas, ToolCallAccumulator, ToolCallDelta, ToolCallDraft};
use serde_json::Value;

const DONE_PAYLOAD: &str = "[DONE]";

/// Decoded form of one SSE event
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Empty event or comment
    Ignored,
    /// Terminal `[DONE]` payload
    Done,
    Delta(StreamDelta),
    /// Undecodable event; logged and dropped
    Malformed(String),
}

/// Payload of a `choices[0].delta`
#[derive(Debug, Clone)]
pub enum StreamDelta {
    Content(String),
    ToolCalls(Vec<ToolCallDelta>),
    /// Role-only or empty delta
    Empty,
}

/// Decode one event (without its trailing blank line).
pub fn parse_stream_event(event: &[u8]) -> StreamEvent {
    let text = match std::str::from_utf8(event) {
        Ok(text) => text.trim_matches(|c| c == '\r' || c == '\n'),
        Err(e) => return StreamEvent::Malformed(format!("invalid UTF-8 in stream event: {e}")),
    };
    if text.is_empty() || text.starts_with(':') {
        return StreamEvent::Ignored;
    }

    let data: Vec<&str> = text
        .lines()
        .filter_map(|line| line.trim_end_matches('\r').strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect();
    if data.is_empty() {
        return StreamEvent::Malformed(format!("invalid stream data: {text}"));
    }
    let payload = data.join("\n");
    if payload.trim() == DONE_PAYLOAD {
        return StreamEvent::Done;
    }

    let json: Value = match serde_json::from_str(&payload) {
        Ok(json) => json,
        Err(e) => return StreamEvent::Malformed(format!("SSE JSON parse error: {e}")),
    };

    let Some(delta) = json
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("delta"))
    else {
        return StreamEvent::Delta(StreamDelta::Empty);
    };

    if let Some(tool_calls) = delta.get("tool_calls").filter(|v| !v.is_null()) {
        return StreamEvent::Delta(StreamDelta::ToolCalls(parse_deltas(tool_calls)));
    }
    match delta.get("content").and_then(Value::as_str) {
        Some(content) if !content.is_empty() => {
            StreamEvent::Delta(StreamDelta::Content(content.to_string()))
        }
        _ => StreamEvent::Delta(StreamDelta::Empty),
    }
}

/// Find the next event boundary: `(event_end, separator_len)`.
fn next_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) if b < a => Some((b, 4)),
        (Some(a), _) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

/// Per-turn streaming state
#[derive(Debug, Default)]
pub struct StreamContext {
    buffer: Vec<u8>,
    accumulated_text: String,
    has_tool_calls: bool,
    tool_calls: ToolCallAccumulator,
    done: bool,
}

/// What a finished (or abandoned) stream produced
#[derive(Debug)]
pub struct StreamOutcome {
    pub text: String,
    /// `Some` when the stream carried tool calls
    pub tool_calls: Option<Vec<ToolCallDraft>>,
}

impl StreamOutcome {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.tool_calls.as_ref().is_none_or(Vec::is_empty)
    }
}

impl StreamContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a chunk and process every complete event in it.
    /// Returns the text fragments to report, in order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut chunks = Vec::new();
        while let Some((end, sep)) = next_boundary(&self.buffer) {
            let event: Vec<u8> = self.buffer.drain(..end + sep).take(end).collect();
            chunks.extend(self.apply(&event));
        }
        chunks
    }

    /// Process whatever is left in the buffer as a final event.
    pub fn flush(&mut self) -> Vec<String> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let rest = std::mem::take(&mut self.buffer);
        self.apply(&rest).into_iter().collect()
    }

    fn apply(&mut self, event: &[u8]) -> Option<String> {
        if self.done {
            return None;
        }
        match parse_stream_event(event) {
            StreamEvent::Ignored | StreamEvent::Delta(StreamDelta::Empty) => None,
            StreamEvent::Done => {
                self.done = true;
                None
            }
            StreamEvent::Malformed(reason) => {
                tracing::warn!(%reason, "Dropping stream event");
                None
            }
            StreamEvent::Delta(StreamDelta::ToolCalls(deltas)) => {
                self.has_tool_calls = true;
                self.tool_calls.merge(&deltas);
                None
            }
            StreamEvent::Delta(StreamDelta::Content(chunk)) => {
                self.accumulated_text.push_str(&chunk);
                Some(chunk)
            }
        }
    }

    pub fn accumulated_text(&self) -> &str {
        &self.accumulated_text
    }

    pub fn has_tool_calls(&self) -> bool {
        self.has_tool_calls
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn into_outcome(self) -> StreamOutcome {
        StreamOutcome {
            text: self.accumulated_text,
            tool_calls: self.has_tool_calls.then(|| self.tool_calls.finish()),
        }
    }
}
