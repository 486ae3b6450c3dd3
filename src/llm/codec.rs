//! `OpenAI`-compatible chat-completions request/reply codec

use super::tool_calls::{normalize_tool_calls, NormalizedToolCalls, ShapeRejection, ToolCallDraft};
use super::types::{ToolCallRequest, ToolDeclaration};
use crate::history::{Message, Role};
use serde::Serialize;
use serde_json::Value;

pub const EMPTY_CONTENT: &str = "Empty response content";
pub const INVALID_JSON: &str = "Invalid JSON response (null)";

const FINISH_TOOL_CALLS: &str = "tool_calls";

/// Usable content of a finished reply
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    ToolCalls(Vec<ToolCallRequest>),
}

/// Result of parsing a non-streamed reply body
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Reply(Reply),
    MalformedPayload(String),
    /// Tool calls in a shape the engine doesn't coerce; `raw` is untouched
    UnsupportedToolShape {
        reason: ShapeRejection,
        raw: Vec<Value>,
    },
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    messages: Vec<WireMessage<'a>>,
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDeclaration]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<&'a [ToolCallRequest]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

impl<'a> WireMessage<'a> {
    fn system(prompt: &'a str) -> Self {
        Self {
            role: "system",
            content: Some(prompt),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn from_message(msg: &'a Message) -> Self {
        let mut wire = Self {
            role: msg.role.as_str(),
            content: Some(&msg.content),
            tool_calls: None,
            tool_call_id: None,
        };
        match msg.role {
            Role::Tool => {
                wire.tool_call_id = Some(msg.tool_call_id.as_deref().unwrap_or_default());
            }
            Role::Assistant if msg.has_tool_calls() => {
                if msg.content.is_empty() {
                    wire.content = None;
                }
                wire.tool_calls = Some(&msg.tool_calls);
            }
            Role::User | Role::Assistant => {}
        }
        wire
    }
}

/// Serialize the full history plus system prompt and tool declarations.
pub fn build_request_body(
    history: &[Message],
    system_prompt: Option<&str>,
    tools: &[ToolDeclaration],
    model: &str,
    streaming: bool,
) -> Result<Vec<u8>, serde_json::Error> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    if let Some(prompt) = system_prompt.filter(|p| !p.is_empty()) {
        messages.push(WireMessage::system(prompt));
    }
    messages.extend(history.iter().map(WireMessage::from_message));

    tracing::debug!(history_len = history.len(), streaming, "Building request body");

    let request = ChatRequest {
        messages,
        model,
        tools: (!tools.is_empty()).then_some(tools),
        stream: streaming.then_some(true),
    };
    serde_json::to_vec(&request)
}

/// Parse a complete (non-streamed) reply body.
pub fn parse_final_reply(body: &[u8]) -> ParseOutcome {
    let root: Value = match serde_json::from_slice(body) {
        Ok(Value::Null) | Err(_) => {
            tracing::error!(body = %String::from_utf8_lossy(body), "Invalid JSON response");
            return ParseOutcome::MalformedPayload(INVALID_JSON.to_string());
        }
        Ok(root) => root,
    };

    let choice = root
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first());
    let finish_reason = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(Value::as_str);
    let message = choice.and_then(|c| c.get("message"));

    if finish_reason == Some(FINISH_TOOL_CALLS) {
        let raw: Vec<Value> = message
            .and_then(|m| m.get("tool_calls"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let drafts = raw.iter().map(ToolCallDraft::from_value).collect();
        return match normalize_tool_calls(drafts) {
            NormalizedToolCalls::Ready(calls) if calls.is_empty() => {
                tracing::error!("Reply finished with tool_calls but carried none");
                ParseOutcome::MalformedPayload(EMPTY_CONTENT.to_string())
            }
            NormalizedToolCalls::Ready(calls) => ParseOutcome::Reply(Reply::ToolCalls(calls)),
            NormalizedToolCalls::Unsupported { reason, .. } => {
                ParseOutcome::UnsupportedToolShape { reason, raw }
            }
        };
    }

    match message.and_then(|m| m.get("content")).and_then(Value::as_str) {
        Some(content) if !content.is_empty() => ParseOutcome::Reply(Reply::Text(content.to_string())),
        _ => {
            tracing::error!(body = %root, "Empty or malformed response content");
            ParseOutcome::MalformedPayload(EMPTY_CONTENT.to_string())
        }
    }
}
