//! Streamed tool-call assembly
//!
//! Backends stream a tool call as a series of deltas tagged with an `index`.
//! Every string field is concatenated across deltas. `arguments` is JSON
//! text that is only well-formed once the stream is over, so it is held in
//! [`PartialArguments`], which has no way to be parsed: the text only comes
//! out through [`PartialArguments::finish`].

use super::types::{FunctionCall, ToolCallRequest, FUNCTION_TYPE};
use crate::history::MessageId;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Map, Value};

/// Upper bound on a delta's `index`; larger values are dropped.
const MAX_TOOL_CALLS: usize = 128;

/// Argument text still being assembled
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialArguments(String);

impl PartialArguments {
    pub fn push(&mut self, fragment: &str) {
        self.0.push_str(fragment);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// End assembly and hand out the complete text.
    pub fn finish(self) -> String {
        self.0
    }
}

/// One tool call as merged so far. Absent fields stay `None` so the
/// normalizer can tell "missing" from "empty".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallDraft {
    pub id: Option<String>,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<PartialArguments>,
    pub has_function: bool,
}

impl ToolCallDraft {
    /// Read a complete (non-streamed) tool call leniently.
    pub fn from_value(value: &Value) -> Self {
        let function = value.get("function");
        Self {
            id: value.get("id").map(value_text),
            kind: value.get("type").map(value_text),
            name: function.and_then(|f| f.get("name")).map(value_text),
            arguments: function
                .and_then(|f| f.get("arguments"))
                .map(|a| PartialArguments(value_text(a))),
            has_function: function.is_some(),
        }
    }

    fn apply(&mut self, delta: &ToolCallDelta) {
        if let Some(kind) = &delta.kind {
            self.kind.get_or_insert_with(String::new).push_str(kind);
        }
        if let Some(id) = &delta.id {
            self.id.get_or_insert_with(String::new).push_str(id);
        }
        if let Some(function) = &delta.function {
            self.has_function = true;
            if let Some(name) = &function.name {
                self.name.get_or_insert_with(String::new).push_str(name);
            }
            if let Some(arguments) = &function.arguments {
                self.arguments.get_or_insert_with(PartialArguments::default).push(arguments);
            }
        }
    }

    /// Rebuild the JSON shape, for handing an unusable batch to the caller.
    pub fn into_value(self) -> Value {
        let mut obj = Map::new();
        if let Some(kind) = self.kind {
            obj.insert("type".to_string(), Value::String(kind));
        }
        if let Some(id) = self.id {
            obj.insert("id".to_string(), Value::String(id));
        }
        if self.has_function {
            let mut function = Map::new();
            if let Some(name) = self.name {
                function.insert("name".to_string(), Value::String(name));
            }
            if let Some(arguments) = self.arguments {
                function.insert("arguments".to_string(), Value::String(arguments.finish()));
            }
            obj.insert("function".to_string(), Value::Object(function));
        }
        Value::Object(obj)
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// One `delta.tool_calls[]` element of a streamed reply
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "fragment_text")]
    pub arguments: Option<String>,
}

fn fragment_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Merges streamed tool-call deltas by index
#[derive(Debug, Clone, Default)]
pub struct ToolCallAccumulator {
    entries: Vec<ToolCallDraft>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, deltas: &[ToolCallDelta]) {
        for delta in deltas {
            let index = delta.index.unwrap_or_else(|| {
                tracing::warn!("Tool call delta without index, treating as index 0");
                0
            });
            if index >= MAX_TOOL_CALLS {
                tracing::warn!(index, limit = MAX_TOOL_CALLS, "Tool call index exceeds limit, skipping");
                continue;
            }
            if self.entries.len() <= index {
                self.entries.resize_with(index + 1, ToolCallDraft::default);
            }
            self.entries[index].apply(delta);
        }
    }

    pub fn entries(&self) -> &[ToolCallDraft] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn finish(self) -> Vec<ToolCallDraft> {
        self.entries
    }
}

/// Why a batch of tool calls was left untouched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeRejection {
    UnsupportedType(String),
    MissingFunctionName,
}

impl std::fmt::Display for ShapeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShapeRejection::UnsupportedType(kind) => {
                write!(f, "unsupported tool call type `{kind}`")
            }
            ShapeRejection::MissingFunctionName => write!(f, "tool call without function name"),
        }
    }
}

/// Result of normalizing a finished batch
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedToolCalls {
    Ready(Vec<ToolCallRequest>),
    Unsupported { reason: ShapeRejection, raw: Vec<Value> },
}

/// Backfill missing fields, deciding the policy from the first element only.
pub fn normalize_tool_calls(drafts: Vec<ToolCallDraft>) -> NormalizedToolCalls {
    let Some(first) = drafts.first() else {
        return NormalizedToolCalls::Ready(Vec::new());
    };

    let rejection = match (&first.kind, &first.name) {
        (Some(kind), _) if kind != FUNCTION_TYPE => Some(ShapeRejection::UnsupportedType(kind.clone())),
        (_, None) => Some(ShapeRejection::MissingFunctionName),
        _ => None,
    };
    if let Some(reason) = rejection {
        tracing::error!(%reason, "Invalid tool calls from backend, passing through");
        return NormalizedToolCalls::Unsupported {
            reason,
            raw: drafts.into_iter().map(ToolCallDraft::into_value).collect(),
        };
    }

    let stamp_type = first.kind.is_none();
    let stamp_id = first.id.is_none();

    let calls = drafts
        .into_iter()
        .map(|draft| {
            let kind = if stamp_type {
                FUNCTION_TYPE.to_string()
            } else {
                draft.kind.unwrap_or_default()
            };
            let id = match draft.id {
                Some(id) => id,
                None if stamp_id => MessageId::next().to_string(),
                None => String::new(),
            };
            ToolCallRequest {
                id,
                kind,
                function: FunctionCall {
                    name: draft.name.unwrap_or_default(),
                    arguments: draft.arguments.map(PartialArguments::finish).unwrap_or_default(),
                },
            }
        })
        .collect();

    NormalizedToolCalls::Ready(calls)
}

/// Parse a `delta.tool_calls` array, dropping elements that don't fit.
pub fn parse_deltas(value: &Value) -> Vec<ToolCallDelta> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match serde_json::from_value(item.clone()) {
                    Ok(delta) => Some(delta),
                    Err(e) => {
                        tracing::warn!(error = %e, delta = %item, "Ignoring malformed tool call delta");
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) fn delta(index: Option<usize>, fields: &Value) -> ToolCallDelta {
    let mut value = fields.clone();
    if let (Some(index), Some(obj)) = (index, value.as_object_mut()) {
        obj.insert("index".to_string(), json!(index));
    }
    serde_json::from_value(value).unwrap_or_default()
}
