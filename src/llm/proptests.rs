//! Property-based tests for the wire codec
//!
//! These check invariants that must hold for every input:
//! - SSE decoding does not depend on where the byte stream is cut
//! - Tool-call fragments concatenate in arrival order
//! - Tag and fence stripping leave no opener behind and are idempotent
//! - Normalization preserves the batch size

use super::codec::build_request_body;
use super::sse::StreamContext;
use super::text::{remove_code_blocks, remove_tags};
use super::tool_calls::{delta, normalize_tool_calls, NormalizedToolCalls, ToolCallAccumulator, ToolCallDraft};
use crate::history::{MessageStore, Role};
use proptest::prelude::*;
use serde_json::json;

// ============================================================================
// Strategies
// ============================================================================

/// Content fragments as a model would stream them
fn arb_fragments() -> impl Strategy<Value = Vec<String>> {
    proptest::collection::vec("[a-zA-Z0-9 .,!?]{1,16}", 1..12)
}

/// Full SSE body for the given fragments, terminated by `[DONE]`
fn sse_body(fragments: &[String], crlf: bool) -> Vec<u8> {
    let sep = if crlf { "\r\n\r\n" } else { "\n\n" };
    let mut body = String::new();
    for fragment in fragments {
        let frame = json!({"choices": [{"delta": {"content": fragment}}]});
        body.push_str(&format!("data: {frame}{sep}"));
    }
    body.push_str(&format!("data: [DONE]{sep}"));
    body.into_bytes()
}

/// Split `bytes` at the given (unsorted, possibly repeated) cut points
fn split_at_cuts(bytes: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (bytes.len() + 1)).collect();
    points.sort_unstable();
    points.dedup();

    let mut pieces = Vec::new();
    let mut last = 0;
    for point in points {
        pieces.push(bytes[last..point].to_vec());
        last = point;
    }
    pieces.push(bytes[last..].to_vec());
    pieces
}

/// Text built from characters that tend to form tags and fences
fn arb_tag_soup() -> impl Strategy<Value = String> {
    "[<>/thinkx` \n]{0,64}"
}

// ============================================================================
// SSE framing
// ============================================================================

proptest! {
    /// Emitted chunks and accumulated text are independent of chunking
    #[test]
    fn prop_sse_chunking_independent(
        fragments in arb_fragments(),
        cuts in proptest::collection::vec(any::<usize>(), 0..20),
        crlf in any::<bool>(),
    ) {
        let body = sse_body(&fragments, crlf);
        let expected: String = fragments.concat();

        let mut ctx = StreamContext::new();
        let mut emitted = Vec::new();
        for piece in split_at_cuts(&body, &cuts) {
            emitted.extend(ctx.feed(&piece));
        }
        emitted.extend(ctx.flush());

        prop_assert_eq!(&emitted, &fragments);
        prop_assert_eq!(ctx.accumulated_text(), expected.as_str());
        prop_assert!(ctx.is_done());
    }

    /// Streamed argument fragments concatenate back to the full text
    #[test]
    fn prop_arguments_concatenate(
        args in "[a-z0-9{}\":,]{0,40}",
        cuts in proptest::collection::vec(any::<usize>(), 0..8),
    ) {
        let mut acc = ToolCallAccumulator::new();
        acc.merge(&[delta(Some(0), &json!({"id": "call_0", "type": "function", "function": {"name": "f"}}))]);
        for piece in split_at_cuts(args.as_bytes(), &cuts) {
            let fragment = String::from_utf8(piece).unwrap();
            acc.merge(&[delta(Some(0), &json!({"function": {"arguments": fragment}}))]);
        }

        let entries = acc.finish();
        prop_assert_eq!(entries.len(), 1);
        let text = entries[0].arguments.clone().map(|a| a.finish()).unwrap_or_default();
        prop_assert_eq!(text, args);
    }

    /// Accumulator length is one past the highest index seen
    #[test]
    fn prop_accumulator_pads_to_max_index(
        indices in proptest::collection::vec(0usize..32, 1..10)
    ) {
        let mut acc = ToolCallAccumulator::new();
        for &index in &indices {
            acc.merge(&[delta(Some(index), &json!({"function": {"name": "n"}}))]);
        }
        let max = indices.iter().copied().max().unwrap_or(0);
        prop_assert_eq!(acc.len(), max + 1);
    }
}

// ============================================================================
// Text utilities
// ============================================================================

proptest! {
    #[test]
    fn prop_remove_tags_idempotent(text in arb_tag_soup()) {
        let once = remove_tags("think", &text);
        prop_assert!(!once.contains("<think>"));
        prop_assert_eq!(remove_tags("think", &once), once);
    }

    #[test]
    fn prop_remove_code_blocks_idempotent(text in arb_tag_soup()) {
        let once = remove_code_blocks(&text);
        prop_assert!(!once.contains("```"));
        prop_assert_eq!(remove_code_blocks(&once), once);
    }

    /// Text without the opener is only trimmed
    #[test]
    fn prop_remove_tags_plain_text_trimmed(text in "[a-zA-Z0-9 \n]{0,64}") {
        prop_assert_eq!(remove_tags("think", &text), text.trim());
    }
}

// ============================================================================
// Normalization and request building
// ============================================================================

proptest! {
    /// A batch whose first element is well-formed keeps every element
    #[test]
    fn prop_normalize_preserves_count(
        names in proptest::collection::vec("[a-z_]{1,12}", 1..6),
        with_ids in any::<bool>(),
    ) {
        let drafts: Vec<ToolCallDraft> = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut value = json!({"function": {"name": name, "arguments": "{}"}});
                if with_ids {
                    value["id"] = json!(format!("call_{i}"));
                }
                ToolCallDraft::from_value(&value)
            })
            .collect();

        let NormalizedToolCalls::Ready(calls) = normalize_tool_calls(drafts) else {
            return Err(TestCaseError::fail("expected ready batch"));
        };
        prop_assert_eq!(calls.len(), names.len());
        prop_assert!(calls.iter().all(|c| c.kind == "function" && !c.id.is_empty()));
    }

    /// One wire message per history entry, plus the system prompt
    #[test]
    fn prop_request_body_message_count(
        contents in proptest::collection::vec("[a-zA-Z0-9 ]{0,30}", 0..10),
        prompt in proptest::option::of("[a-z ]{1,20}"),
    ) {
        let mut store = MessageStore::new();
        for (i, content) in contents.iter().enumerate() {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store.append(role, content.clone(), vec![], None);
        }
        let bytes = build_request_body(store.all(), prompt.as_deref(), &[], "m", false).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        let expected = contents.len() + usize::from(prompt.is_some());
        prop_assert_eq!(body["messages"].as_array().map(Vec::len), Some(expected));
    }
}
