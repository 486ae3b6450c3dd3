//! Reply clean-up helpers

const CODE_FENCE: &str = "```";

/// Remove every `<tag>...</tag>` span, then trim.
///
/// An opening tag without a matching close removes everything after it.
pub fn remove_tags(tag: &str, text: &str) -> String {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    strip_spans(text, &open, &close)
}

/// Remove every fenced code block (fences included), then trim.
///
/// An unterminated fence removes everything after it.
pub fn remove_code_blocks(text: &str) -> String {
    strip_spans(text, CODE_FENCE, CODE_FENCE)
}

fn strip_spans(text: &str, open: &str, close: &str) -> String {
    let mut result = text.to_string();
    if open.is_empty() {
        return result.trim().to_string();
    }

    let mut from = 0;
    while let Some(found) = result.get(from..).and_then(|rest| rest.find(open)) {
        let start = from + found;
        let body = start + open.len();
        match result.get(body..).and_then(|rest| rest.find(close)) {
            Some(offset) => result.replace_range(start..body + offset + close.len(), ""),
            None => {
                result.truncate(start);
                break;
            }
        }
        // Removal can join text into a new opener just before `start`.
        from = floor_char_boundary(&result, start.saturating_sub(open.len() - 1));
    }
    result.trim().to_string()
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}
