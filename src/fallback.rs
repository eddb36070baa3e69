use serde_json::Value;
use tracing::{debug, warn};

use crate::types::ToolCall;

const OPEN: &str = "<tool_call>";
const CLOSE: &str = "</tool_call>";

/// Prefix of IDs assigned to calls recovered from text, so they can be told
/// apart from provider-issued IDs.
pub const FALLBACK_ID_PREFIX: &str = "fallback_call_";

/// Cheap check: does the text contain tool-call markup at all?
pub fn contains_tool_call_markup(text: &str) -> bool {
    text.to_ascii_lowercase().contains(OPEN)
}

/// Recover tool calls written as `<tool_call>{"name": .., "arguments": ..}</tool_call>`.
///
/// Each block must hold a JSON object with a string `name` and `arguments`
/// as either a string or an object (objects are re-serialized). Blocks that
/// don't parse are logged and skipped. Returns `None` when nothing valid was
/// found.
pub fn extract_tool_calls(text: &str) -> Option<Vec<ToolCall>> {
    let mut calls = Vec::new();

    for (block, _) in blocks(text) {
        let interior = text[block.0..block.1].trim();
        match parse_block(interior) {
            Some((name, arguments)) => {
                let id = format!("{FALLBACK_ID_PREFIX}{}", calls.len());
                debug!(id = %id, tool = %name, "recovered tool call from text");
                calls.push(ToolCall::new(id, name, arguments));
            }
            None => {
                warn!(block = %interior, "skipping malformed tool_call block");
            }
        }
    }

    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

/// Remove every `<tool_call>` block from text meant for display. An opening
/// marker with no closing marker is dropped together with everything after
/// it. Text outside the blocks is left byte-identical.
pub fn strip_tool_call_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;

    for (_, outer) in blocks(text) {
        out.push_str(&text[cursor..outer.0]);
        cursor = outer.1;
    }

    let lower = text.to_ascii_lowercase();
    match lower[cursor..].find(OPEN) {
        Some(dangling) => out.push_str(&text[cursor..cursor + dangling]),
        None => out.push_str(&text[cursor..]),
    }
    out
}

/// Byte ranges of complete blocks: (interior, whole block including markers).
fn blocks(text: &str) -> Vec<((usize, usize), (usize, usize))> {
    let lower = text.to_ascii_lowercase();
    let mut found = Vec::new();
    let mut from = 0;

    while let Some(rel) = lower[from..].find(OPEN) {
        let start = from + rel;
        let inner_start = start + OPEN.len();
        let Some(rel_end) = lower[inner_start..].find(CLOSE) else {
            break;
        };
        let inner_end = inner_start + rel_end;
        let end = inner_end + CLOSE.len();
        found.push(((inner_start, inner_end), (start, end)));
        from = end;
    }
    found
}

fn parse_block(interior: &str) -> Option<(String, String)> {
    let parsed: Value = serde_json::from_str(interior).ok()?;
    let name = parsed.get("name")?.as_str()?.to_string();
    let arguments = match parsed.get("arguments")? {
        Value::String(s) => s.clone(),
        obj @ Value::Object(_) => obj.to_string(),
        _ => return None,
    };
    Some((name, arguments))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_object_arguments() {
        let text = r#"<tool_call>{"name":"foo","arguments":{"x":1}}</tool_call>"#;
        let calls = extract_tool_calls(text).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "foo");
        assert_eq!(calls[0].arguments, r#"{"x":1}"#);
        assert!(calls[0].id.starts_with(FALLBACK_ID_PREFIX));
    }

    #[test]
    fn extracts_string_arguments_and_multiple_blocks() {
        let text = concat!(
            "Checking both.\n",
            "<tool_call>\n{\"name\": \"a\", \"arguments\": \"{\\\"k\\\": 2}\"}\n</tool_call>\n",
            "<TOOL_CALL>{\"name\": \"b\", \"arguments\": {}}</TOOL_CALL>",
        );
        let calls = extract_tool_calls(text).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].arguments, "{\"k\": 2}");
        assert_eq!(calls[1].name, "b");
        assert_ne!(calls[0].id, calls[1].id);
    }

    #[test]
    fn malformed_blocks_are_skipped() {
        let text = concat!(
            "<tool_call>not json</tool_call>",
            "<tool_call>{\"arguments\": {}}</tool_call>",
            "<tool_call>{\"name\": \"n\", \"arguments\": 5}</tool_call>",
            "<tool_call>{\"name\": \"ok\", \"arguments\": {\"q\": true}}</tool_call>",
        );
        let calls = extract_tool_calls(text).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "ok");
        assert_eq!(calls[0].id, format!("{FALLBACK_ID_PREFIX}0"));
    }

    #[test]
    fn nothing_valid_returns_none() {
        assert!(extract_tool_calls("plain answer").is_none());
        assert!(extract_tool_calls("<tool_call>{broken</tool_call>").is_none());
        assert!(extract_tool_calls("<tool_call>{\"name\":\"x\",\"arguments\":{}}").is_none());
    }

    #[test]
    fn detector() {
        assert!(contains_tool_call_markup("x <Tool_Call> y"));
        assert!(!contains_tool_call_markup("tool_call without brackets"));
    }

    #[test]
    fn strip_leaves_surrounding_text_identical() {
        let text = r#"Before  <tool_call>{"name":"foo","arguments":{"x":1}}</tool_call>  after"#;
        assert_eq!(strip_tool_call_markup(text), "Before    after");
        assert_eq!(strip_tool_call_markup("untouched é"), "untouched é");
    }

    #[test]
    fn strip_drops_dangling_block() {
        let text = "Answer.<tool_call>{}</tool_call> more <tool_call>{\"name\"";
        assert_eq!(strip_tool_call_markup(text), "Answer. more ");
    }
}
