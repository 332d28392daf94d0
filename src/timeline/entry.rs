//! Normalization of raw message-log entries into [`LogEntry`].
//!
//! The backend's log mixes several shapes (plain strings, content blocks,
//! OpenAI-style `tool_calls`, `role: "tool"` results). Everything is mapped
//! onto one closed enum here so nothing downstream inspects raw JSON.

use serde_json::Value;

use crate::core::task::Source;

/// Keys that may wrap the real payload of a tool result, one level deep.
const ENVELOPE_KEYS: [&str; 4] = ["data", "result", "output", "response"];
const LIST_KEYS: [&str; 2] = ["results", "sources"];

#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    Reasoning { text: String },
    UserMessage { text: String },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub output: ToolOutput,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub sources: Vec<Source>,
    pub text: Option<String>,
    pub raw: Value,
}

/// Role of a raw entry, if it has one.
pub fn role_of(raw: &Value) -> Option<&str> {
    raw.get("role")
        .or_else(|| raw.get("type"))
        .and_then(Value::as_str)
}

/// Normalize one raw message. A message with several content blocks yields
/// several entries, in block order.
pub fn parse_message(raw: &Value) -> Vec<LogEntry> {
    match role_of(raw) {
        Some("assistant") => parse_assistant(raw),
        Some("user") => parse_user(raw),
        Some("tool") => parse_tool_message(raw).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| value.get(*k).and_then(Value::as_str))
}

fn parse_assistant(raw: &Value) -> Vec<LogEntry> {
    let mut entries = Vec::new();

    if let Some(text) = raw.get("reasoning").and_then(Value::as_str).and_then(non_empty) {
        entries.push(LogEntry::Reasoning { text });
    }

    match raw.get("content") {
        Some(Value::String(text)) => {
            if let Some(text) = non_empty(text) {
                entries.push(LogEntry::Reasoning { text });
            }
        }
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") | Some("reasoning") | Some("thinking") => {
                        if let Some(text) =
                            str_field(block, &["text", "thinking", "reasoning"]).and_then(non_empty)
                        {
                            entries.push(LogEntry::Reasoning { text });
                        }
                    }
                    Some("tool_use") | Some("tool_call") => {
                        if let Some(call) = parse_tool_call_block(block) {
                            entries.push(LogEntry::ToolCall(call));
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    if let Some(calls) = raw.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let function = call.get("function");
            let name = function
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .or_else(|| call.get("name").and_then(Value::as_str))
                .unwrap_or("tool");
            let input = function
                .and_then(|f| f.get("arguments"))
                .map(decode_embedded_json)
                .unwrap_or(Value::Null);
            entries.push(LogEntry::ToolCall(ToolCall {
                id: str_field(call, &["id"]).unwrap_or_default().to_string(),
                name: name.to_string(),
                input,
            }));
        }
    }

    entries
}

fn parse_tool_call_block(block: &Value) -> Option<ToolCall> {
    let name = str_field(block, &["name"])?;
    Some(ToolCall {
        id: str_field(block, &["id", "tool_call_id", "tool_use_id"])
            .unwrap_or_default()
            .to_string(),
        name: name.to_string(),
        input: block
            .get("input")
            .or_else(|| block.get("arguments"))
            .map(decode_embedded_json)
            .unwrap_or(Value::Null),
    })
}

fn parse_user(raw: &Value) -> Vec<LogEntry> {
    match raw.get("content") {
        Some(Value::String(text)) => non_empty(text)
            .map(|text| vec![LogEntry::UserMessage { text }])
            .unwrap_or_default(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| match block.get("type").and_then(Value::as_str) {
                Some("text") => str_field(block, &["text"])
                    .and_then(non_empty)
                    .map(|text| LogEntry::UserMessage { text }),
                Some("tool_result") => parse_tool_result_block(block).map(LogEntry::ToolResult),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_tool_message(raw: &Value) -> Option<LogEntry> {
    let call_id = str_field(raw, &["tool_call_id", "tool_use_id", "id"])?;
    Some(LogEntry::ToolResult(ToolResult {
        call_id: call_id.to_string(),
        output: ToolOutput::from_content(raw.get("content").unwrap_or(&Value::Null)),
        is_error: raw.get("is_error").and_then(Value::as_bool).unwrap_or(false),
    }))
}

fn parse_tool_result_block(block: &Value) -> Option<ToolResult> {
    let call_id = str_field(block, &["tool_use_id", "tool_call_id"])?;
    Some(ToolResult {
        call_id: call_id.to_string(),
        output: ToolOutput::from_content(block.get("content").unwrap_or(&Value::Null)),
        is_error: block.get("is_error").and_then(Value::as_bool).unwrap_or(false),
    })
}

/// Strings that hold JSON are decoded; anything else is returned as is.
fn decode_embedded_json(value: &Value) -> Value {
    match value {
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(parsed @ (Value::Object(_) | Value::Array(_))) => parsed,
            _ => value.clone(),
        },
        other => other.clone(),
    }
}

impl ToolOutput {
    pub fn from_content(content: &Value) -> Self {
        // Content blocks carrying text are flattened first.
        let flattened = match content {
            Value::Array(blocks)
                if !blocks.is_empty()
                    && blocks
                        .iter()
                        .all(|b| b.get("type").and_then(Value::as_str) == Some("text")) =>
            {
                let text: Vec<&str> = blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect();
                Value::String(text.join("\n"))
            }
            other => other.clone(),
        };

        let raw = decode_embedded_json(&flattened);
        let text = match &raw {
            Value::String(s) => non_empty(s),
            _ => None,
        };
        Self {
            sources: extract_sources(&raw),
            text,
            raw,
        }
    }
}

fn find_list(value: &Value) -> Option<&Vec<Value>> {
    if let Some(list) = value.as_array() {
        return Some(list);
    }
    LIST_KEYS
        .iter()
        .find_map(|k| value.get(*k).and_then(Value::as_array))
}

/// Sources from a tool payload, unwrapping at most one envelope layer.
fn extract_sources(value: &Value) -> Vec<Source> {
    if let Some(list) = find_list(value) {
        return to_sources(list);
    }
    for key in ENVELOPE_KEYS {
        if let Some(inner) = value.get(key) {
            let inner = decode_embedded_json(inner);
            if let Some(list) = find_list(&inner) {
                return to_sources(list);
            }
        }
    }
    Vec::new()
}

fn to_sources(list: &[Value]) -> Vec<Source> {
    list.iter()
        .filter_map(|item| {
            let url = str_field(item, &["url", "link", "href"])?;
            Some(Source {
                title: str_field(item, &["title", "name"]).map(str::to_string),
                url: url.to_string(),
                snippet: str_field(item, &["snippet", "description", "content"]).map(str::to_string),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_assistant_blocks() {
        let entries = parse_message(&json!({
            "role": "assistant",
            "content": [
                { "type": "thinking", "thinking": "Plan the search" },
                { "type": "tool_use", "id": "call_1", "name": "web_search", "input": { "q": "Stripe" } },
                { "type": "text", "text": "  " }
            ]
        }));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], LogEntry::Reasoning { text: "Plan the search".into() });
        match &entries[1] {
            LogEntry::ToolCall(call) => {
                assert_eq!(call.id, "call_1");
                assert_eq!(call.input["q"], "Stripe");
            }
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[test]
    fn test_openai_style_tool_calls() {
        let entries = parse_message(&json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{ "id": "c9", "function": { "name": "fetch", "arguments": "{\"url\":\"https://a.io\"}" } }]
        }));
        assert_eq!(
            entries,
            vec![LogEntry::ToolCall(ToolCall {
                id: "c9".into(),
                name: "fetch".into(),
                input: json!({ "url": "https://a.io" }),
            })]
        );
    }

    #[test]
    fn test_single_envelope_is_unwrapped() {
        let wrapped = ToolOutput::from_content(&json!({
            "data": { "results": [{ "title": "Stripe", "url": "https://stripe.com" }] }
        }));
        assert_eq!(wrapped.sources.len(), 1);
        assert_eq!(wrapped.sources[0].url, "https://stripe.com");

        let bare = ToolOutput::from_content(&json!({
            "results": [{ "url": "https://a.io", "snippet": "A" }]
        }));
        assert_eq!(bare.sources[0].snippet.as_deref(), Some("A"));

        let as_string = ToolOutput::from_content(&json!(
            "{\"result\":{\"sources\":[{\"link\":\"https://b.io\"}]}}"
        ));
        assert_eq!(as_string.sources[0].url, "https://b.io");
    }

    #[test]
    fn test_double_envelope_is_not_unwrapped() {
        let output = ToolOutput::from_content(&json!({
            "data": { "result": { "results": [{ "url": "https://deep.io" }] } }
        }));
        assert!(output.sources.is_empty());
    }

    #[test]
    fn test_tool_results_from_user_and_tool_roles() {
        let from_user = parse_message(&json!({
            "role": "user",
            "content": [{ "type": "tool_result", "tool_use_id": "call_1", "content": [{ "type": "text", "text": "done" }] }]
        }));
        match &from_user[0] {
            LogEntry::ToolResult(result) => {
                assert_eq!(result.call_id, "call_1");
                assert_eq!(result.output.text.as_deref(), Some("done"));
            }
            other => panic!("unexpected entry {:?}", other),
        }

        let from_tool = parse_message(&json!({ "role": "tool", "tool_call_id": "c9", "content": "[]" }));
        assert!(matches!(&from_tool[0], LogEntry::ToolResult(r) if r.call_id == "c9" && r.output.text.is_none()));

        assert!(parse_message(&json!({ "role": "system", "content": "x" })).is_empty());
    }
}
