use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::entry::{parse_message, role_of, LogEntry, ToolCall, ToolResult};

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineItem {
    Reasoning {
        index: usize,
        text: String,
    },
    UserMessage {
        index: usize,
        text: String,
    },
    ToolInvocation {
        index: usize,
        call: ToolCall,
        /// `None` while the tool is still running.
        result: Option<ToolResult>,
    },
}

impl TimelineItem {
    /// Position of the originating entry in the flattened log.
    pub fn index(&self) -> usize {
        match self {
            TimelineItem::Reasoning { index, .. }
            | TimelineItem::UserMessage { index, .. }
            | TimelineItem::ToolInvocation { index, .. } => *index,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, TimelineItem::ToolInvocation { result: None, .. })
    }
}

/// Build the timeline for `log`. Pure: the same log always gives the same
/// items in the same order.
///
/// A result attaches to the first invocation with its correlation id; later
/// duplicates and results without an invocation are dropped.
pub fn build_timeline(log: &[Value]) -> Vec<TimelineItem> {
    let mut items = Vec::new();
    let mut open_calls: HashMap<String, usize> = HashMap::new();
    let mut index = 0usize;

    for raw in log {
        for entry in parse_message(raw) {
            match entry {
                LogEntry::Reasoning { text } => items.push(TimelineItem::Reasoning { index, text }),
                LogEntry::UserMessage { text } => {
                    items.push(TimelineItem::UserMessage { index, text })
                }
                LogEntry::ToolCall(call) => {
                    if !call.id.is_empty() {
                        if open_calls.contains_key(&call.id) {
                            index += 1;
                            continue;
                        }
                        open_calls.insert(call.id.clone(), items.len());
                    }
                    items.push(TimelineItem::ToolInvocation {
                        index,
                        call,
                        result: None,
                    });
                }
                LogEntry::ToolResult(result) => {
                    if let Some(&pos) = open_calls.get(&result.call_id) {
                        if let Some(TimelineItem::ToolInvocation { result: slot @ None, .. }) =
                            items.get_mut(pos)
                        {
                            *slot = Some(result);
                        }
                    }
                }
            }
            index += 1;
        }
    }

    items
}

/// Cheap fingerprint of an append-only log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSignature {
    pub count: usize,
    pub last_role: Option<String>,
    pub content_size: usize,
}

impl LogSignature {
    pub fn of(log: &[Value]) -> Self {
        Self {
            count: log.len(),
            last_role: log.last().and_then(role_of).map(str::to_string),
            content_size: log.iter().map(text_size).sum(),
        }
    }
}

fn text_size(value: &Value) -> usize {
    match value {
        Value::String(s) => s.len(),
        Value::Array(items) => items.iter().map(text_size).sum(),
        Value::Object(map) => map.values().map(text_size).sum(),
        _ => 0,
    }
}

/// Memoizes [`build_timeline`] behind a [`LogSignature`].
#[derive(Debug)]
pub struct TimelineBuilder {
    signature: Option<LogSignature>,
    items: Arc<[TimelineItem]>,
    rebuilds: usize,
}

impl Default for TimelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TimelineBuilder {
    pub fn new() -> Self {
        Self {
            signature: None,
            items: Arc::from(Vec::new()),
            rebuilds: 0,
        }
    }

    pub fn build(&mut self, log: &[Value]) -> Arc<[TimelineItem]> {
        let signature = LogSignature::of(log);
        if self.signature.as_ref() != Some(&signature) {
            self.items = build_timeline(log).into();
            self.signature = Some(signature);
            self.rebuilds += 1;
        }
        Arc::clone(&self.items)
    }

    /// Number of full rebuilds performed so far.
    pub fn rebuilds(&self) -> usize {
        self.rebuilds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn research_log() -> Vec<Value> {
        vec![
            json!({ "role": "user", "content": "Research Stripe" }),
            json!({ "role": "assistant", "content": [
                { "type": "reasoning", "text": "Start with funding history" },
                { "type": "tool_use", "id": "s1", "name": "web_search", "input": { "q": "Stripe funding" } },
                { "type": "tool_use", "id": "s2", "name": "web_search", "input": { "q": "Stripe products" } }
            ]}),
            json!({ "role": "tool", "tool_call_id": "s2", "content": {
                "data": { "results": [{ "title": "Products", "url": "https://stripe.com/products" }] }
            }}),
        ]
    }

    #[test]
    fn test_same_log_gives_same_timeline() {
        let log = research_log();
        let first = build_timeline(&log);
        let second = build_timeline(&log.clone());
        assert_eq!(first, second);

        let indexes: Vec<_> = first.iter().map(TimelineItem::index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
        assert!(matches!(&first[0], TimelineItem::UserMessage { text, .. } if text == "Research Stripe"));
        assert!(first[2].is_in_progress());
        assert!(!first[3].is_in_progress());
    }

    #[test]
    fn test_appended_result_resolves_without_reordering() {
        let mut log = research_log();
        let before = build_timeline(&log);

        log.push(json!({ "role": "user", "content": [
            { "type": "tool_result", "tool_use_id": "s1", "content": "{\"results\":[{\"url\":\"https://a.io\"}]}" }
        ]}));
        let after = build_timeline(&log);

        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.index(), a.index());
        }
        match &after[2] {
            TimelineItem::ToolInvocation { call, result: Some(result), .. } => {
                assert_eq!(call.id, "s1");
                assert_eq!(result.output.sources[0].url, "https://a.io");
            }
            other => panic!("expected resolved invocation, got {:?}", other),
        }
    }

    #[test]
    fn test_orphan_and_duplicate_results() {
        let log = vec![
            json!({ "role": "tool", "tool_call_id": "ghost", "content": "late" }),
            json!({ "role": "assistant", "content": [{ "type": "tool_use", "id": "x", "name": "fetch", "input": {} }] }),
            json!({ "role": "tool", "tool_call_id": "x", "content": "first" }),
            json!({ "role": "tool", "tool_call_id": "x", "content": "second" }),
        ];
        let items = build_timeline(&log);
        assert_eq!(items.len(), 1);
        match &items[0] {
            TimelineItem::ToolInvocation { result: Some(result), .. } => {
                assert_eq!(result.output.text.as_deref(), Some("first"));
            }
            other => panic!("unexpected item {:?}", other),
        }
    }

    #[test]
    fn test_builder_skips_rebuild_for_unchanged_signature() {
        let mut log = research_log();
        let mut builder = TimelineBuilder::new();

        let first = builder.build(&log);
        let again = builder.build(&log);
        assert_eq!(builder.rebuilds(), 1);
        assert!(Arc::ptr_eq(&first, &again));

        log.push(json!({ "role": "assistant", "content": "Summary ready" }));
        let grown = builder.build(&log);
        assert_eq!(builder.rebuilds(), 2);
        assert_eq!(grown.len(), first.len() + 1);
    }

    #[test]
    fn test_empty_log() {
        let mut builder = TimelineBuilder::new();
        assert!(builder.build(&[]).is_empty());
        assert_eq!(LogSignature::of(&[]).last_role, None);
    }
}
