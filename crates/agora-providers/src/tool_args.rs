//! Tool-call argument buffering.
//!
//! Providers stream tool arguments as string fragments. [`ToolCallBuffer`]
//! accumulates them per call and asks a [`CompletionDetector`] when a call's
//! JSON is complete. Detection is heuristic: a call declared complete may
//! still fail to parse, and consumers treat that as a malformed tool call.

use std::sync::Arc;

use tracing::debug;

use crate::StreamEvent;

/// Decides whether a buffered argument string is a finished JSON payload.
pub trait CompletionDetector: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_complete(&self, buffer: &str) -> bool;
}

/// Complete once the outermost object's braces balance. Braces inside string
/// literals (including escaped quotes) are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct BraceBalance;

impl CompletionDetector for BraceBalance {
    fn name(&self) -> &'static str {
        "brace_balance"
    }

    fn is_complete(&self, buffer: &str) -> bool {
        let trimmed = buffer.trim_start();
        if !trimmed.starts_with('{') {
            return false;
        }

        let mut depth: i64 = 0;
        let mut in_string = false;
        let mut escaped = false;

        for c in trimmed.chars() {
            if in_string {
                match c {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '{' | '[' => depth += 1,
                '}' | ']' => {
                    depth -= 1;
                    if depth == 0 {
                        return true;
                    }
                }
                _ => {}
            }
        }
        false
    }
}

/// Complete only when the buffer parses as a JSON object.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictJson;

impl CompletionDetector for StrictJson {
    fn name(&self) -> &'static str {
        "strict_json"
    }

    fn is_complete(&self, buffer: &str) -> bool {
        matches!(
            serde_json::from_str::<serde_json::Value>(buffer),
            Ok(serde_json::Value::Object(_))
        )
    }
}

/// Look up a detector by its configured name.
pub fn detector_by_name(name: &str) -> Option<Arc<dyn CompletionDetector>> {
    match name {
        "brace_balance" => Some(Arc::new(BraceBalance)),
        "strict_json" => Some(Arc::new(StrictJson)),
        _ => None,
    }
}

#[derive(Debug)]
struct PendingCall {
    key: String,
    id: String,
    name: String,
    arguments: String,
    complete: bool,
}

/// Per-stream accumulator of tool-call fragments.
pub struct ToolCallBuffer {
    detector: Arc<dyn CompletionDetector>,
    calls: Vec<PendingCall>,
}

impl ToolCallBuffer {
    pub fn new(detector: Arc<dyn CompletionDetector>) -> Self {
        Self {
            detector,
            calls: Vec::new(),
        }
    }

    /// Add a fragment. Returns the event to forward, or `None` for fragments
    /// arriving after the call was already declared complete.
    pub fn push(
        &mut self,
        key: &str,
        id: Option<String>,
        name: Option<String>,
        fragment: &str,
    ) -> Option<StreamEvent> {
        let idx = match self.calls.iter().position(|c| c.key == key) {
            Some(idx) => idx,
            None => {
                self.calls.push(PendingCall {
                    key: key.to_string(),
                    id: String::new(),
                    name: String::new(),
                    arguments: String::new(),
                    complete: false,
                });
                self.calls.len() - 1
            }
        };
        let call = &mut self.calls[idx];

        if let Some(id) = id.filter(|s| !s.is_empty()) {
            call.id = id;
        }
        if let Some(name) = name.filter(|s| !s.is_empty()) {
            call.name = name;
        }
        if call.id.is_empty() {
            call.id = format!("call_{key}");
        }

        if call.complete {
            if !fragment.trim().is_empty() {
                debug!(id = %call.id, fragment, "Dropping fragment for completed tool call");
            }
            return None;
        }

        call.arguments.push_str(fragment);
        let complete = self.detector.is_complete(&call.arguments);
        call.complete = complete;

        Some(StreamEvent::ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            fragment: fragment.to_string(),
            is_complete: complete,
            arguments: complete.then(|| call.arguments.clone()),
        })
    }

    /// Mark every still-open call complete, in first-seen order. Each call is
    /// flushed at most once.
    pub fn flush(&mut self) -> Vec<StreamEvent> {
        self.calls
            .iter_mut()
            .filter(|c| !c.complete)
            .map(|call| {
                call.complete = true;
                if call.arguments.trim().is_empty() {
                    call.arguments = "{}".into();
                }
                StreamEvent::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    fragment: String::new(),
                    is_complete: true,
                    arguments: Some(call.arguments.clone()),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brace_balance_ignores_braces_in_strings() {
        let d = BraceBalance;
        assert!(!d.is_complete(r#"{"query": "a } b"#));
        assert!(!d.is_complete(r#"{"query": "a } b""#));
        assert!(d.is_complete(r#"{"query": "a } b"}"#));
        assert!(!d.is_complete(r#"{"q": "say \"}\" now"#));
        assert!(d.is_complete(r#"{"q": "say \"}\" now"}"#));
    }

    #[test]
    fn test_brace_balance_nested() {
        let d = BraceBalance;
        assert!(!d.is_complete(r#"{"a": {"b": 1}"#));
        assert!(d.is_complete(r#"{"a": {"b": [1, {"c": 2}]}}"#));
        assert!(!d.is_complete(""));
        assert!(!d.is_complete("}"));
    }

    #[test]
    fn test_strict_json_requires_object() {
        let d = StrictJson;
        assert!(d.is_complete(r#"{"a": 1}"#));
        assert!(!d.is_complete(r#"{"a": "#));
        assert!(!d.is_complete("[1, 2]"));
    }

    #[test]
    fn test_detector_lookup() {
        assert_eq!(detector_by_name("strict_json").unwrap().name(), "strict_json");
        assert!(detector_by_name("closing_brace").is_none());
    }

    #[test]
    fn test_buffer_completes_on_last_fragment() {
        let mut buf = ToolCallBuffer::new(Arc::new(BraceBalance));
        let first = buf
            .push("0", Some("call_a".into()), Some("web_search".into()), r#"{"query":"#)
            .unwrap();
        assert!(matches!(first, StreamEvent::ToolCall { is_complete: false, .. }));

        let last = buf.push("0", None, None, r#" "x"}"#).unwrap();
        match last {
            StreamEvent::ToolCall {
                id,
                name,
                is_complete,
                arguments,
                ..
            } => {
                assert_eq!(id, "call_a");
                assert_eq!(name, "web_search");
                assert!(is_complete);
                assert_eq!(arguments.as_deref(), Some(r#"{"query": "x"}"#));
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert!(buf.push("0", None, None, "  ").is_none());
        assert!(buf.flush().is_empty());
    }

    #[test]
    fn test_flush_closes_open_calls_once() {
        let mut buf = ToolCallBuffer::new(Arc::new(BraceBalance));
        buf.push("0", Some("a".into()), Some("t1".into()), r#"{"x": 1"#);
        buf.push("1", Some("b".into()), Some("t2".into()), "");

        let flushed = buf.flush();
        assert_eq!(flushed.len(), 2);
        match &flushed[1] {
            StreamEvent::ToolCall { id, arguments, .. } => {
                assert_eq!(id, "b");
                assert_eq!(arguments.as_deref(), Some("{}"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(buf.flush().is_empty());
    }

    #[test]
    fn test_missing_id_is_synthesized() {
        let mut buf = ToolCallBuffer::new(Arc::new(StrictJson));
        let ev = buf.push("2", None, Some("calc".into()), "{}").unwrap();
        assert!(matches!(ev, StreamEvent::ToolCall { ref id, is_complete: true, .. } if id == "call_2"));
    }
}
