//! Assembles a streamed response.

use std::collections::BTreeMap;

use serde_json::Value;
use storage::ToolCallRecord;
use tracing::warn;
use uuid::Uuid;

use crate::backend::{Fragment, ToolCallDelta};

/// Text to show live, produced by [`StreamAccumulator::on_fragment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextUpdate {
    pub text: String,
    /// True for the first text of the response: display starts a new message.
    pub starts_message: bool,
}

/// A complete, well-formed tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Parsed arguments; always a JSON object.
    pub arguments: Value,
    /// Arguments exactly as streamed.
    pub raw_arguments: String,
}

impl ToolCallRequest {
    pub fn record(&self) -> ToolCallRecord {
        ToolCallRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments: self.raw_arguments.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Per-call accumulation state.
///
/// Text only grows. A tool call slot exists from the first delta carrying its
/// index; later deltas append to its name and arguments.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    calls: BTreeMap<usize, PartialCall>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one fragment. Returns the text to display, if any.
    pub fn on_fragment(&mut self, fragment: Fragment) -> Option<TextUpdate> {
        match fragment {
            Fragment::Text(text) if text.is_empty() => None,
            Fragment::Text(text) => {
                let starts_message = self.text.is_empty();
                self.text.push_str(&text);
                Some(TextUpdate {
                    text,
                    starts_message,
                })
            }
            Fragment::ToolCall(delta) => {
                self.apply(delta);
                None
            }
        }
    }

    fn apply(&mut self, delta: ToolCallDelta) {
        let call = self.calls.entry(delta.index).or_default();
        if let (Some(id), true) = (delta.id, call.id.is_empty()) {
            call.id = id;
        }
        if let Some(name) = delta.name {
            call.name.push_str(&name);
        }
        if let Some(arguments) = delta.arguments {
            call.arguments.push_str(&arguments);
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// The answer text and the well-formed tool calls in index order.
    ///
    /// Calls without a name, without arguments, or whose arguments are not a
    /// JSON object are dropped with a warning.
    pub fn finalize(self) -> (String, Vec<ToolCallRequest>) {
        let mut requests = Vec::with_capacity(self.calls.len());
        for (index, call) in self.calls {
            if call.name.is_empty() || call.arguments.trim().is_empty() {
                warn!(index, name = %call.name, "Skipping incomplete tool call");
                continue;
            }
            let arguments = match serde_json::from_str::<Value>(&call.arguments) {
                Ok(value @ Value::Object(_)) => value,
                Ok(_) => {
                    warn!(index, name = %call.name, "Skipping tool call: arguments are not an object");
                    continue;
                }
                Err(e) => {
                    warn!(index, name = %call.name, "Skipping tool call with malformed arguments: {e}");
                    continue;
                }
            };
            let id = if call.id.is_empty() {
                format!("call_{}", Uuid::new_v4().simple())
            } else {
                call.id
            };
            requests.push(ToolCallRequest {
                id,
                name: call.name,
                arguments,
                raw_arguments: call.arguments,
            });
        }
        (self.text, requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta(index: usize, name: Option<&str>, arguments: Option<&str>) -> Fragment {
        Fragment::ToolCall(ToolCallDelta {
            index,
            id: None,
            name: name.map(String::from),
            arguments: arguments.map(String::from),
        })
    }

    #[test]
    fn text_is_concatenated_and_first_update_starts_message() {
        let mut acc = StreamAccumulator::new();
        let first = acc.on_fragment(Fragment::Text("Here ".into())).unwrap();
        assert!(first.starts_message);
        assert_eq!(acc.on_fragment(Fragment::Text(String::new())), None);
        let second = acc.on_fragment(Fragment::Text("it is.".into())).unwrap();
        assert!(!second.starts_message);
        assert_eq!(second.text, "it is.");

        let (text, calls) = acc.finalize();
        assert_eq!(text, "Here it is.");
        assert!(calls.is_empty());
    }

    #[test]
    fn interleaved_indices_accumulate_independently() {
        let mut acc = StreamAccumulator::new();
        acc.on_fragment(Fragment::ToolCall(ToolCallDelta {
            index: 2,
            id: Some("c2".into()),
            name: Some("wri".into()),
            arguments: Some("{\"n\":".into()),
        }));
        acc.on_fragment(delta(0, Some("read"), Some("{\"n\"")));
        acc.on_fragment(delta(2, Some("te"), Some("2}")));
        acc.on_fragment(delta(0, None, Some(":0}")));
        acc.on_fragment(delta(1, Some("stat"), Some("{}")));

        let (_, calls) = acc.finalize();
        let names: Vec<_> = calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["read", "stat", "write"]);
        assert_eq!(calls[0].arguments, json!({"n": 0}));
        assert_eq!(calls[2].arguments, json!({"n": 2}));
        assert_eq!(calls[2].id, "c2");
        assert!(calls[0].id.starts_with("call_"));
    }

    #[test]
    fn id_is_set_once() {
        let mut acc = StreamAccumulator::new();
        acc.on_fragment(Fragment::ToolCall(ToolCallDelta {
            index: 0,
            id: Some("first".into()),
            name: Some("x".into()),
            arguments: Some("{}".into()),
        }));
        acc.on_fragment(Fragment::ToolCall(ToolCallDelta {
            index: 0,
            id: Some("second".into()),
            ..Default::default()
        }));
        let (_, calls) = acc.finalize();
        assert_eq!(calls[0].id, "first");
    }

    #[test]
    fn malformed_calls_are_skipped() {
        let mut acc = StreamAccumulator::new();
        acc.on_fragment(delta(0, None, Some("{}")));
        acc.on_fragment(delta(1, Some("no_args"), None));
        acc.on_fragment(delta(2, Some("truncated"), Some("{\"path\":")));
        acc.on_fragment(delta(3, Some("array"), Some("[1,2]")));
        acc.on_fragment(delta(4, Some("good"), Some("{\"ok\":true}")));

        let (_, calls) = acc.finalize();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "good");
        assert_eq!(calls[0].record().arguments, "{\"ok\":true}");
    }
}
