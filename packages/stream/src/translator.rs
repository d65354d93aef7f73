// ABOUTME: Line-to-event translation and content accumulation
// ABOUTME: One JSON object per line; malformed lines become warnings, never failures

use crate::event::{ContentItem, EventPayload, WarningPayload};
use serde_json::Value;
use tracing::{debug, warn};

/// Translates raw output lines from a sandboxed agent process into typed
/// event payloads.
///
/// Parsing is per-line and never aborts the stream: a line that is not a
/// JSON object, or whose shape is unrecognized, is surfaced as a `warning`
/// payload and processing continues.
#[derive(Debug, Default)]
pub struct Translator;

impl Translator {
    pub fn new() -> Self {
        Self
    }

    /// Translate one raw line. Returns `None` for blank lines.
    pub fn translate_line(&self, raw: &str) -> Option<EventPayload> {
        let line = raw.trim();
        if line.is_empty() {
            return None;
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!("Skipping malformed output line: {}", e);
                return Some(EventPayload::Warning(WarningPayload {
                    title: "Malformed output".to_string(),
                    message: format!("Output line was not valid JSON: {}", e),
                    details: vec![truncate_for_report(line)],
                }));
            }
        };

        let kind = value.get("type").and_then(Value::as_str).unwrap_or("");

        // Warnings get lenient handling: the fixed {title, message, details}
        // shape is rebuilt field by field and non-string detail elements are
        // dropped rather than propagated.
        if kind == "warning" {
            return Some(EventPayload::Warning(sanitize_warning(&value)));
        }

        match serde_json::from_value::<EventPayload>(value.clone()) {
            Ok(payload) => {
                debug!(kind = payload.kind(), "Translated agent event");
                Some(payload)
            }
            Err(e) => {
                warn!("Skipping unrecognized output object (type={:?}): {}", kind, e);
                Some(EventPayload::Warning(WarningPayload {
                    title: "Unrecognized event".to_string(),
                    message: format!("Output object of type {:?} was not understood", kind),
                    details: vec![truncate_for_report(line)],
                }))
            }
        }
    }
}

/// Rebuild a warning payload from raw JSON, keeping only string `details`.
fn sanitize_warning(value: &Value) -> WarningPayload {
    let details = value
        .get("details")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|d| d.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    WarningPayload {
        title: value
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("Warning")
            .to_string(),
        message: value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        details,
    }
}

fn truncate_for_report(line: &str) -> String {
    const MAX: usize = 200;
    if line.len() <= MAX {
        line.to_string()
    } else {
        let mut end = MAX;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &line[..end])
    }
}

/// Ordered content accumulation shared by every delivery path.
///
/// Both live translation and reattachment replay go through [`apply`], so
/// a reattaching consumer reconstructs exactly what a from-the-start
/// consumer observed.
///
/// [`apply`]: Accumulator::apply
#[derive(Debug, Default, Clone)]
pub struct Accumulator {
    content: Vec<ContentItem>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a previously persisted content buffer.
    pub fn from_content(content: Vec<ContentItem>) -> Self {
        Self { content }
    }

    /// Fold one event payload into the content buffer.
    ///
    /// Text extends the trailing text item only; if the trailing item is a
    /// tool or thinking item, a fresh text item is started instead.
    /// Terminal events and session notifications carry no content.
    pub fn apply(&mut self, payload: &EventPayload) {
        match payload {
            EventPayload::Text { text } => match self.content.last_mut() {
                Some(ContentItem::Text { text: existing }) => existing.push_str(text),
                _ => self.content.push(ContentItem::Text { text: text.clone() }),
            },
            EventPayload::ToolUse { id, name, input } => {
                self.content.push(ContentItem::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                });
            }
            EventPayload::ToolResult {
                tool_use_id,
                output,
                is_error,
            } => {
                self.content.push(ContentItem::ToolResult {
                    tool_use_id: tool_use_id.clone(),
                    output: output.clone(),
                    is_error: *is_error,
                });
            }
            EventPayload::Thinking { text } => {
                self.content.push(ContentItem::Thinking { text: text.clone() });
            }
            EventPayload::Warning(w) => {
                self.content.push(ContentItem::Warning(w.clone()));
            }
            EventPayload::Error { .. }
            | EventPayload::TypedError { .. }
            | EventPayload::Done { .. }
            | EventPayload::Aborted
            | EventPayload::SessionEvent { .. } => {}
        }
    }

    pub fn content(&self) -> &[ContentItem] {
        &self.content
    }

    pub fn snapshot(&self) -> Vec<ContentItem> {
        self.content.clone()
    }
}
