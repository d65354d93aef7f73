// ABOUTME: Core event type definitions for the streaming protocol
// ABOUTME: Closed discriminated event set with exactly four terminal variants

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The four event kinds that end a stream. This set is closed: consumers
/// and producers must agree on it exactly, and no other kind terminates.
pub const TERMINAL_KINDS: [&str; 4] = ["done", "error", "typed_error", "aborted"];

/// A single event in a session's output stream.
///
/// `seq` increases monotonically within one session and is never reused;
/// subscribers rely on it for reattachment continuity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub session_id: String,
    /// Position within the session's stream, starting at 1.
    pub seq: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Discriminated payload of a stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Plain assistant text, accumulated into the trailing text item.
    Text { text: String },
    /// Agent invoked a tool.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// Result of a prior tool invocation.
    ToolResult {
        tool_use_id: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
    /// Extended reasoning emitted by the agent.
    Thinking { text: String },
    /// Non-fatal condition (malformed input, degraded behavior).
    Warning(WarningPayload),
    /// Infrastructure-level failure. Terminal.
    Error { message: String },
    /// Agent-reported failure with a machine-readable code. Terminal.
    TypedError { code: String, message: String },
    /// Successful completion. Terminal.
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    /// Execution was aborted by an explicit request. Terminal.
    Aborted,
    /// Session lifecycle notification (title changed, context compacted).
    SessionEvent { name: String, data: Value },
}

impl EventPayload {
    /// Whether this payload ends the stream. Exactly the four kinds in
    /// [`TERMINAL_KINDS`] return true; the set must not drift.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventPayload::Done { .. }
                | EventPayload::Error { .. }
                | EventPayload::TypedError { .. }
                | EventPayload::Aborted
        )
    }

    /// Stable lowercase tag for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::Text { .. } => "text",
            EventPayload::ToolUse { .. } => "tool_use",
            EventPayload::ToolResult { .. } => "tool_result",
            EventPayload::Thinking { .. } => "thinking",
            EventPayload::Warning(_) => "warning",
            EventPayload::Error { .. } => "error",
            EventPayload::TypedError { .. } => "typed_error",
            EventPayload::Done { .. } => "done",
            EventPayload::Aborted => "aborted",
            EventPayload::SessionEvent { .. } => "session_event",
        }
    }
}

/// Fixed warning shape. `details` holds strings only; translation filters
/// out anything else so a malformed upstream payload cannot reach consumers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WarningPayload {
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub details: Vec<String>,
}

/// One entry in a session's ordered accumulated-content buffer.
///
/// Content items are what a reattaching consumer receives as its snapshot;
/// terminal events and session notifications are not content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentItem {
    Text { text: String },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        output: String,
        is_error: bool,
    },
    Thinking { text: String },
    Warning(WarningPayload),
}
