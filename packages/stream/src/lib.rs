// ABOUTME: Typed stream events and agent output translation
// ABOUTME: Turns line-delimited JSON from sandboxed agents into a closed event set

pub mod event;
pub mod translator;

// Re-export commonly used types
pub use event::{ContentItem, EventPayload, StreamEvent, WarningPayload, TERMINAL_KINDS};
pub use translator::{Accumulator, Translator};
