// ABOUTME: Error types for sandbox operations
// ABOUTME: Boundary validation, engine failures, and execution timeouts

use crate::engine::EngineError;
use thiserror::Error;

/// Main error type for sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Externally derived identifier failed the allow-pattern.
    /// Rejected at the boundary, never sanitized and continued.
    #[error("Invalid identifier: {0}")]
    Validation(String),

    /// Container engine call failed; carries the adapter's classification.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// No live execution context for the given name.
    #[error("Execution context not found: {0}")]
    ContextNotFound(String),

    /// Ephemeral execution exceeded its wall-clock bound and was
    /// force-terminated.
    #[error("Execution timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;
