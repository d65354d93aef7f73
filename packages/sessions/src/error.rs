// ABOUTME: Error types for session orchestration
// ABOUTME: Busy and validation fail synchronously; everything else lands on the stream

use crate::store::StoreError;
use corral_sandbox::SandboxError;
use thiserror::Error;

/// Main error type for orchestrator operations
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The session already has an execution in flight. The new request is
    /// rejected immediately, never queued.
    #[error("Session {0} already has an execution in flight")]
    Busy(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Sandbox-boundary failure, including identifier validation.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// Persistence-boundary failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No in-flight execution to abort.
    #[error("Session {0} is not streaming")]
    NotStreaming(String),
}

/// Type alias for Results that return OrchestratorError
pub type Result<T> = std::result::Result<T, OrchestratorError>;
