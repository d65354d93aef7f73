// ABOUTME: Execution engine boundary trait and tagged error classification
// ABOUTME: Retryability is decided on an explicit kind, never on an error type's name

use crate::types::{ContainerSpec, ContainerState};
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use thiserror::Error;

/// Classification a failed engine call carries across the boundary.
///
/// The adapter assigns the kind from engine status codes at the point of
/// failure; callers branch on it and never inspect message text or
/// platform-specific error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorKind {
    /// Resource does not exist.
    NotFound,
    /// Resource already exists or is in a conflicting state.
    Conflict,
    /// Authentication or authorization failure. Fatal, never retried.
    PermissionDenied,
    /// Engine throttled the call. Transient.
    RateLimited,
    /// Engine unreachable or failing internally. Transient.
    Unavailable,
    /// Anything else.
    Other,
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineErrorKind::NotFound => "not_found",
            EngineErrorKind::Conflict => "conflict",
            EngineErrorKind::PermissionDenied => "permission_denied",
            EngineErrorKind::RateLimited => "rate_limited",
            EngineErrorKind::Unavailable => "unavailable",
            EngineErrorKind::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// Engine call failure with its tagged classification.
#[derive(Error, Debug, Clone)]
#[error("Engine error ({kind}): {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether a bounded retry is worthwhile. Permission and validation
    /// classes are fatal for the invocation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            EngineErrorKind::RateLimited | EngineErrorKind::Unavailable
        )
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Lazy sequence of raw output lines from a container process. Never holds
/// the whole output; each item is one line without its trailing newline.
pub type RawLineStream = Pin<Box<dyn Stream<Item = EngineResult<String>> + Send>>;

/// Summary of one engine-side container.
#[derive(Debug, Clone)]
pub struct EngineContainer {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub labels: HashMap<String, String>,
}

/// Boundary to the external container engine.
///
/// Every operation that creates a container takes the full [`ContainerSpec`],
/// hardening included; the adapter translates it without weakening it.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Verify the engine is reachable.
    async fn ping(&self) -> EngineResult<()>;

    /// Create a container from a spec. Returns the engine container id.
    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String>;

    async fn start_container(&self, container_id: &str) -> EngineResult<()>;

    async fn stop_container(&self, container_id: &str, timeout_secs: i64) -> EngineResult<()>;

    async fn remove_container(&self, container_id: &str, force: bool) -> EngineResult<()>;

    /// List containers matching all given `label=value` filters, including
    /// stopped ones.
    async fn list_containers(
        &self,
        label_filters: &[(String, String)],
    ) -> EngineResult<Vec<EngineContainer>>;

    /// Look up one container by name or id. `Ok(None)` when absent.
    async fn inspect_container(&self, name_or_id: &str)
        -> EngineResult<Option<EngineContainer>>;

    /// Run a command inside a running container, feeding `stdin` if given,
    /// and return its stdout lazily as lines. Stderr is logged, not
    /// streamed; the agent protocol lives on stdout.
    async fn exec_streamed(
        &self,
        container_id: &str,
        command: Vec<String>,
        env: Vec<String>,
        stdin: Option<String>,
    ) -> EngineResult<RawLineStream>;

    /// Run a short command inside a running container to completion and
    /// return its exit code. Output is discarded.
    async fn run_exec(&self, container_id: &str, command: Vec<String>) -> EngineResult<i64>;

    /// Block until the container's main process exits; returns the exit
    /// code.
    async fn wait_container(&self, container_id: &str) -> EngineResult<i64>;

    /// Stream the container's own stdout/stderr as lines.
    async fn container_logs(&self, container_id: &str, follow: bool)
        -> EngineResult<RawLineStream>;
}
