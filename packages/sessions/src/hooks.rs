// ABOUTME: Hook boundary for lifecycle extension points
// ABOUTME: Hooks run off the orchestrator's path; failures are logged, vetoes are honored

use async_trait::async_trait;
use serde_json::Value;

/// Fired before a message is dispatched to the sandbox. A vetoing outcome
/// stops the send.
pub const PRE_SEND: &str = "pre_send";

/// Fired after a stream reaches its terminal event. Outcomes are ignored.
pub const SESSION_COMPLETED: &str = "session_completed";

/// Result of one hook invocation.
#[derive(Debug, Clone, Default)]
pub struct HookOutcome {
    /// Identifier of the hook that produced this outcome.
    pub hook: String,
    /// A reason here vetoes the operation.
    pub veto: Option<String>,
    /// A failure message; non-fatal, logged by the caller.
    pub error: Option<String>,
}

impl HookOutcome {
    pub fn vetoed(&self) -> bool {
        self.veto.is_some()
    }
}

/// External hook dispatch boundary.
///
/// Implementations may perform arbitrary I/O; the orchestrator always
/// dispatches `fire` on its own task so a slow hook cannot stall delivery
/// for other sessions.
#[async_trait]
pub trait HookRunner: Send + Sync {
    async fn fire(&self, event: &str, payload: Value) -> Vec<HookOutcome>;
}

/// Hook runner with no hooks registered.
pub struct NoopHooks;

#[async_trait]
impl HookRunner for NoopHooks {
    async fn fire(&self, _event: &str, _payload: Value) -> Vec<HookOutcome> {
        Vec::new()
    }
}
