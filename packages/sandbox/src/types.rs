// ABOUTME: Core type definitions for sandboxed execution contexts
// ABOUTME: Hardening flags, resource ceilings, context records, and reconciliation reports

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of isolated execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    /// One-shot context created for a single command, destroyed on completion
    Ephemeral,
    /// Long-lived context reused across messages for one workspace
    Persistent,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::Ephemeral => "ephemeral",
            ContextKind::Persistent => "persistent",
        }
    }
}

/// Security hardening applied to every isolated execution.
///
/// Ephemeral and persistent contexts for the same workspace receive this
/// exact set; both creation paths build their container spec through one
/// constructor so the sets cannot drift apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardeningConfig {
    /// Capabilities removed from the container ("ALL" by default).
    pub drop_capabilities: Vec<String>,
    /// Minimum capabilities added back, if any.
    pub add_capabilities: Vec<String>,
    /// Hard cap on concurrent processes inside the context.
    pub pids_limit: i64,
    /// Disables privilege escalation (setuid binaries, etc.).
    pub no_new_privileges: bool,
    /// Run an init supervisor as PID 1 to reap orphans.
    pub use_init: bool,
}

impl Default for HardeningConfig {
    fn default() -> Self {
        Self {
            drop_capabilities: vec!["ALL".to_string()],
            add_capabilities: Vec::new(),
            pids_limit: 256,
            no_new_privileges: true,
            use_init: true,
        }
    }
}

impl HardeningConfig {
    /// Engine `security_opt` entries for this flag set.
    pub fn security_options(&self) -> Vec<String> {
        let mut opts = Vec::new();
        if self.no_new_privileges {
            opts.push("no-new-privileges:true".to_string());
        }
        opts
    }
}

/// Resource ceilings for container execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in megabytes
    pub memory_mb: u64,
    /// CPU cores (can be fractional, e.g., 0.5 for half a core)
    pub cpu_cores: f64,
    /// Maximum wall-clock time for an ephemeral execution in seconds
    pub timeout_seconds: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpu_cores: 2.0,
            timeout_seconds: 3600,
        }
    }
}

/// Engine-side container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    /// Parse an engine state string ("running", "exited", ...).
    pub fn parse(state: &str) -> Self {
        match state.to_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }
}

/// A cache-style volume mount paired with the environment variable that
/// points the in-container tool at it. The mount is inert without the
/// variable, so the pair is kept together and applied together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMount {
    /// Named volume on the engine side.
    pub volume: String,
    /// Mount point inside the container.
    pub container_path: String,
    /// Environment variable that activates the cache path.
    pub env_var: String,
}

/// Everything the engine needs to create one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Entry command; `None` uses the image default.
    pub command: Option<Vec<String>>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub labels: HashMap<String, String>,
    /// Bind specs in engine `source:target[:mode]` form.
    pub binds: Vec<String>,
    pub hardening: HardeningConfig,
    pub limits: ResourceLimits,
}

/// Registry record for one live execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContextRecord {
    pub name: String,
    pub container_id: String,
    pub workspace: String,
    pub kind: ContextKind,
    /// Hardening set actually applied at creation.
    pub hardening: HardeningConfig,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// Cheap handle to a live execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRef {
    pub name: String,
    pub container_id: String,
    pub workspace: String,
    pub kind: ContextKind,
}

/// Result of a completed ephemeral execution.
#[derive(Debug, Clone)]
pub struct EphemeralOutcome {
    pub exit_code: i64,
    pub output: Vec<String>,
}

/// One failed removal during reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileFailure {
    pub name: String,
    pub error: String,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Managed containers examined.
    pub examined: usize,
    /// Names of stale contexts removed.
    pub removed: Vec<String>,
    /// Removals that failed; each is independent of the others.
    pub failed: Vec<ReconcileFailure>,
}

/// Sandbox manager configuration.
///
/// Defaults are production values; the environment overrides below are
/// validated and fall back to the default when out of range.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Image every execution context runs.
    /// Override: CORRAL_SANDBOX_IMAGE
    pub image: String,
    /// Mount point of the workspace vault inside containers.
    pub vault_mount: String,
    /// Host directory containing one subdirectory per workspace. `None`
    /// runs contexts without a vault bind (useful against fake engines).
    pub vault_root: Option<String>,
    /// Command exec'd inside a persistent context to run the agent.
    pub agent_command: Vec<String>,
    pub hardening: HardeningConfig,
    pub limits: ResourceLimits,
    pub cache_mounts: Vec<CacheMount>,
    /// Concurrent removals during reconciliation.
    /// Override: CORRAL_RECONCILE_PARALLELISM
    pub reconcile_parallelism: usize,
}

/// Default concurrent removals during a reconcile pass.
const DEFAULT_RECONCILE_PARALLELISM: usize = 4;

impl Default for SandboxConfig {
    fn default() -> Self {
        let image = std::env::var("CORRAL_SANDBOX_IMAGE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "corral/agent:latest".to_string());

        let reconcile_parallelism = std::env::var("CORRAL_RECONCILE_PARALLELISM")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| (1..=64).contains(&v))
            .unwrap_or(DEFAULT_RECONCILE_PARALLELISM);

        Self {
            image,
            vault_mount: "/vault".to_string(),
            vault_root: None,
            agent_command: vec!["corral-agent".to_string()],
            hardening: HardeningConfig::default(),
            limits: ResourceLimits::default(),
            cache_mounts: Vec::new(),
            reconcile_parallelism,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_hardening_is_fully_locked_down() {
        let hardening = HardeningConfig::default();
        assert_eq!(hardening.drop_capabilities, vec!["ALL".to_string()]);
        assert!(hardening.add_capabilities.is_empty());
        assert!(hardening.pids_limit > 0);
        assert!(hardening.no_new_privileges);
        assert!(hardening.use_init);
        assert_eq!(
            hardening.security_options(),
            vec!["no-new-privileges:true".to_string()]
        );
    }

    #[test]
    fn test_context_kind_labels() {
        assert_eq!(ContextKind::Ephemeral.as_str(), "ephemeral");
        assert_eq!(ContextKind::Persistent.as_str(), "persistent");
    }
}
