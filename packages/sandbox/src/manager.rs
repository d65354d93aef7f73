// ABOUTME: Sandbox lifecycle manager for execution contexts
// ABOUTME: Idempotent ensure, hardened one-shot runs, streaming, and parallel reconciliation

use crate::engine::{EngineResult, ExecutionEngine, RawLineStream};
use crate::error::{Result, SandboxError};
use crate::types::{
    ContainerSpec, ContainerState, ContextKind, ContextRef, EphemeralOutcome,
    ExecutionContextRecord, ReconcileFailure, ReconcileReport, SandboxConfig,
};
use crate::validate::SlugValidator;
use chrono::Utc;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Labels applied to every Corral-managed container for discovery
const MANAGED_LABEL: &str = "corral.managed";
const WORKSPACE_LABEL: &str = "corral.workspace";
const KIND_LABEL: &str = "corral.kind";

/// Bounded retry for transient engine failures
const MAX_ENGINE_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 100;

/// Input for one streamed agent invocation inside a persistent context.
#[derive(Debug, Clone)]
pub struct StreamInput {
    /// Message delivered to the agent on stdin.
    pub message: String,
    /// Environment for the agent process (session id, workspace id, trust).
    pub env: HashMap<String, String>,
}

/// Manages isolated execution contexts against the container engine.
///
/// Both context kinds build their container spec through one constructor,
/// so the hardening applied to an ephemeral run is always the exact set
/// applied to the workspace's persistent context.
pub struct SandboxManager {
    engine: Arc<dyn ExecutionEngine>,
    config: SandboxConfig,
    validator: SlugValidator,
    /// name -> record for contexts this process knows about. Mutated by
    /// ensure/stop per-name and by reconcile under `reconcile_lock`.
    registry: RwLock<HashMap<String, ExecutionContextRecord>>,
    /// Serializes reconciliation passes against each other.
    reconcile_lock: Mutex<()>,
}

impl SandboxManager {
    pub fn new(engine: Arc<dyn ExecutionEngine>, config: SandboxConfig) -> Self {
        Self {
            engine,
            config,
            validator: SlugValidator::new(),
            registry: RwLock::new(HashMap::new()),
            reconcile_lock: Mutex::new(()),
        }
    }

    /// Connect to the local Docker daemon and build a manager on top of it.
    pub async fn connect(config: SandboxConfig) -> Result<Self> {
        let engine = crate::docker::DockerEngine::new().await?;
        Ok(Self::new(Arc::new(engine), config))
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn persistent_name(slug: &str) -> String {
        format!("corral-ws-{}", slug)
    }

    fn ephemeral_name(slug: &str) -> String {
        format!("corral-eph-{}-{}", slug, nanoid::nanoid!(8))
    }

    /// Single source of the container spec for both context kinds.
    ///
    /// Hardening and resource ceilings come from one config; cache mounts
    /// are always paired with the environment variable that activates them,
    /// since the mount alone has no effect.
    fn container_spec(
        &self,
        kind: ContextKind,
        slug: &str,
        name: &str,
        command: Option<Vec<String>>,
    ) -> ContainerSpec {
        let mut env = HashMap::new();
        let mut binds = Vec::new();

        if let Some(root) = &self.config.vault_root {
            binds.push(format!(
                "{}/{}:{}:rw",
                root.trim_end_matches('/'),
                slug,
                self.config.vault_mount
            ));
        }

        for cache in &self.config.cache_mounts {
            binds.push(format!("{}:{}", cache.volume, cache.container_path));
            env.insert(cache.env_var.clone(), cache.container_path.clone());
        }

        let labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (WORKSPACE_LABEL.to_string(), slug.to_string()),
            (KIND_LABEL.to_string(), kind.as_str().to_string()),
        ]);

        ContainerSpec {
            name: name.to_string(),
            image: self.config.image.clone(),
            command,
            env,
            working_dir: Some(self.config.vault_mount.clone()),
            labels,
            binds,
            hardening: self.config.hardening.clone(),
            limits: self.config.limits.clone(),
        }
    }

    /// Idempotently return a live persistent context for the workspace.
    ///
    /// The slug is validated before any engine call. A running container is
    /// reused, a stopped one is restarted, and anything unsalvageable is
    /// replaced with a freshly hardened one.
    pub async fn ensure_persistent(&self, workspace_slug: &str) -> Result<ContextRef> {
        self.validator.validate("workspace slug", workspace_slug)?;

        let name = Self::persistent_name(workspace_slug);

        if let Some(existing) = self.engine.inspect_container(&name).await? {
            match existing.state {
                ContainerState::Running => {
                    debug!("Reusing running context {}", name);
                    return Ok(self
                        .adopt(workspace_slug, &name, existing.id, ContextKind::Persistent)
                        .await);
                }
                ContainerState::Created | ContainerState::Exited => {
                    info!("Restarting stopped context {}", name);
                    self.with_retry("start container", || {
                        self.engine.start_container(&existing.id)
                    })
                    .await?;
                    return Ok(self
                        .adopt(workspace_slug, &name, existing.id, ContextKind::Persistent)
                        .await);
                }
                state => {
                    warn!(
                        "Context {} in unusable state {:?}, replacing it",
                        name, state
                    );
                    self.engine.remove_container(&existing.id, true).await?;
                }
            }
        }

        // A persistent context idles between messages; the init supervisor
        // is PID 1 and the agent is exec'd in per message.
        let spec = self.container_spec(
            ContextKind::Persistent,
            workspace_slug,
            &name,
            Some(vec!["sleep".to_string(), "infinity".to_string()]),
        );

        let container_id = self
            .with_retry("create container", || self.engine.create_container(&spec))
            .await?;
        self.with_retry("start container", || {
            self.engine.start_container(&container_id)
        })
        .await?;

        info!(
            workspace = workspace_slug,
            container = %container_id,
            "Created persistent execution context"
        );

        Ok(self
            .adopt(workspace_slug, &name, container_id, ContextKind::Persistent)
            .await)
    }

    /// One-shot hardened execution of a command for a workspace.
    ///
    /// Applies the identical hardening set as [`ensure_persistent`] — the
    /// command runs the same class of untrusted code. The container is
    /// destroyed on completion; exceeding the wall-clock bound force-
    /// terminates it and surfaces [`SandboxError::Timeout`].
    ///
    /// [`ensure_persistent`]: SandboxManager::ensure_persistent
    pub async fn run_ephemeral(
        &self,
        workspace_slug: &str,
        command: Vec<String>,
    ) -> Result<EphemeralOutcome> {
        self.validator.validate("workspace slug", workspace_slug)?;

        let name = Self::ephemeral_name(workspace_slug);
        let spec = self.container_spec(
            ContextKind::Ephemeral,
            workspace_slug,
            &name,
            Some(command),
        );

        let container_id = self
            .with_retry("create container", || self.engine.create_container(&spec))
            .await?;
        self.adopt(
            workspace_slug,
            &name,
            container_id.clone(),
            ContextKind::Ephemeral,
        )
        .await;

        let result = self.drive_ephemeral(&container_id).await;

        // The context record and container never outlive the run.
        if let Err(e) = self.engine.remove_container(&container_id, true).await {
            warn!(
                "Failed to remove ephemeral container {}: {}",
                container_id, e
            );
        }
        self.registry.write().await.remove(&name);

        result
    }

    async fn drive_ephemeral(&self, container_id: &str) -> Result<EphemeralOutcome> {
        self.with_retry("start container", || {
            self.engine.start_container(container_id)
        })
        .await?;

        let logs = self.engine.container_logs(container_id, true).await?;
        let collector = tokio::spawn(async move {
            let mut lines = Vec::new();
            let mut logs = logs;
            while let Some(line) = logs.next().await {
                match line {
                    Ok(line) => lines.push(line),
                    Err(e) => {
                        warn!("Ephemeral log stream failed: {}", e);
                        break;
                    }
                }
            }
            lines
        });

        let timeout = Duration::from_secs(self.config.limits.timeout_seconds);
        match tokio::time::timeout(timeout, self.engine.wait_container(container_id)).await {
            Ok(Ok(exit_code)) => {
                let output = collector.await.unwrap_or_default();
                Ok(EphemeralOutcome { exit_code, output })
            }
            Ok(Err(e)) => {
                collector.abort();
                Err(e.into())
            }
            Err(_) => {
                collector.abort();
                warn!(
                    "Ephemeral container {} exceeded {}s, force-terminating",
                    container_id, self.config.limits.timeout_seconds
                );
                if let Err(e) = self.engine.stop_container(container_id, 0).await {
                    warn!("Force stop of {} failed: {}", container_id, e);
                }
                Err(SandboxError::Timeout {
                    seconds: self.config.limits.timeout_seconds,
                })
            }
        }
    }

    /// Attach the agent process to a persistent context and stream its raw
    /// output lines. Nothing is buffered beyond the line in progress.
    pub async fn stream(&self, ctx: &ContextRef, input: StreamInput) -> Result<RawLineStream> {
        self.touch(&ctx.name).await;

        let env: Vec<String> = input
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let stream = self
            .engine
            .exec_streamed(
                &ctx.container_id,
                self.config.agent_command.clone(),
                env,
                Some(input.message),
            )
            .await?;

        Ok(stream)
    }

    /// Best-effort interruption of the agent process inside a context.
    /// The context itself stays alive for future messages.
    pub async fn interrupt(&self, ctx: &ContextRef) {
        let agent = self
            .config
            .agent_command
            .first()
            .cloned()
            .unwrap_or_default();
        let command = vec![
            "pkill".to_string(),
            "-INT".to_string(),
            "-f".to_string(),
            agent,
        ];
        if let Err(e) = self.engine.run_exec(&ctx.container_id, command).await {
            warn!("Failed to interrupt agent in {}: {}", ctx.name, e);
        }
    }

    /// Stop a workspace's persistent context if it exists. Idempotent; the
    /// stopped container is restarted by the next `ensure_persistent`.
    pub async fn stop_persistent(&self, workspace_slug: &str) -> Result<()> {
        self.validator.validate("workspace slug", workspace_slug)?;

        let name = Self::persistent_name(workspace_slug);
        if let Some(existing) = self.engine.inspect_container(&name).await? {
            self.engine.stop_container(&existing.id, 10).await?;
            info!("Stopped persistent context {}", name);
        }
        self.registry.write().await.remove(&name);
        Ok(())
    }

    /// Remove every managed container no longer referenced by a live
    /// workspace, plus finished ephemeral leftovers.
    ///
    /// Removals fan out with bounded parallelism, so total wall-clock time
    /// approaches the slowest single removal rather than their sum. A
    /// failed removal is reported independently and blocks nothing else.
    pub async fn reconcile(&self, live_workspaces: &HashSet<String>) -> Result<ReconcileReport> {
        let _guard = self.reconcile_lock.lock().await;

        let containers = self
            .engine
            .list_containers(&[(MANAGED_LABEL.to_string(), "true".to_string())])
            .await?;

        let examined = containers.len();
        let stale: Vec<_> = containers
            .into_iter()
            .filter(|c| {
                match c.labels.get(WORKSPACE_LABEL) {
                    // Managed but unlabeled: nothing can reference it.
                    None => true,
                    Some(ws) => {
                        if !live_workspaces.contains(ws) {
                            return true;
                        }
                        // Finished one-shots are leftovers even for live
                        // workspaces (normally destroyed at completion).
                        c.labels.get(KIND_LABEL).map(String::as_str)
                            == Some(ContextKind::Ephemeral.as_str())
                            && c.state != ContainerState::Running
                    }
                }
            })
            .collect();

        if stale.is_empty() {
            debug!(
                "Reconcile pass found no stale contexts ({} examined)",
                examined
            );
            return Ok(ReconcileReport {
                examined,
                ..Default::default()
            });
        }

        info!(
            "Reconciling {} stale contexts ({} examined)",
            stale.len(),
            examined
        );

        let parallelism = self.config.reconcile_parallelism.max(1);
        let results: Vec<(String, EngineResult<()>)> =
            futures_util::stream::iter(stale.into_iter().map(|container| {
                let engine = Arc::clone(&self.engine);
                async move {
                    // Try a short graceful stop first; removal is forced
                    // either way.
                    let _ = engine.stop_container(&container.id, 5).await;
                    let outcome = engine.remove_container(&container.id, true).await;
                    (container.name, outcome)
                }
            }))
            .buffer_unordered(parallelism)
            .collect()
            .await;

        let mut report = ReconcileReport {
            examined,
            ..Default::default()
        };
        let mut registry = self.registry.write().await;
        for (name, outcome) in results {
            match outcome {
                Ok(()) => {
                    registry.remove(&name);
                    report.removed.push(name);
                }
                Err(e) => {
                    warn!("Failed to remove stale context {}: {}", name, e);
                    report.failed.push(ReconcileFailure {
                        name,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Reconcile pass removed {} contexts, {} failures",
            report.removed.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Snapshot of the contexts this process is tracking.
    pub async fn contexts(&self) -> Vec<ExecutionContextRecord> {
        self.registry.read().await.values().cloned().collect()
    }

    /// Look up the tracked persistent context for a workspace.
    pub async fn get_context(&self, workspace_slug: &str) -> Result<ContextRef> {
        self.validator.validate("workspace slug", workspace_slug)?;
        let name = Self::persistent_name(workspace_slug);
        let registry = self.registry.read().await;
        registry
            .get(&name)
            .map(|r| ContextRef {
                name: r.name.clone(),
                container_id: r.container_id.clone(),
                workspace: r.workspace.clone(),
                kind: r.kind,
            })
            .ok_or(SandboxError::ContextNotFound(name))
    }

    /// Validate an externally derived identifier with this manager's
    /// compiled allow-pattern.
    pub fn validate_identifier(&self, kind: &str, value: &str) -> Result<()> {
        self.validator.validate(kind, value)
    }

    async fn adopt(
        &self,
        workspace: &str,
        name: &str,
        container_id: String,
        kind: ContextKind,
    ) -> ContextRef {
        let now = Utc::now();
        let mut registry = self.registry.write().await;
        let record = registry
            .entry(name.to_string())
            .or_insert_with(|| ExecutionContextRecord {
                name: name.to_string(),
                container_id: container_id.clone(),
                workspace: workspace.to_string(),
                kind,
                hardening: self.config.hardening.clone(),
                created_at: now,
                last_used_at: now,
            });
        record.container_id = container_id.clone();
        record.last_used_at = now;

        ContextRef {
            name: name.to_string(),
            container_id,
            workspace: workspace.to_string(),
            kind,
        }
    }

    async fn touch(&self, name: &str) {
        if let Some(record) = self.registry.write().await.get_mut(name) {
            record.last_used_at = Utc::now();
        }
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = EngineResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < MAX_ENGINE_ATTEMPTS => {
                    let delay = Duration::from_millis(RETRY_BASE_DELAY_MS << (attempt - 1));
                    warn!(
                        "{} failed ({}), retrying in {:?} (attempt {}/{})",
                        op, e, delay, attempt, MAX_ENGINE_ATTEMPTS
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
