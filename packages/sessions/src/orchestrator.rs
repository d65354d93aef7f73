// ABOUTME: Session orchestrator, the single coordination point over the sandbox layer
// ABOUTME: Serializes per-session execution and guarantees one terminal event per stream

use crate::error::{OrchestratorError, Result};
use crate::hooks::{HookRunner, PRE_SEND, SESSION_COMPLETED};
use crate::locks::SessionLocks;
use crate::store::SessionStore;
use crate::types::{vault_relative, NewSession, Session, SessionState};
use chrono::Utc;
use corral_events::{Coalescer, SessionChannel, Snapshot, Subscription};
use corral_sandbox::{ReconcileReport, SandboxManager, StreamInput};
use corral_stream::{EventPayload, StreamEvent, Translator};
use futures_util::{Stream, StreamExt};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default minutes between background reconciliation passes.
/// Can be overridden via CORRAL_RECONCILE_INTERVAL_MINUTES.
const DEFAULT_RECONCILE_INTERVAL_MINUTES: u64 = 15;

/// The sole entry point through which external callers affect sandbox
/// state. API layers and bridge adapters hold an `Orchestrator` and never
/// touch the sandbox manager or the engine underneath it.
pub struct Orchestrator {
    sandbox: Arc<SandboxManager>,
    store: Arc<dyn SessionStore>,
    hooks: Arc<dyn HookRunner>,
    locks: SessionLocks,
    channels: Mutex<HashMap<String, Arc<SessionChannel>>>,
    /// Cancellation tokens for in-flight executions, keyed by session id.
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl Orchestrator {
    pub fn new(
        sandbox: Arc<SandboxManager>,
        store: Arc<dyn SessionStore>,
        hooks: Arc<dyn HookRunner>,
    ) -> Self {
        Self {
            sandbox,
            store,
            hooks,
            locks: SessionLocks::new(),
            channels: Mutex::new(HashMap::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    // ==================== Session CRUD ====================

    pub async fn create_session(&self, input: NewSession) -> Result<Session> {
        self.sandbox
            .validate_identifier("workspace slug", &input.workspace_id)?;

        let now = Utc::now();
        let session = Session {
            id: format!("sess_{}", nanoid::nanoid!(10)),
            workspace_id: input.workspace_id,
            state: SessionState::Idle,
            agent_kind: input.agent_kind,
            trust_level: input.trust_level,
            title: input.title,
            platform_link: input.platform_link,
            cwd: input.cwd,
            content: Vec::new(),
            last_seq: 0,
            last_active_at: now,
            created_at: now,
            updated_at: now,
        };

        self.store.create(session.clone()).await?;
        info!(
            session_id = %session.id,
            workspace = %session.workspace_id,
            "Created session"
        );
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.sandbox.validate_identifier("session id", session_id)?;
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))
    }

    /// Resolve an external chat thread to its session in one lookup.
    pub async fn find_by_platform_link(&self, link: &str) -> Result<Option<Session>> {
        Ok(self.store.find_by_platform_link(link).await?)
    }

    /// Resolve an external chat thread to its session, creating one on the
    /// first message. Issues the link lookup exactly once.
    pub async fn session_for_platform_link(
        &self,
        link: &str,
        defaults: NewSession,
    ) -> Result<Session> {
        if let Some(existing) = self.store.find_by_platform_link(link).await? {
            return Ok(existing);
        }
        let mut input = defaults;
        input.platform_link = Some(link.to_string());
        self.create_session(input).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        Ok(self.store.list().await?)
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.sandbox.validate_identifier("session id", session_id)?;

        if let Some(token) = self.active.lock().unwrap().get(session_id) {
            token.cancel();
        }
        self.channels.lock().unwrap().remove(session_id);
        self.store.delete(session_id).await?;
        info!(session_id, "Deleted session");
        Ok(())
    }

    // ==================== Streaming ====================

    /// Dispatch a message to a session's agent and stream the response.
    ///
    /// Validation and `Busy` fail synchronously; every failure after the
    /// stream opens surfaces as a terminal event on the returned
    /// subscription. The session is always transitioned to `streaming`,
    /// and on completion to exactly one of idle/error/aborted, persisted
    /// before the stream's terminal event is observable as final state.
    pub async fn send(&self, session_id: &str, message: &str) -> Result<Subscription> {
        self.sandbox.validate_identifier("session id", session_id)?;

        let session = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;

        // Defense in depth: the slug is checked again even though creation
        // validated it, and the sandbox will check once more.
        self.sandbox
            .validate_identifier("workspace slug", &session.workspace_id)?;

        let guard = self
            .locks
            .try_acquire(session_id)
            .ok_or_else(|| OrchestratorError::Busy(session_id.to_string()))?;

        let channel = self.channel_for(&session);

        self.store
            .update_state(session_id, SessionState::Streaming)
            .await?;

        if channel.begin_stream().is_err() {
            // Unreachable while the per-session lock is held; restore the
            // persisted state before failing closed.
            if let Err(e) = self.store.update_state(session_id, SessionState::Idle).await {
                error!("Failed to restore session state for {}: {}", session_id, e);
            }
            return Err(OrchestratorError::Busy(session_id.to_string()));
        }

        // Subscribe before the producer starts so the initiating caller
        // can never miss an event.
        let subscription = channel.subscribe();

        let token = CancellationToken::new();
        self.active
            .lock()
            .unwrap()
            .insert(session_id.to_string(), token.clone());

        let run = StreamRun {
            sandbox: Arc::clone(&self.sandbox),
            store: Arc::clone(&self.store),
            hooks: Arc::clone(&self.hooks),
            channel,
            session,
            message: message.to_string(),
            token,
        };
        let active = Arc::clone(&self.active);
        tokio::spawn(run.execute(guard, active));

        Ok(subscription)
    }

    /// Attach a consumer to a session's stream, active or not. Supports
    /// reattachment after a dropped connection: the subscription carries a
    /// snapshot plus the live tail.
    pub async fn subscribe(&self, session_id: &str) -> Result<Subscription> {
        self.sandbox.validate_identifier("session id", session_id)?;

        let existing = self.channels.lock().unwrap().get(session_id).cloned();
        if let Some(channel) = existing {
            return Ok(channel.subscribe());
        }

        // No channel in memory (e.g. after a restart): rebuild it from the
        // persisted content buffer.
        let session = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;
        Ok(self.channel_for(&session).subscribe())
    }

    /// Like [`subscribe`], with outbound delivery coalesced for consumers
    /// that rate-limit edits (message bridges).
    ///
    /// [`subscribe`]: Orchestrator::subscribe
    pub async fn subscribe_coalesced(
        &self,
        session_id: &str,
    ) -> Result<(Snapshot, impl Stream<Item = StreamEvent>)> {
        let subscription = self.subscribe(session_id).await?;
        let snapshot = subscription.snapshot().clone();
        Ok((snapshot, Coalescer::from_env().apply(subscription)))
    }

    /// Cancel a session's in-flight execution. Exactly one `aborted`
    /// terminal event reaches every remaining consumer. Consumers going
    /// away never triggers this; only an explicit call does.
    pub fn abort(&self, session_id: &str) -> Result<()> {
        let active = self.active.lock().unwrap();
        match active.get(session_id) {
            Some(token) => {
                info!(session_id, "Aborting in-flight execution");
                token.cancel();
                Ok(())
            }
            None => Err(OrchestratorError::NotStreaming(session_id.to_string())),
        }
    }

    // ==================== Sandbox wrappers ====================

    /// Stop the session's execution context. Thin wrapper so API layers
    /// never reach into sandbox internals.
    pub async fn stop(&self, session_id: &str) -> Result<()> {
        let session = self.get_session(session_id).await?;

        if let Some(token) = self.active.lock().unwrap().get(session_id) {
            token.cancel();
        }
        self.sandbox.stop_persistent(&session.workspace_id).await?;
        Ok(())
    }

    /// Remove execution contexts no longer referenced by any session.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let sessions = self.store.list().await?;
        let live: HashSet<String> = sessions.into_iter().map(|s| s.workspace_id).collect();
        Ok(self.sandbox.reconcile(&live).await?)
    }

    fn channel_for(&self, session: &Session) -> Arc<SessionChannel> {
        let mut channels = self.channels.lock().unwrap();
        Arc::clone(channels.entry(session.id.clone()).or_insert_with(|| {
            Arc::new(SessionChannel::with_restored_content(
                session.id.clone(),
                session.content.clone(),
                session.last_seq,
            ))
        }))
    }
}

/// Spawn the periodic background reconciliation task.
///
/// Runs until the process exits; errors are logged and the next tick
/// proceeds regardless.
pub fn spawn_reconcile_task(orchestrator: Arc<Orchestrator>) {
    tokio::spawn(async move {
        let interval_minutes = std::env::var("CORRAL_RECONCILE_INTERVAL_MINUTES")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| (1..=1440).contains(&v))
            .unwrap_or(DEFAULT_RECONCILE_INTERVAL_MINUTES);

        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(interval_minutes * 60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            "Started reconciliation task (interval: {} minutes)",
            interval_minutes
        );

        loop {
            interval.tick().await;
            match orchestrator.reconcile().await {
                Ok(report) => {
                    if !report.removed.is_empty() || !report.failed.is_empty() {
                        info!(
                            "Reconciled: removed {}, failed {}",
                            report.removed.len(),
                            report.failed.len()
                        );
                    }
                }
                Err(e) => {
                    error!("Reconciliation pass failed: {}", e);
                }
            }
        }
    });
}

/// One message's drive through sandbox, translator, and event channel.
struct StreamRun {
    sandbox: Arc<SandboxManager>,
    store: Arc<dyn SessionStore>,
    hooks: Arc<dyn HookRunner>,
    channel: Arc<SessionChannel>,
    session: Session,
    message: String,
    token: CancellationToken,
}

impl StreamRun {
    /// Run to the terminal event, then persist the outcome and release the
    /// per-session lock. Holding the guard here keeps the session locked
    /// for the whole execution, not just the dispatch.
    async fn execute(
        self,
        guard: OwnedMutexGuard<()>,
        active: Arc<Mutex<HashMap<String, CancellationToken>>>,
    ) {
        let session_id = self.session.id.clone();
        let final_state = self.drive().await;

        let (content, last_seq) = self.channel.checkpoint();
        if let Err(e) = self
            .store
            .save_content(&session_id, &content, last_seq)
            .await
        {
            error!("Failed to persist content for {}: {}", session_id, e);
        }
        if let Err(e) = self.store.update_state(&session_id, final_state).await {
            error!("Failed to persist state for {}: {}", session_id, e);
        }

        active.lock().unwrap().remove(&session_id);
        drop(guard);

        // Completion hooks are fire-and-forget.
        let hooks = Arc::clone(&self.hooks);
        let payload = json!({
            "session_id": session_id,
            "workspace_id": self.session.workspace_id,
            "state": final_state.as_str(),
        });
        tokio::spawn(async move {
            hooks.fire(SESSION_COMPLETED, payload).await;
        });
    }

    async fn drive(&self) -> SessionState {
        // Pre-hooks run on their own task; a hang or panic there cannot
        // take this stream down with it.
        let hooks = Arc::clone(&self.hooks);
        let payload = json!({
            "session_id": self.session.id,
            "workspace_id": self.session.workspace_id,
            "message": self.message,
        });
        match tokio::spawn(async move { hooks.fire(PRE_SEND, payload).await }).await {
            Ok(outcomes) => {
                for outcome in &outcomes {
                    if let Some(err) = &outcome.error {
                        warn!("Hook {} failed: {}", outcome.hook, err);
                    }
                }
                if let Some(vetoed) = outcomes.iter().find(|o| o.vetoed()) {
                    let reason = vetoed.veto.clone().unwrap_or_default();
                    info!(
                        session_id = %self.session.id,
                        hook = %vetoed.hook,
                        "Send vetoed by hook"
                    );
                    let _ = self.channel.publish(EventPayload::TypedError {
                        code: "hook_veto".to_string(),
                        message: reason,
                    });
                    return SessionState::Idle;
                }
            }
            Err(e) => {
                warn!("Pre-send hook task failed: {}", e);
            }
        }

        let ctx = match self.sandbox.ensure_persistent(&self.session.workspace_id).await {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(
                    "Failed to ensure context for {}: {}",
                    self.session.workspace_id, e
                );
                let _ = self.channel.publish(EventPayload::Error {
                    message: e.to_string(),
                });
                return SessionState::Error;
            }
        };

        let input = StreamInput {
            message: self.message.clone(),
            env: execution_env(&self.session),
        };
        let mut raw = match self.sandbox.stream(&ctx, input).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start agent stream: {}", e);
                let _ = self.channel.publish(EventPayload::Error {
                    message: e.to_string(),
                });
                return SessionState::Error;
            }
        };

        let translator = Translator::new();
        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    debug!(session_id = %self.session.id, "Abort requested");
                    self.sandbox.interrupt(&ctx).await;
                    let _ = self.channel.publish(EventPayload::Aborted);
                    return SessionState::Aborted;
                }
                line = raw.next() => match line {
                    Some(Ok(line)) => {
                        let Some(payload) = translator.translate_line(&line) else {
                            continue;
                        };
                        self.apply_side_effects(&payload).await;
                        let terminal = payload.is_terminal();
                        let kind = payload.kind();
                        let _ = self.channel.publish(payload);
                        if terminal {
                            // Agent-reported failures end the stream but
                            // leave the conversation usable.
                            return match kind {
                                "aborted" => SessionState::Aborted,
                                _ => SessionState::Idle,
                            };
                        }
                    }
                    Some(Err(e)) => {
                        error!("Agent output stream failed: {}", e);
                        let _ = self.channel.publish(EventPayload::Error {
                            message: format!("output stream failed: {}", e),
                        });
                        return SessionState::Error;
                    }
                    None => {
                        // The agent exited without closing the protocol;
                        // the stream still must end with a terminal event.
                        warn!(
                            session_id = %self.session.id,
                            "Agent exited without a terminal event"
                        );
                        let _ = self.channel.publish(EventPayload::Error {
                            message: "agent exited without completing".to_string(),
                        });
                        return SessionState::Error;
                    }
                }
            }
        }
    }

    async fn apply_side_effects(&self, payload: &EventPayload) {
        if let EventPayload::SessionEvent { name, data } = payload {
            if name == "title_changed" {
                if let Some(title) = data.as_str() {
                    if let Err(e) = self.store.set_title(&self.session.id, title).await {
                        warn!("Failed to persist title for {}: {}", self.session.id, e);
                    }
                }
            }
        }
    }
}

/// Environment handed to the agent process. The working directory is
/// framed vault-relative; the host filesystem layout never crosses the
/// boundary.
fn execution_env(session: &Session) -> HashMap<String, String> {
    HashMap::from([
        ("CORRAL_SESSION_ID".to_string(), session.id.clone()),
        (
            "CORRAL_WORKSPACE_ID".to_string(),
            session.workspace_id.clone(),
        ),
        (
            "CORRAL_TRUST_LEVEL".to_string(),
            session.trust_level.as_str().to_string(),
        ),
        (
            "CORRAL_CWD".to_string(),
            vault_relative(session.cwd.as_deref().unwrap_or("")),
        ),
    ])
}
