// ABOUTME: End-to-end orchestrator tests against a scripted engine and in-memory store
// ABOUTME: Covers busy rejection, terminal guarantees, reattachment, abort, and fatal errors

use async_trait::async_trait;
use corral_sandbox::{
    ContainerSpec, ContainerState, EngineContainer, EngineError, EngineErrorKind, EngineResult,
    ExecutionEngine, RawLineStream, SandboxConfig, SandboxError, SandboxManager,
};
use corral_sessions::{
    HookOutcome, HookRunner, MemorySessionStore, NewSession, NoopHooks, Orchestrator,
    OrchestratorError, Session, SessionState, SessionStore,
};
use corral_stream::StreamEvent;
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Engine whose agent "emits" a scripted set of protocol lines.
#[derive(Default)]
struct ScriptedEngine {
    agent_lines: Mutex<Vec<String>>,
    line_delay: Mutex<Duration>,
    containers: Mutex<HashMap<String, (String, ContainerState)>>,
    calls: AtomicUsize,
    create_calls: AtomicUsize,
    interrupted: AtomicBool,
    /// Makes every inspect call fail with this kind.
    fail_inspect_with: Mutex<Option<EngineErrorKind>>,
}

impl ScriptedEngine {
    fn new(lines: &[&str], line_delay: Duration) -> Arc<Self> {
        let engine = Self::default();
        *engine.agent_lines.lock().unwrap() = lines.iter().map(|l| l.to_string()).collect();
        *engine.line_delay.lock().unwrap() = line_delay;
        Arc::new(engine)
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    async fn ping(&self) -> EngineResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let id = format!("id-{}", spec.name);
        self.containers
            .lock()
            .unwrap()
            .insert(spec.name.clone(), (id.clone(), ContainerState::Created));
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> EngineResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut containers = self.containers.lock().unwrap();
        for (id, state) in containers.values_mut() {
            if id == container_id {
                *state = ContainerState::Running;
            }
        }
        Ok(())
    }

    async fn stop_container(&self, _container_id: &str, _timeout_secs: i64) -> EngineResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> EngineResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.containers
            .lock()
            .unwrap()
            .retain(|_, (id, _)| id != container_id);
        Ok(())
    }

    async fn list_containers(
        &self,
        _label_filters: &[(String, String)],
    ) -> EngineResult<Vec<EngineContainer>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .map(|(name, (id, state))| EngineContainer {
                id: id.clone(),
                name: name.clone(),
                state: *state,
                labels: HashMap::from([
                    ("corral.managed".to_string(), "true".to_string()),
                    (
                        "corral.workspace".to_string(),
                        name.trim_start_matches("corral-ws-").to_string(),
                    ),
                    ("corral.kind".to_string(), "persistent".to_string()),
                ]),
            })
            .collect())
    }

    async fn inspect_container(&self, name_or_id: &str) -> EngineResult<Option<EngineContainer>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = *self.fail_inspect_with.lock().unwrap() {
            return Err(EngineError::new(kind, "engine refused"));
        }
        Ok(self
            .containers
            .lock()
            .unwrap()
            .get(name_or_id)
            .map(|(id, state)| EngineContainer {
                id: id.clone(),
                name: name_or_id.to_string(),
                state: *state,
                labels: HashMap::new(),
            }))
    }

    async fn exec_streamed(
        &self,
        _container_id: &str,
        _command: Vec<String>,
        _env: Vec<String>,
        _stdin: Option<String>,
    ) -> EngineResult<RawLineStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let lines = self.agent_lines.lock().unwrap().clone();
        let delay = *self.line_delay.lock().unwrap();
        Ok(Box::pin(
            futures_util::stream::iter(lines).then(move |line| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(line)
            }),
        ))
    }

    async fn run_exec(&self, _container_id: &str, _command: Vec<String>) -> EngineResult<i64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.interrupted.store(true, Ordering::SeqCst);
        Ok(0)
    }

    async fn wait_container(&self, _container_id: &str) -> EngineResult<i64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    async fn container_logs(
        &self,
        _container_id: &str,
        _follow: bool,
    ) -> EngineResult<RawLineStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Box::pin(futures_util::stream::empty::<EngineResult<String>>()))
    }
}

fn build(
    engine: Arc<ScriptedEngine>,
    hooks: Arc<dyn HookRunner>,
) -> (Orchestrator, Arc<MemorySessionStore>) {
    let sandbox = Arc::new(SandboxManager::new(engine, SandboxConfig::default()));
    let store = Arc::new(MemorySessionStore::new());
    let orchestrator = Orchestrator::new(sandbox, Arc::clone(&store) as Arc<dyn SessionStore>, hooks);
    (orchestrator, store)
}

async fn make_session(orchestrator: &Orchestrator) -> Session {
    orchestrator
        .create_session(NewSession {
            workspace_id: "notes".to_string(),
            agent_kind: "coder".to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
}

async fn collect(mut sub: corral_events::Subscription) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(ev) = sub.next_event().await {
        events.push(ev);
    }
    events
}

/// Poll the store until the session reaches `state` (the driving task
/// persists it shortly after the terminal event), then give the task a
/// moment to release the per-session lock.
async fn wait_for_state(store: &MemorySessionStore, id: &str, state: SessionState) {
    for _ in 0..100 {
        if store.get(id).await.unwrap().unwrap().state == state {
            tokio::time::sleep(Duration::from_millis(50)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session {} never reached {:?}", id, state);
}

const HAPPY_SCRIPT: &[&str] = &[
    r#"{"type":"text","text":"Working on"}"#,
    r#"{"type":"text","text":" it"}"#,
    r#"{"type":"tool_use","id":"t1","name":"read_file","input":{"path":"a.md"}}"#,
    r#"{"type":"tool_result","tool_use_id":"t1","output":"contents","is_error":false}"#,
    r#"{"type":"done"}"#,
];

#[tokio::test]
async fn test_send_streams_events_and_returns_session_to_idle() {
    let engine = ScriptedEngine::new(HAPPY_SCRIPT, Duration::ZERO);
    let (orchestrator, store) = build(Arc::clone(&engine), Arc::new(NoopHooks));
    let session = make_session(&orchestrator).await;

    let sub = orchestrator.send(&session.id, "hello").await.unwrap();
    let events = collect(sub).await;

    assert_eq!(events.len(), 5);
    assert_eq!(
        events.iter().filter(|e| e.payload.is_terminal()).count(),
        1
    );
    assert_eq!(events.last().unwrap().payload.kind(), "done");
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

    wait_for_state(&store, &session.id, SessionState::Idle).await;

    // Content was accumulated and persisted: folded text + tool use +
    // tool result.
    let persisted = store.get(&session.id).await.unwrap().unwrap();
    assert_eq!(persisted.content.len(), 3);
    assert_eq!(persisted.last_seq, 5);
}

#[tokio::test]
async fn test_concurrent_send_is_rejected_busy_and_first_stream_unaffected() {
    let engine = ScriptedEngine::new(HAPPY_SCRIPT, Duration::from_millis(40));
    let (orchestrator, store) = build(engine, Arc::new(NoopHooks));
    let session = make_session(&orchestrator).await;

    let sub = orchestrator.send(&session.id, "first").await.unwrap();

    let second = orchestrator.send(&session.id, "second").await;
    assert!(matches!(second, Err(OrchestratorError::Busy(_))));

    // The rejected call left the first stream intact.
    let events = collect(sub).await;
    assert_eq!(events.len(), 5);
    assert_eq!(events.last().unwrap().payload.kind(), "done");

    wait_for_state(&store, &session.id, SessionState::Idle).await;

    // And the session accepts messages again afterwards.
    let sub = orchestrator.send(&session.id, "third").await.unwrap();
    let events = collect(sub).await;
    assert_eq!(events.last().unwrap().payload.kind(), "done");
}

#[tokio::test]
async fn test_malformed_session_id_is_rejected_before_any_lookup() {
    let engine = ScriptedEngine::new(HAPPY_SCRIPT, Duration::ZERO);
    let (orchestrator, _store) = build(Arc::clone(&engine), Arc::new(NoopHooks));

    let result = orchestrator.send("../../etc", "hello").await;
    assert!(matches!(
        result,
        Err(OrchestratorError::Sandbox(SandboxError::Validation(_)))
    ));
    assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fatal_engine_error_closes_session_as_error_without_retry() {
    let engine = ScriptedEngine::new(HAPPY_SCRIPT, Duration::ZERO);
    *engine.fail_inspect_with.lock().unwrap() = Some(EngineErrorKind::PermissionDenied);
    let (orchestrator, store) = build(Arc::clone(&engine), Arc::new(NoopHooks));
    let session = make_session(&orchestrator).await;

    let sub = orchestrator.send(&session.id, "hello").await.unwrap();
    let events = collect(sub).await;

    // Exactly one terminal error event, nothing else.
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload.kind(), "error");

    wait_for_state(&store, &session.id, SessionState::Error).await;

    // One inspect call, no retries, no container created.
    assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.create_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_reattaching_consumer_sees_snapshot_then_contiguous_tail() {
    let engine = ScriptedEngine::new(HAPPY_SCRIPT, Duration::from_millis(30));
    let (orchestrator, _store) = build(engine, Arc::new(NoopHooks));
    let session = make_session(&orchestrator).await;

    let first = orchestrator.send(&session.id, "hello").await.unwrap();

    // Let part of the stream land, then attach as a reconnecting bridge.
    tokio::time::sleep(Duration::from_millis(80)).await;
    let late = orchestrator.subscribe(&session.id).await.unwrap();
    let watermark = late.snapshot().seq;
    assert!(watermark > 0, "expected a partial snapshot");

    let late_events = collect(late).await;
    let late_seqs: Vec<u64> = late_events.iter().map(|e| e.seq).collect();
    assert_eq!(
        late_seqs,
        (watermark + 1..=5).collect::<Vec<u64>>(),
        "tail must start strictly after the snapshot with no gaps"
    );

    let first_events = collect(first).await;
    assert_eq!(
        first_events.iter().map(|e| e.seq).collect::<Vec<u64>>(),
        vec![1, 2, 3, 4, 5]
    );
}

#[tokio::test]
async fn test_abort_delivers_exactly_one_aborted_to_every_consumer() {
    // A long script that will not finish on its own.
    let lines: Vec<String> = (0..200)
        .map(|i| format!(r#"{{"type":"text","text":"chunk {}"}}"#, i))
        .collect();
    let line_refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let engine = ScriptedEngine::new(&line_refs, Duration::from_millis(10));
    let (orchestrator, store) = build(Arc::clone(&engine), Arc::new(NoopHooks));
    let session = make_session(&orchestrator).await;

    let sub_a = orchestrator.send(&session.id, "go").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let sub_b = orchestrator.subscribe(&session.id).await.unwrap();

    orchestrator.abort(&session.id).unwrap();

    let a = collect(sub_a).await;
    let b = collect(sub_b).await;

    for events in [&a, &b] {
        let terminals: Vec<_> = events
            .iter()
            .filter(|e| e.payload.is_terminal())
            .collect();
        assert_eq!(terminals.len(), 1);
        assert_eq!(terminals[0].payload.kind(), "aborted");
    }

    wait_for_state(&store, &session.id, SessionState::Aborted).await;
    assert!(engine.interrupted.load(Ordering::SeqCst));

    // A second abort has nothing to cancel.
    assert!(matches!(
        orchestrator.abort(&session.id),
        Err(OrchestratorError::NotStreaming(_))
    ));
}

struct VetoHooks;

#[async_trait]
impl HookRunner for VetoHooks {
    async fn fire(&self, event: &str, _payload: Value) -> Vec<HookOutcome> {
        if event == corral_sessions::PRE_SEND {
            vec![HookOutcome {
                hook: "policy-guard".to_string(),
                veto: Some("workspace is read-only".to_string()),
                error: None,
            }]
        } else {
            Vec::new()
        }
    }
}

#[tokio::test]
async fn test_hook_veto_stops_send_before_the_sandbox_is_touched() {
    let engine = ScriptedEngine::new(HAPPY_SCRIPT, Duration::ZERO);
    let (orchestrator, store) = build(Arc::clone(&engine), Arc::new(VetoHooks));
    let session = make_session(&orchestrator).await;

    let sub = orchestrator.send(&session.id, "hello").await.unwrap();
    let events = collect(sub).await;

    assert_eq!(events.len(), 1);
    match &events[0].payload {
        corral_stream::EventPayload::TypedError { code, message } => {
            assert_eq!(code, "hook_veto");
            assert!(message.contains("read-only"));
        }
        other => panic!("expected typed_error, got {:?}", other),
    }

    wait_for_state(&store, &session.id, SessionState::Idle).await;
    assert_eq!(engine.create_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_agent_silence_still_terminates_the_stream() {
    let engine = ScriptedEngine::new(&[r#"{"type":"text","text":"partial"}"#], Duration::ZERO);
    let (orchestrator, store) = build(engine, Arc::new(NoopHooks));
    let session = make_session(&orchestrator).await;

    let sub = orchestrator.send(&session.id, "hello").await.unwrap();
    let events = collect(sub).await;

    assert_eq!(
        events.iter().filter(|e| e.payload.is_terminal()).count(),
        1
    );
    assert_eq!(events.last().unwrap().payload.kind(), "error");
    wait_for_state(&store, &session.id, SessionState::Error).await;
}

#[tokio::test]
async fn test_reconcile_sweeps_contexts_of_deleted_sessions() {
    let engine = ScriptedEngine::new(HAPPY_SCRIPT, Duration::ZERO);
    let (orchestrator, _store) = build(Arc::clone(&engine), Arc::new(NoopHooks));
    let session = make_session(&orchestrator).await;

    // Run once so the workspace context exists.
    let sub = orchestrator.send(&session.id, "hello").await.unwrap();
    collect(sub).await;
    assert!(engine
        .containers
        .lock()
        .unwrap()
        .contains_key("corral-ws-notes"));

    // While the session lives, its context is kept.
    let report = orchestrator.reconcile().await.unwrap();
    assert!(report.removed.is_empty());

    orchestrator.delete_session(&session.id).await.unwrap();
    let report = orchestrator.reconcile().await.unwrap();
    assert_eq!(report.removed, vec!["corral-ws-notes".to_string()]);
    assert!(engine.containers.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_platform_link_resolves_or_creates_exactly_one_session() {
    let engine = ScriptedEngine::new(HAPPY_SCRIPT, Duration::ZERO);
    let (orchestrator, _store) = build(engine, Arc::new(NoopHooks));

    let defaults = NewSession {
        workspace_id: "notes".to_string(),
        agent_kind: "coder".to_string(),
        ..Default::default()
    };

    let first = orchestrator
        .session_for_platform_link("telegram:42", defaults.clone())
        .await
        .unwrap();
    assert_eq!(first.platform_link.as_deref(), Some("telegram:42"));

    let again = orchestrator
        .session_for_platform_link("telegram:42", defaults)
        .await
        .unwrap();
    assert_eq!(again.id, first.id);
    assert_eq!(orchestrator.list_sessions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_session_title_side_effect_is_persisted() {
    let engine = ScriptedEngine::new(
        &[
            r#"{"type":"session_event","name":"title_changed","data":"Refactor plan"}"#,
            r#"{"type":"done"}"#,
        ],
        Duration::ZERO,
    );
    let (orchestrator, store) = build(engine, Arc::new(NoopHooks));
    let session = make_session(&orchestrator).await;

    let sub = orchestrator.send(&session.id, "hello").await.unwrap();
    collect(sub).await;
    wait_for_state(&store, &session.id, SessionState::Idle).await;

    let persisted = store.get(&session.id).await.unwrap().unwrap();
    assert_eq!(persisted.title.as_deref(), Some("Refactor plan"));
}
