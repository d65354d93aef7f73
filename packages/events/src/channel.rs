// ABOUTME: Per-session event channel with replay log and broadcast fan-out
// ABOUTME: Guarantees snapshot-then-tail continuity and exactly one terminal per stream

use corral_stream::{Accumulator, ContentItem, EventPayload, StreamEvent};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default capacity for the live broadcast channel.
/// Can be overridden via CORRAL_EVENT_CHANNEL_SIZE environment variable.
/// Subscribers that fall behind catch up from the replay log, so this only
/// bounds how much of the live tail is buffered per receiver.
const DEFAULT_EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Error, Debug, PartialEq)]
pub enum ChannelError {
    /// Publish attempted after a terminal event closed the stream.
    #[error("Stream already closed for session {0}")]
    StreamClosed(String),

    /// A second producer tried to open a stream that is already open.
    #[error("Session {0} already has an active producer")]
    AlreadyStreaming(String),
}

/// Immutable view handed to a consumer at attach time: everything the
/// session has accumulated, plus the sequence watermark the live tail
/// starts strictly after.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub session_id: String,
    pub content: Vec<ContentItem>,
    /// Sequence number of the last event folded into this snapshot.
    pub seq: u64,
    /// Whether a producer was active when the snapshot was taken.
    pub streaming: bool,
}

struct ChannelState {
    accumulator: Accumulator,
    /// Events with seq in (base_seq, seq], in order. Slow or reattaching
    /// consumers are served from here; the broadcast channel is only the
    /// live wakeup path.
    log: Vec<StreamEvent>,
    /// Watermark below which events are no longer individually replayable
    /// (they are represented by the accumulated content instead).
    base_seq: u64,
    /// Sequence number of the most recently published event.
    seq: u64,
    /// True between `begin_stream` and the terminal event.
    open: bool,
}

/// Event channel for one session.
///
/// A single producer publishes translated events; any number of consumers
/// subscribe, before or during a stream. Every event is appended to the
/// replay log and fanned out over a broadcast channel under one lock, so a
/// consumer attaching mid-stream never observes a gap between its snapshot
/// and its tail.
pub struct SessionChannel {
    session_id: String,
    state: Mutex<ChannelState>,
    tx: broadcast::Sender<StreamEvent>,
}

impl SessionChannel {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self::with_restored_content(session_id, Vec::new(), 0)
    }

    /// Rebuild a channel for a session whose content was persisted, e.g.
    /// after a server restart. `seq` is the watermark the persisted content
    /// corresponds to; new events continue numbering after it.
    pub fn with_restored_content(
        session_id: impl Into<String>,
        content: Vec<ContentItem>,
        seq: u64,
    ) -> Self {
        let capacity = std::env::var("CORRAL_EVENT_CHANNEL_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| (16..=65536).contains(&v))
            .unwrap_or(DEFAULT_EVENT_CHANNEL_SIZE);

        let (tx, _) = broadcast::channel(capacity);

        Self {
            session_id: session_id.into(),
            state: Mutex::new(ChannelState {
                accumulator: Accumulator::from_content(content),
                log: Vec::new(),
                base_seq: seq,
                seq,
                open: false,
            }),
            tx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!(
                session_id = %self.session_id,
                "Channel state mutex poisoned, recovering"
            );
            poisoned.into_inner()
        })
    }

    /// Open the channel for a new stream. Fails if a producer is already
    /// active; the orchestrator's per-session lock makes that a bug, not a
    /// race to win.
    pub fn begin_stream(&self) -> Result<(), ChannelError> {
        let mut state = self.lock_state();
        if state.open {
            return Err(ChannelError::AlreadyStreaming(self.session_id.clone()));
        }

        // Nobody is tailing: events from finished streams are fully
        // represented by the accumulated content, so the log can be reset.
        if self.tx.receiver_count() == 0 && !state.log.is_empty() {
            debug!(
                session_id = %self.session_id,
                dropped = state.log.len(),
                "Compacting replay log before new stream"
            );
            state.log.clear();
            state.base_seq = state.seq;
        }

        state.open = true;
        Ok(())
    }

    /// Publish one event payload, assigning the next sequence number.
    ///
    /// A terminal payload closes the stream; anything published after that
    /// is refused so the exactly-one-terminal contract holds.
    pub fn publish(&self, payload: EventPayload) -> Result<u64, ChannelError> {
        let event = {
            let mut state = self.lock_state();
            if !state.open {
                warn!(
                    session_id = %self.session_id,
                    kind = payload.kind(),
                    "Dropping event published after stream close"
                );
                return Err(ChannelError::StreamClosed(self.session_id.clone()));
            }

            state.seq += 1;
            state.accumulator.apply(&payload);
            if payload.is_terminal() {
                state.open = false;
            }

            let event = StreamEvent {
                session_id: self.session_id.clone(),
                seq: state.seq,
                payload,
            };
            state.log.push(event.clone());
            event
        };

        let seq = event.seq;
        // Send failures just mean no live receivers; the log still serves
        // future subscribers.
        let _ = self.tx.send(event);
        Ok(seq)
    }

    pub fn is_streaming(&self) -> bool {
        self.lock_state().open
    }

    /// Current accumulated content and watermark, e.g. for persistence.
    pub fn checkpoint(&self) -> (Vec<ContentItem>, u64) {
        let state = self.lock_state();
        (state.accumulator.snapshot(), state.seq)
    }

    /// Attach a consumer. The snapshot and the live receiver are taken
    /// under the same lock, so the tail begins strictly after the snapshot
    /// watermark with no duplicated and no missing events.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let state = self.lock_state();
        let snapshot = Snapshot {
            session_id: self.session_id.clone(),
            content: state.accumulator.snapshot(),
            seq: state.seq,
            streaming: state.open,
        };
        let rx = self.tx.subscribe();
        let cursor = state.seq;
        drop(state);

        Subscription {
            channel: Arc::clone(self),
            snapshot,
            rx,
            cursor,
            finished: false,
        }
    }
}

/// One consumer's view of a session stream.
///
/// Yields events strictly after the snapshot watermark, in sequence order,
/// each exactly once, ending after the first terminal event. Dropping a
/// subscription detaches the consumer and never affects the execution.
pub struct Subscription {
    channel: Arc<SessionChannel>,
    snapshot: Snapshot,
    rx: broadcast::Receiver<StreamEvent>,
    /// Sequence number of the last delivered event.
    cursor: u64,
    finished: bool,
}

impl Subscription {
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn session_id(&self) -> &str {
        &self.channel.session_id
    }

    /// Next event after the cursor, or `None` once a terminal event has
    /// been delivered (or the channel itself is gone).
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }

        loop {
            // Serve from the replay log first; the broadcast receiver is
            // only used to wait for events that do not exist yet.
            if let Some(event) = self.next_from_log() {
                return Some(self.deliver(event));
            }

            match self.rx.recv().await {
                Ok(event) => {
                    if event.seq <= self.cursor {
                        continue;
                    }
                    // A gap here means the log has entries we skipped over;
                    // loop back and drain it in order instead.
                    if event.seq > self.cursor + 1 {
                        continue;
                    }
                    return Some(self.deliver(event));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(
                        session_id = %self.channel.session_id,
                        skipped,
                        "Subscriber lagged, catching up from replay log"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return self.next_from_log().map(|event| self.deliver(event));
                }
            }
        }
    }

    fn next_from_log(&self) -> Option<StreamEvent> {
        let state = self.channel.lock_state();
        if self.cursor < state.base_seq {
            // The log was compacted past our cursor; events below base_seq
            // are only available as accumulated content. Resume at the tail
            // of what is individually replayable.
            let idx = 0;
            return state.log.get(idx).cloned();
        }
        let idx = (self.cursor - state.base_seq) as usize;
        state.log.get(idx).cloned()
    }

    fn deliver(&mut self, event: StreamEvent) -> StreamEvent {
        self.cursor = event.seq;
        if event.payload.is_terminal() {
            self.finished = true;
        }
        event
    }
}
