// ABOUTME: Keyed per-session locks guaranteeing one in-flight execution per session
// ABOUTME: Bounded registry; entries nobody holds are evicted on the next acquire

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::warn;

/// Registry of per-session mutexes, created lazily.
///
/// Contention is rejected, not queued: `try_acquire` returns `None` when
/// the session already has a holder. Eviction policy: on every acquire,
/// entries whose lock has no outstanding guard are dropped, bounding the
/// registry to the number of sessions with an execution in flight.
#[derive(Default)]
pub struct SessionLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the session's lock without waiting. `None` means an execution
    /// is already in flight for this session.
    pub fn try_acquire(&self, session_id: &str) -> Option<OwnedMutexGuard<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("Session lock registry mutex poisoned, recovering");
            poisoned.into_inner()
        });

        // An unheld lock is indistinguishable from a fresh one; drop it.
        // The strong count is 1 exactly when only the map references it.
        map.retain(|_, lock| Arc::strong_count(lock) > 1);

        let lock = map
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        lock.try_lock_owned().ok()
    }

    /// Number of registered entries (held locks plus not-yet-evicted ones).
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
