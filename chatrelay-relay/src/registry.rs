//! Live and recently finished relay sessions.

use chatrelay_core::{SessionId, SessionState, StreamSession};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Finished sessions kept for inspection.
const DEFAULT_RETAINED: usize = 1024;

/// Snapshot of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session ID.
    pub id: SessionId,
    /// Model requested.
    pub model: String,
    /// When the session was opened.
    pub created_at: DateTime<Utc>,
    /// Current state.
    pub state: SessionState,
    /// Every state the session has been in, oldest first.
    pub history: Vec<SessionState>,
}

#[derive(Debug)]
struct Entry {
    record: SessionRecord,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<SessionId, Entry>,
    finished: VecDeque<SessionId>,
}

/// Tracks session state for inspection and remote stop.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Inner>>,
    retained: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_RETAINED)
    }
}

impl SessionRegistry {
    /// Create a registry keeping at most `retained` finished sessions.
    #[must_use]
    pub fn new(retained: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            retained,
        }
    }

    /// Start tracking a session.
    pub fn register(&self, session: &StreamSession) {
        let record = SessionRecord {
            id: session.id().clone(),
            model: session.model().to_string(),
            created_at: session.created_at(),
            state: session.state(),
            history: vec![session.state()],
        };
        let entry = Entry {
            record,
            cancel: session.cancellation_token(),
        };
        self.inner.write().sessions.insert(session.id().clone(), entry);
    }

    /// Record the session's current state.
    pub fn record(&self, session: &StreamSession) {
        let state = session.state();
        let mut inner = self.inner.write();

        let Some(entry) = inner.sessions.get_mut(session.id()) else {
            return;
        };
        if entry.record.state == state {
            return;
        }
        entry.record.state = state;
        entry.record.history.push(state);

        if state.is_terminal() {
            inner.finished.push_back(session.id().clone());
            while inner.finished.len() > self.retained {
                if let Some(oldest) = inner.finished.pop_front() {
                    inner.sessions.remove(&oldest);
                }
            }
        }
    }

    /// Snapshot of a session.
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<SessionRecord> {
        self.inner.read().sessions.get(id).map(|e| e.record.clone())
    }

    /// Stop a live session. Returns `false` if unknown or already finished.
    pub fn cancel(&self, id: &SessionId) -> bool {
        let inner = self.inner.read();
        match inner.sessions.get(id) {
            Some(entry) if !entry.record.state.is_terminal() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Sessions not yet in a terminal state.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner
            .read()
            .sessions
            .values()
            .filter(|e| !e.record.state.is_terminal())
            .count()
    }

    /// All tracked sessions, in no particular order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SessionRecord> {
        self.inner
            .read()
            .sessions
            .values()
            .map(|e| e.record.clone())
            .collect()
    }
}
