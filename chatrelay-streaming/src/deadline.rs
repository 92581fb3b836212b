//! First-token and overall deadlines.
//!
//! Two timers are armed when a session starts, each in its own tokio task:
//!
//! - the **first-token** timer fires only if no content byte has been seen,
//!   and is disarmed by the first one;
//! - the **overall** timer bounds the whole session and is never reset by
//!   progress.
//!
//! Either expiry cancels the session's [`CancellationToken`], which the
//! reader loop `select!`s on, so a stalled body read cannot outlive a
//! deadline. "First byte seen" and "first-token deadline expired" are
//! decided under one lock: exactly one of them wins.

use chatrelay_core::{DeadlineConfig, RelayError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Which deadline elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    /// No content byte before the first-token deadline.
    FirstToken,
    /// The overall session deadline.
    Overall,
}

#[derive(Debug, Default)]
struct DeadlineState {
    first_token_seen: bool,
    expired: Option<DeadlineKind>,
    /// Completed or cancelled by the owner; timers must not fire any more.
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<DeadlineState>,
    first_token: Duration,
    overall: Duration,
    session: CancellationToken,
}

impl Shared {
    fn expire(&self, kind: DeadlineKind) {
        let mut state = self.state.lock();
        if state.closed || state.expired.is_some() {
            return;
        }
        if kind == DeadlineKind::FirstToken && state.first_token_seen {
            return;
        }
        state.expired = Some(kind);
        drop(state);

        tracing::debug!(?kind, "deadline elapsed, cancelling session");
        self.session.cancel();
    }
}

/// Arms deadline timers for sessions.
#[derive(Debug, Clone, Copy)]
pub struct DeadlineManager;

impl DeadlineManager {
    /// Arm both timers and return the session's handle.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(first_token: Duration, overall: Duration) -> DeadlineHandle {
        Self::start_with_token(first_token, overall, CancellationToken::new())
    }

    /// Arm timers from a deadline config entry.
    pub fn start_for(deadlines: DeadlineConfig, session: CancellationToken) -> DeadlineHandle {
        Self::start_with_token(deadlines.first_token(), deadlines.overall(), session)
    }

    /// Arm both timers, cancelling `session` on expiry.
    pub fn start_with_token(
        first_token: Duration,
        overall: Duration,
        session: CancellationToken,
    ) -> DeadlineHandle {
        let shared = Arc::new(Shared {
            state: Mutex::new(DeadlineState::default()),
            first_token,
            overall,
            session: session.clone(),
        });
        let timers = CancellationToken::new();
        let first_token_timer = timers.child_token();
        let started = Instant::now();

        spawn_timer(
            Arc::clone(&shared),
            first_token_timer.clone(),
            started + first_token,
            DeadlineKind::FirstToken,
        );
        spawn_timer(
            Arc::clone(&shared),
            timers.clone(),
            started + overall,
            DeadlineKind::Overall,
        );

        DeadlineHandle {
            shared,
            session,
            timers,
            first_token_timer,
        }
    }
}

fn spawn_timer(shared: Arc<Shared>, disarm: CancellationToken, at: Instant, kind: DeadlineKind) {
    tokio::spawn(async move {
        tokio::select! {
            _ = disarm.cancelled() => {}
            _ = sleep_until(at) => shared.expire(kind),
        }
    });
}

/// Per-session deadline handle. Dropping it disarms both timers.
#[derive(Debug)]
pub struct DeadlineHandle {
    shared: Arc<Shared>,
    session: CancellationToken,
    timers: CancellationToken,
    first_token_timer: CancellationToken,
}

impl DeadlineHandle {
    /// Record a received content byte.
    ///
    /// The first call disarms the first-token timer. Returns `false` if the
    /// session is already cancelled; the caller must stop processing.
    pub fn on_byte_received(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.expired.is_some() || self.session.is_cancelled() {
            return false;
        }
        if !state.first_token_seen {
            state.first_token_seen = true;
            self.first_token_timer.cancel();
        }
        true
    }

    /// Explicit stop: disarm both timers and cancel the session.
    pub fn cancel(&self) {
        self.shared.state.lock().closed = true;
        self.timers.cancel();
        self.session.cancel();
    }

    /// Graceful completion: disarm both timers.
    pub fn complete(&self) {
        self.shared.state.lock().closed = true;
        self.timers.cancel();
    }

    /// Which deadline elapsed, if any.
    #[must_use]
    pub fn expired(&self) -> Option<DeadlineKind> {
        self.shared.state.lock().expired
    }

    /// Whether a content byte has been recorded.
    #[must_use]
    pub fn first_token_seen(&self) -> bool {
        self.shared.state.lock().first_token_seen
    }

    /// Whether the session has been cancelled, by expiry or explicitly.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.session.is_cancelled()
    }

    /// Resolves when the session is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.session.cancelled()
    }

    /// The session token the timers cancel.
    #[must_use]
    pub fn session_token(&self) -> CancellationToken {
        self.session.clone()
    }

    /// The timeout error for the elapsed deadline, if any.
    #[must_use]
    pub fn timeout_error(&self) -> Option<RelayError> {
        self.expired().map(|kind| match kind {
            DeadlineKind::FirstToken => RelayError::FirstTokenTimeout(self.shared.first_token),
            DeadlineKind::Overall => RelayError::GatewayTimeout {
                after: Some(self.shared.overall),
            },
        })
    }
}

impl Drop for DeadlineHandle {
    fn drop(&mut self) {
        self.timers.cancel();
    }
}
