//! Streaming session lifecycle.
//!
//! A session is one relay connection or one client connection. It moves
//! through `Connecting → Streaming → {Completed | Failed | Cancelled}`;
//! a failure while connecting skips `Streaming` entirely.

use crate::errors::ErrorKind;
use crate::identifier::{now_utc, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// State of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    /// Waiting for response headers.
    Connecting,
    /// Processing the response body.
    Streaming,
    /// Stream ended normally.
    Completed,
    /// Stream aborted with an error.
    Failed {
        /// Classification of the failure.
        kind: ErrorKind,
    },
    /// Stream aborted by cancellation.
    Cancelled {
        /// True for an explicit user stop, false for a deadline.
        user_initiated: bool,
    },
}

impl SessionState {
    /// Whether no further transitions are possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Streaming => write!(f, "streaming"),
            Self::Completed => write!(f, "completed"),
            Self::Failed { kind } => write!(f, "failed({kind})"),
            Self::Cancelled { user_initiated: true } => write!(f, "cancelled(user)"),
            Self::Cancelled { user_initiated: false } => write!(f, "cancelled(deadline)"),
        }
    }
}

/// Rejected state transition.
#[derive(Debug, Clone, Error)]
#[error("Invalid session transition: {from} -> {to}")]
pub struct InvalidTransition {
    /// State before the attempted transition.
    pub from: SessionState,
    /// Requested state.
    pub to: SessionState,
}

/// One streaming session, owned by whoever opened it.
#[derive(Debug)]
pub struct StreamSession {
    id: SessionId,
    model: String,
    created_at: DateTime<Utc>,
    started: Instant,
    state: SessionState,
    cancel: CancellationToken,
}

impl StreamSession {
    /// Open a new session for `model` in the `Connecting` state.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: SessionId::new(),
            model: model.into(),
            created_at: now_utc(),
            started: Instant::now(),
            state: SessionState::Connecting,
            cancel: CancellationToken::new(),
        }
    }

    /// Session ID.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Model the session talks to.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Creation time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time since the session was opened.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The session's cancellation token. Cancelling it aborts the session
    /// from any task.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the session has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Response headers arrived with a success status.
    pub fn begin_streaming(&mut self) -> Result<(), InvalidTransition> {
        self.transition(SessionState::Streaming, |s| s == SessionState::Connecting)
    }

    /// Stream ended normally.
    pub fn complete(&mut self) -> Result<(), InvalidTransition> {
        self.transition(SessionState::Completed, |s| s == SessionState::Streaming)
    }

    /// Stream aborted with an error.
    pub fn fail(&mut self, kind: ErrorKind) -> Result<(), InvalidTransition> {
        self.transition(SessionState::Failed { kind }, |s| !s.is_terminal())
    }

    /// Stream aborted by cancellation. Also cancels the session token.
    pub fn cancel(&mut self, user_initiated: bool) -> Result<(), InvalidTransition> {
        self.cancel.cancel();
        self.transition(SessionState::Cancelled { user_initiated }, |s| {
            !s.is_terminal()
        })
    }

    fn transition(
        &mut self,
        to: SessionState,
        allowed: impl Fn(SessionState) -> bool,
    ) -> Result<(), InvalidTransition> {
        if !allowed(self.state) {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        #[cfg(feature = "tracing-integration")]
        tracing::debug!(session = %self.id, from = %self.state, to = %to, "session transition");
        self.state = to;
        Ok(())
    }
}
