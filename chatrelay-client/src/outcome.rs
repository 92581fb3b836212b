//! Result of a consumed stream.

use chatrelay_core::{RelayError, SessionId, SessionState};

/// What a consumer ended with.
///
/// Partial text is always kept. `incomplete` marks outputs that were cut
/// off by a failure, a deadline, or a stop.
#[derive(Debug, Clone)]
pub struct ConsumerOutcome {
    /// Client-side session ID.
    pub session_id: SessionId,
    /// Terminal state.
    pub state: SessionState,
    /// Answer text received.
    pub content: String,
    /// Reasoning text received, all blocks concatenated.
    pub thinking: String,
    /// Why the session did not complete.
    pub error: Option<RelayError>,
    /// True unless the session completed.
    pub incomplete: bool,
}

impl ConsumerOutcome {
    /// Whether the stream ended normally.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == SessionState::Completed
    }

    /// Whether a fallback model should be offered.
    #[must_use]
    pub fn suggests_fallback(&self) -> bool {
        self.error.as_ref().is_some_and(RelayError::suggests_fallback)
    }

    /// Short status text for the user, if the stream did not complete.
    #[must_use]
    pub fn notice(&self) -> Option<&'static str> {
        self.error.as_ref().map(RelayError::user_message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_core::ErrorKind;

    fn outcome(state: SessionState, error: Option<RelayError>) -> ConsumerOutcome {
        ConsumerOutcome {
            session_id: SessionId::new(),
            incomplete: state != SessionState::Completed,
            state,
            content: "partial".into(),
            thinking: String::new(),
            error,
        }
    }

    #[test]
    fn test_completed() {
        let done = outcome(SessionState::Completed, None);
        assert!(done.is_complete());
        assert!(!done.incomplete);
        assert!(done.notice().is_none());
    }

    #[test]
    fn test_rate_limited_offers_fallback() {
        let failed = outcome(
            SessionState::Failed {
                kind: ErrorKind::RateLimited,
            },
            Some(RelayError::RateLimited { retry_after: None }),
        );
        assert!(failed.incomplete);
        assert!(failed.suggests_fallback());
        assert_eq!(failed.content, "partial");
    }

    #[test]
    fn test_user_stop_has_no_fallback() {
        let stopped = outcome(
            SessionState::Cancelled {
                user_initiated: true,
            },
            Some(RelayError::UserCancelled),
        );
        assert!(!stopped.suggests_fallback());
        assert_eq!(stopped.notice(), Some("Stopped."));
    }
}
