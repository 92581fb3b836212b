//! Callbacks for a consumed stream.

use chatrelay_core::SessionState;
use chatrelay_streaming::ChannelUpdate;

/// Receives coalesced updates while a stream is consumed.
///
/// Callbacks run on the consumer's tasks and must not block. All methods
/// have no-op defaults.
pub trait StreamObserver: Send + Sync {
    /// Answer text was flushed.
    fn on_content(&self, update: &ChannelUpdate) {
        let _ = update;
    }

    /// Reasoning text was flushed.
    fn on_thinking(&self, update: &ChannelUpdate) {
        let _ = update;
    }

    /// A reasoning block opened.
    fn on_thinking_started(&self) {}

    /// A reasoning block closed.
    fn on_thinking_complete(&self, accumulated: &str) {
        let _ = accumulated;
    }

    /// The session changed state.
    fn on_state(&self, state: SessionState) {
        let _ = state;
    }
}

/// Ignores every callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl StreamObserver for NoopObserver {}
