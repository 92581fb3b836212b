//! Streaming event types and their wire encoding.
//!
//! Every event the relay emits becomes exactly one `data:` line on the
//! outbound stream. Content deltas use the same chat-completion chunk shape
//! as a plain pass-through stream, so a client that knows nothing about the
//! thinking channel still renders the answer. Thinking events carry
//! `"thinking": true` and are routed to the reasoning panel.

use chatrelay_core::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

/// Terminal sentinel payload.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Events flowing through the streaming pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Answer text.
    ContentDelta {
        /// The text content.
        text: String,
    },

    /// A reasoning block opened.
    ThinkingStarted,

    /// Reasoning text.
    ThinkingDelta {
        /// New text since the previous delta.
        text: String,
        /// All reasoning text of the current block so far.
        accumulated: String,
    },

    /// A reasoning block closed (or was cut off).
    ThinkingComplete {
        /// The full reasoning text of the block.
        accumulated: String,
    },

    /// The upstream signalled the end of the stream.
    Done,

    /// A data line that could not be decoded. Never re-emitted.
    ParseError {
        /// The undecodable payload.
        raw: String,
    },

    /// The relay aborted an already-streaming response.
    Error {
        /// Failure classification.
        kind: ErrorKind,
        /// Human-readable message.
        message: String,
    },
}

impl StreamEvent {
    /// Create a content delta.
    pub fn content(text: impl Into<String>) -> Self {
        Self::ContentDelta { text: text.into() }
    }

    /// Create a thinking delta.
    pub fn thinking_delta(text: impl Into<String>, accumulated: impl Into<String>) -> Self {
        Self::ThinkingDelta {
            text: text.into(),
            accumulated: accumulated.into(),
        }
    }

    /// Create a thinking-complete event.
    pub fn thinking_complete(accumulated: impl Into<String>) -> Self {
        Self::ThinkingComplete {
            accumulated: accumulated.into(),
        }
    }

    /// Create an in-band error event.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    /// Check if this event ends the stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }

    /// Check if this event belongs to the thinking channel.
    #[must_use]
    pub fn is_thinking(&self) -> bool {
        matches!(
            self,
            Self::ThinkingStarted | Self::ThinkingDelta { .. } | Self::ThinkingComplete { .. }
        )
    }

    /// Get the text if this is a content delta.
    pub fn as_content(&self) -> Option<&str> {
        match self {
            Self::ContentDelta { text } => Some(text),
            _ => None,
        }
    }

    /// Encode the payload of this event's `data:` line.
    ///
    /// Returns `None` for [`StreamEvent::ParseError`], which is never sent.
    #[must_use]
    pub fn to_payload(&self) -> Option<String> {
        let value = match self {
            Self::ContentDelta { text } => json!({
                "choices": [{ "index": 0, "delta": { "content": text } }]
            }),
            Self::ThinkingStarted => json!({ "thinking": true, "started": true }),
            Self::ThinkingDelta { text, accumulated } => json!({
                "thinking": true,
                "delta": text,
                "accumulated": accumulated,
            }),
            Self::ThinkingComplete { accumulated } => json!({
                "thinking": true,
                "complete": true,
                "accumulated": accumulated,
            }),
            Self::Error { kind, message } => json!({
                "error": { "kind": kind, "message": message }
            }),
            Self::Done => return Some(DONE_SENTINEL.to_string()),
            Self::ParseError { .. } => return None,
        };
        Some(value.to_string())
    }

    /// Encode this event as a complete `data:` frame including the blank
    /// separator line.
    #[must_use]
    pub fn encode_frame(&self) -> Option<String> {
        self.to_payload().map(|payload| format!("data: {payload}\n\n"))
    }
}

impl fmt::Display for StreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContentDelta { text } => write!(f, "{}", text),
            Self::ThinkingStarted => write!(f, "[thinking_started]"),
            Self::ThinkingDelta { text, .. } => write!(f, "[thinking] {}", text),
            Self::ThinkingComplete { accumulated } => {
                write!(f, "[thinking_complete] {} chars", accumulated.chars().count())
            }
            Self::Done => write!(f, "[done]"),
            Self::ParseError { raw } => write!(f, "[parse_error] {}", raw),
            Self::Error { kind, message } => write!(f, "[error] {}: {}", kind, message),
        }
    }
}
