//! Thinking-block demultiplexer.
//!
//! Some models interleave their reasoning with the answer inside one text
//! stream, wrapped in `<thinking>…</thinking>` markers. [`ThinkingDemux`]
//! splits each content delta into answer text and reasoning text with a
//! two-state machine, so the client can render both as independent live
//! channels.
//!
//! Markers may be cut anywhere by the network. A trailing fragment that
//! could be the beginning of the next marker (`"<thi"`) is held back and
//! re-examined together with the next delta. The scan never backtracks over
//! emitted text, and splitting the same input at different byte offsets
//! yields the same content text, the same reasoning blocks and the same
//! transition points; only the number of delta events differs.
//!
//! # Example
//!
//! ```rust
//! use chatrelay_streaming::{StreamEvent, ThinkingDemux};
//!
//! let mut demux = ThinkingDemux::default();
//! let mut events = demux.process("Hi <thinking>plan");
//! events.extend(demux.process("</thinking>there"));
//!
//! assert_eq!(events[0], StreamEvent::content("Hi "));
//! assert_eq!(events[1], StreamEvent::ThinkingStarted);
//! assert_eq!(events.last(), Some(&StreamEvent::content("there")));
//! ```

use crate::events::StreamEvent;
use chatrelay_core::ThinkingTags;
use std::mem;

/// Which channel incoming text currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DemuxMode {
    /// Answer text.
    #[default]
    Outside,
    /// Reasoning text.
    InsideThinking,
}

/// Splits a content stream into answer and reasoning channels.
#[derive(Debug, Clone)]
pub struct ThinkingDemux {
    tags: ThinkingTags,
    enabled: bool,
    mode: DemuxMode,
    /// Reasoning text of the open block. Cleared on `ThinkingComplete`.
    accumulator: String,
    /// Trailing fragment that may be the start of a marker.
    pending_tag: String,
}

impl Default for ThinkingDemux {
    fn default() -> Self {
        Self::new(ThinkingTags::default())
    }
}

impl ThinkingDemux {
    /// Create a demultiplexer for the given markers.
    ///
    /// An empty marker cannot be scanned for, so such a pair disables
    /// extraction and every delta is forwarded as content.
    #[must_use]
    pub fn new(tags: ThinkingTags) -> Self {
        let enabled = match tags.validate() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "thinking extraction disabled");
                false
            }
        };
        Self {
            tags,
            enabled,
            mode: DemuxMode::Outside,
            accumulator: String::new(),
            pending_tag: String::new(),
        }
    }

    /// Create a demultiplexer that forwards every delta untouched.
    #[must_use]
    pub fn passthrough() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> DemuxMode {
        self.mode
    }

    /// Reasoning text of the currently open block.
    #[must_use]
    pub fn accumulated(&self) -> &str {
        &self.accumulator
    }

    /// Whether tag extraction is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Process one content delta.
    pub fn process(&mut self, text: &str) -> Vec<StreamEvent> {
        if !self.enabled {
            return if text.is_empty() {
                vec![]
            } else {
                vec![StreamEvent::content(text)]
            };
        }

        let combined;
        let mut remaining = if self.pending_tag.is_empty() {
            text
        } else {
            combined = mem::take(&mut self.pending_tag) + text;
            combined.as_str()
        };

        let mut events = Vec::new();
        while !remaining.is_empty() {
            match self.mode {
                DemuxMode::Outside => {
                    if let Some(pos) = remaining.find(self.tags.start.as_str()) {
                        if pos > 0 {
                            events.push(StreamEvent::content(&remaining[..pos]));
                        }
                        events.push(StreamEvent::ThinkingStarted);
                        self.mode = DemuxMode::InsideThinking;
                        remaining = &remaining[pos + self.tags.start.len()..];
                    } else {
                        let (body, held) = split_partial_marker(remaining, &self.tags.start);
                        if !body.is_empty() {
                            events.push(StreamEvent::content(body));
                        }
                        self.pending_tag = held.to_string();
                        break;
                    }
                }
                DemuxMode::InsideThinking => {
                    if let Some(pos) = remaining.find(self.tags.end.as_str()) {
                        if pos > 0 {
                            events.push(self.push_thinking(&remaining[..pos]));
                        }
                        events.push(StreamEvent::thinking_complete(mem::take(
                            &mut self.accumulator,
                        )));
                        self.mode = DemuxMode::Outside;
                        remaining = &remaining[pos + self.tags.end.len()..];
                    } else {
                        let (body, held) = split_partial_marker(remaining, &self.tags.end);
                        if !body.is_empty() {
                            events.push(self.push_thinking(body));
                        }
                        self.pending_tag = held.to_string();
                        break;
                    }
                }
            }
        }

        events
    }

    /// Route any pipeline event through the demultiplexer.
    ///
    /// Content deltas are split, `Done` is preceded by [`finish`](Self::finish),
    /// parse errors are dropped, everything else passes through.
    pub fn process_event(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        match event {
            StreamEvent::ContentDelta { text } => self.process(&text),
            StreamEvent::Done => {
                let mut events = self.finish();
                events.push(StreamEvent::Done);
                events
            }
            StreamEvent::ParseError { .. } => vec![],
            other => vec![other],
        }
    }

    /// End of the upstream stream.
    ///
    /// Releases a held marker fragment to its channel. A reasoning block that
    /// was never closed is completed with whatever was accumulated, so text
    /// already shown to the user is not lost.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let held = mem::take(&mut self.pending_tag);
        let mut events = Vec::new();

        match self.mode {
            DemuxMode::Outside => {
                if !held.is_empty() {
                    events.push(StreamEvent::content(held));
                }
            }
            DemuxMode::InsideThinking => {
                if !held.is_empty() {
                    events.push(self.push_thinking(&held));
                }
                tracing::warn!(
                    chars = self.accumulator.chars().count(),
                    "thinking block not closed before end of stream"
                );
                events.push(StreamEvent::thinking_complete(mem::take(
                    &mut self.accumulator,
                )));
                self.mode = DemuxMode::Outside;
            }
        }

        events
    }

    fn push_thinking(&mut self, text: &str) -> StreamEvent {
        self.accumulator.push_str(text);
        StreamEvent::thinking_delta(text, self.accumulator.clone())
    }
}

/// Split `text` into the part that is safe to emit and a trailing fragment
/// that is a proper prefix of `marker`.
fn split_partial_marker<'a>(text: &'a str, marker: &str) -> (&'a str, &'a str) {
    let longest = marker.len().saturating_sub(1).min(text.len());
    let held = (1..=longest)
        .rev()
        .map(|n| text.len() - n)
        .find(|&at| text.is_char_boundary(at) && marker.starts_with(&text[at..]))
        .unwrap_or(text.len());
    text.split_at(held)
}
