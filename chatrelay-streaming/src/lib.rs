//! # chatrelay-streaming
//!
//! The streaming pipeline shared by the relay and the client.
//!
//! Bytes from the network flow through four independent stages:
//!
//! - **[`FrameReader`]**: reassembles newline-delimited protocol lines
//! - **[`EventParser`]**: decodes `data:` lines into [`StreamEvent`]s
//! - **[`ThinkingDemux`]**: splits inline reasoning blocks out of content
//! - **[`UpdateCoalescer`]**: batches deltas into a bounded update rate
//!
//! [`DeadlineManager`] arms the first-token and overall timers that bound
//! each session.
//!
//! ## Example
//!
//! ```rust
//! use chatrelay_streaming::{EventParser, FrameReader, StreamEvent, ThinkingDemux};
//!
//! let mut reader = FrameReader::new();
//! let mut parser = EventParser::new();
//! let mut demux = ThinkingDemux::default();
//!
//! let mut events = Vec::new();
//! for chunk in [
//!     "data: {\"choices\":[{\"delta\":{\"content\":\"<thinking>hm</thinking>\"}}]}\n",
//!     "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n",
//! ] {
//!     for line in reader.feed_str(chunk) {
//!         if let Some(event) = parser.parse(&line) {
//!             events.extend(demux.process_event(event));
//!         }
//!     }
//! }
//!
//! assert_eq!(events.first(), Some(&StreamEvent::ThinkingStarted));
//! assert_eq!(events.last(), Some(&StreamEvent::Done));
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod coalesce;
pub mod deadline;
pub mod demux;
pub mod events;
pub mod frame;
pub mod parser;

// Re-exports
pub use coalesce::{ChannelUpdate, UpdateCoalescer};
pub use deadline::{DeadlineHandle, DeadlineKind, DeadlineManager};
pub use demux::{DemuxMode, ThinkingDemux};
pub use events::{StreamEvent, DONE_SENTINEL};
pub use frame::{FrameReader, FrameStream, LineKind, ProtocolLine, DATA_MARKER};
pub use parser::EventParser;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::{
        ChannelUpdate, DeadlineHandle, DeadlineKind, DeadlineManager, EventParser, FrameReader,
        FrameStream, ProtocolLine, StreamEvent, ThinkingDemux, UpdateCoalescer,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prelude_imports() {
        use crate::prelude::*;

        let demux = ThinkingDemux::default();
        assert!(demux.is_enabled());
        assert_eq!(EventParser::new().malformed_frames(), 0);
    }

    #[test]
    fn test_scenario_through_all_stages() {
        let mut reader = FrameReader::new();
        let mut parser = EventParser::new();
        let mut demux = ThinkingDemux::default();

        let mut wire = String::new();
        for delta in ["He", "llo <thi", "nking>ana", "lysis</thinking> world"] {
            wire.push_str(&StreamEvent::content(delta).encode_frame().unwrap());
        }
        wire.push_str("data: [DONE]\n\n");

        // Re-chunk the wire text at an awkward width.
        let mut events = Vec::new();
        let bytes = wire.as_bytes();
        for chunk in bytes.chunks(7) {
            for line in reader.feed(chunk) {
                if let Some(event) = parser.parse(&line) {
                    events.extend(demux.process_event(event));
                }
            }
        }

        assert_eq!(
            events,
            vec![
                StreamEvent::content("He"),
                StreamEvent::content("llo "),
                StreamEvent::ThinkingStarted,
                StreamEvent::thinking_delta("ana", "ana"),
                StreamEvent::thinking_delta("lysis", "analysis"),
                StreamEvent::thinking_complete("analysis"),
                StreamEvent::content(" world"),
                StreamEvent::Done,
            ]
        );
    }
}
