//! # chatrelay
//!
//! Streaming chat relay for reasoning models.
//!
//! A relay sits between chat clients and an OpenAI-compatible upstream. It
//! forwards the token stream as `data:` lines, moves inline
//! `<thinking>...</thinking>` blocks onto a separate reasoning channel,
//! enforces a first-token and an overall deadline per model, and classifies
//! every failure so a client can decide whether to offer another model.
//! The consumer side coalesces the stream into bounded-rate updates without
//! ever dropping text.
//!
//! ## Quick Start
//!
//! ```ignore
//! use chatrelay::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RelayConfig::new("https://api.example.com/v1/chat/completions")?
//!         .api_key(std::env::var("UPSTREAM_API_KEY")?);
//!     Relay::new(config)?.serve(([127, 0, 0, 1], 8080)).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Description | Default |
//! |---------|-------------|--------|
//! | `client` | Stream consumer | ✅ |
//! | `server` | Axum endpoint and `chatrelay` binary | ❌ |
//! | `tracing-integration` | Log session transitions | ❌ |
//! | `full` | All features | ❌ |
//!
//! ## Architecture
//!
//! - [`chatrelay_core`] - Errors, session lifecycle, configuration
//! - [`chatrelay_streaming`] - Framing, parsing, reasoning demux, deadlines, coalescing
//! - [`chatrelay_relay`] - Upstream client, relay pipeline, HTTP endpoint
//! - `chatrelay_client` - Stream consumer (`client` feature)

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// Crate Re-exports
// ============================================================================

/// Errors, session lifecycle, and configuration.
pub use chatrelay_core as core;

/// Framing, parsing, reasoning demux, deadlines, and coalescing.
pub use chatrelay_streaming as streaming;

/// Relay endpoint.
pub use chatrelay_relay as relay;

/// Stream consumer.
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub use chatrelay_client as client;

// ============================================================================
// Flat Re-exports
// ============================================================================

pub use chatrelay_core::{
    ClientConfig, DeadlineConfig, DeadlineTable, ErrorKind, RelayConfig, RelayError, SessionId,
    SessionState, StreamSession, ThinkingTags,
};

pub use chatrelay_streaming::{
    ChannelUpdate, DeadlineHandle, DeadlineManager, EventParser, FrameStream, StreamEvent,
    ThinkingDemux, UpdateCoalescer,
};

pub use chatrelay_relay::{
    ChatMessage, ChatRequest, Collaborators, EndpointError, Relay, RelayStream, Role,
};

#[cfg(feature = "client")]
pub use chatrelay_client::{ConsumerHandle, ConsumerOutcome, StreamConsumer, StreamObserver};

// ============================================================================
// Prelude
// ============================================================================

/// Convenient prelude for common imports.
///
/// ```rust
/// use chatrelay::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::prelude::*;

    pub use crate::streaming::{ChannelUpdate, StreamEvent};

    pub use crate::relay::{
        ChatMessage, ChatRequest, Collaborators, CreditLedger, EndpointError, IdentityVerifier,
        Relay, RelayStream, TranscriptStore,
    };

    #[cfg(feature = "client")]
    pub use crate::client::{
        ConsumerHandle, ConsumerOutcome, NoopObserver, StreamConsumer, StreamObserver,
    };
}

// ============================================================================
// Version Information
// ============================================================================

/// Returns the current version of chatrelay.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(version(), "0.1.0");
    }

    #[test]
    fn test_prelude_imports() {
        use crate::prelude::*;

        let request = ChatRequest::new("m", vec![ChatMessage::user("hi")]);
        assert!(request.validate().is_ok());
        assert!(ErrorKind::RateLimited.suggests_fallback());
    }

    #[cfg(feature = "client")]
    #[tokio::test]
    async fn test_relay_output_feeds_consumer() {
        use bytes::Bytes;
        use futures::stream;
        use std::sync::Arc;

        let events = [
            StreamEvent::content("Hi "),
            StreamEvent::ThinkingStarted,
            StreamEvent::thinking_delta("hm", "hm"),
            StreamEvent::thinking_complete("hm"),
            StreamEvent::content("there"),
            StreamEvent::Done,
        ];
        let body: Vec<Result<Bytes, std::io::Error>> = events
            .iter()
            .filter_map(StreamEvent::encode_frame)
            .map(|frame| Ok(Bytes::from(frame)))
            .collect();

        let consumer =
            StreamConsumer::new(ClientConfig::new("http://127.0.0.1:1/").unwrap()).unwrap();
        let outcome = consumer
            .consume("m", stream::iter(body), Arc::new(client::NoopObserver))
            .join()
            .await;

        pretty_assertions::assert_eq!(outcome.content, "Hi there");
        pretty_assertions::assert_eq!(outcome.thinking, "hm");
        assert_eq!(outcome.state, SessionState::Completed);
    }
}
