//! # chatrelay-client
//!
//! Consumer side of a chatrelay stream.
//!
//! [`StreamConsumer`] posts a chat request to a relay endpoint (or takes an
//! already-open byte stream), enforces the per-model deadlines on its own,
//! and reports answer and reasoning text through a [`StreamObserver`] at a
//! bounded rate. The final [`ConsumerOutcome`] always carries every byte
//! that was received, even when the stream was cut off.
//!
//! ## Example
//!
//! ```rust,ignore
//! use chatrelay_client::prelude::*;
//! use std::sync::Arc;
//!
//! struct Print;
//!
//! impl StreamObserver for Print {
//!     fn on_content(&self, update: &ChannelUpdate) {
//!         print!("{}", update.delta);
//!     }
//! }
//!
//! let consumer = StreamConsumer::new(ClientConfig::new("http://localhost:8080/v1/chat/stream")?)?;
//! let handle = consumer.start(
//!     ChatRequest::new("reasoner", vec![ChatMessage::user("Hello")]),
//!     Arc::new(Print),
//! );
//! let outcome = handle.join().await;
//! if outcome.suggests_fallback() {
//!     // offer another model
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod consumer;
pub mod observer;
pub mod outcome;

pub use consumer::{ConsumerHandle, StreamConsumer};
pub use observer::{NoopObserver, StreamObserver};
pub use outcome::ConsumerOutcome;

/// Prelude module for common imports.
pub mod prelude {
    pub use crate::{ConsumerHandle, ConsumerOutcome, NoopObserver, StreamConsumer, StreamObserver};
    pub use chatrelay_core::{ClientConfig, SessionState};
    pub use chatrelay_relay::{ChatMessage, ChatRequest};
    pub use chatrelay_streaming::ChannelUpdate;
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use bytes::Bytes;
    use futures::stream;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_noop_observer_consumes() {
        let consumer = StreamConsumer::new(ClientConfig::new("http://127.0.0.1:1/").unwrap()).unwrap();
        let body = stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n",
            )),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ]);

        let outcome = consumer.consume("m", body, Arc::new(NoopObserver)).join().await;
        assert!(outcome.is_complete());
        assert_eq!(outcome.content, "hi");
    }
}
