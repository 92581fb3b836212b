//! # chatrelay-relay
//!
//! Streaming relay endpoint for chatrelay.
//!
//! The relay accepts a chat request, opens a streaming completion against
//! the upstream provider, and forwards the response as a stream of
//! `data:` lines, splitting inline reasoning into a separate channel.
//!
//! ## Features
//!
//! - Per-model first-token and overall deadlines
//! - Pre-stream failures mapped onto HTTP statuses, later ones sent in-band
//! - Identity, credit, and transcript collaborator traits
//! - Axum server and `chatrelay` binary (`server` feature)
//!
//! ## Example
//!
//! ```rust,ignore
//! use chatrelay_core::RelayConfig;
//! use chatrelay_relay::{ChatMessage, ChatRequest, Relay};
//!
//! let relay = Relay::new(RelayConfig::new("https://api.example.com/v1/chat/completions")?)?;
//!
//! let request = ChatRequest::new("reasoner", vec![ChatMessage::user("Hello")]);
//! let mut stream = relay.open(Some(token), request).await?;
//! while let Some(event) = stream.recv().await {
//!     println!("{event}");
//! }
//!
//! // Or serve over HTTP
//! relay.serve(([0, 0, 0, 0], 8080)).await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod collaborators;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod relay;
pub mod request;
pub mod upstream;

#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

pub use collaborators::{
    AllowAll, CollaboratorError, Collaborators, CreditLedger, DiscardTranscripts,
    IdentityVerifier, InMemoryTranscripts, Transcript, TranscriptStore, UsageRecord,
};
pub use error::{EndpointError, ErrorBody, ErrorResponse};
pub use pipeline::{PipelineEnd, RelayPipeline, RelayedText};
pub use registry::{SessionRecord, SessionRegistry};
pub use relay::{Relay, RelayStream};
pub use request::{ChatMessage, ChatRequest, Role, UpstreamRequest};
pub use upstream::{classify_transport, parse_retry_after, UpstreamBody, UpstreamClient};

#[cfg(feature = "server")]
pub use server::{ServerError, SESSION_HEADER};
