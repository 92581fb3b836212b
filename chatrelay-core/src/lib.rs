//! # chatrelay-core
//!
//! Core types, configuration, and error handling for chatrelay.
//!
//! This crate provides the foundational types shared by the relay and the
//! client:
//!
//! - **Errors**: the [`ErrorKind`] taxonomy and [`RelayError`]
//! - **Settings**: per-model deadline tables, relay and client configuration
//! - **Sessions**: the [`StreamSession`] lifecycle state machine
//! - **Identifiers**: session IDs and timestamps
//!
//! ## Feature Flags
//!
//! - `tracing-integration`: Log session transitions and config loading
//!
//! ## Example
//!
//! ```rust
//! use chatrelay_core::{DeadlineConfig, DeadlineTable, ErrorKind, StreamSession};
//!
//! let table = DeadlineTable::new(DeadlineConfig::new(10_000, 60_000))
//!     .with_model("reasoner", DeadlineConfig::new(60_000, 300_000));
//! assert_eq!(table.for_model("reasoner").first_token_ms, 60_000);
//!
//! let mut session = StreamSession::new("reasoner");
//! session.fail(ErrorKind::RateLimited).unwrap();
//! assert!(session.state().is_terminal());
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod errors;
pub mod identifier;
pub mod session;
pub mod settings;

// Re-exports for convenience
pub use errors::{ErrorKind, RelayError, Result};
pub use identifier::{generate_session_id, now_utc, SessionId};
pub use session::{InvalidTransition, SessionState, StreamSession};
pub use settings::{ClientConfig, DeadlineConfig, DeadlineTable, RelayConfig, ThinkingTags};

/// Prelude module for common imports.
///
/// ```rust
/// use chatrelay_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::errors::{ErrorKind, RelayError, Result};
    pub use crate::identifier::SessionId;
    pub use crate::session::{SessionState, StreamSession};
    pub use crate::settings::{
        ClientConfig, DeadlineConfig, DeadlineTable, RelayConfig, ThinkingTags,
    };
}
