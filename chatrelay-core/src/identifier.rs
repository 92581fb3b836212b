//! ID generation utilities.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Generate a unique session ID.
///
/// Returns a UUID v4 string prefixed with "sess_".
///
/// # Example
///
/// ```rust
/// use chatrelay_core::identifier::generate_session_id;
///
/// let id = generate_session_id();
/// assert!(id.starts_with("sess_"));
/// assert_eq!(id.len(), 37); // "sess_" + 32 hex chars
/// ```
#[must_use]
pub fn generate_session_id() -> String {
    format!("sess_{}", Uuid::new_v4().simple())
}

/// Get the current UTC timestamp.
#[must_use]
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Type-safe wrapper for a session ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Create a new random session ID.
    #[must_use]
    pub fn new() -> Self {
        Self(generate_session_id())
    }

    /// Create from an existing string.
    #[must_use]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
