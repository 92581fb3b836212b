//! Errors surfaced by the relay endpoint before streaming starts.

use chatrelay_core::{ErrorKind, RelayError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collaborators::CollaboratorError;

/// Why a relay session could not be opened.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// The identity collaborator rejected the caller.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The caller has no credit for this model.
    #[error("Insufficient credits for model {0}")]
    InsufficientCredits(String),

    /// The request body cannot be forwarded.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A collaborator backend failed.
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// The upstream could not be opened.
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl EndpointError {
    /// HTTP status for the relay's own response.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::InsufficientCredits(_) => 402,
            Self::InvalidRequest(_) => 400,
            Self::Collaborator(_) => 500,
            Self::Relay(e) => e.kind().http_status(),
        }
    }

    /// Stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::InsufficientCredits(_) => ErrorKind::QuotaExhausted.code(),
            Self::InvalidRequest(_) => "invalid_request",
            Self::Collaborator(_) => "internal_error",
            Self::Relay(e) => e.kind().code(),
        }
    }

    /// Whether the client should offer a different model.
    #[must_use]
    pub fn suggests_fallback(&self) -> bool {
        matches!(self, Self::Relay(e) if e.suggests_fallback())
    }

    /// The upstream failure, if this came from the upstream.
    #[must_use]
    pub fn relay_error(&self) -> Option<&RelayError> {
        match self {
            Self::Relay(e) => Some(e),
            _ => None,
        }
    }
}

/// JSON body of a non-streaming error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error details.
    pub error: ErrorBody,
}

/// Error details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Whether a fallback model should be offered.
    #[serde(default)]
    pub fallback: bool,
}

impl From<&EndpointError> for ErrorResponse {
    fn from(error: &EndpointError) -> Self {
        Self {
            error: ErrorBody {
                kind: error.code().to_string(),
                message: error.to_string(),
                fallback: error.suggests_fallback(),
            },
        }
    }
}
