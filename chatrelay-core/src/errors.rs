//! Error types for chatrelay.
//!
//! Every failure a streaming session can end with is classified into an
//! [`ErrorKind`]. The kind travels with the error across the relay and the
//! client so callers can decide on user-facing messaging and whether to
//! offer a fallback model.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification of a session failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Upstream answered 429.
    RateLimited,
    /// Upstream answered 402 (credits or quota used up).
    QuotaExhausted,
    /// Upstream answered with a 5xx other than 504.
    UpstreamUnavailable,
    /// Upstream answered 504, or the overall deadline elapsed.
    GatewayTimeout,
    /// No content byte arrived before the first-token deadline.
    FirstTokenTimeout,
    /// The user stopped the stream.
    UserCancelled,
    /// A protocol line could not be decoded. Recovered locally.
    MalformedUpstreamFrame,
    /// Connection reset, DNS failure, unexpected status, and so on.
    UnknownFailure,
}

impl ErrorKind {
    /// Classify a non-success HTTP status.
    ///
    /// Returns `None` for success statuses.
    #[must_use]
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            402 => Some(Self::QuotaExhausted),
            429 => Some(Self::RateLimited),
            504 => Some(Self::GatewayTimeout),
            500..=599 => Some(Self::UpstreamUnavailable),
            _ => Some(Self::UnknownFailure),
        }
    }

    /// Whether a caller should suggest switching to another model.
    #[must_use]
    pub fn suggests_fallback(self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::UpstreamUnavailable
                | Self::GatewayTimeout
                | Self::FirstTokenTimeout
        )
    }

    /// Whether this kind is one of the deadline expiries.
    #[must_use]
    pub fn is_timeout(self) -> bool {
        matches!(self, Self::GatewayTimeout | Self::FirstTokenTimeout)
    }

    /// Stable snake_case code, as used on the wire.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::QuotaExhausted => "quota_exhausted",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::GatewayTimeout => "gateway_timeout",
            Self::FirstTokenTimeout => "first_token_timeout",
            Self::UserCancelled => "user_cancelled",
            Self::MalformedUpstreamFrame => "malformed_upstream_frame",
            Self::UnknownFailure => "unknown_failure",
        }
    }

    /// HTTP status the relay answers with when this failure happens before
    /// any byte has been streamed to the client.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::RateLimited => 429,
            Self::QuotaExhausted => 402,
            Self::UpstreamUnavailable => 503,
            Self::GatewayTimeout | Self::FirstTokenTimeout => 504,
            Self::UserCancelled => 499,
            Self::MalformedUpstreamFrame | Self::UnknownFailure => 502,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Errors that end a streaming session.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// Rate limited by the upstream provider.
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Suggested retry delay, from `Retry-After`.
        retry_after: Option<Duration>,
    },

    /// Upstream quota or credits exhausted.
    #[error("Quota exhausted: {0}")]
    QuotaExhausted(String),

    /// Upstream returned a server error.
    #[error("Upstream unavailable: HTTP {status} - {body}")]
    UpstreamUnavailable {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Upstream gateway timeout, or the overall deadline elapsed.
    #[error("Gateway timeout{}", fmt_after(.after))]
    GatewayTimeout {
        /// The overall deadline, when it was the local deadline that elapsed.
        after: Option<Duration>,
    },

    /// No content arrived before the first-token deadline.
    #[error("No first token within {0:?}")]
    FirstTokenTimeout(Duration),

    /// The user stopped the stream.
    #[error("Stream stopped by user")]
    UserCancelled,

    /// A protocol line could not be decoded.
    #[error("Malformed upstream frame: {raw}")]
    MalformedFrame {
        /// The undecodable payload.
        raw: String,
    },

    /// Upstream answered with a status outside the other categories.
    #[error("HTTP error: {status} - {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Transport failure (connect, DNS, reset).
    #[error("Connection error: {0}")]
    Connection(String),

    /// The relay reported a failure in-band.
    #[error("{kind}: {message}")]
    Remote {
        /// Kind reported by the relay.
        kind: ErrorKind,
        /// Message reported by the relay.
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

fn fmt_after(after: &Option<Duration>) -> String {
    match after {
        Some(after) => format!(" after {after:?}"),
        None => String::new(),
    }
}

impl RelayError {
    /// The classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::QuotaExhausted(_) => ErrorKind::QuotaExhausted,
            Self::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
            Self::GatewayTimeout { .. } => ErrorKind::GatewayTimeout,
            Self::FirstTokenTimeout(_) => ErrorKind::FirstTokenTimeout,
            Self::UserCancelled => ErrorKind::UserCancelled,
            Self::MalformedFrame { .. } => ErrorKind::MalformedUpstreamFrame,
            Self::Http { .. } | Self::Connection(_) | Self::Configuration(_) => {
                ErrorKind::UnknownFailure
            }
            Self::Remote { kind, .. } => *kind,
        }
    }

    /// Whether the caller should suggest a fallback model.
    #[must_use]
    pub fn suggests_fallback(&self) -> bool {
        self.kind().suggests_fallback()
    }

    /// Whether this was a user-initiated stop rather than a failure.
    #[must_use]
    pub fn is_user_cancelled(&self) -> bool {
        self.kind() == ErrorKind::UserCancelled
    }

    /// Build the error for a non-success upstream response.
    pub fn from_status(status: u16, body: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let body = body.into();
        match ErrorKind::from_status(status) {
            Some(ErrorKind::RateLimited) => Self::RateLimited { retry_after },
            Some(ErrorKind::QuotaExhausted) => Self::QuotaExhausted(body),
            Some(ErrorKind::GatewayTimeout) => Self::GatewayTimeout { after: None },
            Some(ErrorKind::UpstreamUnavailable) => Self::UpstreamUnavailable { status, body },
            _ => Self::Http { status, body },
        }
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create an error reported in-band by the relay.
    pub fn remote(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Remote {
            kind,
            message: message.into(),
        }
    }

    /// Short text suitable for showing next to a partial response.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self.kind() {
            ErrorKind::RateLimited => "The model is busy right now. Try again or pick another model.",
            ErrorKind::QuotaExhausted => "You have run out of credits.",
            ErrorKind::UpstreamUnavailable => "The model provider is unavailable. Try another model.",
            ErrorKind::GatewayTimeout => "The response took too long and was cut off.",
            ErrorKind::FirstTokenTimeout => "The model did not start answering in time.",
            ErrorKind::UserCancelled => "Stopped.",
            ErrorKind::MalformedUpstreamFrame | ErrorKind::UnknownFailure => {
                "Something went wrong while streaming the response."
            }
        }
    }
}

/// Result type alias using [`RelayError`].
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(200, None)]
    #[case(204, None)]
    #[case(402, Some(ErrorKind::QuotaExhausted))]
    #[case(429, Some(ErrorKind::RateLimited))]
    #[case(500, Some(ErrorKind::UpstreamUnavailable))]
    #[case(503, Some(ErrorKind::UpstreamUnavailable))]
    #[case(504, Some(ErrorKind::GatewayTimeout))]
    #[case(401, Some(ErrorKind::UnknownFailure))]
    #[case(404, Some(ErrorKind::UnknownFailure))]
    fn test_kind_from_status(#[case] status: u16, #[case] expected: Option<ErrorKind>) {
        assert_eq!(ErrorKind::from_status(status), expected);
    }

    #[test]
    fn test_fallback_policy() {
        assert!(ErrorKind::GatewayTimeout.suggests_fallback());
        assert!(ErrorKind::FirstTokenTimeout.suggests_fallback());
        assert!(ErrorKind::UpstreamUnavailable.suggests_fallback());

        assert!(!ErrorKind::UserCancelled.suggests_fallback());
        assert!(!ErrorKind::QuotaExhausted.suggests_fallback());
        assert!(!ErrorKind::UnknownFailure.suggests_fallback());
    }

    #[test]
    fn test_from_status_keeps_details() {
        let err = RelayError::from_status(429, "slow down", Some(Duration::from_secs(3)));
        assert!(matches!(
            err,
            RelayError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(3)
        ));

        let err = RelayError::from_status(502, "bad gateway", None);
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
        assert!(err.to_string().contains("502"));

        let err = RelayError::from_status(418, "teapot", None);
        assert_eq!(err.kind(), ErrorKind::UnknownFailure);
    }

    #[test]
    fn test_error_display() {
        let err = RelayError::GatewayTimeout {
            after: Some(Duration::from_millis(100)),
        };
        assert_eq!(err.to_string(), "Gateway timeout after 100ms");

        let err = RelayError::GatewayTimeout { after: None };
        assert_eq!(err.to_string(), "Gateway timeout");

        let err = RelayError::remote(ErrorKind::RateLimited, "busy");
        assert_eq!(err.to_string(), "rate_limited: busy");
        assert_eq!(err.kind(), ErrorKind::RateLimited);
    }

    #[test]
    fn test_kind_serde_matches_code() {
        for kind in [
            ErrorKind::RateLimited,
            ErrorKind::FirstTokenTimeout,
            ErrorKind::MalformedUpstreamFrame,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.code()));
        }
    }

    #[test]
    fn test_user_cancelled_is_distinct_from_timeout() {
        assert!(RelayError::UserCancelled.is_user_cancelled());
        assert!(!RelayError::FirstTokenTimeout(Duration::from_secs(1)).is_user_cancelled());
        assert!(ErrorKind::FirstTokenTimeout.is_timeout());
        assert!(!ErrorKind::UserCancelled.is_timeout());
    }
}
