//! Relay and client configuration.
//!
//! Deadlines are per model: a reasoning model may legitimately think for a
//! minute before its first token, a small chat model should not. The
//! [`DeadlineTable`] maps model identifiers to [`DeadlineConfig`] entries and
//! falls back to a default entry for unlisted models.

use crate::errors::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default wait for the first content byte.
pub const DEFAULT_FIRST_TOKEN_MS: u64 = 30_000;
/// Default bound on a whole session.
pub const DEFAULT_OVERALL_MS: u64 = 120_000;
/// Default coalescer flush interval.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 50;

/// First-token and overall deadlines for one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlineConfig {
    /// Maximum wait from session start until the first content byte.
    pub first_token_ms: u64,
    /// Maximum total session duration, regardless of progress.
    pub overall_ms: u64,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            first_token_ms: DEFAULT_FIRST_TOKEN_MS,
            overall_ms: DEFAULT_OVERALL_MS,
        }
    }
}

impl DeadlineConfig {
    /// Create a deadline pair from milliseconds.
    #[must_use]
    pub fn new(first_token_ms: u64, overall_ms: u64) -> Self {
        Self {
            first_token_ms,
            overall_ms,
        }
    }

    /// The first-token deadline.
    #[must_use]
    pub fn first_token(&self) -> Duration {
        Duration::from_millis(self.first_token_ms)
    }

    /// The overall deadline.
    #[must_use]
    pub fn overall(&self) -> Duration {
        Duration::from_millis(self.overall_ms)
    }
}

/// Per-model deadline table with a default fallback entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeadlineTable {
    /// Entry used for models not listed in `models`.
    #[serde(default)]
    pub default: DeadlineConfig,
    /// Entries keyed by model identifier.
    #[serde(default)]
    pub models: HashMap<String, DeadlineConfig>,
}

impl DeadlineTable {
    /// Create a table with only a default entry.
    #[must_use]
    pub fn new(default: DeadlineConfig) -> Self {
        Self {
            default,
            models: HashMap::new(),
        }
    }

    /// Add or replace a model entry.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>, deadlines: DeadlineConfig) -> Self {
        self.models.insert(model.into(), deadlines);
        self
    }

    /// Deadlines for `model`, or the default entry.
    #[must_use]
    pub fn for_model(&self, model: &str) -> DeadlineConfig {
        self.models.get(model).copied().unwrap_or(self.default)
    }

    /// Parse a table from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| RelayError::configuration(format!("invalid deadline table: {e}")))
    }

    /// Load a table from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            RelayError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }
}

/// Start/end markers delimiting an embedded reasoning block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingTags {
    /// Opening marker.
    pub start: String,
    /// Closing marker.
    pub end: String,
}

impl Default for ThinkingTags {
    fn default() -> Self {
        Self::new("<thinking>", "</thinking>")
    }
}

impl ThinkingTags {
    /// Create a marker pair.
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Check that both markers are non-empty.
    pub fn validate(&self) -> Result<()> {
        if self.start.is_empty() || self.end.is_empty() {
            return Err(RelayError::configuration(
                "thinking markers must not be empty",
            ));
        }
        Ok(())
    }
}

/// Configuration of the relay endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Upstream chat-completions URL.
    pub upstream_url: Url,
    /// Bearer token for the upstream provider.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Per-model deadlines.
    #[serde(default)]
    pub deadlines: DeadlineTable,
    /// Reasoning markers.
    #[serde(default)]
    pub thinking_tags: ThinkingTags,
    /// Outbound events buffered per session before the reader waits.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    64
}

impl RelayConfig {
    /// Create a config for the given upstream URL.
    pub fn new(upstream_url: &str) -> Result<Self> {
        let upstream_url = Url::parse(upstream_url)
            .map_err(|e| RelayError::configuration(format!("invalid upstream url: {e}")))?;
        Ok(Self {
            upstream_url,
            api_key: None,
            deadlines: DeadlineTable::default(),
            thinking_tags: ThinkingTags::default(),
            channel_capacity: default_channel_capacity(),
        })
    }

    /// Set the upstream API key.
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the deadline table.
    #[must_use]
    pub fn deadlines(mut self, deadlines: DeadlineTable) -> Self {
        self.deadlines = deadlines;
        self
    }

    /// Set the reasoning markers.
    #[must_use]
    pub fn thinking_tags(mut self, tags: ThinkingTags) -> Self {
        self.thinking_tags = tags;
        self
    }

    /// Check values that deserialization alone cannot rule out.
    pub fn validate(&self) -> Result<()> {
        self.thinking_tags.validate()?;
        if self.channel_capacity == 0 {
            return Err(RelayError::configuration(
                "channel_capacity must be at least 1",
            ));
        }
        Ok(())
    }

    /// Read configuration from the environment.
    ///
    /// - `CHATRELAY_UPSTREAM_URL` (required)
    /// - `CHATRELAY_API_KEY`
    /// - `CHATRELAY_DEADLINES`: path to a JSON [`DeadlineTable`]
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("CHATRELAY_UPSTREAM_URL")
            .map_err(|_| RelayError::configuration("CHATRELAY_UPSTREAM_URL is not set"))?;
        let mut config = Self::new(&url)?;

        if let Ok(key) = std::env::var("CHATRELAY_API_KEY") {
            config = config.api_key(key);
        }
        if let Ok(path) = std::env::var("CHATRELAY_DEADLINES") {
            config = config.deadlines(DeadlineTable::from_file(&path)?);
            #[cfg(feature = "tracing-integration")]
            tracing::debug!(path = %path, "loaded deadline table");
        }

        config.validate()?;
        Ok(config)
    }
}

/// Configuration of the stream consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Relay endpoint URL.
    pub endpoint: Url,
    /// Bearer token presented to the relay.
    #[serde(default, skip_serializing)]
    pub auth_token: Option<String>,
    /// Per-model deadlines.
    #[serde(default)]
    pub deadlines: DeadlineTable,
    /// Interval between coalesced UI updates.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL_MS
}

impl ClientConfig {
    /// Create a config for the given relay endpoint.
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| RelayError::configuration(format!("invalid endpoint url: {e}")))?;
        Ok(Self {
            endpoint,
            auth_token: None,
            deadlines: DeadlineTable::default(),
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
        })
    }

    /// Set the bearer token.
    #[must_use]
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Set the deadline table.
    #[must_use]
    pub fn deadlines(mut self, deadlines: DeadlineTable) -> Self {
        self.deadlines = deadlines;
        self
    }

    /// Set the flush interval.
    #[must_use]
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = interval.as_millis() as u64;
        self
    }

    /// The flush interval as a duration.
    #[must_use]
    pub fn flush_interval_duration(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}
