//! Collaborator interfaces consulted around a relay session.
//!
//! Identity, billing, and chat persistence live outside the relay. The relay
//! only needs three narrow capabilities: verify the caller, check and debit
//! credit, persist a finished transcript. Permissive implementations are
//! provided for development and tests.

use async_trait::async_trait;
use chatrelay_core::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::request::ChatMessage;

/// Errors reported by collaborators.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The collaborator refused the operation.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The collaborator backend failed.
    #[error("Collaborator backend error: {0}")]
    Backend(String),
}

/// Usage charged after a completed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Session that produced the usage.
    pub session_id: SessionId,
    /// Caller identity.
    pub user: String,
    /// Model used.
    pub model: String,
    /// Characters sent upstream.
    pub prompt_chars: usize,
    /// Characters received (content plus reasoning).
    pub completion_chars: usize,
}

/// A finished conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    /// Session that produced the reply.
    pub session_id: SessionId,
    /// Caller identity.
    pub user: String,
    /// Model used.
    pub model: String,
    /// When the session was opened.
    pub created_at: DateTime<Utc>,
    /// Conversation sent upstream.
    pub messages: Vec<ChatMessage>,
    /// Answer text.
    pub content: String,
    /// Reasoning text, all blocks concatenated.
    pub thinking: String,
}

/// Resolves a bearer token to a caller identity.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Verify the token. Returns the caller's identity.
    async fn verify(&self, token: Option<String>) -> Result<String, CollaboratorError>;
}

/// Credit checks before a session and debits after it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Whether `user` may start a session on `model`.
    async fn check(&self, user: &str, model: &str) -> Result<bool, CollaboratorError>;

    /// Charge a completed session.
    async fn debit(&self, usage: &UsageRecord) -> Result<(), CollaboratorError>;
}

/// Persists finished transcripts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Store one transcript.
    async fn persist(&self, transcript: &Transcript) -> Result<(), CollaboratorError>;
}

/// Accepts every caller and grants unlimited credit.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl IdentityVerifier for AllowAll {
    async fn verify(&self, _token: Option<String>) -> Result<String, CollaboratorError> {
        Ok("anonymous".to_string())
    }
}

#[async_trait]
impl CreditLedger for AllowAll {
    async fn check(&self, _user: &str, _model: &str) -> Result<bool, CollaboratorError> {
        Ok(true)
    }

    async fn debit(&self, usage: &UsageRecord) -> Result<(), CollaboratorError> {
        tracing::debug!(
            session = %usage.session_id,
            completion_chars = usage.completion_chars,
            "debit skipped"
        );
        Ok(())
    }
}

/// Drops every transcript.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardTranscripts;

#[async_trait]
impl TranscriptStore for DiscardTranscripts {
    async fn persist(&self, _transcript: &Transcript) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// In-memory transcript store.
///
/// Suitable for development and testing. Transcripts are lost when the
/// process terminates.
#[derive(Debug, Default, Clone)]
pub struct InMemoryTranscripts {
    transcripts: Arc<RwLock<Vec<Transcript>>>,
}

impl InMemoryTranscripts {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored transcripts.
    pub async fn len(&self) -> usize {
        self.transcripts.read().await.len()
    }

    /// Check if the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.transcripts.read().await.is_empty()
    }

    /// All stored transcripts, oldest first.
    pub async fn all(&self) -> Vec<Transcript> {
        self.transcripts.read().await.clone()
    }
}

#[async_trait]
impl TranscriptStore for InMemoryTranscripts {
    async fn persist(&self, transcript: &Transcript) -> Result<(), CollaboratorError> {
        self.transcripts.write().await.push(transcript.clone());
        Ok(())
    }
}

/// The collaborators a relay consults.
#[derive(Clone)]
pub struct Collaborators {
    /// Caller verification.
    pub identity: Arc<dyn IdentityVerifier>,
    /// Credit check and debit.
    pub credits: Arc<dyn CreditLedger>,
    /// Transcript persistence.
    pub transcripts: Arc<dyn TranscriptStore>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            identity: Arc::new(AllowAll),
            credits: Arc::new(AllowAll),
            transcripts: Arc::new(DiscardTranscripts),
        }
    }
}

impl Collaborators {
    /// Replace the identity verifier.
    #[must_use]
    pub fn identity(mut self, identity: Arc<dyn IdentityVerifier>) -> Self {
        self.identity = identity;
        self
    }

    /// Replace the credit ledger.
    #[must_use]
    pub fn credits(mut self, credits: Arc<dyn CreditLedger>) -> Self {
        self.credits = credits;
        self
    }

    /// Replace the transcript store.
    #[must_use]
    pub fn transcripts(mut self, transcripts: Arc<dyn TranscriptStore>) -> Self {
        self.transcripts = transcripts;
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
