//! Inbound and upstream request bodies.

use serde::{Deserialize, Serialize};

use crate::error::EndpointError;

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt.
    System,
    /// End user.
    User,
    /// Model reply.
    Assistant,
}

/// One conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author of the message.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

fn default_extract_thinking() -> bool {
    true
}

/// A streaming chat request as received by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model identifier, also the deadline table key.
    pub model: String,
    /// Conversation so far.
    pub messages: Vec<ChatMessage>,
    /// Split inline reasoning blocks into the thinking channel.
    #[serde(default = "default_extract_thinking")]
    pub extract_thinking: bool,
}

impl ChatRequest {
    /// Create a request with thinking extraction enabled.
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            extract_thinking: true,
        }
    }

    /// Enable or disable thinking extraction.
    #[must_use]
    pub fn extract_thinking(mut self, enabled: bool) -> Self {
        self.extract_thinking = enabled;
        self
    }

    /// Reject requests that cannot be forwarded.
    pub fn validate(&self) -> Result<(), EndpointError> {
        if self.model.trim().is_empty() {
            return Err(EndpointError::InvalidRequest("model is required".into()));
        }
        if self.messages.is_empty() {
            return Err(EndpointError::InvalidRequest(
                "at least one message is required".into(),
            ));
        }
        Ok(())
    }

    /// Total characters across all messages.
    #[must_use]
    pub fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }

    /// The body sent to the upstream provider.
    #[must_use]
    pub fn to_upstream(&self) -> UpstreamRequest<'_> {
        UpstreamRequest {
            model: &self.model,
            messages: &self.messages,
            stream: true,
        }
    }
}

/// Upstream chat-completions body. Always streaming.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRequest<'a> {
    /// Model identifier.
    pub model: &'a str,
    /// Conversation.
    pub messages: &'a [ChatMessage],
    /// Always `true`.
    pub stream: bool,
}
