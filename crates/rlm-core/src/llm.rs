//! LLM transport seam.
//!
//! The engine talks to the model through [`LlmTransport`] only. Retries, HTTP
//! and provider quirks live behind the trait; the engine never retries on its
//! own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Chat role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A completed model response with its token accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Opaque transport failure. The engine treats every variant as terminal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("llm endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("llm returned malformed response: {0}")]
    Malformed(String),

    #[error("llm request rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("llm retries exhausted after {attempts} attempt(s): {reason}")]
    RetriesExhausted { attempts: u32, reason: String },
}

/// The single call the engine needs from a model provider.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    /// Complete the conversation. A system prompt, when present, is the
    /// first message.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, TransportError>;

    /// Model identifier recorded in trace headers.
    fn model_name(&self) -> &str {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serializes_lowercase() {
        let msg = ChatMessage::assistant("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(Role::System.to_string(), "system");
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Rejected {
            status: 429,
            message: "slow down".into(),
        };
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("slow down"));
    }
}
