//! LLM integration — chat types and the streaming completion seam.
//!
//! [`CompletionBackend`] is the only thing the proxy knows about the hosted
//! model: give it an ordered conversation, get back a stream of text deltas.
//! [`OpenAiClient`] implements it against an OpenAI-compatible
//! `/chat/completions` endpoint.

use std::fmt;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod openai;

pub use openai::OpenAiClient;

/// Who authored a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        })
    }
}

/// One turn of a conversation. Transcripts are ordered oldest first.
///
/// # Examples
///
/// ```
/// use bluebox::llm::{ChatMessage, Role};
///
/// let turn = ChatMessage::user("hello");
/// assert_eq!(turn.role, Role::User);
/// assert_eq!(
///     serde_json::to_string(&turn).unwrap(),
///     r#"{"role":"user","content":"hello"}"#
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A streaming completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
}

/// Assistant text deltas in arrival order. Concatenated, they form the reply.
pub type DeltaStream = BoxStream<'static, Result<String, LlmError>>;

/// Errors from the hosted completion API.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("upstream stream interrupted: {0}")]
    Stream(String),

    #[error("malformed upstream event: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A hosted chat-completion API that can stream its reply.
///
/// The returned future resolves once the upstream has accepted the call;
/// errors after that point arrive as items of the [`DeltaStream`].
pub trait CompletionBackend: Send + Sync {
    fn stream_chat(&self, request: CompletionRequest) -> BoxFuture<'_, Result<DeltaStream, LlmError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_serialize_lowercase() {
        let json = serde_json::to_string(&ChatMessage::assistant("Hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"Hi"}"#);
    }

    #[test]
    fn unknown_role_is_rejected() {
        let parsed = serde_json::from_str::<ChatMessage>(r#"{"role":"tool","content":"x"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn role_display_matches_wire_name() {
        assert_eq!(Role::System.to_string(), "system");
    }
}
