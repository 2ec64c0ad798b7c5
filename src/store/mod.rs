//! Chat persistence.
//!
//! [`ChatStore`] is the collaborator a [`ChatSession`](crate::consumer::ChatSession)
//! writes to when a user is signed in. The session only ever appends: one
//! user message when a send starts and one assistant message when the reply
//! finishes. [`MemoryChatStore`] keeps everything in process memory.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::llm::{ChatMessage, Role};

/// Chats titled from their first user message keep at most this many chars.
pub const TITLE_MAX_CHARS: usize = 40;

/// Title of a chat that has no user message yet.
pub const UNTITLED: &str = "New Chat";

const ELLIPSIS: &str = "...";

/// A signed-in user. Chats are owned by exactly one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub id: String,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(Uuid);

impl ChatId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChatId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ChatId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// A message as it was persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn new(message: ChatMessage) -> Self {
        Self {
            role: message.role,
            content: message.content,
            created_at: Utc::now(),
        }
    }

    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage::new(self.role, self.content.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    pub user_id: String,
    pub title: String,
    pub messages: Vec<StoredMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    pub fn transcript(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(StoredMessage::to_chat_message).collect()
    }

    pub fn summary(&self) -> ChatSummary {
        ChatSummary {
            id: self.id,
            title: self.title.clone(),
            message_count: self.messages.len(),
            updated_at: self.updated_at,
        }
    }
}

/// One row of a user's chat list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: ChatId,
    pub title: String,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("chat {0} not found")]
    NotFound(ChatId),

    #[error("chat {chat} is not owned by user {user}")]
    Forbidden { chat: ChatId, user: String },

    #[error("storage backend failed: {0}")]
    Backend(String),
}

/// Where chats live between sessions.
pub trait ChatStore: Send + Sync {
    fn create_chat<'a>(&'a self, user: &'a User) -> BoxFuture<'a, Result<ChatId, StoreError>>;

    fn add_message_to_chat<'a>(
        &'a self,
        user: &'a User,
        chat: ChatId,
        message: ChatMessage,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    fn get_chat<'a>(&'a self, user: &'a User, chat: ChatId) -> BoxFuture<'a, Result<Chat, StoreError>>;

    /// Newest activity first.
    fn get_user_chats<'a>(&'a self, user: &'a User) -> BoxFuture<'a, Result<Vec<ChatSummary>, StoreError>>;

    fn delete_chat<'a>(&'a self, user: &'a User, chat: ChatId) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// Derives a chat title from its first user message.
pub fn title_from(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return UNTITLED.to_owned();
    }
    if trimmed.chars().count() <= TITLE_MAX_CHARS {
        return trimmed.to_owned();
    }
    // The ellipsis counts toward the limit.
    let keep = TITLE_MAX_CHARS - ELLIPSIS.len();
    match trimmed.char_indices().nth(keep) {
        Some((cut, _)) => format!("{}{ELLIPSIS}", trimmed[..cut].trim_end()),
        None => trimmed.to_owned(),
    }
}

/// A [`ChatStore`] backed by a map in process memory.
#[derive(Debug, Default)]
pub struct MemoryChatStore {
    chats: RwLock<HashMap<ChatId, Chat>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.chats.read().await.len()
    }
}

fn owned<'a>(chats: &'a HashMap<ChatId, Chat>, user: &User, id: ChatId) -> Result<&'a Chat, StoreError> {
    let chat = chats.get(&id).ok_or(StoreError::NotFound(id))?;
    if chat.user_id != user.id {
        return Err(StoreError::Forbidden {
            chat: id,
            user: user.id.clone(),
        });
    }
    Ok(chat)
}

impl ChatStore for MemoryChatStore {
    fn create_chat<'a>(&'a self, user: &'a User) -> BoxFuture<'a, Result<ChatId, StoreError>> {
        Box::pin(async move {
            let now = Utc::now();
            let chat = Chat {
                id: ChatId::new(),
                user_id: user.id.clone(),
                title: UNTITLED.to_owned(),
                messages: Vec::new(),
                created_at: now,
                updated_at: now,
            };
            let id = chat.id;
            self.chats.write().await.insert(id, chat);
            tracing::debug!(chat = %id, user = %user.id, "chat created");
            Ok(id)
        })
    }

    fn add_message_to_chat<'a>(
        &'a self,
        user: &'a User,
        chat: ChatId,
        message: ChatMessage,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut chats = self.chats.write().await;
            owned(&chats, user, chat)?;
            let Some(entry) = chats.get_mut(&chat) else {
                return Err(StoreError::NotFound(chat));
            };

            let first_user_turn = message.role == Role::User && !entry.messages.iter().any(|m| m.role == Role::User);
            if first_user_turn {
                entry.title = title_from(&message.content);
            }
            let stored = StoredMessage::new(message);
            entry.updated_at = stored.created_at;
            entry.messages.push(stored);
            Ok(())
        })
    }

    fn get_chat<'a>(&'a self, user: &'a User, chat: ChatId) -> BoxFuture<'a, Result<Chat, StoreError>> {
        Box::pin(async move {
            let chats = self.chats.read().await;
            owned(&chats, user, chat).cloned()
        })
    }

    fn get_user_chats<'a>(&'a self, user: &'a User) -> BoxFuture<'a, Result<Vec<ChatSummary>, StoreError>> {
        Box::pin(async move {
            let chats = self.chats.read().await;
            let mut summaries: Vec<ChatSummary> = chats
                .values()
                .filter(|chat| chat.user_id == user.id)
                .map(Chat::summary)
                .collect();
            summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(summaries)
        })
    }

    fn delete_chat<'a>(&'a self, user: &'a User, chat: ChatId) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut chats = self.chats.write().await;
            owned(&chats, user, chat)?;
            chats.remove(&chat);
            tracing::debug!(chat = %chat, user = %user.id, "chat deleted");
            Ok(())
        })
    }
}
