//! The chat client: one conversation, one reply streaming at a time.
//!
//! A [`ChatSession`] owns the transcript and walks every send through
//! `Idle → Sending → Streaming → Finalizing → Idle`. The user's message is
//! shown as soon as it is submitted; the assistant's reply grows live in a
//! partial buffer and becomes a transcript entry only once the stream ends.
//!
//! The session never renders anything. Everything a UI would react to is
//! published as a [`ChatEvent`] on the channel returned by
//! [`ChatSession::new`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::llm::ChatMessage;
use crate::proxy::ConversationRequest;
use crate::store::{ChatId, ChatStore, ChatSummary, StoreError, User};

mod client;
mod decoder;

pub use client::{DEFAULT_ENDPOINT, ProxyClient};
pub use decoder::Utf8Decoder;

/// Where a session is in its send cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendState {
    #[default]
    Idle,
    /// Request sent, no response yet.
    Sending,
    /// Reply body is being read.
    Streaming,
    /// Reply complete, being committed and saved. Sends stay blocked until
    /// the save finishes so stored messages keep conversation order.
    Finalizing,
}

/// Notifications for whatever renders the session.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// A user message was added to the transcript.
    UserMessage(ChatMessage),
    /// Whether the assistant is "typing".
    Typing(bool),
    /// The whole reply so far. Not final; replaced by the next `Partial` or
    /// by `AssistantMessage`.
    Partial(String),
    AssistantMessage(ChatMessage),
    SendFailed(String),
    /// The transcript was replaced wholesale (new chat, loaded chat, deleted chat).
    TranscriptReplaced(Vec<ChatMessage>),
    /// The signed-in user's chat list may have changed.
    ChatListChanged,
    MessageCount(usize),
}

/// How a call to [`ChatSession::send`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// The reply streamed to completion and was committed.
    Completed(ChatMessage),
    /// The connection broke mid-reply; the partial text was committed.
    Truncated(ChatMessage),
    /// [`ChatSession::cancel`] stopped the send, or the conversation was
    /// replaced under it; nothing was committed to the session.
    Cancelled,
    /// Another send is in flight; nothing was sent.
    Busy,
    /// The input was blank; nothing was sent.
    Skipped,
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("chat request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{message}")]
    Status { status: u16, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("this action needs a signed-in user")]
    NotAuthenticated,

    #[error("chat {0} not found")]
    ChatNotFound(ChatId),
}

struct Persistence {
    store: Arc<dyn ChatStore>,
    user: User,
}

#[derive(Default)]
struct Inner {
    state: SendState,
    transcript: Vec<ChatMessage>,
    partial: String,
    chat_id: Option<ChatId>,
    in_flight: Option<CancellationToken>,
}

impl Inner {
    /// Releases the in-flight guard held by `token`. Returns `false` if the
    /// send was cancelled and someone else already reset the session.
    fn release(&mut self, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            return false;
        }
        self.state = SendState::Idle;
        self.in_flight = None;
        self.partial.clear();
        true
    }
}

/// One chat conversation and its send cycle.
///
/// Methods take `&self`; share the session behind an [`Arc`] to cancel a send
/// from another task.
pub struct ChatSession {
    client: ProxyClient,
    persistence: Option<Persistence>,
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<ChatEvent>,
}

impl ChatSession {
    /// A guest session. Nothing is persisted.
    pub fn new(client: ProxyClient) -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let session = Self {
            client,
            persistence: None,
            inner: Mutex::new(Inner::default()),
            events,
        };
        (session, rx)
    }

    /// Persists the conversation to `store` on behalf of `user`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ChatStore>, user: User) -> Self {
        self.persistence = Some(Persistence { store, user });
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.persistence.is_some()
    }

    pub fn user(&self) -> Option<&User> {
        self.persistence.as_ref().map(|p| &p.user)
    }

    pub fn state(&self) -> SendState {
        self.lock().state
    }

    pub fn transcript(&self) -> Vec<ChatMessage> {
        self.lock().transcript.clone()
    }

    /// The reply received so far for the send in flight; empty otherwise.
    pub fn partial_reply(&self) -> String {
        self.lock().partial.clone()
    }

    pub fn chat_id(&self) -> Option<ChatId> {
        self.lock().chat_id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ChatEvent) {
        // A dropped receiver just means nobody is rendering.
        self.events.send(event).ok();
    }

    fn persistence(&self) -> Result<&Persistence, ConsumerError> {
        self.persistence.as_ref().ok_or(ConsumerError::NotAuthenticated)
    }

    /// Sends `input` as the next user message and streams the reply.
    ///
    /// Blank input and sends while another is in flight return without
    /// making a request. Errors leave the user message in place, add no
    /// assistant message, and return the session to `Idle`.
    pub async fn send(&self, input: &str) -> Result<SendOutcome, ConsumerError> {
        let message = input.trim();
        if message.is_empty() {
            return Ok(SendOutcome::Skipped);
        }

        let (token, history, user_message, count) = {
            let mut inner = self.lock();
            if inner.state != SendState::Idle {
                debug!(state = ?inner.state, "send ignored, another reply is in flight");
                return Ok(SendOutcome::Busy);
            }
            let token = CancellationToken::new();
            let history = inner.transcript.clone();
            let user_message = ChatMessage::user(message);
            inner.transcript.push(user_message.clone());
            inner.partial.clear();
            inner.state = SendState::Sending;
            inner.in_flight = Some(token.clone());
            (token, history, user_message, inner.transcript.len())
        };

        self.emit(ChatEvent::UserMessage(user_message.clone()));
        self.emit(ChatEvent::MessageCount(count));
        self.emit(ChatEvent::Typing(true));

        let chat_id = self.save_user_message(&token, user_message).await;

        let request = ConversationRequest {
            message: message.to_owned(),
            history,
        };
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(SendOutcome::Cancelled),
            opened = self.client.open(&request) => opened,
        };
        let response = match opened {
            Ok(response) => response,
            Err(e) => return Err(self.fail(&token, e)),
        };

        {
            let mut inner = self.lock();
            if token.is_cancelled() {
                return Ok(SendOutcome::Cancelled);
            }
            inner.state = SendState::Streaming;
        }

        let mut body = Box::pin(response.bytes_stream());
        let mut decoder = Utf8Decoder::new();
        let mut interrupted = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(SendOutcome::Cancelled),
                next = body.next() => next,
            };
            match next {
                Some(Ok(bytes)) => {
                    let text = decoder.decode(&bytes);
                    self.append_partial(&token, &text);
                }
                Some(Err(e)) => {
                    interrupted = Some(e);
                    break;
                }
                None => break,
            }
        }
        self.append_partial(&token, &decoder.finish());

        let received_nothing = self.lock().partial.is_empty();
        let truncated = match interrupted {
            Some(e) if received_nothing => return Err(self.fail(&token, e.into())),
            Some(e) => {
                warn!(error = %e, "reply stream ended early, keeping partial text");
                true
            }
            None => false,
        };

        Ok(self.finalize(&token, chat_id, truncated).await)
    }

    fn append_partial(&self, token: &CancellationToken, text: &str) {
        if text.is_empty() {
            return;
        }
        let snapshot = {
            let mut inner = self.lock();
            if token.is_cancelled() {
                return;
            }
            inner.partial.push_str(text);
            inner.partial.clone()
        };
        self.emit(ChatEvent::Partial(snapshot));
    }

    /// Records a failed send and hands the error back to the caller.
    fn fail(&self, token: &CancellationToken, error: ConsumerError) -> ConsumerError {
        if self.lock().release(token) {
            warn!(error = %error, "chat request failed");
            self.emit(ChatEvent::Typing(false));
            self.emit(ChatEvent::SendFailed(error.to_string()));
        }
        error
    }

    /// Commits the partial reply as the assistant's message, then saves it.
    /// The in-flight guard is held until the save finishes.
    async fn finalize(&self, token: &CancellationToken, chat_id: Option<ChatId>, truncated: bool) -> SendOutcome {
        let (reply, count) = {
            let mut inner = self.lock();
            if token.is_cancelled() {
                return SendOutcome::Cancelled;
            }
            inner.state = SendState::Finalizing;
            let reply = ChatMessage::assistant(std::mem::take(&mut inner.partial));
            inner.transcript.push(reply.clone());
            (reply, inner.transcript.len())
        };

        let mut saved = false;
        if let (Some(persistence), Some(chat_id)) = (&self.persistence, chat_id) {
            match persistence
                .store
                .add_message_to_chat(&persistence.user, chat_id, reply.clone())
                .await
            {
                Ok(()) => saved = true,
                Err(e) => warn!(error = %e, chat = %chat_id, "failed to save assistant message"),
            }
        }

        if !self.lock().release(token) {
            debug!("conversation replaced while the reply was being saved");
            return SendOutcome::Cancelled;
        }

        self.emit(ChatEvent::Typing(false));
        self.emit(ChatEvent::AssistantMessage(reply.clone()));
        self.emit(ChatEvent::MessageCount(count));
        if saved {
            self.emit(ChatEvent::ChatListChanged);
        }
        info!(chars = reply.content.chars().count(), truncated, "reply committed");

        if truncated {
            SendOutcome::Truncated(reply)
        } else {
            SendOutcome::Completed(reply)
        }
    }

    /// Saves the user's message, creating the chat first if needed. Failures
    /// are logged and the send carries on unsaved. Nothing is written once
    /// the send has been cancelled.
    async fn save_user_message(&self, token: &CancellationToken, message: ChatMessage) -> Option<ChatId> {
        let persistence = self.persistence.as_ref()?;

        let existing = self.lock().chat_id;
        let chat_id = match existing {
            Some(id) => id,
            None => {
                let id = match persistence.store.create_chat(&persistence.user).await {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(error = %e, "failed to create chat, continuing unsaved");
                        return None;
                    }
                };
                let adopted = {
                    let mut inner = self.lock();
                    if token.is_cancelled() {
                        debug!(chat = %id, "send cancelled while its chat was being created");
                        return None;
                    }
                    *inner.chat_id.get_or_insert(id)
                };
                self.emit(ChatEvent::ChatListChanged);
                adopted
            }
        };

        if token.is_cancelled() {
            return None;
        }
        if let Err(e) = persistence
            .store
            .add_message_to_chat(&persistence.user, chat_id, message)
            .await
        {
            warn!(error = %e, chat = %chat_id, "failed to save user message");
        }
        Some(chat_id)
    }

    /// Stops the send in flight, if any. The partial reply is dropped and no
    /// assistant message is added; the user's message stays. A reply that is
    /// already `Finalizing` has been committed and is not cancelled.
    pub fn cancel(&self) -> bool {
        self.stop(false)
    }

    /// Cancels the send in flight. With `force`, a `Finalizing` send is
    /// stopped too.
    fn stop(&self, force: bool) -> bool {
        let cancelled = {
            let mut inner = self.lock();
            if !force && inner.state == SendState::Finalizing {
                return false;
            }
            match inner.in_flight.take() {
                Some(token) => {
                    token.cancel();
                    inner.state = SendState::Idle;
                    inner.partial.clear();
                    true
                }
                None => false,
            }
        };
        if cancelled {
            info!("reply cancelled");
            self.emit(ChatEvent::Typing(false));
        }
        cancelled
    }

    /// Replaces the conversation, stopping any send in flight.
    fn reset(&self, chat_id: Option<ChatId>, transcript: Vec<ChatMessage>) {
        self.stop(true);
        let count = transcript.len();
        {
            let mut inner = self.lock();
            inner.chat_id = chat_id;
            inner.transcript = transcript.clone();
            inner.partial.clear();
        }
        self.emit(ChatEvent::TranscriptReplaced(transcript));
        self.emit(ChatEvent::MessageCount(count));
    }

    /// Starts an empty conversation. A signed-in user gets a fresh stored chat.
    pub async fn new_chat(&self) -> Result<Option<ChatId>, ConsumerError> {
        let chat_id = match &self.persistence {
            Some(persistence) => Some(persistence.store.create_chat(&persistence.user).await?),
            None => None,
        };
        self.reset(chat_id, Vec::new());
        if chat_id.is_some() {
            self.emit(ChatEvent::ChatListChanged);
        }
        debug!(chat = ?chat_id, "new chat started");
        Ok(chat_id)
    }

    /// Replaces the conversation with a stored chat. If the chat cannot be
    /// found the session is left empty.
    pub async fn load_chat(&self, chat_id: ChatId) -> Result<(), ConsumerError> {
        let persistence = self.persistence()?;
        match persistence.store.get_chat(&persistence.user, chat_id).await {
            Ok(chat) => {
                self.reset(Some(chat.id), chat.transcript());
                debug!(chat = %chat_id, messages = chat.messages.len(), "chat loaded");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => {
                self.reset(None, Vec::new());
                Err(ConsumerError::ChatNotFound(chat_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes the current stored chat and clears the session. Returns
    /// `false` when there was no stored chat to delete.
    pub async fn delete_current_chat(&self) -> Result<bool, ConsumerError> {
        let persistence = self.persistence()?;
        let Some(chat_id) = self.chat_id() else {
            return Ok(false);
        };
        persistence.store.delete_chat(&persistence.user, chat_id).await?;
        self.reset(None, Vec::new());
        self.emit(ChatEvent::ChatListChanged);
        Ok(true)
    }

    /// The signed-in user's chats, most recently active first.
    pub async fn user_chats(&self) -> Result<Vec<ChatSummary>, ConsumerError> {
        let persistence = self.persistence()?;
        Ok(persistence.store.get_user_chats(&persistence.user).await?)
    }
}
