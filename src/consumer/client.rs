//! HTTP client for the chat endpoint.

use tracing::debug;

use super::ConsumerError;
use serde::Deserialize;

use crate::proxy::ConversationRequest;

/// Where `bluebox serve` listens by default.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:3000/api/chat";

/// Opens streamed replies from a `POST /api/chat` endpoint.
#[derive(Debug, Clone)]
pub struct ProxyClient {
    http: reqwest::Client,
    endpoint: String,
}

impl ProxyClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ConsumerError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("bluebox/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_http(http, endpoint))
    }

    pub fn with_http(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Sends `request` and returns the response once its status line says the
    /// reply is streaming. The body is left unread.
    pub async fn open(&self, request: &ConversationRequest) -> Result<reqwest::Response, ConsumerError> {
        debug!(endpoint = %self.endpoint, history = request.history.len(), "sending chat request");

        let response = self.http.post(&self.endpoint).json(request).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        Err(ConsumerError::Status {
            status: status.as_u16(),
            message: error_message(status.as_u16(), &text),
        })
    }
}

#[derive(Deserialize)]
struct ErrorPayload {
    error: Option<String>,
    message: Option<String>,
}

/// The `error` (or else `message`) field of a JSON error body, or a generic
/// description.
pub(crate) fn error_message(status: u16, body: &str) -> String {
    serde_json::from_str::<ErrorPayload>(body)
        .ok()
        .and_then(|parsed| parsed.error.or(parsed.message))
        .unwrap_or_else(|| format!("HTTP error! status: {status}"))
}
