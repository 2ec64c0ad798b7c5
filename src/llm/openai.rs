//! OpenAI-compatible streaming chat completions.
//!
//! The upstream answers `stream: true` requests with server-sent events; each
//! `data:` line carries a JSON chunk whose `choices[0].delta.content` is the
//! next piece of text, and `data: [DONE]` marks the end.

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ChatMessage, CompletionBackend, CompletionRequest, DeltaStream, LlmError};

/// Public OpenAI endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const DONE_MARKER: &str = "[DONE]";

/// Upstream error bodies are echoed into logs; keep them short.
const MAX_ERROR_TEXT: usize = 512;

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Deserialize, Default)]
struct WireChoice {
    #[serde(default)]
    delta: WireDelta,
}

#[derive(Deserialize, Default)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireError {
    message: String,
}

#[derive(Deserialize)]
struct WireErrorBody {
    error: WireError,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl OpenAiClient {
    /// Creates a client for `base_url` (e.g. [`DEFAULT_BASE_URL`]).
    pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("bluebox/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_http(http, base_url, api_key))
    }

    /// Creates a client that reuses an existing connection pool.
    pub fn with_http(http: reqwest::Client, base_url: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl CompletionBackend for OpenAiClient {
    fn stream_chat(&self, request: CompletionRequest) -> BoxFuture<'_, Result<DeltaStream, LlmError>> {
        Box::pin(async move {
            let url = format!("{}/chat/completions", self.base_url);
            let body = WireRequest {
                model: &request.model,
                messages: &request.messages,
                temperature: request.temperature,
                stream: true,
            };

            debug!(
                model = %request.model,
                messages = request.messages.len(),
                "opening upstream completion stream"
            );

            let response = self
                .http
                .post(&url)
                .bearer_auth(self.api_key.expose_secret())
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(LlmError::Status {
                    status: status.as_u16(),
                    message: upstream_error_message(&text),
                });
            }

            Ok(sse_deltas(response.bytes_stream()))
        })
    }
}

/// Turns a raw SSE byte stream into text deltas.
///
/// Empty deltas (role-only or finish chunks) are skipped. A stream that ends
/// without `[DONE]` yields a final [`LlmError::Stream`] so callers can tell a
/// cut-off reply from a finished one.
pub(crate) fn sse_deltas<S, E>(bytes: S) -> DeltaStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut events = Box::pin(bytes.eventsource());

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    yield Err(LlmError::Stream(e.to_string()));
                    return;
                }
            };

            let data = event.data.trim();
            if data == DONE_MARKER {
                return;
            }
            if data.is_empty() {
                continue;
            }

            match parse_delta(data) {
                Ok(Some(text)) => yield Ok(text),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "upstream sent an unusable event");
                    yield Err(e);
                    return;
                }
            }
        }

        yield Err(LlmError::Stream("upstream closed the stream before [DONE]".to_owned()));
    })
}

/// Extracts the text of one SSE `data:` payload, if it carries any.
fn parse_delta(data: &str) -> Result<Option<String>, LlmError> {
    let chunk: WireChunk = serde_json::from_str(data)?;

    if let Some(error) = chunk.error {
        return Err(LlmError::Stream(error.message));
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|text| !text.is_empty()))
}

/// Prefers the `error.message` field of an OpenAI error body over raw text.
fn upstream_error_message(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<WireErrorBody>(body) {
        return parsed.error.message;
    }
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX_ERROR_TEXT) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_owned(),
    }
}
