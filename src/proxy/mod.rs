//! The streaming chat proxy behind `POST /api/chat`.
//!
//! A request carries the newest user turn plus the prior transcript. The proxy
//! frames it with the system instruction, opens a streaming completion
//! upstream, and relays each text delta to the caller the moment it arrives.
//!
//! Failures before the first delta become a JSON `{ "error" }` response with a
//! 5xx status. Once the first byte has been relayed the status line is
//! committed, so a later upstream failure simply cuts the body short; the
//! chunked framing leaves the terminal chunk out so the client can tell.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::http::{BodyError, BodyStream};
use crate::llm::{ChatMessage, CompletionBackend, CompletionRequest, DeltaStream, LlmError};
use crate::middleware::LoggerMiddleware;
use crate::router::{Router, error_response};
use crate::{Response, StatusCode};

/// Path the chat endpoint is mounted at.
pub const CHAT_PATH: &str = "/api/chat";

/// Path of the liveness probe.
pub const HEALTH_PATH: &str = "/health";

/// The body of `POST /api/chat`.
///
/// `history` holds every turn strictly before `message`; it never repeats the
/// message being sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
}

/// The JSON body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Why a chat request failed before streaming started.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid request body: {0}")]
    InvalidBody(#[source] serde_json::Error),

    #[error("message must not be empty")]
    EmptyMessage,

    #[error(transparent)]
    Upstream(#[from] LlmError),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidBody(_) | Self::EmptyMessage => StatusCode::InternalServerError,
            Self::Upstream(_) => StatusCode::BadGateway,
        }
    }

    /// Upstream details stay in the logs; callers get a generic message.
    pub fn public_message(&self) -> String {
        match self {
            Self::Upstream(_) => "Failed to process the request".to_owned(),
            other => other.to_string(),
        }
    }

    pub fn into_response(self) -> Response {
        error_response(self.status(), &self.public_message())
    }
}

/// Fixed parameters of every upstream call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxySettings {
    pub model: String,
    pub temperature: f32,
    pub system_prompt: String,
}

/// Relays one conversation turn to the completion backend as a live stream.
pub struct StreamProxy {
    backend: Arc<dyn CompletionBackend>,
    settings: ProxySettings,
}

impl StreamProxy {
    pub fn new(backend: Arc<dyn CompletionBackend>, settings: ProxySettings) -> Self {
        Self { backend, settings }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    /// `[system] ++ history ++ [user message]`, in that order.
    pub fn build_messages(&self, request: ConversationRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        messages.push(ChatMessage::system(self.settings.system_prompt.clone()));
        messages.extend(request.history);
        messages.push(ChatMessage::user(request.message));
        messages
    }

    /// Handles `POST /api/chat`.
    pub async fn handle(&self, ctx: Context) -> Response {
        match self.open_stream(&ctx).await {
            Ok(body) => Response::new(StatusCode::Ok)
                .header("Content-Type", "text/plain; charset=utf-8")
                .header("Cache-Control", "no-cache")
                .header("X-Accel-Buffering", "no")
                .stream(body),
            Err(e) => {
                warn!(error = %e, status = e.status().as_u16(), "chat request failed before streaming");
                e.into_response()
            }
        }
    }

    async fn open_stream(&self, ctx: &Context) -> Result<BodyStream, ProxyError> {
        let request: ConversationRequest = ctx.json().map_err(ProxyError::InvalidBody)?;
        if request.message.trim().is_empty() {
            return Err(ProxyError::EmptyMessage);
        }

        let history_len = request.history.len();
        let completion = CompletionRequest {
            model: self.settings.model.clone(),
            messages: self.build_messages(request),
            temperature: self.settings.temperature,
        };

        let mut deltas = self.backend.stream_chat(completion).await?;

        // Hold the status line until the upstream has produced something, so an
        // immediate failure can still be reported as a proper error response.
        let first = match deltas.next().await {
            Some(Ok(text)) => Some(text),
            Some(Err(e)) => return Err(e.into()),
            None => None,
        };

        info!(history = history_len, "relaying completion stream");
        Ok(relay(first, deltas))
    }

    /// Builds the router serving the proxy, with request logging.
    pub fn router(self) -> Router {
        let proxy = Arc::new(self);
        let mut router = Router::new();
        router.layer(LoggerMiddleware);

        router.post(CHAT_PATH, move |ctx: Context| {
            let proxy = Arc::clone(&proxy);
            async move { proxy.handle(ctx).await }
        });
        router.get(HEALTH_PATH, |_ctx: Context| async {
            Response::new(StatusCode::Ok).json(&serde_json::json!({ "status": "ok" }))
        });

        router
    }
}

/// Re-emits deltas as UTF-8 body chunks, ending the body with an error if the
/// upstream breaks off.
fn relay(first: Option<String>, mut deltas: DeltaStream) -> BodyStream {
    Box::pin(async_stream::stream! {
        let mut relayed = 0usize;

        if let Some(text) = first.filter(|t| !t.is_empty()) {
            relayed += 1;
            yield Ok(Bytes::from(text));
        }

        while let Some(delta) = deltas.next().await {
            match delta {
                Ok(text) if text.is_empty() => continue,
                Ok(text) => {
                    relayed += 1;
                    yield Ok(Bytes::from(text));
                }
                Err(e) => {
                    warn!(error = %e, relayed, "upstream stream failed mid-reply");
                    yield Err(BodyError::new(e.to_string()));
                    return;
                }
            }
        }

        debug!(relayed, "completion stream finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Body, Request};
    use futures_util::future::BoxFuture;
    use futures_util::stream;
    use std::sync::Mutex;

    /// Replays a fixed script and records every request it receives.
    #[derive(Default)]
    struct ScriptedBackend {
        script: Vec<Result<&'static str, &'static str>>,
        reject: Option<u16>,
        calls: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedBackend {
        fn replying(script: Vec<Result<&'static str, &'static str>>) -> Arc<Self> {
            Arc::new(Self {
                script,
                ..Self::default()
            })
        }

        fn calls(&self) -> Vec<CompletionRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CompletionBackend for ScriptedBackend {
        fn stream_chat(&self, request: CompletionRequest) -> BoxFuture<'_, Result<DeltaStream, LlmError>> {
            self.calls.lock().unwrap().push(request);
            let reject = self.reject;
            let items: Vec<Result<String, LlmError>> = self
                .script
                .iter()
                .map(|step| match step {
                    Ok(text) => Ok((*text).to_owned()),
                    Err(reason) => Err(LlmError::Stream((*reason).to_owned())),
                })
                .collect();
            Box::pin(async move {
                if let Some(status) = reject {
                    return Err(LlmError::Status {
                        status,
                        message: "rate limited".to_owned(),
                    });
                }
                let deltas: DeltaStream = Box::pin(stream::iter(items));
                Ok(deltas)
            })
        }
    }

    fn settings() -> ProxySettings {
        ProxySettings {
            model: "test-model".to_owned(),
            temperature: 0.7,
            system_prompt: "You are a helpful assistant.".to_owned(),
        }
    }

    fn chat_context(body: &str) -> Context {
        let raw = format!(
            "POST /api/chat HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let (request, _) = Request::parse(raw.as_bytes()).unwrap();
        Context::new(request)
    }

    async fn drain(response: Response) -> (Vec<String>, Option<String>) {
        let Body::Stream(mut body) = response.into_body() else {
            panic!("expected a streamed body");
        };
        let mut chunks = Vec::new();
        while let Some(item) = body.next().await {
            match item {
                Ok(bytes) => chunks.push(String::from_utf8(bytes.to_vec()).unwrap()),
                Err(e) => return (chunks, Some(e.reason().to_owned())),
            }
        }
        (chunks, None)
    }

    fn error_text(response: Response) -> String {
        let Body::Full(bytes) = response.into_body() else {
            panic!("expected a buffered body");
        };
        serde_json::from_slice::<ErrorBody>(&bytes).unwrap().error
    }

    #[test]
    fn messages_are_system_history_user() {
        let proxy = StreamProxy::new(ScriptedBackend::replying(vec![]), settings());
        let messages = proxy.build_messages(ConversationRequest {
            message: "and now?".to_owned(),
            history: vec![ChatMessage::user("hello"), ChatMessage::assistant("Hi there")],
        });
        assert_eq!(
            messages,
            vec![
                ChatMessage::system("You are a helpful assistant."),
                ChatMessage::user("hello"),
                ChatMessage::assistant("Hi there"),
                ChatMessage::user("and now?"),
            ]
        );
    }

    #[test]
    fn history_defaults_to_empty() {
        let request: ConversationRequest = serde_json::from_str(r#"{"message":"hello"}"#).unwrap();
        assert!(request.history.is_empty());
    }

    #[tokio::test]
    async fn streams_every_delta_in_order() {
        let backend = ScriptedBackend::replying(vec![Ok("Hi"), Ok(""), Ok(" there")]);
        let proxy = StreamProxy::new(backend.clone(), settings());

        let response = proxy.handle(chat_context(r#"{"message":"hello","history":[]}"#)).await;
        assert_eq!(response.status(), StatusCode::Ok);
        assert!(response.is_streaming());

        let (chunks, error) = drain(response).await;
        assert_eq!(chunks, vec!["Hi", " there"]);
        assert!(error.is_none());

        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].model, "test-model");
        assert_eq!(calls[0].temperature, 0.7);
        assert_eq!(
            calls[0].messages,
            vec![ChatMessage::system("You are a helpful assistant."), ChatMessage::user("hello")]
        );
    }

    #[tokio::test]
    async fn empty_reply_is_an_empty_stream() {
        let proxy = StreamProxy::new(ScriptedBackend::replying(vec![]), settings());
        let response = proxy.handle(chat_context(r#"{"message":"hello"}"#)).await;
        assert_eq!(response.status(), StatusCode::Ok);
        let (chunks, error) = drain(response).await;
        assert!(chunks.is_empty());
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn missing_or_blank_message_never_calls_upstream() {
        let backend = ScriptedBackend::replying(vec![Ok("unused")]);
        let proxy = StreamProxy::new(backend.clone(), settings());

        for body in [r#"{"history":[]}"#, r#"{"message":""}"#, r#"{"message":"   "}"#, "not json"] {
            let response = proxy.handle(chat_context(body)).await;
            assert!(response.status().is_server_error(), "body {body:?}");
            assert_eq!(response.headers().get("content-type"), Some("application/json"));
        }
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn upstream_rejection_is_a_json_error() {
        let backend = Arc::new(ScriptedBackend {
            reject: Some(429),
            ..ScriptedBackend::default()
        });
        let proxy = StreamProxy::new(backend, settings());
        let response = proxy.handle(chat_context(r#"{"message":"hello"}"#)).await;
        assert_eq!(response.status(), StatusCode::BadGateway);
        assert_eq!(error_text(response), "Failed to process the request");
    }

    #[tokio::test]
    async fn failure_before_first_delta_is_a_json_error() {
        let proxy = StreamProxy::new(ScriptedBackend::replying(vec![Err("reset")]), settings());
        let response = proxy.handle(chat_context(r#"{"message":"hello"}"#)).await;
        assert_eq!(response.status(), StatusCode::BadGateway);
        assert!(!response.is_streaming());
    }

    #[tokio::test]
    async fn failure_mid_stream_truncates_the_body() {
        let backend = ScriptedBackend::replying(vec![Ok("Hi"), Ok(" the"), Err("connection reset")]);
        let proxy = StreamProxy::new(backend, settings());
        let response = proxy.handle(chat_context(r#"{"message":"hello"}"#)).await;
        assert_eq!(response.status(), StatusCode::Ok);

        let (chunks, error) = drain(response).await;
        assert_eq!(chunks, vec!["Hi", " the"]);
        assert!(error.unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn router_serves_health() {
        let router = StreamProxy::new(ScriptedBackend::replying(vec![]), settings()).router();
        let (request, _) = Request::parse(b"GET /health HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        let response = router.route(request).await;
        assert_eq!(response.status(), StatusCode::Ok);
    }
}
