//! Shared fixtures: real servers on ephemeral ports and scripted backends.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bluebox::context::Context;
use bluebox::http::BodyStream;
use bluebox::llm::{CompletionBackend, CompletionRequest, DeltaStream, LlmError};
use bluebox::proxy::{ProxySettings, StreamProxy};
use bluebox::{Response, Router, Server, StatusCode};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream;
use tokio::sync::mpsc;

pub const SYSTEM_PROMPT: &str = "You are a helpful assistant.";

pub fn settings() -> ProxySettings {
    ProxySettings {
        model: "test-model".to_owned(),
        temperature: 0.7,
        system_prompt: SYSTEM_PROMPT.to_owned(),
    }
}

/// Serves `router` on `127.0.0.1:0` for the rest of the test.
pub async fn spawn(router: Router) -> SocketAddr {
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    let router = Arc::new(router);
    tokio::spawn(server.run(move |req| {
        let router = Arc::clone(&router);
        async move { router.route(req).await }
    }));
    addr
}

/// Runs a [`StreamProxy`] over `backend` and returns its chat endpoint URL.
pub async fn spawn_proxy(backend: Arc<dyn CompletionBackend>) -> String {
    let addr = spawn(StreamProxy::new(backend, settings()).router()).await;
    format!("http://{addr}/api/chat")
}

/// Replies to every call with the same deltas and records each request.
#[derive(Default)]
pub struct ScriptedBackend {
    deltas: Vec<&'static str>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new(deltas: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            deltas,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().unwrap().clone()
    }
}

impl CompletionBackend for ScriptedBackend {
    fn stream_chat(&self, request: CompletionRequest) -> BoxFuture<'_, Result<DeltaStream, LlmError>> {
        self.calls.lock().unwrap().push(request);
        let items: Vec<Result<String, LlmError>> = self.deltas.iter().map(|d| Ok((*d).to_owned())).collect();
        Box::pin(async move {
            let deltas: DeltaStream = Box::pin(stream::iter(items));
            Ok(deltas)
        })
    }
}

pub type Feed = mpsc::UnboundedSender<Result<String, LlmError>>;

/// Each call streams whatever the test pushes into the matching [`Feed`],
/// ending when the feed is dropped.
#[derive(Default)]
pub struct ChannelBackend {
    feeds: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<String, LlmError>>>>,
    calls: AtomicUsize,
}

impl ChannelBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Prepares the reply for the next call.
    pub fn feed(&self) -> Feed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap().push_back(rx);
        tx
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CompletionBackend for ChannelBackend {
    fn stream_chat(&self, _request: CompletionRequest) -> BoxFuture<'_, Result<DeltaStream, LlmError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let feed = self.feeds.lock().unwrap().pop_front();
        Box::pin(async move {
            let Some(rx) = feed else {
                return Err(LlmError::Stream("no reply prepared".to_owned()));
            };
            let deltas: DeltaStream = Box::pin(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            }));
            Ok(deltas)
        })
    }
}

/// What a stub completion API saw.
#[derive(Default)]
pub struct UpstreamLog {
    pub bodies: Mutex<Vec<serde_json::Value>>,
    pub authorization: Mutex<Vec<String>>,
}

/// An OpenAI-style `/v1/chat/completions` that streams `deltas` as SSE.
/// Returns the base URL (`http://addr/v1`) and the request log.
pub async fn spawn_sse_upstream(deltas: Vec<&'static str>) -> (String, Arc<UpstreamLog>) {
    let log = Arc::new(UpstreamLog::default());
    let seen = Arc::clone(&log);

    let mut router = Router::new();
    router.post("/v1/chat/completions", move |ctx: Context| {
        let seen = Arc::clone(&seen);
        let deltas = deltas.clone();
        async move {
            let auth = ctx.request().headers().get("authorization").unwrap_or_default().to_owned();
            seen.authorization.lock().unwrap().push(auth);
            seen.bodies.lock().unwrap().push(ctx.json().unwrap());

            let mut events = vec![sse_event(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#)];
            for delta in deltas {
                let chunk = serde_json::json!({ "choices": [{ "delta": { "content": delta } }] });
                events.push(sse_event(&chunk.to_string()));
            }
            events.push(sse_event(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#));
            events.push(sse_event("[DONE]"));

            let body: BodyStream = Box::pin(stream::iter(events.into_iter().map(Ok)));
            Response::new(StatusCode::Ok)
                .header("Content-Type", "text/event-stream")
                .stream(body)
        }
    });

    let addr = spawn(router).await;
    (format!("http://{addr}/v1"), log)
}

/// An upstream that rejects every call with `status` and an OpenAI error body.
pub async fn spawn_rejecting_upstream(status: StatusCode, message: &'static str) -> String {
    let mut router = Router::new();
    router.post("/v1/chat/completions", move |_ctx: Context| async move {
        Response::new(status).json(&serde_json::json!({ "error": { "message": message, "type": "invalid_request_error" } }))
    });
    let addr = spawn(router).await;
    format!("http://{addr}/v1")
}

fn sse_event(data: &str) -> Bytes {
    Bytes::from(format!("data: {data}\n\n"))
}
