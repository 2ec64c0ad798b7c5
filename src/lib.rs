//! # bluebox
//!
//! A streaming chat proxy and the chat client that consumes it.
//!
//! The proxy ([`proxy::StreamProxy`]) accepts `POST /api/chat` with a user
//! message and the conversation so far, forwards it to an OpenAI-compatible
//! completion API with streaming enabled, and relays the reply to the caller
//! as it is generated. The client ([`consumer::ChatSession`]) sends messages,
//! renders the reply live, and commits it to the transcript once complete.
//!
//! Both run on a small HTTP/1.1 server built directly on tokio.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bluebox::config::{ConfigLoader, api_key};
//! use bluebox::llm::OpenAiClient;
//! use bluebox::proxy::StreamProxy;
//! use bluebox::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = ConfigLoader::load(None)?;
//!     let backend = OpenAiClient::new(&settings.upstream.base_url, api_key()?)?;
//!     let router = Arc::new(StreamProxy::new(Arc::new(backend), settings.proxy_settings()).router());
//!
//!     let server = Server::bind(&settings.server.bind).await?;
//!     server
//!         .run(move |req| {
//!             let router = Arc::clone(&router);
//!             async move { router.route(req).await }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod http;
pub mod server;

pub mod cli;
pub mod config;
pub mod consumer;
pub mod context;
pub mod llm;
pub mod middleware;
pub mod proxy;
pub mod router;
pub mod store;

pub use http::{Body, BodyError, Headers, Method, Request, Response, StatusCode};
pub use router::Router;
pub use server::{Server, ServerError};
