//! Middleware pipeline — composable before/after request handler logic.
//!
//! Each middleware wraps the next layer and may inspect the request,
//! short-circuit with its own response, or decorate the downstream response.
//! The [`Router`](crate::router::Router) appends the matched route handler as
//! the last layer of every chain.
//!
//! ## Core types
//!
//! - [`Middleware`] — trait implemented by all middleware.
//! - [`Next`] — cursor into the remaining chain; call [`Next::run`] to advance.
//! - [`MiddlewareHandler`] — type-erased, cheaply-cloneable middleware function.
//! - [`LoggerMiddleware`] — one structured log record per request.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Response, StatusCode, context::Context};

/// A boxed, sendable response future.
pub type ResponseFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// A type-erased, reference-counted middleware function.
pub type MiddlewareHandler = Arc<dyn Fn(Context, Next) -> ResponseFuture + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use bluebox::middleware::{LoggerMiddleware, from_middleware};
///
/// let handler = from_middleware(Arc::new(LoggerMiddleware));
/// ```
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so each layer can forward at
/// most once.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    index: usize,
}

impl Next {
    /// Creates a cursor positioned at the start of `middlewares`.
    pub fn new(middlewares: impl Into<Arc<[MiddlewareHandler]>>) -> Self {
        Self {
            middlewares: middlewares.into(),
            index: 0,
        }
    }

    /// Invokes the next layer and returns its response.
    ///
    /// An exhausted chain yields `500 Internal Server Error`: some layer
    /// should always have produced a response before that point.
    pub async fn run(mut self, ctx: Context) -> Response {
        match self.middlewares.get(self.index).cloned() {
            Some(handler) => {
                self.index += 1;
                handler(ctx, self).await
            }
            None => Response::new(StatusCode::InternalServerError)
                .json(&serde_json::json!({ "error": "No response generated by middleware pipeline" })),
        }
    }
}

/// The core trait for all middleware.
///
/// Implementations are shared across Tokio tasks, so they must be
/// `Send + Sync` and must not hold `&mut` state across an `.await`.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> ResponseFuture;
}

/// Logs method, path, status and handler latency for every request.
///
/// For streamed responses the latency covers the time to the first byte of
/// the body being ready, not the end of the stream.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> ResponseFuture {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().clone();
            let path = ctx.request().path().to_owned();

            let response = next.run(ctx).await;

            let status = response.status();
            let streamed = response.is_streaming();
            let elapsed_ms = start.elapsed().as_millis() as u64;

            if status.is_server_error() {
                tracing::warn!(%method, %path, status = status.as_u16(), elapsed_ms, "request failed");
            } else {
                tracing::info!(%method, %path, status = status.as_u16(), elapsed_ms, streamed, "request handled");
            }

            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> Context {
        let (request, _) = Request::parse(b"GET /health HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        Context::new(request)
    }

    #[tokio::test]
    async fn exhausted_chain_is_500() {
        let response = Next::new(Vec::<MiddlewareHandler>::new()).run(ctx()).await;
        assert_eq!(response.status(), StatusCode::InternalServerError);
    }

    #[tokio::test]
    async fn layers_run_in_order() {
        let seen = Arc::new(AtomicUsize::new(0));
        let first_seen = Arc::clone(&seen);
        let first: MiddlewareHandler = Arc::new(move |ctx: Context, next: Next| -> ResponseFuture {
            let seen = Arc::clone(&first_seen);
            Box::pin(async move {
                assert_eq!(seen.fetch_add(1, Ordering::SeqCst), 0);
                let mut response = next.run(ctx).await;
                response.add_header("X-First", "1");
                response
            })
        });
        let last_seen = Arc::clone(&seen);
        let last: MiddlewareHandler = Arc::new(move |_ctx: Context, _next: Next| -> ResponseFuture {
            let seen = Arc::clone(&last_seen);
            Box::pin(async move {
                assert_eq!(seen.fetch_add(1, Ordering::SeqCst), 1);
                Response::new(StatusCode::NoContent)
            })
        });

        let response = Next::new(vec![first, last]).run(ctx()).await;
        assert_eq!(response.status(), StatusCode::NoContent);
        assert_eq!(response.headers().get("x-first"), Some("1"));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn logger_passes_response_through() {
        let terminal: MiddlewareHandler = Arc::new(|_ctx: Context, _next: Next| -> ResponseFuture {
            Box::pin(async { Response::new(StatusCode::Ok).body("ok") })
        });
        let chain = vec![from_middleware(Arc::new(LoggerMiddleware)), terminal];
        let response = Next::new(chain).run(ctx()).await;
        assert_eq!(response.status(), StatusCode::Ok);
    }
}
