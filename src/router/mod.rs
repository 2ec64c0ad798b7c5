//! Request routing — map HTTP methods and exact paths to handler functions.
//!
//! Trailing slashes are normalized on both registered paths and incoming
//! paths, so `/api/chat/` and `/api/chat` are the same route. A path that is
//! registered under a different method answers `405 Method Not Allowed`; an
//! unknown path answers `404 Not Found`. Both carry a JSON `{ "error" }` body.
//!
//! Every request, matched or not, runs through the router's middleware stack
//! before reaching its handler.

use std::sync::Arc;

use crate::context::Context;
use crate::middleware::{Middleware, MiddlewareHandler, Next, ResponseFuture, from_middleware};
use crate::{Method, Request, Response, StatusCode};

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait through the blanket impl.
pub trait IntoHandler: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> ResponseFuture;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> ResponseFuture {
        Box::pin((self)(ctx))
    }
}

/// Type-erased route handler.
pub type Handler = Arc<dyn IntoHandler>;

fn normalize(path: &str) -> &str {
    if path != "/" && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

struct Route {
    method: Method,
    path: String,
    handler: Handler,
}

/// What the route table says about a request.
enum Lookup<'a> {
    Found(&'a Handler),
    WrongMethod,
    Missing,
}

/// HTTP request router.
///
/// Routes are evaluated in registration order; the first route whose method
/// and path both match wins.
///
/// # Examples
///
/// ```rust,no_run
/// use bluebox::{Router, Response, StatusCode};
/// use bluebox::context::Context;
///
/// let mut router = Router::new();
/// router.get("/health", |_ctx: Context| async { Response::new(StatusCode::Ok) });
/// router.post("/api/chat", |_ctx: Context| async { Response::new(StatusCode::Ok) });
/// ```
pub struct Router {
    routes: Vec<Route>,
    middlewares: Vec<MiddlewareHandler>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            middlewares: Vec::new(),
        }
    }

    /// Register a handler for `GET` requests to `path`.
    pub fn get(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Get, path, handler);
    }

    /// Register a handler for `POST` requests to `path`.
    pub fn post(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Post, path, handler);
    }

    /// Appends a middleware layer. Layers run in the order they were added,
    /// outermost first.
    pub fn layer<M: Middleware + 'static>(&mut self, middleware: M) {
        self.middlewares.push(from_middleware(Arc::new(middleware)));
    }

    fn add_route(&mut self, method: Method, path: &str, handler: impl IntoHandler) {
        self.routes.push(Route {
            method,
            path: normalize(path).to_owned(),
            handler: Arc::new(handler),
        });
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn lookup(&self, method: &Method, path: &str) -> Lookup<'_> {
        let path = normalize(path);
        let mut path_known = false;

        for route in &self.routes {
            if route.path == path {
                if &route.method == method {
                    return Lookup::Found(&route.handler);
                }
                path_known = true;
            }
        }

        if path_known {
            Lookup::WrongMethod
        } else {
            Lookup::Missing
        }
    }

    /// Dispatch `request` through the middleware stack to its handler.
    pub async fn route(&self, request: Request) -> Response {
        let terminal: MiddlewareHandler = match self.lookup(request.method(), request.path()) {
            Lookup::Found(handler) => {
                let handler = Arc::clone(handler);
                Arc::new(move |ctx: Context, _next: Next| -> ResponseFuture { handler.call(ctx) })
            }
            Lookup::WrongMethod => Arc::new(|_ctx: Context, _next: Next| -> ResponseFuture {
                Box::pin(async { error_response(StatusCode::MethodNotAllowed, "Method not allowed") })
            }),
            Lookup::Missing => Arc::new(|_ctx: Context, _next: Next| -> ResponseFuture {
                Box::pin(async { error_response(StatusCode::NotFound, "Not found") })
            }),
        };

        let mut chain = self.middlewares.clone();
        chain.push(terminal);
        Next::new(chain).run(Context::new(request)).await
    }
}

/// A JSON `{ "error": message }` response.
pub fn error_response(status: StatusCode, message: &str) -> Response {
    Response::new(status).json(&serde_json::json!({ "error": message }))
}
