//! HTTP/1.1 response builder.
//!
//! Responses are built fluently and serialized in two parts: the head (status
//! line, headers and, for buffered bodies, the payload) and an optional body
//! stream that the server relays chunk by chunk.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::body::{Body, BodyStream};
use super::{Headers, StatusCode};

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use bluebox::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::empty(),
            keep_alive: true,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place, for middleware decorating a downstream response.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets a buffered body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Full(Bytes::from(body.into()));
        self
    }

    /// Serializes `value` as the body and sets `Content-Type: application/json`.
    ///
    /// Serialization of plain data structures cannot fail in practice; if it
    /// does, the response degrades to an empty `500`.
    #[must_use]
    pub fn json<T: Serialize>(mut self, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                self.headers.insert("Content-Type", "application/json");
                self.body = Body::Full(Bytes::from(bytes));
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize JSON response body");
                self.status = StatusCode::InternalServerError;
                self.body = Body::empty();
            }
        }
        self
    }

    /// Sets a streamed body. Streamed responses always close the connection
    /// once the body is finished.
    #[must_use]
    pub fn stream(mut self, stream: BodyStream) -> Self {
        self.body = Body::Stream(stream);
        self.keep_alive = false;
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the headers set so far (framing headers are added on serialization).
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns `true` when the connection should stay open after this response.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Returns `true` when the body is relayed as a live stream.
    pub fn is_streaming(&self) -> bool {
        self.body.is_stream()
    }

    /// Consumes the response, returning its body.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Serializes the head and returns it with the body stream, if any.
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if the body is non-empty and no
    ///   `Content-Type` header was set.
    /// - `Content-Length: <n>` for buffered bodies, `Transfer-Encoding: chunked`
    ///   for streamed ones.
    /// - `Connection: keep-alive` or `Connection: close`.
    pub fn into_parts(mut self) -> (BytesMut, Option<BodyStream>) {
        let (payload, stream) = match self.body {
            Body::Full(bytes) => (bytes, None),
            Body::Stream(stream) => (Bytes::new(), Some(stream)),
        };

        if (stream.is_some() || !payload.is_empty()) && !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", "text/plain; charset=utf-8");
        }

        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        self.headers.insert("Connection", connection);

        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 64 + payload.len());

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        // The framing header is always the last one before the blank line.
        if stream.is_some() {
            buf.put(&b"Transfer-Encoding: chunked\r\n"[..]);
        } else {
            buf.put(format!("Content-Length: {}\r\n", payload.len()).as_bytes());
        }

        buf.put(&b"\r\n"[..]);
        buf.put(payload);

        (buf, stream)
    }

    /// Serializes a buffered response in full. A streamed body is not included;
    /// use [`into_parts`](Self::into_parts) for those.
    pub fn into_bytes(self) -> BytesMut {
        self.into_parts().0
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}
