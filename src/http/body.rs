//! Response bodies: fully buffered or streamed with chunked transfer coding.
//!
//! A streamed body ends cleanly with the zero-length terminal chunk. When the
//! producing stream yields an error the server closes the connection without
//! writing that terminator, so a client can tell a truncated body from a
//! complete one without any in-band sentinel.

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::BoxStream;
use thiserror::Error;

/// Terminates a chunked body (RFC 9112 §7.1).
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// A stream of body fragments, written to the socket as they are produced.
pub type BodyStream = BoxStream<'static, Result<Bytes, BodyError>>;

/// The producer of a streamed body failed part-way through.
#[derive(Debug, Error)]
#[error("body stream aborted: {reason}")]
pub struct BodyError {
    reason: String,
}

impl BodyError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// The payload of a [`Response`](super::Response).
pub enum Body {
    /// A complete payload, sent with `Content-Length`.
    Full(Bytes),
    /// A live payload, sent with `Transfer-Encoding: chunked`.
    Stream(BodyStream),
}

impl Body {
    /// An empty, fully buffered body.
    pub fn empty() -> Self {
        Self::Full(Bytes::new())
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Frames `data` as a single chunk: hex length, CRLF, data, CRLF.
///
/// Empty input would read as the terminal chunk, so callers must skip it.
///
/// # Examples
///
/// ```
/// use bluebox::http::body::encode_chunk;
///
/// assert_eq!(&encode_chunk(b"Hi there")[..], b"8\r\nHi there\r\n");
/// ```
pub fn encode_chunk(data: &[u8]) -> BytesMut {
    let size_line = format!("{:X}\r\n", data.len());
    let mut buf = BytesMut::with_capacity(size_line.len() + data.len() + 2);
    buf.put(size_line.as_bytes());
    buf.put(data);
    buf.put(&b"\r\n"[..]);
    buf
}
