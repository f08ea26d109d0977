//! The in-flight response writer.
//!
//! Filters, pre-filters and actions all write into the same
//! [`ResponseWriter`] owned by the request context. Outputs only fill in
//! what is still missing: an explicit `content-type` set by a handler is
//! never overridden.
//!
//! Gzip, when requested, is applied as the writer is turned into a hyper
//! response, so buffered and streamed bodies are both covered.

use std::io::{self, Write};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use flate2::Compression;
use flate2::write::GzEncoder;
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Frame;
use tracing::warn;

/// Body type handed to hyper: either a buffered payload or a file stream.
pub type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

// ── ContentType ───────────────────────────────────────────────────────────────

/// Default content types used by the output renderer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentType {
    Html,         // text/html; charset=utf-8
    Json,         // application/json; charset=utf-8
    OctetStream,  // application/octet-stream
    Text,         // text/plain; charset=utf-8
    Xml,          // application/xml; charset=utf-8
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Html        => "text/html; charset=utf-8",
            Self::Json        => "application/json; charset=utf-8",
            Self::OctetStream => "application/octet-stream",
            Self::Text        => "text/plain; charset=utf-8",
            Self::Xml         => "application/xml; charset=utf-8",
        }
    }
}

// ── ResponseWriter ────────────────────────────────────────────────────────────

enum Body {
    Buffered(BytesMut),
    Stream(ResponseBody),
}

/// Accumulates status, headers and body for one request.
pub struct ResponseWriter {
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
    written: bool,
    gzip: bool,
}

impl Default for ResponseWriter {
    fn default() -> Self { Self::new() }
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Body::Buffered(BytesMut::new()),
            written: false,
            gzip: false,
        }
    }

    /// A response with only a status line.
    pub fn with_status(status: StatusCode) -> Self {
        let mut w = Self::new();
        w.status = status;
        w
    }

    /// A redirect to `location`.
    pub fn redirect(status: StatusCode, location: &str) -> Self {
        let mut w = Self::with_status(status);
        w.set_header(header::LOCATION, location);
        w
    }

    pub fn status(&self) -> StatusCode { self.status }
    pub fn set_status(&mut self, status: StatusCode) { self.status = status; }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.headers }

    /// Sets a header, replacing earlier values. Invalid values are dropped
    /// with a warning.
    pub fn set_header(&mut self, name: HeaderName, value: &str) {
        match HeaderValue::from_str(value) {
            Ok(v) => { self.headers.insert(name, v); }
            Err(_) => warn!(header = %name, "dropping invalid header value"),
        }
    }

    /// Appends a header, keeping earlier values (e.g. several `set-cookie`).
    pub fn append_header(&mut self, name: HeaderName, value: &str) {
        match HeaderValue::from_str(value) {
            Ok(v) => { self.headers.append(name, v); }
            Err(_) => warn!(header = %name, "dropping invalid header value"),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Sets `content-type` only when nothing set one before.
    pub fn default_content_type(&mut self, content_type: &str) {
        if !self.headers.contains_key(header::CONTENT_TYPE) {
            self.set_header(header::CONTENT_TYPE, content_type);
        }
    }

    /// Adds a `set-cookie` header.
    pub fn set_cookie(&mut self, name: &str, value: &str, max_age_secs: Option<u64>, http_only: bool) {
        let mut cookie = format!("{name}={value}; Path=/");
        if let Some(age) = max_age_secs {
            cookie.push_str(&format!("; Max-Age={age}"));
        }
        if http_only {
            cookie.push_str("; HttpOnly");
        }
        self.append_header(header::SET_COOKIE, &cookie);
    }

    /// Appends bytes to a buffered body. Ignored once a stream is attached.
    pub fn write(&mut self, bytes: &[u8]) {
        match &mut self.body {
            Body::Buffered(buf) => buf.extend_from_slice(bytes),
            Body::Stream(_) => warn!("write after a streamed body was attached; ignored"),
        }
        self.written = true;
    }

    /// Replaces the body with a stream; anything buffered so far is sent first.
    pub fn stream(&mut self, body: ResponseBody) {
        self.body = match std::mem::replace(&mut self.body, Body::Buffered(BytesMut::new())) {
            Body::Buffered(buf) if !buf.is_empty() => {
                let head = Full::new(buf.freeze()).map_err(|never| match never {});
                Body::Stream(Chain::new(head.boxed_unsync(), body).boxed_unsync())
            }
            _ => Body::Stream(body),
        };
        self.written = true;
    }

    /// Whether any body bytes were produced.
    pub fn has_written(&self) -> bool { self.written }

    /// Gzips the body on its way out. Empty buffered bodies are sent as is.
    pub fn compress_gzip(&mut self) { self.gzip = true; }

    pub fn is_compressed(&self) -> bool { self.gzip }

    /// Copies the `set-cookie` headers staged on `other`.
    pub fn keep_cookies_from(&mut self, other: &ResponseWriter) {
        for cookie in other.headers.get_all(header::SET_COOKIE) {
            self.headers.append(header::SET_COOKIE, cookie.clone());
        }
    }

    /// Buffered body so far; empty for streamed responses.
    pub fn buffered(&self) -> &[u8] {
        match &self.body {
            Body::Buffered(buf) => buf,
            Body::Stream(_) => &[],
        }
    }

    pub fn into_response(mut self) -> http::Response<ResponseBody> {
        let body = match self.body {
            Body::Buffered(buf) if self.gzip && !buf.is_empty() => match gzip(&buf) {
                Ok(compressed) => {
                    mark_gzipped(&mut self.headers);
                    full(Bytes::from(compressed))
                }
                Err(e) => {
                    warn!(error = %e, "gzip failed; sending the body uncompressed");
                    full(buf.freeze())
                }
            },
            Body::Buffered(buf) => full(buf.freeze()),
            Body::Stream(body) if self.gzip => {
                mark_gzipped(&mut self.headers);
                GzipBody::new(body).boxed_unsync()
            }
            Body::Stream(body) => body,
        };
        let mut res = http::Response::new(body);
        *res.status_mut() = self.status;
        *res.headers_mut() = self.headers;
        res
    }
}

fn full(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

// ── Gzip ──────────────────────────────────────────────────────────────────────

fn gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn mark_gzipped(headers: &mut HeaderMap) {
    headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    headers.append(header::VARY, HeaderValue::from_static("accept-encoding"));
    headers.remove(header::CONTENT_LENGTH);
}

/// Compresses a streamed body frame by frame. Non-data frames are dropped.
struct GzipBody {
    inner: ResponseBody,
    encoder: Option<GzEncoder<Vec<u8>>>,
}

impl GzipBody {
    fn new(inner: ResponseBody) -> Self {
        Self { inner, encoder: Some(GzEncoder::new(Vec::new(), Compression::default())) }
    }
}

impl hyper::body::Body for GzipBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        let this = self.get_mut();
        loop {
            let Some(encoder) = this.encoder.as_mut() else { return Poll::Ready(None) };
            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    let Ok(data) = frame.into_data() else { continue };
                    if let Err(e) = encoder.write_all(&data) {
                        return Poll::Ready(Some(Err(e)));
                    }
                    let out = std::mem::take(encoder.get_mut());
                    if !out.is_empty() {
                        return Poll::Ready(Some(Ok(Frame::data(Bytes::from(out)))));
                    }
                }
                Some(Err(e)) => return Poll::Ready(Some(Err(e))),
                None => {
                    let tail = this.encoder.take().map(GzEncoder::finish);
                    return Poll::Ready(tail.map(|res| res.map(|out| Frame::data(Bytes::from(out)))));
                }
            }
        }
    }
}

// ── Chain ─────────────────────────────────────────────────────────────────────

/// Sends one body to completion, then another.
struct Chain {
    first: Option<ResponseBody>,
    second: ResponseBody,
}

impl Chain {
    fn new(first: ResponseBody, second: ResponseBody) -> Self {
        Self { first: Some(first), second }
    }
}

impl hyper::body::Body for Chain {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<hyper::body::Frame<Bytes>, std::io::Error>>> {
        use std::task::Poll;

        if let Some(first) = self.first.as_mut() {
            match std::pin::Pin::new(first).poll_frame(cx) {
                Poll::Ready(None) => self.first = None,
                other => return other,
            }
        }
        std::pin::Pin::new(&mut self.second).poll_frame(cx)
    }
}
