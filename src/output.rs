//! Action outputs and their rendering.
//!
//! An action answers with exactly one [`Out`]. The renderer consumes it
//! once: deferred callbacks run first, then, unless the request has been
//! cancelled, the payload is encoded into the [`ResponseWriter`]. Content
//! types are defaults only; a type the handler set explicitly stays.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt, stream};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::RenderError;
use crate::monitor::CancelSignal;
use crate::response::{ContentType, ResponseWriter};
use crate::template::Template;

const SNIFF_LEN: usize = 1024;
const CHUNK_LEN: usize = 16 * 1024;

// ── Deferred ──────────────────────────────────────────────────────────────────

/// Callbacks that run once, in registration order. Whatever has not run
/// when the list is dropped runs then.
#[derive(Default)]
pub(crate) struct Deferred(Vec<Box<dyn FnOnce() + Send>>);

impl Deferred {
    pub(crate) fn push(&mut self, f: Box<dyn FnOnce() + Send>) {
        self.0.push(f);
    }

    pub(crate) fn run(&mut self) {
        for f in self.0.drain(..) {
            f();
        }
    }
}

impl Drop for Deferred {
    fn drop(&mut self) {
        self.run();
    }
}

// ── Out ───────────────────────────────────────────────────────────────────────

/// A resolved template with the data it will be executed against.
pub(crate) struct TemplatePayload {
    pub(crate) template: Result<Arc<dyn Template>, RenderError>,
    pub(crate) data: Value,
}

pub(crate) enum Kind {
    Continue,
    Json(Result<Vec<u8>, RenderError>),
    Xml(Result<Vec<u8>, RenderError>),
    /// Layout template, body already embedded as `Content`.
    Layout(TemplatePayload),
    Solo(TemplatePayload),
    String(String),
    Bytes(Bytes),
    File(PathBuf),
    /// Final response with no body, e.g. a redirect.
    Empty,
}

/// The result of a pre-filter or action. Built through the output
/// constructors on [`In`](crate::In).
pub struct Out {
    kind: Kind,
    defers: Deferred,
    cancel: Option<CancelSignal>,
}

impl Out {
    pub(crate) fn new(kind: Kind, defers: Deferred, cancel: Option<CancelSignal>) -> Self {
        Self { kind, defers, cancel }
    }

    /// Whether this is the "keep going" marker returned by pre-filters.
    pub fn is_continue(&self) -> bool {
        matches!(self.kind, Kind::Continue)
    }

    /// Short name of the output kind, for logs.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            Kind::Continue  => "continue",
            Kind::Json(_)   => "json",
            Kind::Xml(_)    => "xml",
            Kind::Layout(_) => "layout",
            Kind::Solo(_)   => "solo",
            Kind::String(_) => "string",
            Kind::Bytes(_)  => "bytes",
            Kind::File(_)   => "file",
            Kind::Empty     => "empty",
        }
    }

    /// Writes the output into `w`.
    pub async fn render(mut self, w: &mut ResponseWriter) -> Result<(), RenderError> {
        self.defers.run();
        if self.cancel.as_ref().is_some_and(CancelSignal::is_cancelled) {
            debug!(kind = self.kind_name(), "request cancelled; skipping render");
            return Ok(());
        }

        match std::mem::replace(&mut self.kind, Kind::Continue) {
            Kind::Continue | Kind::Empty => {}
            Kind::Json(body) => {
                let body = body?;
                w.default_content_type(ContentType::Json.as_str());
                w.write(&body);
            }
            Kind::Xml(body) => {
                let body = body?;
                w.default_content_type(ContentType::Xml.as_str());
                w.write(&body);
            }
            Kind::Layout(payload) | Kind::Solo(payload) => {
                let template = payload.template?;
                let mut body = Vec::new();
                template
                    .execute(&payload.data, &mut body)
                    .map_err(|e| RenderError::Template(e.to_string()))?;
                w.default_content_type(ContentType::Html.as_str());
                w.write(&body);
            }
            Kind::String(s) => {
                w.default_content_type(ContentType::Text.as_str());
                w.write(s.as_bytes());
            }
            Kind::Bytes(b) => {
                w.default_content_type(ContentType::OctetStream.as_str());
                w.write(&b);
            }
            Kind::File(path) => stream_file(path, w).await?,
        }
        Ok(())
    }
}

impl std::fmt::Debug for Out {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Out").field("kind", &self.kind_name()).finish_non_exhaustive()
    }
}

// ── Files ─────────────────────────────────────────────────────────────────────

async fn stream_file(path: PathBuf, w: &mut ResponseWriter) -> Result<(), RenderError> {
    let mut file = tokio::fs::File::open(&path).await?;

    let mut head = vec![0; SNIFF_LEN];
    let mut filled = 0;
    while filled < SNIFF_LEN {
        let n = file.read(&mut head[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    head.truncate(filled);

    if w.content_type().is_none() {
        w.default_content_type(sniff_content_type(&head));
    }

    let rest = stream::try_unfold(file, |mut file| async move {
        let mut buf = vec![0; CHUNK_LEN];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok::<_, std::io::Error>(None);
        }
        buf.truncate(n);
        Ok(Some((Bytes::from(buf), file)))
    });
    let chunks = stream::once(async move { Ok::<_, std::io::Error>(Bytes::from(head)) }).chain(rest);
    w.stream(StreamBody::new(chunks.map_ok(Frame::data)).boxed_unsync());
    Ok(())
}

/// Guesses a content type from the first bytes of a payload.
pub fn sniff_content_type(data: &[u8]) -> &'static str {
    const HTML_TAGS: &[&[u8]] = &[
        b"<!DOCTYPE HTML", b"<HTML", b"<HEAD", b"<SCRIPT", b"<IFRAME", b"<H1", b"<DIV",
        b"<FONT", b"<TABLE", b"<A", b"<STYLE", b"<TITLE", b"<B", b"<BODY", b"<BR", b"<P", b"<!--",
    ];
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"%PDF-", "application/pdf"),
        (b"%!PS-Adobe-", "application/postscript"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"BM", "image/bmp"),
        (b"\x00\x00\x01\x00", "image/x-icon"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b\x08", "application/x-gzip"),
        (b"\x00asm", "application/wasm"),
    ];

    let trimmed = {
        let start = data.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(data.len());
        &data[start..]
    };

    for tag in HTML_TAGS {
        if trimmed.len() > tag.len()
            && trimmed[..tag.len()].eq_ignore_ascii_case(tag)
            && matches!(trimmed[tag.len()], b' ' | b'>')
        {
            return ContentType::Html.as_str();
        }
    }
    if trimmed.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }
    for (signature, content_type) in SIGNATURES {
        if data.starts_with(signature) {
            return *content_type;
        }
    }
    if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return "image/webp";
    }

    let binary = data.iter().any(|b| matches!(b, 0x00..=0x08 | 0x0b | 0x0e..=0x1a | 0x1c..=0x1f));
    if binary { ContentType::OctetStream.as_str() } else { ContentType::Text.as_str() }
}
