//! The per-request context handed to filters, pre-filters and actions.
//!
//! One [`In`] is created for each dispatched request and owned by that
//! request alone. Besides the request and the response being built, it
//! carries the route parameters, two template data bags, the active
//! language, a lazily loaded session and the callbacks that must run when
//! the request ends.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{self, HeaderName};
use http::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{error, warn};

use crate::action::ErasedController;
use crate::app::Services;
use crate::error::{RenderError, ReverseError};
use crate::monitor::CancelSignal;
use crate::output::{Deferred, Kind, Out, TemplatePayload};
use crate::request::Request;
use crate::response::ResponseWriter;
use crate::routing::{ActionDefinition, Params, RouteTable};
use crate::session::{SESSION_COOKIE, Session, SessionError, valid_sid};
use crate::template::{Template, execute_to_string};
use crate::websocket::WebSocket;

// ── Content ───────────────────────────────────────────────────────────────────

/// A JSON object used as template data.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Content(Map<String, Value>);

impl Content {
    pub fn new() -> Self { Self::default() }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> { self.0.get(key) }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn del(&mut self, key: &str) -> Option<Value> { self.0.remove(key) }

    pub fn contains(&self, key: &str) -> bool { self.0.contains_key(key) }

    /// Copies every field of `value`, replacing existing keys. `value` must
    /// serialize to an object.
    pub fn merge<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        for (k, v) in to_object(value)? {
            self.0.insert(k, v);
        }
        Ok(())
    }

    /// Like [`merge`](Self::merge) but keeps keys already present.
    pub fn merge_no_overwrite<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        for (k, v) in to_object(value)? {
            self.0.entry(k).or_insert(v);
        }
        Ok(())
    }

    pub fn as_map(&self) -> &Map<String, Value> { &self.0 }

    pub fn into_value(self) -> Value { Value::Object(self.0) }
}

fn to_object<T: Serialize + ?Sized>(value: &T) -> Result<Map<String, Value>, serde_json::Error> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(serde::ser::Error::custom(format!("expected an object, got `{other}`"))),
    }
}

// ── In ────────────────────────────────────────────────────────────────────────

type BeforeOutput = Box<dyn FnOnce(&mut In) + Send>;

pub struct In {
    request: Request,
    pub(crate) response: ResponseWriter,
    params: Params,
    fixed_params: Arc<[String]>,
    /// Data for body templates.
    pub content: Content,
    /// Data for the layout template.
    pub layout_content: Content,
    /// Translated page title; used as the layout `Title` unless
    /// `layout_content` sets one.
    pub title: String,
    lang: String,
    layout_override: Option<String>,
    controller_name: String,
    action_name: String,
    controller: Arc<dyn ErasedController>,
    services: Arc<Services>,
    routes: Arc<RouteTable>,
    session: Option<Session>,
    defers: Deferred,
    closers: Deferred,
    before_output: Vec<BeforeOutput>,
    cancel: CancelSignal,
    pub(crate) websocket: Option<WebSocket>,
}

/// Everything the dispatcher resolved before building a context.
pub(crate) struct Resolved {
    pub params: Params,
    pub fixed_params: Arc<[String]>,
    pub controller_name: String,
    pub action_name: String,
    pub controller: Arc<dyn ErasedController>,
    pub lang: String,
    pub routes: Arc<RouteTable>,
    pub cancel: CancelSignal,
}

impl In {
    pub(crate) fn new(request: Request, resolved: Resolved, services: Arc<Services>) -> Self {
        let title = services.translator.translate(&resolved.lang, resolved.controller.page_title());
        Self {
            request,
            response: ResponseWriter::new(),
            params: resolved.params,
            fixed_params: resolved.fixed_params,
            content: Content::new(),
            layout_content: Content::new(),
            title,
            lang: resolved.lang,
            layout_override: None,
            controller_name: resolved.controller_name,
            action_name: resolved.action_name,
            controller: resolved.controller,
            services,
            routes: resolved.routes,
            session: None,
            defers: Deferred::default(),
            closers: Deferred::default(),
            before_output: Vec::new(),
            cancel: resolved.cancel,
            websocket: None,
        }
    }

    // ── Request side ──

    pub fn request(&self) -> &Request { &self.request }

    /// A captured route parameter, e.g. `id` for `/app/:id`. Routes with
    /// the `*` method also capture the request method as `METHOD`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn params(&self) -> &Params { &self.params }

    /// Literal arguments declared on the route line.
    pub fn fixed_params(&self) -> &[String] { &self.fixed_params }

    pub fn controller_name(&self) -> &str { &self.controller_name }
    pub fn action_name(&self) -> &str { &self.action_name }

    /// Decoded query-string values; the last occurrence of a key wins.
    pub fn query(&self) -> HashMap<String, String> {
        url::form_urlencoded::parse(self.request.query().unwrap_or_default().as_bytes())
            .into_owned()
            .collect()
    }

    /// A form value from an urlencoded body, falling back to the query.
    pub fn form_value(&self, key: &str) -> Option<String> {
        let urlencoded = self
            .request
            .header("content-type")
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
        let from_body = urlencoded
            .then(|| {
                url::form_urlencoded::parse(self.request.body())
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.into_owned())
            })
            .flatten();
        from_body.or_else(|| {
            url::form_urlencoded::parse(self.request.query().unwrap_or_default().as_bytes())
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
        })
    }

    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(self.request.body())
    }

    // ── Server-level accessors ──

    pub fn config(&self) -> &crate::AppConfig { &self.services.config }

    pub fn lang(&self) -> &str { &self.lang }

    pub fn translate(&self, text: &str) -> String {
        self.services.translator.translate(&self.lang, text)
    }

    /// Builds the URL of an action, see [`RouteTable::reverse`].
    pub fn reverse(&self, action: &str, args: BTreeMap<String, String>) -> Result<ActionDefinition, ReverseError> {
        self.routes.reverse(action, args)
    }

    pub fn cancel_signal(&self) -> &CancelSignal { &self.cancel }

    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }

    /// The framed connection of an upgraded request.
    pub fn websocket(&mut self) -> Option<&mut WebSocket> { self.websocket.as_mut() }

    /// Takes the framed connection, e.g. to move it into another task.
    pub fn take_websocket(&mut self) -> Option<WebSocket> { self.websocket.take() }

    // ── Session ──

    /// The user's session, loaded or created on first use.
    pub async fn session(&mut self) -> &mut Session {
        if self.session.is_none() {
            let session = self.load_session().await;
            self.session = Some(session);
        }
        self.session.get_or_insert_with(Session::new)
    }

    async fn load_session(&mut self) -> Session {
        let provider = Arc::clone(&self.services.sessions);
        let sid = self.request.cookie(SESSION_COOKIE).filter(|sid| valid_sid(sid)).map(str::to_owned);
        if let Some(sid) = sid {
            match provider.get(&sid).await {
                Ok(session) => return session,
                Err(SessionError::NotFound(_)) => {}
                Err(e) => warn!(error = %e, "could not load session; starting a new one"),
            }
        }

        let session = Session::new();
        if let Err(e) = provider.create(&session).await {
            error!(error = %e, "could not store new session");
        }
        self.response.set_cookie(SESSION_COOKIE, &session.sid, None, true);
        session
    }

    // ── Response side ──

    pub fn response(&self) -> &ResponseWriter { &self.response }
    pub fn response_mut(&mut self) -> &mut ResponseWriter { &mut self.response }

    pub fn set_status(&mut self, status: StatusCode) { self.response.set_status(status); }

    pub fn set_header(&mut self, name: HeaderName, value: &str) { self.response.set_header(name, value); }

    /// Tells clients and proxies not to cache the response.
    pub fn no_cache(&mut self) {
        self.response.set_header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate");
        self.response.set_header(header::PRAGMA, "no-cache");
        self.response.set_header(header::EXPIRES, "0");
    }

    /// Overrides the controller's layout for this request.
    pub fn set_layout(&mut self, name: impl Into<String>) {
        self.layout_override = Some(name.into());
    }

    // ── Lifecycle registration ──

    /// Runs `f` right before the output is written, or at the end of the
    /// request if no output is rendered.
    pub fn defer(&mut self, f: impl FnOnce() + Send + 'static) {
        self.defers.push(Box::new(f));
    }

    /// Runs `f` when an output is constructed, before its data is taken.
    pub fn before_output(&mut self, f: impl FnOnce(&mut In) + Send + 'static) {
        self.before_output.push(Box::new(f));
    }

    /// Runs `f` once the request is over, whatever the outcome.
    pub fn close_on_finish(&mut self, f: impl FnOnce() + Send + 'static) {
        self.closers.push(Box::new(f));
    }

    // ── Outputs ──

    /// Lets the pipeline go on; only meaningful from a pre-filter.
    pub fn continue_(&mut self) -> Out {
        Out::new(Kind::Continue, Deferred::default(), None)
    }

    pub fn json<T: Serialize + ?Sized>(&mut self, value: &T) -> Out {
        self.run_before_output();
        let body = serde_json::to_vec(value).map_err(|e| RenderError::Marshal(e.to_string()));
        self.output(Kind::Json(body))
    }

    pub fn xml<T: Serialize + ?Sized>(&mut self, value: &T) -> Out {
        self.run_before_output();
        let body = quick_xml::se::to_string(value)
            .map(String::into_bytes)
            .map_err(|e| RenderError::Marshal(e.to_string()));
        self.output(Kind::Xml(body))
    }

    /// The content bag as JSON.
    pub fn content_json(&mut self) -> Out {
        self.run_before_output();
        let body = serde_json::to_vec(&self.content).map_err(|e| RenderError::Marshal(e.to_string()));
        self.output(Kind::Json(body))
    }

    /// Renders the body template `path` inside the controller's layout.
    pub fn template(&mut self, path: &str) -> Out {
        self.run_before_output();
        let payload = self.layout_payload(Some(path));
        self.output(Kind::Layout(payload))
    }

    /// Renders the controller's layout alone.
    pub fn layout(&mut self) -> Out {
        self.run_before_output();
        let payload = self.layout_payload(None);
        self.output(Kind::Layout(payload))
    }

    /// Renders `path` without a layout.
    pub fn solo(&mut self, path: &str) -> Out {
        self.run_before_output();
        let payload = TemplatePayload { template: self.resolve(path), data: self.content_value() };
        self.output(Kind::Solo(payload))
    }

    pub fn string(&mut self, body: impl Into<String>) -> Out {
        self.run_before_output();
        self.output(Kind::String(body.into()))
    }

    pub fn bytes(&mut self, body: impl Into<Bytes>) -> Out {
        self.run_before_output();
        self.output(Kind::Bytes(body.into()))
    }

    pub fn file(&mut self, path: impl Into<PathBuf>) -> Out {
        self.run_before_output();
        self.output(Kind::File(path.into()))
    }

    /// A `302 Found` to `location`, without a body.
    pub fn redirect(&mut self, location: &str) -> Out {
        self.run_before_output();
        self.response.set_status(StatusCode::FOUND);
        self.response.set_header(header::LOCATION, location);
        self.output(Kind::Empty)
    }

    fn run_before_output(&mut self) {
        for hook in std::mem::take(&mut self.before_output) {
            hook(self);
        }
    }

    fn output(&mut self, kind: Kind) -> Out {
        Out::new(kind, std::mem::take(&mut self.defers), Some(self.cancel.clone()))
    }

    fn resolve(&self, path: &str) -> Result<Arc<dyn Template>, RenderError> {
        let locale = (!self.services.config.default_language.is_empty()).then_some(self.lang.as_str());
        self.services
            .templates
            .resolve(path, locale)
            .ok_or_else(|| RenderError::TemplateNotFound(path.to_owned()))
    }

    fn flash(&self) -> Option<Value> {
        self.session.as_ref().map(|s| Value::Object(s.flash.clone()))
    }

    fn content_value(&self) -> Value {
        let mut data = self.content.clone();
        if let Some(flash) = self.flash() {
            data.set("Flash", flash);
        }
        data.into_value()
    }

    fn layout_payload(&mut self, body: Option<&str>) -> TemplatePayload {
        let failed = |e: RenderError| TemplatePayload { template: Err(e), data: Value::Null };

        let layout_data = self.layout_content.as_map().clone();
        if let Err(e) = self.content.merge_no_overwrite(&layout_data) {
            return failed(RenderError::Marshal(e.to_string()));
        }

        if let Some(path) = body {
            let rendered = self
                .resolve(path)
                .and_then(|t| execute_to_string(&*t, &self.content_value()).map_err(|e| RenderError::Template(e.to_string())));
            match rendered {
                Ok(html) => self.layout_content.set("Content", html),
                Err(e) => return failed(e),
            }
        }

        if !self.layout_content.contains("Title") {
            self.layout_content.set("Title", self.title.clone());
        }
        if let Some(flash) = self.flash() {
            self.layout_content.set("Flash", flash);
        }

        let layout = self
            .layout_override
            .clone()
            .or_else(|| self.controller.layout().map(str::to_owned))
            .filter(|l| !l.is_empty());
        let Some(layout) = layout else {
            return failed(RenderError::NoLayout(self.controller_name.clone()));
        };

        TemplatePayload {
            template: self.resolve(&format!("layouts/{layout}.tpl")),
            data: self.layout_content.clone().into_value(),
        }
    }

    // ── Teardown ──

    /// Runs closers, then writes back a touched session with its flash
    /// cleared. Outstanding defers run here too.
    pub(crate) async fn finish(&mut self) {
        self.defers.run();
        self.closers.run();
        if let Some(mut session) = self.session.take() {
            session.flash.clear();
            if let Err(e) = self.services.sessions.put(&session).await {
                error!(sid = %session.sid, error = %e, "could not save session");
            }
        }
    }

    pub(crate) fn into_response(self) -> ResponseWriter {
        self.response
    }
}
