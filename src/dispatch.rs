//! The request pipeline.
//!
//! Each request moves through a fixed sequence and never goes back:
//!
//! ```text
//! route lookup ─ none ─────────────────────────▶ fallback
//!      │ explicit 404 ─────────────────────────▶ 404 page
//! controller resolution ─ unregistered ────────▶ 500
//! TLS enforcement ─ plain request ─────────────▶ redirect to https / wss
//! context ─ upgrade ─▶ 101, rest runs on a task with the socket
//! filters ─ break ─────────────────────────────┐
//! pre-filter ─ not continue ─▶ render          │
//! action ─ cancelled ──────────────────────────┤
//! render                                       │
//! cleanup ◀────────────────────────────────────┘  (always)
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use http::header;
use http::{Method, StatusCode};
use serde_json::json;
use tracing::{Instrument, debug, debug_span, error, warn};

use crate::action::{DEFAULT_ACTION, ErasedController};
use crate::app::{Fallback, Services};
use crate::context::{In, Resolved};
use crate::error::RenderError;
use crate::filter::Filter;
use crate::i18n::{LANG_COOKIE, resolve_language};
use crate::method::RouteMethod;
use crate::monitor::{CancelSignal, Monitor};
use crate::output::Out;
use crate::request::Request;
use crate::response::{ContentType, ResponseBody, ResponseWriter};
use crate::routing::{Lookup, Router};
use crate::tls::{arrived_securely, secure_url};
use crate::websocket;

/// Routes requests to controller actions. Cheap to clone; clones share
/// the router, collaborators and monitor.
#[derive(Clone)]
pub struct Dispatcher {
    router: Arc<Router>,
    filters: Arc<[Arc<dyn Filter>]>,
    services: Arc<Services>,
    monitor: Arc<Monitor>,
    fallback: Arc<dyn Fallback>,
}

impl Dispatcher {
    pub(crate) fn new(
        router: Arc<Router>,
        filters: Arc<[Arc<dyn Filter>]>,
        services: Arc<Services>,
        monitor: Arc<Monitor>,
        fallback: Arc<dyn Fallback>,
    ) -> Self {
        Self { router, filters, services, monitor, fallback }
    }

    pub fn router(&self) -> &Arc<Router> { &self.router }
    pub fn monitor(&self) -> &Arc<Monitor> { &self.monitor }
    pub fn services(&self) -> &Arc<Services> { &self.services }

    /// Produces the response for one request. Never fails: every problem
    /// becomes an error response.
    pub async fn dispatch(&self, mut req: Request) -> http::Response<ResponseBody> {
        apply_method_override(&mut req);

        let cancel = CancelSignal::new();
        let tracked = self.monitor.track(req.path(), cancel.clone());
        let span = debug_span!("request", id = tracked.id());
        let w = self.route(req, cancel).instrument(span).await;
        tracked.finish();
        w.into_response()
    }

    async fn route(&self, mut req: Request, cancel: CancelSignal) -> ResponseWriter {
        let services = &self.services;
        let table = self.router.current();
        let upgrade = req.wants_websocket();

        let (method, path, ws) = (req.method().as_str(), req.path(), RouteMethod::Ws.as_str());
        let lookup = if upgrade {
            table.lookup(ws, path).or_else(|| table.lookup(method, path))
        } else if req.method() == Method::GET {
            table.lookup(method, path).or_else(|| table.lookup(ws, path))
        } else {
            table.lookup(method, path)
        };

        let matched = match lookup {
            None => return self.fallback.handle(req, Arc::clone(services)).await,
            Some(Lookup::NotFound) => {
                let lang = resolve_language(&req, &*services.translator, &services.config.default_language);
                return error_page(services, &lang.code, StatusCode::NOT_FOUND);
            }
            Some(Lookup::Matched(m)) => m,
        };

        let lang = resolve_language(&req, &*services.translator, &services.config.default_language);

        let Some(controller) = self.router.registry().controller(&matched.controller) else {
            error!(
                controller = %matched.controller,
                path = %req.path(),
                "matched controller is not registered",
            );
            return error_page(services, &lang.code, StatusCode::INTERNAL_SERVER_ERROR);
        };

        if (matched.tls_only || services.config.tls_redirect) && !arrived_securely(&req) {
            let websocket = upgrade || matched.method == RouteMethod::Ws;
            return match secure_url(&req, websocket, services.config.tls_port()) {
                Some(url) => {
                    debug!(from = %req.uri(), to = %url, "redirecting to TLS");
                    ResponseWriter::redirect(StatusCode::MOVED_PERMANENTLY, &url)
                }
                None => {
                    error!(path = %req.path(), "cannot build TLS redirect; request has no host");
                    error_page(services, &lang.code, StatusCode::INTERNAL_SERVER_ERROR)
                }
            };
        }

        if matched.method == RouteMethod::Ws && !upgrade {
            return error_page(services, &lang.code, StatusCode::BAD_REQUEST);
        }

        let switching = if upgrade && matched.method.accepts_upgrade() {
            if req.method() != Method::GET {
                return error_page(services, &lang.code, StatusCode::METHOD_NOT_ALLOWED);
            }
            let (Some(handshake), Some(on_upgrade)) = (websocket::handshake_response(&req), req.take_upgrade())
            else {
                return error_page(services, &lang.code, StatusCode::BAD_REQUEST);
            };
            Some((handshake, on_upgrade))
        } else {
            None
        };

        let resolved = Resolved {
            params: matched.params,
            fixed_params: matched.fixed_params,
            controller_name: matched.controller,
            action_name: matched.action,
            controller: Arc::clone(&controller),
            lang: lang.code,
            routes: table,
            cancel,
        };
        let mut cx = In::new(req, resolved, Arc::clone(services));
        if lang.set_cookie {
            let code = cx.lang().to_owned();
            cx.response.set_cookie(LANG_COOKIE, &code, None, false);
        }

        if let Some((handshake, on_upgrade)) = switching {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                match websocket::accept(on_upgrade).await {
                    Ok(socket) => {
                        cx.websocket = Some(socket);
                        dispatcher.run_guarded(&mut cx, &*controller, false).await;
                    }
                    Err(e) => warn!(error = %e, "websocket upgrade failed"),
                }
                cx.finish().await;
            });
            return handshake;
        }

        self.run_guarded(&mut cx, &*controller, true).await;
        cx.finish().await;
        cx.into_response()
    }

    /// Runs filters, pre-filter, action and (for plain HTTP) rendering,
    /// turning a panic anywhere in them into a 500.
    async fn run_guarded(&self, cx: &mut In, controller: &dyn ErasedController, render: bool) {
        let outcome = AssertUnwindSafe(self.run(cx, controller, render)).catch_unwind().await;
        if outcome.is_err() {
            error!(
                controller = %cx.controller_name(),
                action = %cx.action_name(),
                "request handler panicked",
            );
            self.fail(cx, StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    /// Swaps the response for an error page. Cookies already staged, such
    /// as a new session id, survive.
    fn fail(&self, cx: &mut In, status: StatusCode) {
        let mut page = error_page(&self.services, cx.lang(), status);
        page.keep_cookies_from(&cx.response);
        cx.response = page;
    }

    async fn run(&self, cx: &mut In, controller: &dyn ErasedController, render: bool) {
        let Some(out) = self.pipeline(cx, controller).await else { return };
        if !render {
            if !out.is_continue() {
                debug!(kind = out.kind_name(), "output ignored on upgraded connection");
            }
            return;
        }

        if let Err(e) = out.render(&mut cx.response).await {
            error!(
                controller = %cx.controller_name(),
                action = %cx.action_name(),
                error = %e,
                "render failed",
            );
            if !cx.response.has_written() {
                let status = match &e {
                    RenderError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                self.fail(cx, status);
            }
        }
    }

    /// Steps 7 to 9. `None` means nothing is to be rendered.
    async fn pipeline(&self, cx: &mut In, controller: &dyn ErasedController) -> Option<Out> {
        for (i, filter) in self.filters.iter().enumerate() {
            if filter.apply(cx).await.is_break() {
                debug!(filter = i, path = %cx.request().path(), "filter stopped the request");
                return None;
            }
        }

        let pre = controller.pre_filter(cx).await;
        if !pre.is_continue() {
            return Some(pre);
        }

        let action = match cx.action_name() {
            "" => DEFAULT_ACTION.to_owned(),
            name => name.to_owned(),
        };
        let Some(handle) = self.router.registry().lookup(cx.controller_name(), &action) else {
            error!(
                controller = %cx.controller_name(),
                action = %action,
                "matched action is not registered",
            );
            self.fail(cx, StatusCode::INTERNAL_SERVER_ERROR);
            return None;
        };

        let cancel = cx.cancel_signal().clone();
        tokio::select! {
            out = handle.call(cx) => Some(out),
            () = cancel.cancelled() => {
                debug!(action = %action, "request cancelled during action");
                None
            }
        }
    }
}

/// `X-HTTP-Method-Override` on a POST replaces the method used for routing.
fn apply_method_override(req: &mut Request) {
    if req.method() != Method::POST {
        return;
    }
    let Some(value) = req.header("x-http-method-override").map(str::to_owned) else { return };
    match Method::from_bytes(value.trim().to_ascii_uppercase().as_bytes()) {
        Ok(method) => req.set_method(method),
        Err(_) => debug!(value = %value, "ignoring invalid method override"),
    }
}

// ── Error pages ───────────────────────────────────────────────────────────────

const GENERIC_ERROR: &str =
    "<a href=\"https://en.wikipedia.org/wiki/List_of_HTTP_status_codes\">The request could not be fulfilled.</a>";

fn describe(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "<strong>Bad Request</strong> - The request cannot be fulfilled due to bad syntax.",
        401 => "<strong>Unauthorized</strong> - You must authenticate to view the source.",
        403 => "<strong>Forbidden</strong> - You're not authorized to view the requested source.",
        404 => "<strong>Not Found</strong> - The requested resource could not be found.",
        405 => "<strong>Method Not Allowed</strong> - A request was made of a resource using a request method not supported by that resource.",
        406 => "<strong>Not Acceptable</strong> - The requested resource is only capable of generating content not acceptable according to the Accept headers sent in the request.",
        _   => GENERIC_ERROR,
    }
}

/// Renders the error page for `status`: the `layouts/error.tpl` layout
/// when the template resolver has one, a short HTML description otherwise.
pub fn error_page(services: &Services, lang: &str, status: StatusCode) -> ResponseWriter {
    let code = status.as_u16().to_string();
    let description = services.translator.translate(lang, describe(status));

    let mut w = ResponseWriter::with_status(status);
    w.set_header(header::CONTENT_TYPE, ContentType::Html.as_str());

    let locale = (!services.config.default_language.is_empty()).then_some(lang);
    if let Some(layout) = services.templates.resolve("layouts/error.tpl", locale) {
        let title = match services.config.name.as_str() {
            "" => code.clone(),
            name => format!("{name} - {code}"),
        };
        let data = json!({
            "Title": title,
            "ErrorTitle": code,
            "ErrorMessage": description,
            "Content": " ",
        });
        let mut body = Vec::new();
        match layout.execute(&data, &mut body) {
            Ok(()) => {
                w.write(&body);
                return w;
            }
            Err(e) => error!(status = %status, error = %e, "error layout failed"),
        }
    }

    w.write(description.as_bytes());
    w
}
