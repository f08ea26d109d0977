use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::{HeaderMap, StatusCode, header};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use trellis::session::{MemorySessionStore, Session, SessionError, SessionProvider};
use trellis::template::{MemoryTemplates, TemplateError};
use trellis::{
    ActionTable, App, AppConfig, BoxFuture, Controller, Dispatcher, Filter, In, Out, Request, ResponseWriter, Server,
    Services, compress,
};

// ── Fixtures ──────────────────────────────────────────────────────────────────

const ROUTES: &str = r#"
GET     /login              Site.Login
POST    /action/:id         Site.Action("okay","(())")
GET     /users/:id          Site.Show
DELETE  /items/:id          Site.Delete
GET     /boom               Site.Panic
GET     /data               Site.Data
GET     /counter            Site.Counter
GET     /page               Site.Page
GET     /lifecycle          Site.Lifecycle
POST    /form               Site.Form
GET     /moved              Site.Moved
GET     /slow               Site.Slow
GET     /fragile            Site.Fragile
GET     /secret             Site.Login TLS
GET     /gone               404
GET     /admin              Guarded.Index
WS      /ws/chat            Chat.Echo TLS
WS      /ws/echo            Chat.Echo
"#;

#[derive(Clone, Default)]
struct Site {
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl Site {
    fn login<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move {
            self.log.lock().push("login");
            cx.string("login page")
        })
    }

    fn action<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move {
            let body = json!({ "id": cx.param("id"), "fixed": cx.fixed_params() });
            cx.json(&body)
        })
    }

    fn show<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move {
            let id = cx.param("id").unwrap_or_default().to_owned();
            tokio::task::yield_now().await;
            cx.string(id)
        })
    }

    fn delete<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move {
            let id = cx.param("id").unwrap_or_default().to_owned();
            cx.string(format!("deleted {id}"))
        })
    }

    fn panic<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move {
            if cx.param("never").is_none() {
                panic!("action blew up");
            }
            cx.continue_()
        })
    }

    fn data<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move {
            cx.set_header(header::CONTENT_TYPE, "application/vnd.api+json");
            cx.json(&json!({ "ok": true }))
        })
    }

    fn counter<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move {
            let session = cx.session().await;
            let n = session.get_i64("n").unwrap_or(0) + 1;
            session.set("n", n);
            cx.string(n.to_string())
        })
    }

    fn page<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move {
            cx.content.set("Name", "Ada");
            cx.template("site/page.tpl")
        })
    }

    fn lifecycle<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move {
            let log = Arc::clone(&self.log);
            cx.close_on_finish(move || log.lock().push("close"));
            let log = Arc::clone(&self.log);
            cx.defer(move || log.lock().push("defer"));
            self.log.lock().push("action");
            cx.string("done")
        })
    }

    fn form<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move {
            let name = cx.form_value("name").unwrap_or_default();
            cx.string(name)
        })
    }

    fn moved<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move { cx.redirect("/login") })
    }

    fn slow<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move {
            let log = Arc::clone(&self.log);
            cx.close_on_finish(move || log.lock().push("close"));
            tokio::time::sleep(Duration::from_secs(30)).await;
            self.log.lock().push("woke");
            cx.string("too late")
        })
    }

    fn fragile<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move {
            cx.session().await.set("seen", true);
            if cx.param("never").is_none() {
                panic!("action blew up after touching the session");
            }
            cx.continue_()
        })
    }
}

impl Controller for Site {
    const NAME: &'static str = "Site";

    fn actions(table: &mut ActionTable<Self>) {
        table
            .add("Login", Site::login)
            .add("Action", Site::action)
            .add("Show", Site::show)
            .add("Delete", Site::delete)
            .add("Panic", Site::panic)
            .add("Data", Site::data)
            .add("Counter", Site::counter)
            .add("Page", Site::page)
            .add("Lifecycle", Site::lifecycle)
            .add("Form", Site::form)
            .add("Moved", Site::moved)
            .add("Slow", Site::slow)
            .add("Fragile", Site::fragile);
    }

    fn page_title(&self) -> &str {
        "Welcome"
    }
}

struct Guarded;

impl Guarded {
    fn index<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move { cx.string("admin") })
    }
}

impl Controller for Guarded {
    const NAME: &'static str = "Guarded";

    fn actions(table: &mut ActionTable<Self>) {
        table.add("Index", Guarded::index);
    }

    fn pre_filter<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move {
            if cx.request().header("x-pass").is_some() {
                return cx.continue_();
            }
            cx.set_status(StatusCode::FORBIDDEN);
            cx.string("denied")
        })
    }
}

struct Chat;

impl Chat {
    fn echo<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move {
            if let Some(ws) = cx.websocket() {
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_close() || ws.send(msg).await.is_err() {
                        break;
                    }
                }
            }
            cx.continue_()
        })
    }
}

impl Controller for Chat {
    const NAME: &'static str = "Chat";

    fn actions(table: &mut ActionTable<Self>) {
        table.add("Echo", Chat::echo);
    }
}

fn block_marked(cx: &mut In) -> BoxFuture<'_, ControlFlow<()>> {
    Box::pin(async move {
        if cx.request().header("x-block").is_none() {
            return ControlFlow::Continue(());
        }
        cx.set_status(StatusCode::UNAUTHORIZED);
        ControlFlow::Break(())
    })
}

fn templates() -> MemoryTemplates {
    MemoryTemplates::new()
        .insert("site/page.tpl", |data: &Value, out: &mut Vec<u8>| -> Result<(), TemplateError> {
            out.extend_from_slice(format!("<p>{}</p>", data["Name"].as_str().unwrap_or_default()).as_bytes());
            Ok(())
        })
        .insert("layouts/default.tpl", |data: &Value, out: &mut Vec<u8>| -> Result<(), TemplateError> {
            let title = data["Title"].as_str().unwrap_or_default();
            let content = data["Content"].as_str().unwrap_or_default();
            out.extend_from_slice(format!("<html><title>{title}</title>{content}</html>").as_bytes());
            Ok(())
        })
}

/// Registers a defer and a closer on every request, before any other
/// filter can stop it.
struct Trace(Arc<Mutex<Vec<&'static str>>>);

impl Filter for Trace {
    fn apply<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, ControlFlow<()>> {
        Box::pin(async move {
            let log = Arc::clone(&self.0);
            cx.defer(move || log.lock().push("defer"));
            let log = Arc::clone(&self.0);
            cx.close_on_finish(move || log.lock().push("close"));
            ControlFlow::Continue(())
        })
    }
}

/// A store whose writes take a while, like a remote backend.
struct SlowSessions(MemorySessionStore);

const SLOW_WRITE: Duration = Duration::from_millis(300);

impl SessionProvider for SlowSessions {
    fn get<'a>(&'a self, sid: &'a str) -> BoxFuture<'a, Result<Session, SessionError>> {
        self.0.get(sid)
    }

    fn create<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, Result<(), SessionError>> {
        Box::pin(async move {
            tokio::time::sleep(SLOW_WRITE).await;
            self.0.create(session).await
        })
    }

    fn put<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, Result<(), SessionError>> {
        Box::pin(async move {
            tokio::time::sleep(SLOW_WRITE).await;
            self.0.put(session).await
        })
    }

    fn remove<'a>(&'a self, sid: &'a str) -> BoxFuture<'a, Result<(), SessionError>> {
        self.0.remove(sid)
    }

    fn cleanup(&self, older_than: SystemTime) -> BoxFuture<'_, Result<usize, SessionError>> {
        self.0.cleanup(older_than)
    }
}

fn base(config: AppConfig, site: Site) -> App {
    App::new(config)
        .controller(site)
        .controller(Guarded)
        .controller(Chat)
        .templates(templates())
        .routes("inline", ROUTES)
}

fn app(site: Site) -> App {
    base(AppConfig::default(), site).filter(block_marked)
}

fn dispatcher() -> Dispatcher {
    app(Site::default()).build().unwrap()
}

fn get(uri: &str) -> http::request::Builder {
    http::Request::builder().method("GET").uri(uri).header("host", "example.com")
}

async fn send(d: &Dispatcher, req: http::request::Builder) -> (StatusCode, HeaderMap, String) {
    send_body(d, req, Bytes::new()).await
}

async fn send_body(d: &Dispatcher, req: http::request::Builder, body: Bytes) -> (StatusCode, HeaderMap, String) {
    let (status, headers, bytes) = send_raw(d, req, body).await;
    (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn send_raw(d: &Dispatcher, req: http::request::Builder, body: Bytes) -> (StatusCode, HeaderMap, Bytes) {
    let resp = d.dispatch(Request::new(req.body(body).unwrap())).await;
    let (parts, body) = resp.into_parts();
    (parts.status, parts.headers, body.collect().await.unwrap().to_bytes())
}

// ── Routing ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn routes_to_named_action() {
    let d = dispatcher();
    let (status, headers, body) = send(&d, get("/login")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "login page");
    assert_eq!(headers[header::CONTENT_TYPE], "text/plain; charset=utf-8");
}

#[tokio::test]
async fn passes_fixed_arguments_and_params() {
    let d = dispatcher();
    let req = http::Request::builder().method("POST").uri("/action/42");
    let (status, headers, body) = send(&d, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/json; charset=utf-8");
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body, json!({ "id": "42", "fixed": ["okay", "(())"] }));
}

#[tokio::test]
async fn head_falls_back_to_get() {
    let d = dispatcher();
    let (status, _, _) = send(&d, get("/login").method("HEAD")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn unmatched_request_goes_to_fallback() {
    let d = dispatcher();
    let (status, _, body) = send(&d, get("/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.contains("Not Found"));

    let d = app(Site::default())
        .fallback(|req: Request, _services: Arc<Services>| -> BoxFuture<'static, ResponseWriter> {
            Box::pin(async move {
                let mut w = ResponseWriter::new();
                w.write(format!("static {}", req.path()).as_bytes());
                w
            })
        })
        .build()
        .unwrap();
    let (status, _, body) = send(&d, get("/css/site.css")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "static /css/site.css");
}

#[tokio::test]
async fn explicit_not_found_route() {
    let d = dispatcher();
    let (status, _, _) = send(&d, get("/gone")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn method_override_reroutes_post() {
    let d = dispatcher();
    let req = http::Request::builder()
        .method("POST")
        .uri("/items/7")
        .header("x-http-method-override", "DELETE");
    let (status, _, body) = send(&d, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "deleted 7");
}

#[tokio::test]
async fn concurrent_requests_keep_their_own_params() {
    let d = dispatcher();
    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..64 {
        let d = d.clone();
        tasks.spawn(async move {
            let (_, _, body) = send(&d, get(&format!("/users/{i}"))).await;
            (i, body)
        });
    }
    while let Some(res) = tasks.join_next().await {
        let (i, body) = res.unwrap();
        assert_eq!(body, i.to_string());
    }
    assert_eq!(d.monitor().active_requests(), 0);
}

#[tokio::test]
async fn reads_form_body_before_query() {
    let d = dispatcher();
    let req = http::Request::builder()
        .method("POST")
        .uri("/form?name=query")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    let (_, _, body) = send_body(&d, req, Bytes::from_static(b"name=Ada+Lovelace")).await;
    assert_eq!(body, "Ada Lovelace");

    let req = http::Request::builder().method("POST").uri("/form?name=query");
    let (_, _, body) = send_body(&d, req, Bytes::from_static(b"name=ignored")).await;
    assert_eq!(body, "query");
}

// ── TLS ───────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn tls_route_redirects_plain_requests() {
    let d = dispatcher();
    let (status, headers, _) = send(&d, get("/secret?x=1&y=2")).await;
    assert_eq!(status, StatusCode::MOVED_PERMANENTLY);
    assert_eq!(headers[header::LOCATION], "https://example.com/secret?x=1&y=2");

    let (status, _, body) = send(&d, get("/secret").header("x-forwarded-proto", "https")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "login page");
}

#[tokio::test]
async fn tls_redirect_uses_configured_port() {
    let config = AppConfig { host_addr_tls: ":8443".into(), ..AppConfig::default() };
    let d = App::new(config)
        .controller(Site::default())
        .routes("inline", "GET /secret Site.Login TLS")
        .build()
        .unwrap();
    let req = http::Request::builder().uri("/secret").header("host", "example.com:8080");
    let (status, headers, _) = send(&d, req).await;
    assert_eq!(status, StatusCode::MOVED_PERMANENTLY);
    assert_eq!(headers[header::LOCATION], "https://example.com:8443/secret");
}

#[tokio::test]
async fn websocket_route_redirects_to_wss() {
    let d = dispatcher();
    let (status, headers, _) = send(&d, get("/ws/chat")).await;
    assert_eq!(status, StatusCode::MOVED_PERMANENTLY);
    assert_eq!(headers[header::LOCATION], "wss://example.com/ws/chat");

    // Secure, but not a handshake.
    let (status, _, _) = send(&d, get("/ws/chat").header("x-forwarded-proto", "https")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upgrade_with_non_get_method_is_rejected() {
    let d = dispatcher();
    let req = get("/ws/echo")
        .method("POST")
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
        .header(header::SEC_WEBSOCKET_VERSION, "13");
    let (status, headers, _) = send(&d, req).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert!(headers.get(header::SEC_WEBSOCKET_ACCEPT).is_none());
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn filter_break_skips_action() {
    let site = Site::default();
    let d = app(site.clone()).build().unwrap();
    let (status, _, body) = send(&d, get("/login").header("x-block", "1")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.is_empty());
    assert!(site.log.lock().is_empty());
}

#[tokio::test]
async fn cleanup_runs_when_a_filter_breaks() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let site = Site::default();
    let d = base(AppConfig::default(), site.clone())
        .filter(Trace(Arc::clone(&log)))
        .filter(block_marked)
        .build()
        .unwrap();

    let (status, _, _) = send(&d, get("/login").header("x-block", "1")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(site.log.lock().is_empty());
    assert_eq!(*log.lock(), ["defer", "close"]);
}

#[tokio::test]
async fn cleanup_runs_when_an_action_panics() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let d = base(AppConfig::default(), Site::default())
        .filter(Trace(Arc::clone(&log)))
        .build()
        .unwrap();

    let (status, _, _) = send(&d, get("/boom")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(*log.lock(), ["defer", "close"]);
}

#[tokio::test]
async fn error_page_keeps_session_cookie() {
    let d = dispatcher();
    let (status, headers, _) = send(&d, get("/fragile")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let cookie = headers[header::SET_COOKIE].to_str().unwrap();
    assert!(cookie.starts_with("trellis_sessid="), "{cookie}");
}

#[tokio::test]
async fn cancelled_request_is_not_rendered() {
    let site = Site::default();
    let d = app(site.clone()).build().unwrap();

    let pending = tokio::spawn({
        let d = d.clone();
        async move { send(&d, get("/slow")).await }
    });

    let id = loop {
        if let Some(open) = d.monitor().slow_requests(Duration::ZERO).into_iter().find(|r| r.path == "/slow") {
            break open.id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert!(d.monitor().cancel(&id));

    let (status, headers, body) = tokio::time::timeout(Duration::from_secs(5), pending).await.unwrap().unwrap();
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    assert!(headers.get(header::CONTENT_TYPE).is_none());
    assert_eq!(*site.log.lock(), ["close"]);
    assert_eq!(d.monitor().active_requests(), 0);
}

#[tokio::test]
async fn redirect_has_no_body_type() {
    let d = dispatcher();
    let (status, headers, body) = send(&d, get("/moved")).await;
    assert_eq!(status, StatusCode::FOUND);
    assert_eq!(headers[header::LOCATION], "/login");
    assert!(headers.get(header::CONTENT_TYPE).is_none());
    assert!(body.is_empty());
}

#[tokio::test]
async fn compresses_when_enabled_and_accepted() {
    let config = AppConfig { gzip_dynamic: true, ..AppConfig::default() };
    let d = base(config, Site::default()).filter(compress).build().unwrap();

    let req = get("/login").header(header::ACCEPT_ENCODING, "gzip, deflate");
    let (status, headers, body) = send_raw(&d, req, Bytes::new()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_ENCODING], "gzip");
    assert_eq!(headers[header::CONTENT_TYPE], "text/plain; charset=utf-8");
    let mut text = String::new();
    std::io::Read::read_to_string(&mut flate2::read::GzDecoder::new(&body[..]), &mut text).unwrap();
    assert_eq!(text, "login page");

    // Not accepted by the client.
    let (_, headers, body) = send(&d, get("/login")).await;
    assert!(headers.get(header::CONTENT_ENCODING).is_none());
    assert_eq!(body, "login page");

    // Accepted, but disabled in the configuration.
    let d = base(AppConfig::default(), Site::default()).filter(compress).build().unwrap();
    let (_, headers, _) = send(&d, get("/login").header(header::ACCEPT_ENCODING, "gzip")).await;
    assert!(headers.get(header::CONTENT_ENCODING).is_none());
}

#[tokio::test]
async fn pre_filter_short_circuits() {
    let d = dispatcher();
    let (status, _, body) = send(&d, get("/admin")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, "denied");

    let (status, _, body) = send(&d, get("/admin").header("x-pass", "1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "admin");
}

#[tokio::test]
async fn defers_run_before_closers() {
    let site = Site::default();
    let d = app(site.clone()).build().unwrap();
    let (_, _, body) = send(&d, get("/lifecycle")).await;
    assert_eq!(body, "done");
    assert_eq!(*site.log.lock(), ["action", "defer", "close"]);
}

#[tokio::test]
async fn panicking_action_becomes_500() {
    let d = dispatcher();
    let (status, _, _) = send(&d, get("/boom")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(d.monitor().active_requests(), 0);
}

#[tokio::test]
async fn explicit_content_type_survives_json() {
    let d = dispatcher();
    let (_, headers, body) = send(&d, get("/data")).await;
    assert_eq!(headers[header::CONTENT_TYPE], "application/vnd.api+json");
    assert_eq!(body, r#"{"ok":true}"#);
}

// ── Sessions and templates ────────────────────────────────────────────────────

#[tokio::test]
async fn session_persists_between_requests() {
    let d = dispatcher();
    let (_, headers, body) = send(&d, get("/counter")).await;
    assert_eq!(body, "1");

    let cookie = headers[header::SET_COOKIE].to_str().unwrap();
    assert!(cookie.contains("HttpOnly"));
    let pair = cookie.split(';').next().unwrap().to_owned();
    assert!(pair.starts_with("trellis_sessid="));

    let (_, headers, body) = send(&d, get("/counter").header(header::COOKIE, pair.as_str())).await;
    assert_eq!(body, "2");
    assert!(headers.get(header::SET_COOKIE).is_none());
}

#[tokio::test]
async fn slow_session_store_does_not_stall_other_requests() {
    let d = app(Site::default())
        .sessions(Arc::new(SlowSessions(MemorySessionStore::new())))
        .build()
        .unwrap();

    let counter = tokio::spawn({
        let d = d.clone();
        async move { send(&d, get("/counter")).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    let (_, _, body) = send(&d, get("/login")).await;
    assert_eq!(body, "login page");
    assert!(started.elapsed() < SLOW_WRITE, "waited {:?}", started.elapsed());

    let (_, _, body) = counter.await.unwrap();
    assert_eq!(body, "1");
}

#[tokio::test]
async fn renders_template_inside_layout() {
    let d = dispatcher();
    let (status, headers, body) = send(&d, get("/page")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "text/html; charset=utf-8");
    assert_eq!(body, "<html><title>Welcome</title><p>Ada</p></html>");
}

#[tokio::test]
async fn error_layout_is_used_when_present() {
    let templates = templates().insert("layouts/error.tpl", |data: &Value, out: &mut Vec<u8>| -> Result<(), TemplateError> {
        out.extend_from_slice(format!("{} | {}", data["Title"], data["ErrorTitle"]).as_bytes());
        Ok(())
    });
    let config = AppConfig { name: "Shop".into(), ..AppConfig::default() };
    let d = App::new(config)
        .controller(Site::default())
        .templates(templates)
        .routes("inline", "GET /login Site.Login")
        .build()
        .unwrap();

    let (status, _, body) = send(&d, get("/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, r#""Shop - 404" | "404""#);
}

#[tokio::test]
async fn unknown_action_in_routes_fails_build() {
    let err = App::new(AppConfig::default())
        .controller(Site::default())
        .routes("inline", "GET /x Site.Nope")
        .build();
    assert!(err.is_err());
}

// ── Over the wire ─────────────────────────────────────────────────────────────

async fn start() -> (std::net::SocketAddr, tokio::sync::oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let server = Server::from_listener(listener).with_shutdown(async {
        let _ = rx.await;
    });
    let d = dispatcher();
    let handle = tokio::spawn(async move { server.serve(d).await.unwrap() });
    (addr, tx, handle)
}

#[tokio::test]
async fn serves_http_over_tcp() {
    let (addr, shutdown, handle) = start().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /login HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();
    assert!(raw.starts_with("HTTP/1.1 200 OK"));
    assert!(raw.ends_with("login page"));

    shutdown.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn echoes_over_websocket() {
    let (addr, shutdown, handle) = start().await;

    let (mut ws, resp) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/echo")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);

    ws.send(Message::text("hello")).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply.to_text().unwrap(), "hello");
    ws.close(None).await.unwrap();

    shutdown.send(()).unwrap();
    handle.await.unwrap();
}
