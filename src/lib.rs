//! # trellis
//!
//! Route-file driven controller dispatch for hyper services.
//!
//! ## The contract
//!
//! Routes live in plain text files, one per line:
//!
//! ```text
//! GET     /login              App.Login
//! POST    /action/:id         Home.Action("okay","(())")
//! WS      /ws/chat            Chat.WSChat TLS        # TLS only
//! GET     /static/*filepath   Static.Serve
//! *       /ping               Health.Ping
//! ```
//!
//! At startup every line is parsed, every named action is checked against
//! the registered controllers, and the whole table is compiled into one
//! segment tree. A typo in a route file stops the server from starting; it
//! never surfaces as a 500 on first use.
//!
//! Per request the dispatcher:
//!
//! - matches method and path (literal beats `:param` beats `*wildcard`;
//!   HEAD falls back to GET),
//! - redirects TLS-only routes to `https` / `wss`,
//! - upgrades WebSocket handshakes before the action runs,
//! - runs the global filters, the controller's pre-filter and the action,
//! - renders the action's [`Out`] exactly once, unless the client is gone,
//! - runs cleanup callbacks and saves the session, whatever happened before.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use trellis::{ActionTable, App, AppConfig, BoxFuture, Controller, In, Out, Server};
//!
//! struct Users;
//!
//! impl Users {
//!     fn show<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
//!         Box::pin(async move {
//!             let id = cx.param("id").unwrap_or("unknown").to_owned();
//!             cx.json(&serde_json::json!({ "id": id }))
//!         })
//!     }
//! }
//!
//! impl Controller for Users {
//!     const NAME: &'static str = "Users";
//!
//!     fn actions(table: &mut ActionTable<Self>) {
//!         table.add("Show", Users::show);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), trellis::Error> {
//!     let dispatcher = App::new(AppConfig::default())
//!         .controller(Users)
//!         .routes("inline", "GET /users/:id Users.Show")
//!         .build()?;
//!
//!     Server::bind("0.0.0.0:3000")?.serve(dispatcher).await
//! }
//! ```

mod action;
mod app;
mod config;
mod context;
mod dispatch;
mod error;
mod method;
mod monitor;
mod output;
mod request;
mod response;
mod server;
mod tls;
mod websocket;

pub mod filter;
pub mod i18n;
pub mod routing;
pub mod session;
pub mod template;

pub use action::{ActionFn, ActionHandle, ActionTable, BoxFuture, Controller, DEFAULT_ACTION, Registry};
pub use app::{App, Fallback, NotFound, Services};
pub use config::AppConfig;
pub use context::{Content, In};
pub use dispatch::{Dispatcher, error_page};
pub use error::{Error, RenderError, ReverseError, RouteError};
pub use filter::{Filter, access_log, compress};
pub use method::RouteMethod;
pub use monitor::{CancelSignal, Monitor, RequestInfo};
pub use output::{Out, sniff_content_type};
pub use request::Request;
pub use response::{ContentType, ResponseBody, ResponseWriter};
pub use server::{Server, run};
pub use tls::{arrived_securely, load_server_config, secure_url};
pub use websocket::WebSocket;
