//! Minimal trellis example: route-file dispatch, JSON actions and sessions.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/users/42
//!   curl -X POST http://localhost:3000/users \
//!        -H 'content-type: application/json' \
//!        -d '{"name":"alice"}'
//!   curl -c jar -b jar http://localhost:3000/visits
//!   curl http://localhost:3000/ping

use serde::Deserialize;
use trellis::{ActionTable, App, AppConfig, BoxFuture, Controller, In, Out, Server, access_log};

const ROUTES: &str = r#"
GET     /users/:id      Users.Show
POST    /users          Users.Create
DELETE  /users/:id      Users.Delete
GET     /visits         Users.Visits
*       /ping           Users.Ping
GET     /favicon.ico    404
"#;

#[derive(Deserialize)]
struct CreateUser {
    name: String,
}

struct Users;

impl Users {
    // GET /users/:id
    fn show<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move {
            let id = cx.param("id").unwrap_or("unknown").to_owned();
            cx.json(&serde_json::json!({ "id": id, "name": "alice" }))
        })
    }

    // POST /users
    fn create<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move {
            let Ok(input) = cx.body_json::<CreateUser>() else {
                cx.set_status(http::StatusCode::BAD_REQUEST);
                return cx.string("expected {\"name\": ...}");
            };
            cx.set_status(http::StatusCode::CREATED);
            cx.set_header(http::header::LOCATION, "/users/99");
            cx.json(&serde_json::json!({ "id": "99", "name": input.name }))
        })
    }

    // DELETE /users/:id → 204 No Content
    fn delete<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move {
            cx.set_status(http::StatusCode::NO_CONTENT);
            cx.bytes(bytes::Bytes::new())
        })
    }

    fn visits<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move {
            let session = cx.session().await;
            let n = session.get_i64("visits").unwrap_or(0) + 1;
            session.set("visits", n);
            cx.string(format!("visit #{n}"))
        })
    }

    // Any method; the method is captured as METHOD.
    fn ping<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(async move {
            let method = cx.param("METHOD").unwrap_or_default().to_owned();
            cx.string(format!("pong ({method})"))
        })
    }
}

impl Controller for Users {
    const NAME: &'static str = "Users";

    fn actions(table: &mut ActionTable<Self>) {
        table
            .add("Show", Users::show)
            .add("Create", Users::create)
            .add("Delete", Users::delete)
            .add("Visits", Users::visits)
            .add("Ping", Users::ping);
    }
}

#[tokio::main]
async fn main() -> Result<(), trellis::Error> {
    tracing_subscriber::fmt::init();

    let config = AppConfig { dynamic_access_log: true, ..AppConfig::default() };
    let dispatcher = App::new(config)
        .controller(Users)
        .filter(access_log)
        .routes("demo", ROUTES)
        .build()?;

    Server::bind("0.0.0.0:3000")?.serve(dispatcher).await
}
