//! Cookie-backed sessions.
//!
//! A session is loaded lazily the first time a handler asks for it. Its id
//! travels in the `trellis_sessid` cookie and is always 32 lowercase hex
//! characters; anything else is treated as no session. Sessions touched
//! during a request are written back to the provider in cleanup, after
//! flash values have been cleared.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::future;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::action::BoxFuture;

/// Name of the session-id cookie.
pub const SESSION_COOKIE: &str = "trellis_sessid";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session `{0}` not found")]
    NotFound(String),

    #[error("session backend: {0}")]
    Backend(String),
}

/// Per-user state carried between requests.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub sid: String,
    pub data: Map<String, Value>,
    /// Values visible for the current request only.
    #[serde(skip)]
    pub flash: Map<String, Value>,
    pub created: SystemTime,
    pub updated: SystemTime,
}

impl Session {
    /// A fresh session with a new random id.
    pub fn new() -> Self {
        let now = SystemTime::now();
        Self { sid: new_sid(), data: Map::new(), flash: Map::new(), created: now, updated: now }
    }

    pub fn get(&self, key: &str) -> Option<&Value> { self.data.get(key) }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.data.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(Value::as_i64)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> { self.data.remove(key) }

    /// Sets a value exposed to templates as `Flash` for this request.
    pub fn flash(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.flash.insert(key.into(), value.into());
    }
}

impl Default for Session {
    fn default() -> Self { Self::new() }
}

pub fn new_sid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Whether `sid` has the shape of an id we issued.
pub fn valid_sid(sid: &str) -> bool {
    sid.len() == 32 && sid.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Storage behind sessions. Every call is awaited on the request's task,
/// so backends doing network or disk I/O must not block the thread.
pub trait SessionProvider: Send + Sync {
    fn get<'a>(&'a self, sid: &'a str) -> BoxFuture<'a, Result<Session, SessionError>>;

    /// Stores a session that was just created.
    fn create<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, Result<(), SessionError>>;

    /// Writes back a session modified during a request.
    fn put<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, Result<(), SessionError>>;

    fn remove<'a>(&'a self, sid: &'a str) -> BoxFuture<'a, Result<(), SessionError>>;

    /// Drops sessions not updated since `older_than`; returns how many.
    fn cleanup(&self, older_than: SystemTime) -> BoxFuture<'_, Result<usize, SessionError>>;
}

/// Process-local session storage.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.sessions.lock().len() }

    pub fn is_empty(&self) -> bool { self.sessions.lock().is_empty() }

    /// Synchronous form of [`SessionProvider::cleanup`].
    pub fn remove_stale(&self, older_than: SystemTime) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.updated >= older_than);
        before - sessions.len()
    }
}

// Each operation takes the lock once and finishes before the future is
// returned; the guard never lives across an await.
impl SessionProvider for MemorySessionStore {
    fn get<'a>(&'a self, sid: &'a str) -> BoxFuture<'a, Result<Session, SessionError>> {
        let found = self
            .sessions
            .lock()
            .get(sid)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(sid.to_owned()));
        Box::pin(future::ready(found))
    }

    fn create<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, Result<(), SessionError>> {
        self.sessions.lock().insert(session.sid.clone(), session.clone());
        Box::pin(future::ready(Ok(())))
    }

    fn put<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, Result<(), SessionError>> {
        let mut stored = session.clone();
        stored.updated = SystemTime::now();
        stored.flash.clear();
        self.sessions.lock().insert(stored.sid.clone(), stored);
        Box::pin(future::ready(Ok(())))
    }

    fn remove<'a>(&'a self, sid: &'a str) -> BoxFuture<'a, Result<(), SessionError>> {
        self.sessions.lock().remove(sid);
        Box::pin(future::ready(Ok(())))
    }

    fn cleanup(&self, older_than: SystemTime) -> BoxFuture<'_, Result<usize, SessionError>> {
        Box::pin(future::ready(Ok(self.remove_stale(older_than))))
    }
}

/// Expires sessions idle for longer than `max_age`, every `every`. The
/// first pass runs one period after start.
pub(crate) async fn maintain_sessions(sessions: Arc<dyn SessionProvider>, every: Duration, max_age: Duration) {
    let mut tick = tokio::time::interval(every);
    tick.tick().await;
    loop {
        tick.tick().await;
        let Some(cutoff) = SystemTime::now().checked_sub(max_age) else { continue };
        match sessions.cleanup(cutoff).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "expired idle sessions"),
            Err(e) => warn!(error = %e, "session cleanup failed"),
        }
    }
}
