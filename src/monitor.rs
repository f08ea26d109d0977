//! In-flight request bookkeeping and cancellation.
//!
//! Every dispatched request is registered with the [`Monitor`] for its
//! whole lifetime. The monitor exposes live counts, lets an operator cancel
//! a request by id and, when a slow-request timeout is configured, a reaper
//! task cancels requests that have been running too long.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

// ── CancelSignal ──────────────────────────────────────────────────────────────

/// A one-shot flag shared by a request and everything that may abort it.
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<SignalInner>);

#[derive(Default)]
struct SignalInner {
    fired: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self { Self::default() }

    /// Fires the signal. Later calls are no-ops.
    pub fn cancel(&self) {
        if !self.0.fired.swap(true, Ordering::SeqCst) {
            self.0.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.fired.load(Ordering::SeqCst)
    }

    /// Resolves once the signal fires.
    pub async fn cancelled(&self) {
        let notified = self.0.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CancelSignal").field(&self.is_cancelled()).finish()
    }
}

// ── Monitor ───────────────────────────────────────────────────────────────────

/// Snapshot of one open request.
#[derive(Clone, Debug)]
pub struct RequestInfo {
    pub id: String,
    pub path: String,
    pub started: Instant,
}

struct Entry {
    info: RequestInfo,
    cancel: CancelSignal,
}

#[derive(Default)]
struct Open {
    paths: HashMap<String, usize>,
    entries: HashMap<String, Entry>,
}

#[derive(Default)]
pub struct Monitor {
    active: AtomicUsize,
    open: Mutex<Open>,
}

impl Monitor {
    pub fn new() -> Self { Self::default() }

    pub fn active_requests(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Open requests per path.
    pub fn active_paths(&self) -> HashMap<String, usize> {
        self.open.lock().paths.clone()
    }

    /// Requests that have been running for longer than `limit`.
    pub fn slow_requests(&self, limit: Duration) -> Vec<RequestInfo> {
        self.open
            .lock()
            .entries
            .values()
            .filter(|e| e.info.started.elapsed() > limit)
            .map(|e| e.info.clone())
            .collect()
    }

    /// Fires the cancel signal of an open request. Returns false for
    /// unknown ids.
    pub fn cancel(&self, id: &str) -> bool {
        match self.open.lock().entries.get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Registers a request until the returned guard is dropped.
    pub(crate) fn track(self: &Arc<Self>, path: &str, cancel: CancelSignal) -> Tracked {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let info = RequestInfo { id: id.clone(), path: path.to_owned(), started: Instant::now() };

        self.active.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock();
        *open.paths.entry(path.to_owned()).or_default() += 1;
        open.entries.insert(id.clone(), Entry { info, cancel: cancel.clone() });
        drop(open);

        Tracked { monitor: Arc::clone(self), id, path: path.to_owned(), cancel, finished: false }
    }

    fn untrack(&self, id: &str, path: &str) {
        let mut open = self.open.lock();
        open.entries.remove(id);
        if let Some(count) = open.paths.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                open.paths.remove(path);
            }
        }
        drop(open);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Cancels every request running longer than `limit`, checking once a
/// minute. Runs until the task is aborted.
pub(crate) async fn reap_slow_requests(monitor: Arc<Monitor>, limit: Duration) {
    let mut tick = tokio::time::interval(Duration::from_secs(60));
    tick.tick().await;
    loop {
        tick.tick().await;
        for slow in monitor.slow_requests(limit) {
            info!(id = %slow.id, path = %slow.path, elapsed = ?slow.started.elapsed(), "cancelling slow request");
            monitor.cancel(&slow.id);
        }
    }
}

// ── Tracked ───────────────────────────────────────────────────────────────────

/// Keeps a request registered. Dropping it before [`Tracked::finish`]
/// means the response future was abandoned, which hyper does when the
/// client goes away, so the request's cancel signal fires.
pub(crate) struct Tracked {
    monitor: Arc<Monitor>,
    id: String,
    path: String,
    cancel: CancelSignal,
    finished: bool,
}

impl Tracked {
    pub(crate) fn id(&self) -> &str { &self.id }

    pub(crate) fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        if !self.finished {
            debug!(id = %self.id, path = %self.path, "request abandoned");
            self.cancel.cancel();
        }
        self.monitor.untrack(&self.id, &self.path);
    }
}
