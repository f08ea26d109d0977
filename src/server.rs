//! HTTP(S) server and graceful shutdown.
//!
//! # Graceful shutdown
//!
//! On **SIGTERM** or Ctrl-C the server:
//! 1. Immediately stops `listener.accept()`; no new connections are made.
//! 2. Lets every in-flight connection task run to completion.
//! 3. Returns from [`Server::serve`], which lets `main` exit cleanly.
//!
//! Upgraded WebSocket connections run on their own tasks and are not part
//! of the drain.
//!
//! # Background tasks
//!
//! While serving, the server also runs the slow-request reaper (when
//! `slow_request_timeout_secs` is set) and the idle-session sweep (every 15
//! minutes by default). Both stop when the server returns.

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::monitor::reap_slow_requests;
use crate::request::Request;
use crate::response::{ResponseBody, ResponseWriter};
use crate::session::maintain_sessions;
use crate::tls::load_server_config;

type Shutdown = Pin<Box<dyn Future<Output = ()> + Send>>;

enum Listen {
    Addr(SocketAddr),
    Listener(TcpListener),
}

/// The HTTP server.
pub struct Server {
    listen: Listen,
    shutdown: Option<Shutdown>,
    background: bool,
}

impl Server {
    /// Configures the server to bind to `addr`. A bare `:port` binds every
    /// interface.
    ///
    /// ```rust,no_run
    /// use trellis::Server;
    /// let server = Server::bind("0.0.0.0:3000").unwrap();
    /// ```
    pub fn bind(addr: &str) -> Result<Self, Error> {
        let normalized = match addr.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => addr.to_owned(),
        };
        let addr: SocketAddr = normalized.parse().map_err(|_| Error::Address(addr.to_owned()))?;
        Ok(Self { listen: Listen::Addr(addr), shutdown: None, background: true })
    }

    /// Serves on an already bound listener.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self { listen: Listen::Listener(listener), shutdown: None, background: true }
    }

    /// Skips the reaper and session sweep, e.g. for a second listener
    /// sharing a dispatcher whose tasks already run elsewhere.
    pub fn without_background_tasks(mut self) -> Self {
        self.background = false;
        self
    }

    /// Replaces the SIGTERM / Ctrl-C trigger with `signal`.
    pub fn with_shutdown(mut self, signal: impl Future<Output = ()> + Send + 'static) -> Self {
        self.shutdown = Some(Box::pin(signal));
        self
    }

    /// Serves plain HTTP. Returns after a full graceful shutdown.
    pub async fn serve(self, dispatcher: Dispatcher) -> Result<(), Error> {
        self.run(dispatcher, None).await
    }

    /// Serves HTTPS with the PEM certificate chain and key at the given
    /// paths. Fails before accepting anything if the material is missing.
    pub async fn serve_tls(self, dispatcher: Dispatcher, cert: impl AsRef<Path>, key: impl AsRef<Path>) -> Result<(), Error> {
        let config = load_server_config(cert.as_ref(), key.as_ref())?;
        self.run(dispatcher, Some(TlsAcceptor::from(config))).await
    }

    async fn run(self, dispatcher: Dispatcher, tls: Option<TlsAcceptor>) -> Result<(), Error> {
        let listener = match self.listen {
            Listen::Addr(addr) => TcpListener::bind(addr).await?,
            Listen::Listener(listener) => listener,
        };
        let local = listener.local_addr()?;
        let scheme = if tls.is_some() { "https" } else { "http" };
        info!(addr = %local, scheme, "trellis listening");

        let background = if self.background { spawn_background_tasks(&dispatcher) } else { Vec::new() };

        // JoinSet tracks every spawned connection task so they can all be
        // awaited during graceful shutdown.
        let mut tasks = tokio::task::JoinSet::new();

        // Tests and embedders may supply their own trigger; a standalone
        // server waits for SIGTERM or Ctrl-C.
        let shutdown = self.shutdown.unwrap_or_else(|| Box::pin(shutdown_signal()));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Checked top to bottom, so a pending shutdown wins over
                // queued connections.
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let dispatcher = dispatcher.clone();
                    let tls = tls.clone();
                    tasks.spawn(async move {
                        // The TLS handshake runs on the connection task so a
                        // slow client never stalls the accept loop.
                        match tls {
                            None => serve_connection(stream, remote_addr, false, dispatcher).await,
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => serve_connection(stream, remote_addr, true, dispatcher).await,
                                Err(e) => debug!(peer = %remote_addr, "tls handshake failed: {e}"),
                            },
                        }
                    });
                }

                // Reap finished connection tasks so the set stays bounded on
                // long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        // Drain: wait for every in-flight connection before returning.
        while tasks.join_next().await.is_some() {}
        for task in background {
            task.abort();
        }

        info!(addr = %local, "trellis stopped");
        Ok(())
    }
}

/// Serves the listeners named in the configuration: `host_addr` always and
/// `host_addr_tls` when set. Returns when both have shut down, or on the
/// first error.
pub async fn run(dispatcher: Dispatcher) -> Result<(), Error> {
    let config = dispatcher.services().config.clone();
    let plain = Server::bind(&config.host_addr)?.serve(dispatcher.clone());
    if config.host_addr_tls.is_empty() {
        return plain.await;
    }
    let secure = Server::bind(&config.host_addr_tls)?.without_background_tasks().serve_tls(
        dispatcher,
        &config.tls_certificate_path,
        &config.tls_key_path,
    );
    tokio::try_join!(plain, secure).map(|_| ())
}

/// Starts the reaper and the session sweep the configuration asks for.
fn spawn_background_tasks(dispatcher: &Dispatcher) -> Vec<tokio::task::JoinHandle<()>> {
    let config = &dispatcher.services().config;
    let mut tasks = Vec::new();
    if let Some(limit) = config.slow_request_timeout() {
        tasks.push(tokio::spawn(reap_slow_requests(Arc::clone(dispatcher.monitor()), limit)));
    }
    if let Some((every, max_age)) = config.session_maintenance() {
        let sessions = Arc::clone(&dispatcher.services().sessions);
        tasks.push(tokio::spawn(maintain_sessions(sessions, every, max_age)));
    }
    tasks
}

async fn serve_connection<S>(stream: S, remote_addr: SocketAddr, tls: bool, dispatcher: Dispatcher)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    // Called once per request on the connection, not once per connection.
    let svc = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
        let dispatcher = dispatcher.clone();
        async move { Ok::<_, std::convert::Infallible>(handle(dispatcher, req, remote_addr, tls).await) }
    });

    // The auto builder speaks HTTP/1.1 or HTTP/2, whichever the client
    // negotiates; upgrades stay enabled so WebSocket handshakes complete.
    if let Err(e) = ConnBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(stream), svc)
        .await
    {
        error!(peer = %remote_addr, "connection error: {e}");
    }
}

/// Collects the body and hands the request to the dispatcher.
async fn handle(
    dispatcher: Dispatcher,
    req: hyper::Request<hyper::body::Incoming>,
    remote_addr: SocketAddr,
    tls: bool,
) -> http::Response<ResponseBody> {
    let (parts, body) = req.into_parts();
    let body: Bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(peer = %remote_addr, "failed to read request body: {e}");
            return ResponseWriter::with_status(http::StatusCode::BAD_REQUEST).into_response();
        }
    };
    let req = Request::new(http::Request::from_parts(parts, body)).with_connection(remote_addr, tls);
    dispatcher.dispatch(req).await
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first SIGTERM or Ctrl-C. If a handler cannot be
/// installed, that trigger is logged and disabled.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
