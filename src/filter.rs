//! Global filters.
//!
//! Filters run for every routed request, in registration order, before the
//! controller's pre-filter. A filter that returns [`ControlFlow::Break`]
//! stops the request; whatever it wrote to the response is sent as is.
//!
//! Two filters ship with the crate: [`access_log`] and [`compress`].
//!
//! ```rust,no_run
//! use std::ops::ControlFlow;
//! use http::StatusCode;
//! use trellis::{BoxFuture, In};
//!
//! fn require_token(cx: &mut In) -> BoxFuture<'_, ControlFlow<()>> {
//!     Box::pin(async move {
//!         if cx.request().header("x-token").is_some() {
//!             return ControlFlow::Continue(());
//!         }
//!         cx.set_status(StatusCode::UNAUTHORIZED);
//!         ControlFlow::Break(())
//!     })
//! }
//! ```

use std::ops::ControlFlow;
use std::time::Instant;

use tracing::{debug, info};

use crate::action::BoxFuture;
use crate::context::In;

pub trait Filter: Send + Sync + 'static {
    fn apply<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, ControlFlow<()>>;
}

impl<F> Filter for F
where
    F: for<'a> Fn(&'a mut In) -> BoxFuture<'a, ControlFlow<()>> + Send + Sync + 'static,
{
    fn apply<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, ControlFlow<()>> {
        self(cx)
    }
}

/// Logs each request when `dynamic_access_log` is enabled. The line is
/// written once the response is being produced, with the elapsed time.
pub fn access_log(cx: &mut In) -> BoxFuture<'_, ControlFlow<()>> {
    Box::pin(async move {
        if cx.config().dynamic_access_log {
            let started = Instant::now();
            let method = cx.request().method().to_string();
            let path = cx.request().path().to_owned();
            let peer = cx.request().remote_addr().map(|a| a.to_string()).unwrap_or_else(|| "-".into());
            cx.defer(move || {
                info!(peer = %peer, method = %method, path = %path, elapsed = ?started.elapsed(), "request");
            });
        }
        ControlFlow::Continue(())
    })
}

/// Gzips the response when `gzip_dynamic` is enabled and the client
/// accepts it.
pub fn compress(cx: &mut In) -> BoxFuture<'_, ControlFlow<()>> {
    Box::pin(async move {
        let accepted = cx.request().header("accept-encoding").is_some_and(accepts_gzip);
        if cx.config().gzip_dynamic && accepted {
            debug!(path = %cx.request().path(), "gzipping response");
            cx.response_mut().compress_gzip();
        }
        ControlFlow::Continue(())
    })
}

/// Whether an `Accept-Encoding` value allows gzip, either by name or
/// through `*`, with a non-zero quality.
fn accepts_gzip(header: &str) -> bool {
    header.split(',').any(|entry| {
        let mut parts = entry.split(';').map(str::trim);
        let coding = parts.next().unwrap_or_default();
        if !coding.eq_ignore_ascii_case("gzip") && coding != "*" {
            return false;
        }
        let quality = parts
            .find_map(|p| p.strip_prefix("q=").or_else(|| p.strip_prefix("Q=")))
            .and_then(|q| q.trim().parse::<f32>().ok())
            .unwrap_or(1.0);
        quality > 0.0
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_accept_encoding() {
        assert!(accepts_gzip("gzip"));
        assert!(accepts_gzip("deflate, GZIP;q=0.5"));
        assert!(accepts_gzip("br, *"));
        assert!(!accepts_gzip("br, deflate"));
        assert!(!accepts_gzip("gzip;q=0"));
        assert!(!accepts_gzip("x-gzip-ish"));
    }
}
