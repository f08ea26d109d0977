//! Incoming HTTP request type.

use std::net::SocketAddr;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use hyper::upgrade::OnUpgrade;

/// An incoming HTTP request with its body already collected.
pub struct Request {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) tls: bool,
    pub(crate) upgrade: Option<OnUpgrade>,
}

impl Request {
    /// Wraps an `http::Request`. A pending connection upgrade stored in the
    /// request extensions by hyper is kept for the WebSocket handshake.
    pub fn new(req: http::Request<Bytes>) -> Self {
        let (mut parts, body) = req.into_parts();
        let upgrade = parts.extensions.remove::<OnUpgrade>();
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            remote_addr: None,
            tls: false,
            upgrade,
        }
    }

    /// Records how the request reached us.
    pub fn with_connection(mut self, remote_addr: SocketAddr, tls: bool) -> Self {
        self.remote_addr = Some(remote_addr);
        self.tls = tls;
        self
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn path(&self) -> &str { self.uri.path() }
    pub fn query(&self) -> Option<&str> { self.uri.query() }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &[u8] { &self.body }
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }

    /// Whether the connection itself was TLS.
    pub fn is_tls(&self) -> bool { self.tls }

    /// Case-insensitive header lookup. Non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns the value of a cookie sent with the request.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    /// The host the client addressed, from `Host` or the URI authority.
    pub fn host(&self) -> Option<&str> {
        self.header("host").or_else(|| self.uri.authority().map(|a| a.as_str()))
    }

    /// Whether the client asked to switch to the WebSocket protocol.
    pub fn wants_websocket(&self) -> bool {
        self.header("upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }

    pub(crate) fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub(crate) fn take_upgrade(&mut self) -> Option<OnUpgrade> {
        self.upgrade.take()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> Request {
        let mut builder = http::Request::builder().uri("/a?b=c");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        Request::new(builder.body(Bytes::new()).unwrap())
    }

    #[test]
    fn reads_cookies_across_headers() {
        let req = request(&[("cookie", "a=1; lang=pt"), ("cookie", "trellis_sessid=abc")]);
        assert_eq!(req.cookie("lang"), Some("pt"));
        assert_eq!(req.cookie("trellis_sessid"), Some("abc"));
        assert_eq!(req.cookie("missing"), None);
    }

    #[test]
    fn detects_websocket_upgrade() {
        assert!(request(&[("upgrade", "WebSocket")]).wants_websocket());
        assert!(!request(&[("upgrade", "h2c")]).wants_websocket());
        assert!(!request(&[]).wants_websocket());
    }

    #[test]
    fn exposes_path_and_query() {
        let req = request(&[]);
        assert_eq!(req.path(), "/a");
        assert_eq!(req.query(), Some("b=c"));
    }
}
