//! TLS: listener configuration and redirects to the secure origin.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::CertificateDer;

use crate::error::Error;
use crate::request::Request;

/// Whether the request reached us securely, directly or through a
/// TLS-terminating proxy that set `X-Forwarded-Proto`.
pub fn arrived_securely(req: &Request) -> bool {
    req.is_tls()
        || req
            .header("x-forwarded-proto")
            .and_then(|v| v.split(',').next())
            .is_some_and(|proto| matches!(proto.trim().to_ascii_lowercase().as_str(), "https" | "wss"))
}

/// The secure equivalent of the request URL: `http` becomes `https` and
/// `ws` becomes `wss`, the TLS port is added unless it is 443, and the
/// path and query are kept. `None` when the request names no host.
pub fn secure_url(req: &Request, websocket: bool, tls_port: Option<u16>) -> Option<String> {
    let authority = req.host()?;
    let host = strip_port(authority);
    if host.is_empty() {
        return None;
    }

    let scheme = if websocket { "wss" } else { "https" };
    let mut url = format!("{scheme}://{host}");
    if let Some(port) = tls_port.filter(|p| *p != 443) {
        url.push_str(&format!(":{port}"));
    }
    url.push_str(req.uri().path_and_query().map_or("/", |pq| pq.as_str()));
    Some(url)
}

fn strip_port(authority: &str) -> &str {
    if authority.starts_with('[') {
        // [::1]:8080
        return match authority.find(']') {
            Some(end) => &authority[..=end],
            None => authority,
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => authority,
    }
}

/// Builds the rustls configuration for the TLS listener. Missing or
/// unreadable material is an error.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, Error> {
    if cert_path.as_os_str().is_empty() || key_path.as_os_str().is_empty() {
        return Err(Error::Tls("certificate and key paths are required".into()));
    }

    let open = |path: &Path| {
        File::open(path)
            .map(BufReader::new)
            .map_err(|e| Error::Tls(format!("{}: {e}", path.display())))
    };

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<_, _>>()
        .map_err(|e| Error::Tls(format!("{}: {e}", cert_path.display())))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("{}: no certificates found", cert_path.display())));
    }

    let key = rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(|e| Error::Tls(format!("{}: {e}", key_path.display())))?
        .ok_or_else(|| Error::Tls(format!("{}: no private key found", key_path.display())))?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}
