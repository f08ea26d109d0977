//! WebSocket handshake on top of hyper's connection upgrade.

use http::header::{self, HeaderValue};
use http::StatusCode;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;

use crate::request::Request;
use crate::response::ResponseWriter;

/// A framed WebSocket connection handed to actions through
/// [`In::websocket`](crate::In::websocket).
pub type WebSocket = WebSocketStream<TokioIo<hyper::upgrade::Upgraded>>;

/// The `101 Switching Protocols` answer to a valid handshake, or `None`
/// when the client sent no `Sec-WebSocket-Key`.
pub(crate) fn handshake_response(req: &Request) -> Option<ResponseWriter> {
    let key = req.headers().get(header::SEC_WEBSOCKET_KEY)?;
    let accept = derive_accept_key(key.as_bytes());

    let mut w = ResponseWriter::with_status(StatusCode::SWITCHING_PROTOCOLS);
    let headers = w.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    w.set_header(header::SEC_WEBSOCKET_ACCEPT, &accept);
    Some(w)
}

/// Waits for hyper to hand over the connection once the 101 is sent.
pub(crate) async fn accept(upgrade: OnUpgrade) -> Result<WebSocket, hyper::Error> {
    let upgraded = upgrade.await?;
    Ok(WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await)
}
