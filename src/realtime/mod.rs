//! Real-time communication: the WebSocket opening handshake (RFC 6455).
//!
//! Only the handshake is handled here. After the `101 Switching Protocols`
//! response is flushed, the listener gives the raw connection to the
//! handler's callback as an [`Upgraded`]; framing is up to the application.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::net::TcpStream;

use crate::http::Headers;
use crate::router::BoxFuture;

/// Magic value appended to the client key, fixed by RFC 6455 §1.3.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this module speaks.
pub const WEBSOCKET_VERSION: &str = "13";

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("missing or invalid {0} header")]
    MissingHeader(&'static str),

    #[error("unsupported websocket version {0:?}")]
    UnsupportedVersion(String),

    #[error("a response was already started")]
    AlreadyResponded,
}

/// A connection taken over from the HTTP listener.
#[derive(Debug)]
pub struct Upgraded {
    pub stream: TcpStream,
    /// Bytes the client sent after the handshake that were already read.
    pub buffered: Bytes,
}

/// Callback receiving the upgraded connection.
pub type OnUpgrade = Box<dyn FnOnce(Upgraded) -> BoxFuture<'static, ()> + Send + 'static>;

/// Computes `Sec-WebSocket-Accept` for a client's `Sec-WebSocket-Key`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Validates handshake headers and returns the accept key to send back.
pub(crate) fn accept_handshake(headers: &Headers) -> Result<String, UpgradeError> {
    if !headers.has_token("upgrade", "websocket") {
        return Err(UpgradeError::MissingHeader("Upgrade"));
    }
    if !headers.has_token("connection", "upgrade") {
        return Err(UpgradeError::MissingHeader("Connection"));
    }
    let version = headers
        .get("sec-websocket-version")
        .ok_or(UpgradeError::MissingHeader("Sec-WebSocket-Version"))?
        .trim();
    if version != WEBSOCKET_VERSION {
        return Err(UpgradeError::UnsupportedVersion(version.to_owned()));
    }
    let key = headers
        .get("sec-websocket-key")
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or(UpgradeError::MissingHeader("Sec-WebSocket-Key"))?;
    Ok(accept_key(key))
}
