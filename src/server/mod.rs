//! Async TCP listener using Tokio.
//!
//! Accepts TCP connections and feeds HTTP/1.1 requests to a [`Dispatcher`].
//! Connections are persistent (keep-alive) unless the client asks
//! otherwise, and a connection whose handler accepted a WebSocket upgrade
//! leaves the HTTP loop for good.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::ConfigError;
use crate::dispatch::{Dispatcher, Reply};
use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::realtime::Upgraded;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The listening socket.
///
/// Usually driven through [`App::run`](crate::app::App::run); binding it
/// directly is useful when the caller needs the local address first, e.g.
/// to listen on port 0 in tests.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until the process ends, one Tokio task per
    /// connection, all sharing `dispatcher`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run(self, dispatcher: Arc<Dispatcher>) -> Result<(), ServerError> {
        info!(address = %self.local_addr, "porch listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let dispatcher = Arc::clone(&dispatcher);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, dispatcher).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Serves one connection: one request per loop iteration until the peer
/// closes, sends `Connection: close`, or the connection is upgraded.
///
/// Bytes already buffered are parsed before reading again, so pipelined
/// requests are answered in order.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                if !fill(&mut stream, &mut buf, peer_addr).await? {
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = Response::new(StatusCode::BAD_REQUEST)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        // Wait for the full body to arrive if Content-Length is set.
        let content_length = request.content_length().unwrap_or(0);
        let total_needed = match body_offset.checked_add(content_length) {
            Some(total) if total <= MAX_REQUEST_SIZE => total,
            _ => {
                warn!(peer = %peer_addr, content_length, "declared body too large, sending 413");
                too_large(&mut stream).await?;
                break;
            }
        };
        if buf.len() < total_needed {
            if !fill(&mut stream, &mut buf, peer_addr).await? {
                break;
            }
            continue;
        }

        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let Reply {
            mut response,
            upgrade,
        } = dispatcher.dispatch(request).await;
        response.set_keep_alive(keep_alive);
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        let _ = buf.split_to(total_needed);

        if let Some(on_upgrade) = upgrade {
            debug!(peer = %peer_addr, "connection upgraded");
            let upgraded = Upgraded {
                stream,
                buffered: buf.freeze(),
            };
            on_upgrade(upgraded).await;
            return Ok(());
        }

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}

/// Reads more bytes into `buf`. Returns `false` when the connection should
/// end: the peer closed it, or the buffer outgrew [`MAX_REQUEST_SIZE`] and a
/// 413 was sent.
async fn fill(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    peer_addr: SocketAddr,
) -> Result<bool, std::io::Error> {
    if stream.read_buf(buf).await? == 0 {
        debug!(peer = %peer_addr, "connection closed by peer");
        return Ok(false);
    }
    if buf.len() > MAX_REQUEST_SIZE {
        warn!(peer = %peer_addr, "request too large, sending 413");
        too_large(stream).await?;
        return Ok(false);
    }
    Ok(true)
}

async fn too_large(stream: &mut TcpStream) -> Result<(), std::io::Error> {
    let response = Response::new(StatusCode::PAYLOAD_TOO_LARGE)
        .body("Request entity too large")
        .keep_alive(false);
    stream.write_all(&response.into_bytes()).await
}
