//! WebSocket server for browser sessions.
//!
//! Accepts page sockets and binds each one to a bridge [`Connection`].
//!
//! # Connection Flow
//!
//! 1. The page opens `ws://<host>/websocket/<connection id>/<page path>`
//! 2. The upgrade request yields the [`SessionInfo`] and cookie claims
//! 3. The sink half goes to a [`WsTransport`] writer task
//! 4. The stream half is read here; text frames go to the bridge
//! 5. Close, error or bridge shutdown ends the session

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tracing::{debug, error, info, trace, warn};

use crate::bridge::Bridge;
use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::session::SessionInfo;

use super::WsTransport;

// ============================================================================
// Constants
// ============================================================================

/// How often the accept loop rechecks the shutdown flags.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// WsServer
// ============================================================================

/// WebSocket server feeding a [`Bridge`].
///
/// # Example
///
/// ```ignore
/// let bridge = Bridge::builder().port(8300).build()?;
/// let server = WsServer::bind(&bridge).await?;
/// println!("listening on {}", server.ws_url());
/// ```
pub struct WsServer {
    /// Address actually bound.
    local_addr: SocketAddr,
    /// Shutdown flag shared with the accept loop.
    shutdown: Arc<AtomicBool>,
}

impl fmt::Debug for WsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsServer")
            .field("local_addr", &self.local_addr)
            .field("shutdown", &self.shutdown.load(Ordering::SeqCst))
            .finish()
    }
}

// ============================================================================
// WsServer - Constructor
// ============================================================================

impl WsServer {
    /// Binds to the bridge's configured address and starts accepting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(bridge: &Bridge) -> Result<Self> {
        Self::bind_to(bridge, bridge.config().bind_addr).await
    }

    /// Binds to `addr` and starts accepting.
    ///
    /// Use port 0 to let the OS pick a free port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind_to(bridge: &Bridge, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));

        tokio::spawn(accept_loop(
            listener,
            bridge.clone(),
            Arc::clone(&shutdown),
        ));

        info!(%local_addr, "WebSocket server started");

        Ok(Self {
            local_addr,
            shutdown,
        })
    }
}

// ============================================================================
// WsServer - Public API
// ============================================================================

impl WsServer {
    /// Returns the bound address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the bound port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns the base WebSocket URL.
    ///
    /// Format: `ws://{ip}:{port}/websocket/`
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}/websocket/", self.local_addr)
    }

    /// Stops accepting new sockets.
    ///
    /// Open sessions stay up until their browser leaves or the bridge shuts
    /// down.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!(local_addr = %self.local_addr, "WebSocket server stopping");
        }
    }
}

impl Drop for WsServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

/// Accepts sockets until the server or the bridge stops.
async fn accept_loop(listener: TcpListener, bridge: Bridge, shutdown: Arc<AtomicBool>) {
    debug!("Accept loop started");

    loop {
        if shutdown.load(Ordering::SeqCst) || !bridge.is_running() {
            debug!("Accept loop shutting down");
            break;
        }

        // Accept with timeout to allow checking the shutdown flags
        match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
            Ok(Ok((stream, addr))) => {
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_socket(stream, addr, bridge).await {
                        warn!(error = %e, ?addr, "WebSocket session failed");
                    }
                });
            }
            Ok(Err(e)) => {
                error!(error = %e, "Accept failed");
            }
            Err(_) => continue,
        }
    }

    debug!("Accept loop terminated");
}

/// Runs one browser socket from upgrade to close.
async fn serve_socket(stream: TcpStream, addr: SocketAddr, bridge: Bridge) -> Result<()> {
    debug!(?addr, "New TCP connection");

    let mut request_path = String::new();
    let mut cookie_header: Option<String> = None;

    let capture = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        request_path = request.uri().to_string();
        cookie_header = request
            .headers()
            .get(COOKIE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        Ok(response)
    };

    let ws_stream = accept_hdr_async(stream, capture)
        .await
        .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;

    let info = SessionInfo::from_request_path(&request_path);
    let identity = cookie_header
        .as_deref()
        .and_then(|header| bridge.identity_from_cookies(header));

    let (sink, mut stream) = ws_stream.split();
    let id = info
        .connection_id
        .clone()
        .unwrap_or_else(ConnectionId::generate);
    let transport = WsTransport::spawn(id.clone(), sink);
    let connection = bridge.open(Arc::new(transport), info.with_id(id));

    let mut shutdown = bridge.shutdown_signal();

    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            _ = shutdown.wait_for(|stopped| *stopped) => break,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                trace!(connection_id = %connection.id(), len = text.len(), "Frame received");
                if let Err(e) = bridge.handle_frame_as(&connection, text.as_str(), identity.clone()) {
                    warn!(connection_id = %connection.id(), error = %e, "Frame rejected");
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                debug!(connection_id = %connection.id(), "Browser closed socket");
                break;
            }
            Some(Ok(Message::Binary(_))) => {
                let e = Error::protocol("binary frames are not supported");
                warn!(connection_id = %connection.id(), error = %e, "Frame rejected");
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(connection_id = %connection.id(), error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    bridge.close_connection(&connection);
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    fn any_port() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[tokio::test]
    async fn test_server_bind_random_port() {
        let bridge = Bridge::builder().build().expect("bridge");
        let server = WsServer::bind_to(&bridge, any_port())
            .await
            .expect("bind should succeed");

        assert!(server.port() > 0);
        assert_eq!(server.local_addr().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(
            server.ws_url(),
            format!("ws://127.0.0.1:{}/websocket/", server.port())
        );

        server.shutdown();
        bridge.shutdown();
    }
}
