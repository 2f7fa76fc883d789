//! Transport layer.
//!
//! A [`Transport`] is the per-connection send boundary the bridge writes
//! frames to. Receiving is push-based: whoever owns the socket feeds text
//! frames to [`Bridge::handle_frame`](crate::Bridge::handle_frame) and
//! reports the disconnect through [`Bridge::close`](crate::Bridge::close).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐                              ┌─────────────────┐
//! │  Bridge (Rust)  │                              │  Page script    │
//! │                 │         WebSocket            │  (browser tab)  │
//! │  WsServer       │◄────────────────────────────►│                 │
//! │  → WsTransport  │  /websocket/<id>/<pathname>  │  WebSocket      │
//! │                 │                              │  client         │
//! └─────────────────┘                              └─────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `memory` | In-process channel transport |
//! | `server` | WebSocket accept loop and per-socket reader |
//! | `websocket` | WebSocket writer task |

// ============================================================================
// Submodules
// ============================================================================

/// In-process channel transport.
pub mod memory;

/// WebSocket server accepting browser connections.
pub mod server;

/// WebSocket writer task.
pub mod websocket;

// ============================================================================
// Re-exports
// ============================================================================

pub use memory::{ChannelPeer, ChannelTransport, channel_transport};
pub use server::WsServer;
pub use websocket::WsTransport;

// ============================================================================
// Transport
// ============================================================================

use crate::error::Result;

/// Send side of one browser connection.
///
/// Implementations must not block: `send` enqueues the frame for the
/// socket owner and returns, so a slow peer never stalls the outbound
/// dispatcher for other connections.
pub trait Transport: Send + Sync + 'static {
    /// Queues one text frame for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`](crate::Error::ConnectionClosed)
    /// if the transport is closed.
    fn send(&self, frame: String) -> Result<()>;

    /// Returns `true` while frames can still be sent.
    fn is_open(&self) -> bool;

    /// Closes the transport. Idempotent.
    fn close(&self);
}
