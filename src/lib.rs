//! Weblink - Bidirectional call bridge between Rust backends and browser pages.
//!
//! Server code asks a browser tab to evaluate a script and, optionally,
//! waits for its value. The tab asks the server to run a named procedure.
//! Both directions share one WebSocket per tab.
//!
//! # Architecture
//!
//! The bridge follows an actor model:
//!
//! - **Outbound**: any task calls [`Connection::eval_js`]; a single
//!   dispatcher writes `eval_js` frames in queue order
//! - **Inbound**: `call_py` frames are resolved against the procedure
//!   table and run on the inbound dispatcher or a spawned task
//! - **Returns**: `return_py` frames wake the caller waiting on the
//!   matching correlation id
//!
//! Key design principles:
//!
//! - One [`Bridge`] per process owns all shared state
//! - Blocking calls have a bounded wait and yield `None` on timeout
//! - A closed connection wakes its waiting callers at once
//! - A failing procedure never stops a dispatcher
//!
//! # Quick Start
//!
//! ```no_run
//! use weblink::{Bridge, Connection, Invocation, Result, WsServer};
//!
//! async fn ready(connection: Connection, _invocation: Invocation) -> Result<()> {
//!     let title = connection.eval_js("document.title").await?;
//!     println!("page title: {title:?}");
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let bridge = Bridge::builder().procedure("ready", ready).build()?;
//!
//!     let server = WsServer::bind(&bridge).await?;
//!     println!("listening on {}", server.ws_url());
//!
//!     tokio::signal::ctrl_c().await?;
//!     bridge.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`bridge`] | [`Bridge`], builder, dispatchers |
//! | [`session`] | [`Connection`], registry, identity |
//! | [`procedure`] | [`Procedure`] trait and resolution |
//! | [`plugin`] | [`Plugin`] extension point |
//! | [`protocol`] | wire messages |
//! | [`transport`] | WebSocket server and in-memory transport |
//! | [`dom`] | alert, download, select and modal helpers |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |

// ============================================================================
// Modules
// ============================================================================

/// The call bridge.
///
/// Use [`Bridge::builder()`] to create a configured bridge.
pub mod bridge;

/// Convenience calls into the browser page.
pub mod dom;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Bridge extensions.
pub mod plugin;

/// Browser-callable procedures.
pub mod procedure;

/// WebSocket protocol message types.
pub mod protocol;

/// Browser sessions.
pub mod session;

/// Transport layer.
///
/// WebSocket server plus an in-memory transport for tests.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Bridge types
pub use bridge::{Bridge, BridgeBuilder, BridgeConfig};

// Session types
pub use session::{
    CallOptions, Connection, Identity, SecureCookie, SessionInfo, SessionRegistry,
};

// Procedure types
pub use procedure::{Invocation, Procedure, ProcedureRef, ProcedureTable, Tier, page_key};

// Plugin types
pub use plugin::Plugin;

// Transport types
pub use transport::{ChannelPeer, ChannelTransport, Transport, WsServer, WsTransport, channel_transport};

// Helpers
pub use dom::js_string;

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{CallId, ConnectionId, PageInstanceId};
