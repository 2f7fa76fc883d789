//! Browser sessions.
//!
//! | Type | Role |
//! |------|------|
//! | [`Connection`] | handle to one live browser tab |
//! | [`SessionRegistry`] | live sessions by id, lifecycle hooks, broadcast |
//! | [`SessionInfo`] | id and page path known when a socket opens |
//! | [`Identity`] | request-scoped authentication claims |
//! | [`CallOptions`] | wait policy of an outbound call |

// ============================================================================
// Submodules
// ============================================================================

pub mod connection;
pub mod identity;
pub mod registry;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{CallOptions, Connection, SessionInfo};
pub use identity::{Identity, SecureCookie};
pub use registry::{ConnectionHook, SessionRegistry};
