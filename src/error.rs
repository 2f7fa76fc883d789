//! Error types for the call bridge.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use weblink::{Connection, Result};
//!
//! async fn title(connection: &Connection) -> Result<Option<String>> {
//!     let value = connection.eval_js("document.title").await?;
//!     Ok(value.and_then(|v| v.as_str().map(str::to_owned)))
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`], [`Error::ConnectionNotFound`] |
//! | Protocol | [`Error::Protocol`], [`Error::InvalidArgument`] |
//! | Call | [`Error::TooManyPendingCalls`], [`Error::BridgeStopped`] |
//! | Procedure | [`Error::ProcedureNotFound`], [`Error::Procedure`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |
//!
//! A blocking outbound call that times out, or whose connection closes
//! while it waits, is not an error: it yields `Ok(None)`.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::ConnectionId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when bridge configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport-level failure.
    ///
    /// Returned when a WebSocket cannot be accepted or written.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// The connection's transport is already closed.
    ///
    /// Returned when issuing an outbound call on a dead connection.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No live connection with this id.
    #[error("Connection not found: {connection_id}")]
    ConnectionNotFound {
        /// The missing connection id.
        connection_id: ConnectionId,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or malformed frame.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// Invalid procedure argument.
    ///
    /// Returned by [`Invocation`](crate::procedure::Invocation) accessors
    /// when an argument is missing or has the wrong shape.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    // ========================================================================
    // Call Errors
    // ========================================================================
    /// Pending-call table is full.
    #[error("Too many pending calls: {pending}/{max}")]
    TooManyPendingCalls {
        /// Calls currently awaiting a result.
        pending: usize,
        /// Configured limit.
        max: usize,
    },

    /// The bridge has been shut down.
    #[error("Bridge stopped")]
    BridgeStopped,

    // ========================================================================
    // Procedure Errors
    // ========================================================================
    /// No procedure registered under this name.
    #[error("No function found with name \"{name}\"")]
    ProcedureNotFound {
        /// The unresolved procedure name.
        name: String,
    },

    /// A procedure body failed.
    #[error("{message}")]
    Procedure {
        /// Failure description reported by the procedure.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection not found error.
    #[inline]
    pub fn connection_not_found(connection_id: ConnectionId) -> Self {
        Self::ConnectionNotFound { connection_id }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a too-many-pending-calls error.
    #[inline]
    pub fn too_many_pending_calls(pending: usize, max: usize) -> Self {
        Self::TooManyPendingCalls { pending, max }
    }

    /// Creates a procedure not found error.
    #[inline]
    pub fn procedure_not_found(name: impl Into<String>) -> Self {
        Self::ProcedureNotFound { name: name.into() }
    }

    /// Creates a procedure failure.
    #[inline]
    pub fn procedure(message: impl Into<String>) -> Self {
        Self::Procedure {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionClosed
                | Self::ConnectionNotFound { .. }
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this error came from procedure resolution or execution.
    #[inline]
    #[must_use]
    pub fn is_procedure_error(&self) -> bool {
        matches!(
            self,
            Self::ProcedureNotFound { .. } | Self::Procedure { .. } | Self::InvalidArgument { .. }
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::TooManyPendingCalls { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================
