//! Type-safe identifiers for bridge entities.
//!
//! Newtype wrappers prevent mixing incompatible IDs at compile time.
//!
//! | Type | Source | Lifetime |
//! |------|--------|----------|
//! | [`ConnectionId`] | WebSocket URL or generated | One socket |
//! | [`PageInstanceId`] | Page render | Survives reconnects |
//! | [`CallId`] | Random UUID v4 | One outbound call |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

// ============================================================================
// ConnectionId
// ============================================================================

/// Identifier of one live browser session.
///
/// Stable for the lifetime of the socket; callers use it to key per-session
/// caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wraps an existing identifier.
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random identifier.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// PageInstanceId
// ============================================================================

/// Identifier shared by every connection descending from one page render.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageInstanceId(String);

impl PageInstanceId {
    /// Wraps an existing identifier.
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PageInstanceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PageInstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// CallId
// ============================================================================

/// Correlation id of one outbound call.
///
/// Rendered on the wire as `py_<uuid>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(Uuid);

/// Wire prefix for outbound call ids.
const CALL_ID_PREFIX: &str = "py_";

impl CallId {
    /// Generates a new random call id.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a wire-format id.
    ///
    /// Returns `None` for ids this process could not have issued.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        s.strip_prefix(CALL_ID_PREFIX)
            .and_then(|rest| Uuid::parse_str(rest).ok())
            .map(Self)
    }

    /// Returns the underlying UUID.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{CALL_ID_PREFIX}{}", self.0)
    }
}

impl Serialize for CallId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CallId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid call id: {s}")))
    }
}

// ============================================================================
// Tests
// ============================================================================
