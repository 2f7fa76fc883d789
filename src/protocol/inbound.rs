//! Frames sent from the browser to the bridge.
//!
//! # Format
//!
//! ```json
//! { "cmd": "synchronize_time", "event_time_ms": 1700000000000 }
//! { "cmd": "call_py", "py_func_name": "btn_clicked", "args": [1, "a"],
//!   "window_location_pathname": "/reports.html",
//!   "no_error_if_undefined": false, "new_thread": false,
//!   "event_time_ms": 1700000000123 }
//! { "cmd": "return_py", "caller_id": "py_<uuid>", "retval": 42,
//!   "event_time_ms": 1700000000456 }
//! ```
//!
//! Unknown fields (such as the client's own `id` counter) are ignored.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::Result;

// ============================================================================
// ClientMessage
// ============================================================================

/// Any frame the browser may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Clock handshake, sent once right after the socket opens.
    SynchronizeTime {
        /// Client wall clock in milliseconds.
        #[serde(default)]
        event_time_ms: Option<f64>,
    },

    /// Procedure invocation.
    CallPy(CallPy),

    /// Result of an outbound `eval_js`.
    ReturnPy(ReturnPy),
}

impl ClientMessage {
    /// Parses one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if the frame is not a
    /// known message.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Returns the client timestamp carried by the frame, if any.
    #[inline]
    #[must_use]
    pub fn event_time_ms(&self) -> Option<f64> {
        match self {
            Self::SynchronizeTime { event_time_ms } => *event_time_ms,
            Self::CallPy(call) => call.event_time_ms,
            Self::ReturnPy(ret) => ret.event_time_ms,
        }
    }

    /// Returns the `cmd` discriminator, for logging.
    #[inline]
    #[must_use]
    pub fn cmd(&self) -> &'static str {
        match self {
            Self::SynchronizeTime { .. } => "synchronize_time",
            Self::CallPy(_) => "call_py",
            Self::ReturnPy(_) => "return_py",
        }
    }
}

// ============================================================================
// CallPy
// ============================================================================

/// A browser request to run a named procedure.
#[derive(Debug, Clone, Deserialize)]
pub struct CallPy {
    /// Procedure name.
    pub py_func_name: String,

    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,

    /// `window.location.pathname` of the calling page.
    #[serde(default)]
    pub window_location_pathname: Option<String>,

    /// Suppress the "no function found" report when unresolved.
    #[serde(default, deserialize_with = "truthy")]
    pub no_error_if_undefined: bool,

    /// Run on a separate task instead of the dispatch loop.
    #[serde(default, deserialize_with = "truthy")]
    pub new_thread: bool,

    /// Client wall clock in milliseconds.
    #[serde(default)]
    pub event_time_ms: Option<f64>,
}

// ============================================================================
// ReturnPy
// ============================================================================

/// A browser reply carrying the value of an evaluated script.
#[derive(Debug, Clone, Deserialize)]
pub struct ReturnPy {
    /// Correlation id from the matching `eval_js`.
    ///
    /// Kept as a raw string: stale or foreign ids are dropped silently
    /// rather than rejected at parse time.
    pub caller_id: String,

    /// Evaluated value; `undefined` arrives as a missing field.
    #[serde(default)]
    pub retval: Value,

    /// Client wall clock in milliseconds.
    #[serde(default)]
    pub event_time_ms: Option<f64>,
}

// ============================================================================
// Helpers
// ============================================================================

/// Accepts JSON booleans as well as the JS truthiness of numbers, strings and null.
fn truthy<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Null => false,
        Value::Array(_) | Value::Object(_) => true,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_synchronize_time() {
        let msg = ClientMessage::parse(
            r#"{"id": "js_0", "cmd": "synchronize_time", "event_time_ms": 1700000000000}"#,
        )
        .expect("parse");
        assert_eq!(msg.cmd(), "synchronize_time");
        assert_eq!(msg.event_time_ms(), Some(1_700_000_000_000.0));
    }

    #[test]
    fn test_parse_call_py_minimal() {
        let msg = ClientMessage::parse(
            r#"{"id": "js_1", "cmd": "call_py", "py_func_name": "ready", "args": ["/"], "event_time_ms": 5}"#,
        )
        .expect("parse");

        let ClientMessage::CallPy(call) = msg else {
            panic!("expected call_py");
        };
        assert_eq!(call.py_func_name, "ready");
        assert_eq!(call.args, vec![Value::from("/")]);
        assert!(!call.no_error_if_undefined);
        assert!(!call.new_thread);
        assert!(call.window_location_pathname.is_none());
    }

    #[test]
    fn test_parse_call_py_flags() {
        let msg = ClientMessage::parse(
            r#"{"cmd": "call_py", "py_func_name": "f", "no_error_if_undefined": 1,
                "new_thread": true, "window_location_pathname": "/a/b.html"}"#,
        )
        .expect("parse");

        let ClientMessage::CallPy(call) = msg else {
            panic!("expected call_py");
        };
        assert!(call.no_error_if_undefined);
        assert!(call.new_thread);
        assert_eq!(call.window_location_pathname.as_deref(), Some("/a/b.html"));
        assert!(call.args.is_empty());
    }

    #[test]
    fn test_parse_return_py_without_retval() {
        let msg = ClientMessage::parse(r#"{"cmd": "return_py", "caller_id": "py_x"}"#)
            .expect("parse");

        let ClientMessage::ReturnPy(ret) = msg else {
            panic!("expected return_py");
        };
        assert_eq!(ret.caller_id, "py_x");
        assert_eq!(ret.retval, Value::Null);
        assert_eq!(ret.event_time_ms, None);
    }

    #[test]
    fn test_parse_rejects_unknown_cmd() {
        assert!(ClientMessage::parse(r#"{"cmd": "reboot"}"#).is_err());
        assert!(ClientMessage::parse("not json").is_err());
    }
}
