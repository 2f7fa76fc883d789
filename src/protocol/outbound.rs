//! Frames sent from the bridge to the browser.

// ============================================================================
// Imports
// ============================================================================

use serde::Serialize;

use crate::error::Result;
use crate::identifiers::CallId;

// ============================================================================
// ServerMessage
// ============================================================================

/// Any frame the bridge may send.
///
/// # Format
///
/// ```json
/// {
///   "cmd": "eval_js",
///   "id": "py_<uuid>",
///   "js_code": "document.title",
///   "send_return_value": true
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Evaluate a script in the page.
    EvalJs {
        /// Correlation id echoed back as `caller_id`.
        id: CallId,
        /// Script source.
        js_code: String,
        /// Whether the page must answer with `return_py`.
        send_return_value: bool,
    },
}

impl ServerMessage {
    /// Creates an `eval_js` frame.
    #[inline]
    #[must_use]
    pub fn eval_js(id: CallId, js_code: impl Into<String>, send_return_value: bool) -> Self {
        Self::EvalJs {
            id,
            js_code: js_code.into(),
            send_return_value,
        }
    }

    /// Serializes the frame to its wire text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if serialization fails.
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Tests
// ============================================================================
