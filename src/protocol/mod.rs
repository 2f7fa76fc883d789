//! WebSocket protocol message types.
//!
//! This module defines the message format for communication between
//! the bridge (Rust) and the page script (browser).
//!
//! # Protocol Overview
//!
//! Every frame is one JSON object discriminated by its `cmd` field.
//!
//! | `cmd` | Direction | Purpose |
//! |-------|-----------|---------|
//! | `synchronize_time` | Browser → Bridge | Establish clock offset |
//! | `call_py` | Browser → Bridge | Invoke a named procedure |
//! | `return_py` | Browser → Bridge | Result of a prior `eval_js` |
//! | `eval_js` | Bridge → Browser | Evaluate a script, optionally reply |
//!
//! Browser frames carry `event_time_ms`, which the bridge consumes to
//! maintain the per-connection clock offset.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `inbound` | Frames sent by the browser |
//! | `outbound` | Frames sent by the bridge |

// ============================================================================
// Submodules
// ============================================================================

/// Frames sent by the browser.
pub mod inbound;

/// Frames sent by the bridge.
pub mod outbound;

// ============================================================================
// Re-exports
// ============================================================================

pub use inbound::{CallPy, ClientMessage, ReturnPy};
pub use outbound::ServerMessage;
