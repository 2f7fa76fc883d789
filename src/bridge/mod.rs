//! The call bridge.
//!
//! | Component | Role |
//! |-----------|------|
//! | [`Bridge`] | process-wide instance: sessions, procedures, dispatchers |
//! | [`BridgeBuilder`] | fluent configuration, validated at build |
//! | [`BridgeConfig`] | validated settings |
//! | `pending` | correlation id to waiting caller |
//! | `outbound` | single consumer writing `eval_js` frames |
//! | `inbound` | resolves and runs `call_py` requests |
//! | `returns` | matches `return_py` frames to waiting callers |

// ============================================================================
// Submodules
// ============================================================================

pub mod builder;
pub mod core;

pub(crate) mod inbound;
pub(crate) mod outbound;
pub(crate) mod pending;
pub(crate) mod returns;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::{
    BridgeBuilder, BridgeConfig, DEFAULT_BIND_ADDR, DEFAULT_CALL_TIMEOUT,
    DEFAULT_MAX_PENDING_CALLS, DEFAULT_PORT, HeartbeatCallback,
};
pub use core::Bridge;
