//! Return correlator.
//!
//! Matches `return_py` frames to waiting callers. Unknown, stale and
//! malformed ids are expected (the caller may have timed out, or the id
//! may predate a reconnect) and are dropped without complaint.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::identifiers::CallId;

use super::pending::{CallOwner, PendingCalls};

// ============================================================================
// ReturnValue
// ============================================================================

/// A value sent back by a browser.
pub(crate) struct ReturnValue {
    /// Connection that sent it.
    pub(crate) from: CallOwner,
    /// Correlation id as received.
    pub(crate) caller_id: String,
    /// Evaluated value.
    pub(crate) value: Value,
}

// ============================================================================
// Loop
// ============================================================================

/// Runs until shutdown or until every sender is gone.
pub(crate) async fn run(
    mut returns: mpsc::UnboundedReceiver<ReturnValue>,
    pending: Arc<PendingCalls>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Return correlator started");

    loop {
        let ret = tokio::select! {
            ret = returns.recv() => match ret {
                Some(ret) => ret,
                None => break,
            },
            _ = shutdown.wait_for(|stopped| *stopped) => break,
        };

        correlate(&pending, ret);
    }

    debug!("Return correlator terminated");
}

/// Wakes the caller waiting on this return, if any.
fn correlate(pending: &PendingCalls, ret: ReturnValue) {
    let ReturnValue {
        from,
        caller_id,
        value,
    } = ret;
    let connection_id = &from.connection_id;

    match CallId::parse(&caller_id) {
        Some(call_id) if pending.resolve(call_id, &from, value) => {
            trace!(%connection_id, %call_id, "Return delivered");
        }
        _ => {
            trace!(%connection_id, caller_id, "Return discarded, no waiting caller");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
