//! Outbound dispatcher.
//!
//! Single consumer of every `eval_js` request. Callers on any task push
//! onto one FIFO channel; the loop serializes each call and hands the frame
//! to the connection's transport, whose `send` never waits on the peer.
//! A slow browser therefore delays nobody but itself.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::identifiers::CallId;
use crate::protocol::ServerMessage;
use crate::session::Connection;

use super::pending::PendingCalls;

// ============================================================================
// OutboundCall
// ============================================================================

/// One script queued for a browser.
pub(crate) struct OutboundCall {
    /// Target session.
    pub(crate) connection: Connection,
    /// Correlation id.
    pub(crate) call_id: CallId,
    /// Script to evaluate.
    pub(crate) script: String,
    /// A caller is waiting for the value.
    pub(crate) expect_result: bool,
}

// ============================================================================
// Loop
// ============================================================================

/// Runs until shutdown or until every sender is gone.
pub(crate) async fn run(
    mut calls: mpsc::UnboundedReceiver<OutboundCall>,
    pending: Arc<PendingCalls>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Outbound dispatcher started");

    loop {
        let call = tokio::select! {
            call = calls.recv() => match call {
                Some(call) => call,
                None => break,
            },
            _ = shutdown.wait_for(|stopped| *stopped) => break,
        };

        deliver(&pending, call);
    }

    debug!("Outbound dispatcher terminated");
}

/// Writes one call to its transport.
///
/// A blocking caller whose call cannot be written is woken at once.
fn deliver(pending: &PendingCalls, call: OutboundCall) {
    let OutboundCall {
        connection,
        call_id,
        script,
        expect_result,
    } = call;

    let frame = match ServerMessage::eval_js(call_id, script, expect_result).to_frame() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connection_id = %connection.id(), %call_id, error = %e, "Failed to encode eval_js");
            if expect_result {
                pending.fail(call_id);
            }
            return;
        }
    };

    let sent = if connection.is_open() {
        connection.transport().send(frame)
    } else {
        Err(Error::ConnectionClosed)
    };

    match sent {
        Ok(()) => {
            trace!(connection_id = %connection.id(), %call_id, expect_result, "eval_js sent");
        }
        Err(e) => {
            debug!(connection_id = %connection.id(), %call_id, error = %e, "eval_js not delivered");
            if expect_result {
                pending.fail(call_id);
            }
        }
    }
}
