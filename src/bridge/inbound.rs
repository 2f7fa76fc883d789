//! Inbound dispatcher.
//!
//! Resolves `call_py` requests against the procedure table and runs them.
//!
//! # Execution
//!
//! | `new_thread` | Runs on | Ordering |
//! |--------------|---------|----------|
//! | `false` | the dispatcher, awaited before the next call | receipt order |
//! | `true` | a spawned task | none |
//!
//! A failing or panicking procedure is logged, reported to its browser as
//! an alert, and the dispatcher moves on.

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace, warn};

use crate::dom;
use crate::error::Error;
use crate::procedure::{Invocation, ProcedureRef, ProcedureTable};
use crate::session::{Connection, Identity};

// ============================================================================
// InboundCall
// ============================================================================

/// One `call_py` request awaiting dispatch.
pub(crate) struct InboundCall {
    /// Calling session.
    pub(crate) connection: Connection,
    /// Procedure name.
    pub(crate) name: String,
    /// Positional arguments.
    pub(crate) args: Vec<Value>,
    /// Page the call came from, when the client sent it.
    pub(crate) pathname: Option<String>,
    /// Stay silent when the name does not resolve.
    pub(crate) no_error_if_undefined: bool,
    /// Run on a separate task.
    pub(crate) new_thread: bool,
    /// Claims of the carrying request.
    pub(crate) identity: Option<Identity>,
    /// Corrected client event time.
    pub(crate) event_time_ms: Option<f64>,
}

// ============================================================================
// Loop
// ============================================================================

/// Runs until shutdown or until every sender is gone.
pub(crate) async fn run(
    mut calls: mpsc::UnboundedReceiver<InboundCall>,
    procedures: Arc<ProcedureTable>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Inbound dispatcher started");

    loop {
        let call = tokio::select! {
            call = calls.recv() => match call {
                Some(call) => call,
                None => break,
            },
            _ = shutdown.wait_for(|stopped| *stopped) => break,
        };

        dispatch(&procedures, call).await;
    }

    debug!("Inbound dispatcher terminated");
}

/// Resolves and runs one call.
async fn dispatch(procedures: &ProcedureTable, call: InboundCall) {
    let InboundCall {
        connection,
        name,
        args,
        pathname,
        no_error_if_undefined,
        new_thread,
        identity,
        event_time_ms,
    } = call;

    let pathname = pathname.unwrap_or_else(|| connection.pathname().to_string());

    let Some((tier, procedure)) = procedures.resolve(&name, &pathname) else {
        if no_error_if_undefined {
            trace!(procedure = %name, connection_id = %connection.id(), "Optional procedure not defined");
        } else {
            warn!(procedure = %name, connection_id = %connection.id(), %pathname, "No procedure found");
            report(&connection, &Error::procedure_not_found(&name));
        }
        return;
    };

    debug!(procedure = %name, %tier, connection_id = %connection.id(), new_thread, "Dispatching call");

    let invocation = Invocation {
        name,
        args,
        identity,
        event_time_ms,
    };
    let task = invoke(procedure, connection, invocation);

    if new_thread {
        tokio::spawn(task);
    } else {
        task.await;
    }
}

/// Runs a procedure, containing its errors and panics.
async fn invoke(procedure: ProcedureRef, connection: Connection, invocation: Invocation) {
    let name = invocation.name.clone();

    let outcome = AssertUnwindSafe(procedure.call(connection.clone(), invocation))
        .catch_unwind()
        .await;

    let failure = match outcome {
        Ok(Ok(())) => {
            trace!(procedure = %name, connection_id = %connection.id(), "Procedure completed");
            return;
        }
        Ok(Err(e)) => e,
        Err(panic) => Error::procedure(format!(
            "procedure {name} panicked: {}",
            panic_message(panic.as_ref())
        )),
    };

    error!(procedure = %name, connection_id = %connection.id(), error = %failure, "Procedure failed");
    report(&connection, &failure);
}

/// Shows an error to the browser, best effort.
fn report(connection: &Connection, failure: &Error) {
    if let Err(e) = dom::alert(connection, &failure.to_string()) {
        debug!(connection_id = %connection.id(), error = %e, "Could not report error to browser");
    }
}

/// Extracts the message of a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");

        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
