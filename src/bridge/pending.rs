//! Pending-call table.
//!
//! Rendezvous point between a blocked caller and the return correlator.
//! An entry is inserted before the call is queued for transmission and is
//! removed exactly once, by whichever of these happens first:
//!
//! | Event | Effect on the waiter |
//! |-------|----------------------|
//! | `return_py` arrives | receives the value |
//! | Caller's deadline passes | entry abandoned, late result ignored |
//! | Transmission fails | sender dropped, waiter wakes with no value |
//! | Connection closes | sender dropped, waiter wakes with no value |
//!
//! Fire-and-forget calls never enter the table.
//!
//! Entries are owned by one connection *instance*, not just its id. A
//! reconnect under the same id gets a new instance, so tearing down the
//! old handle leaves the new handle's calls alone, and a return is only
//! accepted from the instance the call was sent to.

// ============================================================================
// Imports
// ============================================================================

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::{CallId, ConnectionId};

// ============================================================================
// CallOwner
// ============================================================================

/// The connection instance a call was issued on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CallOwner {
    /// Session id.
    pub(crate) connection_id: ConnectionId,
    /// Distinguishes handles that share a session id.
    pub(crate) serial: u64,
}

impl CallOwner {
    #[inline]
    pub(crate) fn new(connection_id: ConnectionId, serial: u64) -> Self {
        Self {
            connection_id,
            serial,
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// Receiving half handed to a blocking caller.
pub(crate) type ResultReceiver = oneshot::Receiver<Value>;

/// One outstanding call.
struct PendingCall {
    /// Connection the call was issued on.
    owner: CallOwner,
    /// Wakes the blocked caller.
    result_tx: oneshot::Sender<Value>,
}

// ============================================================================
// PendingCalls
// ============================================================================

/// Concurrency-safe map from correlation id to waiting caller.
pub(crate) struct PendingCalls {
    /// Outstanding calls.
    calls: Mutex<FxHashMap<CallId, PendingCall>>,
    /// Maximum number of outstanding calls.
    max_pending: usize,
}

impl PendingCalls {
    /// Creates an empty table.
    pub(crate) fn new(max_pending: usize) -> Self {
        Self {
            calls: Mutex::new(FxHashMap::default()),
            max_pending,
        }
    }

    /// Registers a call and returns the receiver its caller waits on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooManyPendingCalls`] if the table is full.
    pub(crate) fn register(
        &self,
        call_id: CallId,
        owner: CallOwner,
    ) -> Result<ResultReceiver> {
        let mut calls = self.calls.lock();

        if calls.len() >= self.max_pending {
            debug!(
                pending = calls.len(),
                max = self.max_pending,
                "Too many pending calls"
            );
            return Err(Error::too_many_pending_calls(calls.len(), self.max_pending));
        }

        let (result_tx, result_rx) = oneshot::channel();
        calls.insert(
            call_id,
            PendingCall {
                owner,
                result_tx,
            },
        );

        Ok(result_rx)
    }

    /// Delivers a result to the waiting caller.
    ///
    /// Returns `false` if no call with this id is pending on `from`. A
    /// return sent by any other connection leaves the entry in place.
    pub(crate) fn resolve(&self, call_id: CallId, from: &CallOwner, value: Value) -> bool {
        let mut calls = self.calls.lock();
        let Some(call) = calls.get(&call_id) else {
            return false;
        };
        if &call.owner != from {
            debug!(
                %call_id,
                expected = %call.owner.connection_id,
                from = %from.connection_id,
                "Return from wrong connection ignored"
            );
            return false;
        }
        let Some(call) = calls.remove(&call_id) else {
            return false;
        };
        drop(calls);

        // The receiver may have been dropped by a caller that just timed out.
        if call.result_tx.send(value).is_err() {
            trace!(%call_id, "Result arrived after caller left");
        }
        true
    }

    /// Removes a call and wakes its caller with no value.
    ///
    /// Returns `false` if no call with this id is pending.
    pub(crate) fn fail(&self, call_id: CallId) -> bool {
        self.calls.lock().remove(&call_id).is_some()
    }

    /// Removes a call whose caller stopped waiting.
    #[inline]
    pub(crate) fn abandon(&self, call_id: CallId) {
        self.calls.lock().remove(&call_id);
    }

    /// Fails every call issued on one connection instance.
    ///
    /// Returns the number of calls failed.
    pub(crate) fn fail_connection(&self, owner: &CallOwner) -> usize {
        let mut calls = self.calls.lock();
        let before = calls.len();
        calls.retain(|_, call| &call.owner != owner);
        before - calls.len()
    }

    /// Fails every outstanding call.
    pub(crate) fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.calls.lock().drain().collect();
        drained.len()
    }

    /// Returns `true` if a call with this id is pending.
    #[cfg(test)]
    pub(crate) fn contains(&self, call_id: CallId) -> bool {
        self.calls.lock().contains_key(&call_id)
    }

    /// Returns the number of outstanding calls.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.calls.lock().len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn conn(id: &str) -> CallOwner {
        CallOwner::new(ConnectionId::new(id), 1)
    }

    #[tokio::test]
    async fn test_resolve_wakes_waiter() {
        let table = PendingCalls::new(10);
        let id = CallId::generate();
        let rx = table.register(id, conn("a")).expect("register");

        assert!(table.resolve(id, &conn("a"), json!({"ok": true})));
        assert_eq!(rx.await.expect("value"), json!({"ok": true}));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_resolve_unknown_is_noop() {
        let table = PendingCalls::new(10);
        assert!(!table.resolve(CallId::generate(), &conn("a"), json!(1)));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_resolve_twice_only_first_counts() {
        let table = PendingCalls::new(10);
        let id = CallId::generate();
        let _rx = table.register(id, conn("a")).expect("register");

        assert!(table.resolve(id, &conn("a"), json!(1)));
        assert!(!table.resolve(id, &conn("a"), json!(2)));
    }

    #[tokio::test]
    async fn test_fail_wakes_with_no_value() {
        let table = PendingCalls::new(10);
        let id = CallId::generate();
        let rx = table.register(id, conn("a")).expect("register");

        assert!(table.fail(id));
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_abandoned_call_ignores_late_result() {
        let table = PendingCalls::new(10);
        let id = CallId::generate();
        let rx = table.register(id, conn("a")).expect("register");

        drop(rx);
        table.abandon(id);
        assert!(!table.contains(id));
        assert!(!table.resolve(id, &conn("a"), json!("late")));
    }

    #[test]
    fn test_fail_connection_only_touches_that_connection() {
        let table = PendingCalls::new(10);
        let _a1 = table.register(CallId::generate(), conn("a")).expect("register");
        let _a2 = table.register(CallId::generate(), conn("a")).expect("register");
        let b = CallId::generate();
        let _b1 = table.register(b, conn("b")).expect("register");

        assert_eq!(table.fail_connection(&conn("a")), 2);
        assert_eq!(table.len(), 1);
        assert!(table.contains(b));
    }

    #[tokio::test]
    async fn test_fail_connection_spares_reconnected_instance() {
        let table = PendingCalls::new(10);
        let stale = CallOwner::new(ConnectionId::new("a"), 1);
        let live = CallOwner::new(ConnectionId::new("a"), 2);
        let _old = table.register(CallId::generate(), stale.clone()).expect("register");
        let id = CallId::generate();
        let rx = table.register(id, live.clone()).expect("register");

        assert_eq!(table.fail_connection(&stale), 1);
        assert!(table.contains(id));
        assert!(table.resolve(id, &live, json!("fresh")));
        assert_eq!(rx.await.expect("value"), json!("fresh"));
    }

    #[test]
    fn test_resolve_from_other_connection_keeps_entry() {
        let table = PendingCalls::new(10);
        let id = CallId::generate();
        let _rx = table.register(id, conn("a")).expect("register");

        assert!(!table.resolve(id, &conn("b"), json!("spoofed")));
        assert!(!table.resolve(id, &CallOwner::new(ConnectionId::new("a"), 2), json!("stale")));
        assert!(table.contains(id));
        assert!(table.resolve(id, &conn("a"), json!("real")));
    }

    #[test]
    fn test_limit_enforced() {
        let table = PendingCalls::new(2);
        let _r1 = table.register(CallId::generate(), conn("a")).expect("register");
        let _r2 = table.register(CallId::generate(), conn("a")).expect("register");

        let err = table
            .register(CallId::generate(), conn("a"))
            .expect_err("table is full");
        assert!(matches!(err, Error::TooManyPendingCalls { pending: 2, max: 2 }));
    }

    #[test]
    fn test_fail_all() {
        let table = PendingCalls::new(10);
        let _r1 = table.register(CallId::generate(), conn("a")).expect("register");
        let _r2 = table.register(CallId::generate(), conn("b")).expect("register");

        assert_eq!(table.fail_all(), 2);
        assert_eq!(table.len(), 0);
    }
}
