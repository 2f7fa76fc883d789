//! Per-session connection handle.
//!
//! A [`Connection`] represents one live browser tab. It is the first
//! argument of every procedure and the target of every outbound call.
//!
//! # Outbound Calls
//!
//! | Method | Waits | Returns |
//! |--------|-------|---------|
//! | [`Connection::eval_js`] | up to the default timeout | `Some(value)` or `None` |
//! | [`Connection::eval_js_with_timeout`] | up to the given timeout | `Some(value)` or `None` |
//! | [`Connection::eval_js_nowait`] | no | `()` |
//! | [`Connection::call`] | per [`CallOptions`] | `Option<Value>` |
//!
//! A blocking call yields `None` when the deadline passes or the
//! connection closes mid-call. Issuing a blocking call on a connection that
//! is already closed fails immediately with [`Error::ConnectionClosed`];
//! fire-and-forget scripts for a closed connection are dropped.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::time::timeout;
use tracing::debug;
use url::Url;

use crate::bridge::core::BridgeShared;
use crate::bridge::outbound::OutboundCall;
use crate::bridge::pending::CallOwner;
use crate::error::{Error, Result};
use crate::identifiers::{CallId, ConnectionId, PageInstanceId};
use crate::procedure::Invocation;
use crate::transport::Transport;

// ============================================================================
// Constants
// ============================================================================

/// URL prefix of the browser's WebSocket endpoint.
const WEBSOCKET_PATH_PREFIX: &str = "/websocket/";

/// Base for resolving request paths.
const REQUEST_BASE: &str = "http://localhost/";

/// Source of per-handle serials.
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// CallOptions
// ============================================================================

/// How an outbound call waits for its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Wait for the browser's return value.
    pub blocking: bool,
    /// Overrides the bridge's default call timeout.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    /// Wait for the result with the default timeout.
    #[inline]
    #[must_use]
    pub const fn blocking() -> Self {
        Self {
            blocking: true,
            timeout: None,
        }
    }

    /// Fire and forget.
    #[inline]
    #[must_use]
    pub const fn nowait() -> Self {
        Self {
            blocking: false,
            timeout: None,
        }
    }

    /// Sets a custom timeout.
    #[inline]
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Default for CallOptions {
    fn default() -> Self {
        Self::blocking()
    }
}

// ============================================================================
// SessionInfo
// ============================================================================

/// Identity of a connection as known when its socket opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Connection id; generated when absent.
    pub connection_id: Option<ConnectionId>,
    /// Page path the socket belongs to, e.g. `/reports/sales.html`.
    pub pathname: String,
}

impl SessionInfo {
    /// Creates session info for a page path with a generated id.
    #[inline]
    #[must_use]
    pub fn new(pathname: impl Into<String>) -> Self {
        Self {
            connection_id: None,
            pathname: pathname.into(),
        }
    }

    /// Sets an explicit connection id.
    #[inline]
    #[must_use]
    pub fn with_id(mut self, connection_id: impl Into<ConnectionId>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    /// Derives session info from a WebSocket request path.
    ///
    /// The browser connects to `/websocket/<connection id>/<page path>`.
    /// Query strings are ignored and dot segments resolved. Paths outside
    /// `/websocket/` get a generated id and the root page.
    #[must_use]
    pub fn from_request_path(path: &str) -> Self {
        let path = Url::parse(REQUEST_BASE)
            .and_then(|base| base.join(path))
            .map(|url| url.path().to_string())
            .unwrap_or_default();

        let Some(rest) = path.strip_prefix(WEBSOCKET_PATH_PREFIX) else {
            return Self::new("/");
        };

        let (id, page) = rest.split_once('/').unwrap_or((rest, ""));
        let pathname = format!("/{page}");

        if id.is_empty() {
            Self::new(pathname)
        } else {
            Self::new(pathname).with_id(ConnectionId::new(id))
        }
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Client clock correction state.
#[derive(Debug, Default, Clone, Copy)]
struct Clock {
    /// Client time minus server time, in milliseconds.
    offset_ms: Option<f64>,
    /// Last client event time, corrected to the server clock.
    event_time_ms: Option<f64>,
}

/// Current server wall clock in milliseconds.
fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or_default()
}

// ============================================================================
// Types
// ============================================================================

/// Internal shared state for a connection.
pub(crate) struct ConnectionInner {
    /// Session id.
    id: ConnectionId,
    /// Unique per handle, even across reconnects under the same id.
    serial: u64,
    /// Page render this session descends from.
    page_instance_id: Option<PageInstanceId>,
    /// Page path of the session.
    pathname: String,
    /// Cache-invalidation counter.
    sequence_number: AtomicU64,
    /// Set once the registry starts tearing the session down.
    closing: AtomicBool,
    /// Application state scoped to the session.
    tags: RwLock<FxHashMap<String, Value>>,
    /// Client clock correction.
    clock: Mutex<Clock>,
    /// Send side of the socket.
    transport: Arc<dyn Transport>,
    /// Owning bridge.
    bridge: Weak<BridgeShared>,
}

// ============================================================================
// Connection
// ============================================================================

/// A handle to one live browser session.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("pathname", &self.inner.pathname)
            .field("page_instance_id", &self.inner.page_instance_id)
            .field("sequence_number", &self.sequence_number())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates a new connection handle.
    pub(crate) fn new(
        id: ConnectionId,
        pathname: String,
        page_instance_id: Option<PageInstanceId>,
        tags: FxHashMap<String, Value>,
        transport: Arc<dyn Transport>,
        bridge: Weak<BridgeShared>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
                page_instance_id,
                pathname,
                sequence_number: AtomicU64::new(0),
                closing: AtomicBool::new(false),
                tags: RwLock::new(tags),
                clock: Mutex::new(Clock::default()),
                transport,
                bridge,
            }),
        }
    }

    /// Returns the owning bridge state.
    fn bridge(&self) -> Result<Arc<BridgeShared>> {
        self.inner.bridge.upgrade().ok_or(Error::BridgeStopped)
    }

    /// Identifies this handle in the pending-call table.
    pub(crate) fn owner(&self) -> CallOwner {
        CallOwner::new(self.inner.id.clone(), self.inner.serial)
    }
}

// ============================================================================
// Connection - Accessors
// ============================================================================

impl Connection {
    /// Returns the session id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// Returns the page instance this session descends from.
    #[inline]
    #[must_use]
    pub fn page_instance_id(&self) -> Option<&PageInstanceId> {
        self.inner.page_instance_id.as_ref()
    }

    /// Returns the page path, e.g. `/reports/sales.html`.
    #[inline]
    #[must_use]
    pub fn pathname(&self) -> &str {
        &self.inner.pathname
    }

    /// Returns `true` while the transport accepts frames.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.inner.closing.load(Ordering::SeqCst) && self.inner.transport.is_open()
    }

    /// Marks the session as closing.
    ///
    /// Returns `false` if it was already marked.
    #[inline]
    pub(crate) fn begin_close(&self) -> bool {
        !self.inner.closing.swap(true, Ordering::SeqCst)
    }

    /// Returns the transport this connection writes to.
    #[inline]
    pub(crate) fn transport(&self) -> &dyn Transport {
        self.inner.transport.as_ref()
    }

    /// Reads a bridge-wide setting.
    #[must_use]
    pub fn setting(&self, name: &str) -> Option<Value> {
        self.inner
            .bridge
            .upgrade()
            .and_then(|shared| shared.config.settings.get(name).cloned())
    }
}

// ============================================================================
// Connection - Sequence Number
// ============================================================================

impl Connection {
    /// Returns the cache-invalidation sequence number.
    #[inline]
    #[must_use]
    pub fn sequence_number(&self) -> u64 {
        self.inner.sequence_number.load(Ordering::SeqCst)
    }

    /// Increments the sequence number and returns the new value.
    #[inline]
    pub fn increment_sequence_number(&self) -> u64 {
        self.inner.sequence_number.fetch_add(1, Ordering::SeqCst) + 1
    }
}

// ============================================================================
// Connection - Tags
// ============================================================================

impl Connection {
    /// Returns a copy of a tag value.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<Value> {
        self.inner.tags.read().get(key).cloned()
    }

    /// Sets a tag, returning the previous value.
    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.inner.tags.write().insert(key.into(), value.into())
    }

    /// Removes a tag, returning its value.
    pub fn remove_tag(&self, key: &str) -> Option<Value> {
        self.inner.tags.write().remove(key)
    }

    /// Runs `f` with exclusive access to the whole tag bag.
    pub fn with_tags<R>(&self, f: impl FnOnce(&mut FxHashMap<String, Value>) -> R) -> R {
        f(&mut self.inner.tags.write())
    }
}

// ============================================================================
// Connection - Clock
// ============================================================================

impl Connection {
    /// Returns the client clock offset in milliseconds, once synchronized.
    #[inline]
    #[must_use]
    pub fn time_offset_ms(&self) -> Option<f64> {
        self.inner.clock.lock().offset_ms
    }

    /// Returns the last client event time, corrected to the server clock.
    #[inline]
    #[must_use]
    pub fn event_time_ms(&self) -> Option<f64> {
        self.inner.clock.lock().event_time_ms
    }

    /// Records a client timestamp and returns its corrected value.
    ///
    /// `synchronize` recomputes the offset from this timestamp first.
    pub(crate) fn record_event_time(&self, client_ms: f64, synchronize: bool) -> f64 {
        let mut clock = self.inner.clock.lock();
        if synchronize {
            clock.offset_ms = Some(client_ms - now_ms());
        }
        let corrected = client_ms - clock.offset_ms.unwrap_or_default();
        clock.event_time_ms = Some(corrected);
        corrected
    }
}

// ============================================================================
// Connection - Outbound Calls
// ============================================================================

impl Connection {
    /// Evaluates a script in the browser and waits for its value.
    ///
    /// Uses the bridge's default call timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection is already closed
    /// - [`Error::TooManyPendingCalls`] if the pending-call table is full
    /// - [`Error::BridgeStopped`] if the bridge was shut down
    pub async fn eval_js(&self, script: impl Into<String>) -> Result<Option<Value>> {
        self.call(script, CallOptions::blocking()).await
    }

    /// Evaluates a script in the browser and waits up to `wait` for its value.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::eval_js`].
    pub async fn eval_js_with_timeout(
        &self,
        script: impl Into<String>,
        wait: Duration,
    ) -> Result<Option<Value>> {
        self.call(script, CallOptions::blocking().with_timeout(wait))
            .await
    }

    /// Queues a script for evaluation without waiting for it.
    ///
    /// A script issued on a closed connection is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BridgeStopped`] if the bridge was shut down.
    pub fn eval_js_nowait(&self, script: impl Into<String>) -> Result<()> {
        let shared = self.bridge()?;
        if !self.is_open() {
            debug!(connection_id = %self.id(), "Dropping script for closed connection");
            return Ok(());
        }
        self.enqueue(&shared, CallId::generate(), script.into(), false)
    }

    /// Issues an outbound call.
    ///
    /// Returns `Ok(None)` for non-blocking calls, and for blocking calls
    /// that time out or lose their connection before a result arrives.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::eval_js`].
    pub async fn call(
        &self,
        script: impl Into<String>,
        options: CallOptions,
    ) -> Result<Option<Value>> {
        if !options.blocking {
            self.eval_js_nowait(script)?;
            return Ok(None);
        }

        let shared = self.bridge()?;
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }

        // Register before queuing so an immediate reply always finds its entry.
        let call_id = CallId::generate();
        let result_rx = shared.pending.register(call_id, self.owner())?;
        if let Err(e) = self.enqueue(&shared, call_id, script.into(), true) {
            shared.pending.abandon(call_id);
            return Err(e);
        }

        let wait = options.timeout.unwrap_or(shared.config.call_timeout);
        let pending = Arc::clone(&shared.pending);
        drop(shared);

        match timeout(wait, result_rx).await {
            Ok(Ok(value)) => Ok(Some(value)),
            Ok(Err(_)) => {
                debug!(connection_id = %self.id(), %call_id, "Call failed before a result arrived");
                Ok(None)
            }
            Err(_) => {
                pending.abandon(call_id);
                debug!(
                    connection_id = %self.id(),
                    %call_id,
                    timeout_ms = wait.as_millis() as u64,
                    "Call timed out"
                );
                Ok(None)
            }
        }
    }

    /// Hands a call to the outbound dispatcher.
    fn enqueue(
        &self,
        shared: &BridgeShared,
        call_id: CallId,
        script: String,
        expect_result: bool,
    ) -> Result<()> {
        shared.enqueue_outbound(OutboundCall {
            connection: self.clone(),
            call_id,
            script,
            expect_result,
        })
    }
}

// ============================================================================
// Connection - Peers & Exposed Procedures
// ============================================================================

impl Connection {
    /// Returns every live connection on the same page, including this one.
    #[must_use]
    pub fn broadcast_peers(&self) -> Vec<Self> {
        self.inner
            .bridge
            .upgrade()
            .map(|shared| shared.registry.broadcast(self.pathname()))
            .unwrap_or_default()
    }

    /// Invokes a plugin-exposed procedure with this connection bound.
    ///
    /// # Errors
    ///
    /// - [`Error::ProcedureNotFound`] if no plugin exposes `name`
    /// - Whatever the procedure itself returns
    pub async fn call_exposed(&self, name: &str, args: Vec<Value>) -> Result<()> {
        let procedure = self
            .bridge()?
            .procedures
            .exposed(name)
            .ok_or_else(|| Error::procedure_not_found(name))?;

        procedure
            .call(self.clone(), Invocation::new(name, args))
            .await
    }
}

// ============================================================================
// Tests
// ============================================================================
