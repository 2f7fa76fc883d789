//! Bridge instance and lifecycle.
//!
//! One [`Bridge`] per process owns every piece of shared state: the
//! session registry, the pending-call table, the procedure table and the
//! three dispatcher queues.
//!
//! # Architecture
//!
//! ```text
//!  app tasks ──eval_js──► outbound queue ──► outbound loop ──► Transport::send
//!                                                                    │
//!  browser ◄─────────────────────────────────────────────────────────┘
//!     │
//!     └─frame─► handle_frame ─┬─ call_py ───► inbound queue ──► inbound loop ──► Procedure
//!                             ├─ return_py ─► return queue ───► return loop ───► PendingCalls
//!                             └─ synchronize_time ─► Connection clock
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, PageInstanceId};
use crate::procedure::{Procedure, ProcedureTable};
use crate::protocol::ClientMessage;
use crate::session::{CallOptions, Connection, Identity, SessionInfo, SessionRegistry};
use crate::transport::Transport;

use super::builder::{BridgeBuilder, BridgeConfig, Components, HeartbeatCallback, Registration};
use super::inbound::{self, InboundCall};
use super::outbound::{self, OutboundCall};
use super::pending::PendingCalls;
use super::returns::{self, ReturnValue};

// ============================================================================
// BridgeShared
// ============================================================================

/// State shared by every handle and connection.
pub(crate) struct BridgeShared {
    /// Validated configuration.
    pub(crate) config: BridgeConfig,
    /// Outstanding blocking calls.
    pub(crate) pending: Arc<PendingCalls>,
    /// Browser-callable procedures.
    pub(crate) procedures: Arc<ProcedureTable>,
    /// Live sessions.
    pub(crate) registry: SessionRegistry,
    /// Page instance of each expected connection.
    page_instances: Mutex<FxHashMap<ConnectionId, PageInstanceId>>,
    /// Outbound dispatcher queue.
    outbound_tx: mpsc::UnboundedSender<OutboundCall>,
    /// Inbound dispatcher queue.
    inbound_tx: mpsc::UnboundedSender<InboundCall>,
    /// Return correlator queue.
    returns_tx: mpsc::UnboundedSender<ReturnValue>,
    /// Set to `true` on shutdown.
    shutdown_tx: watch::Sender<bool>,
    /// Cleared on shutdown.
    running: AtomicBool,
}

impl BridgeShared {
    /// Queues an outbound call.
    pub(crate) fn enqueue_outbound(&self, call: OutboundCall) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::BridgeStopped);
        }
        self.outbound_tx
            .send(call)
            .map_err(|_| Error::BridgeStopped)
    }
}

// ============================================================================
// Bridge
// ============================================================================

/// Bidirectional call bridge between server code and browser sessions.
///
/// Cheap to clone; all clones share the same state.
///
/// # Example
///
/// ```ignore
/// let bridge = Bridge::builder()
///     .procedure("ready", ready)
///     .build()?;
///
/// let server = WsServer::bind(&bridge).await?;
/// for connection in bridge.broadcast("/dashboard.html") {
///     connection.eval_js_nowait("refresh()")?;
/// }
/// ```
#[derive(Clone)]
pub struct Bridge {
    pub(crate) inner: Arc<BridgeShared>,
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("running", &self.is_running())
            .field("connections", &self.connection_count())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Bridge - Construction
// ============================================================================

impl Bridge {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::new()
    }

    /// Creates shared state and spawns the dispatcher tasks.
    pub(crate) fn start(config: BridgeConfig, components: Components, runtime: &Handle) -> Self {
        let Components {
            plugins,
            procedures: registrations,
            open_hooks,
            close_hooks,
            heartbeat,
        } = components;

        let procedures = Arc::new(ProcedureTable::new());
        for registration in registrations {
            match registration {
                Registration::Global(name, procedure) => procedures.register(name, procedure),
                Registration::Page(page, name, procedure) => {
                    procedures.register_page(&page, name, procedure);
                }
                Registration::Exposed(name, procedure) => {
                    procedures.register_exposed(name, procedure);
                }
            }
        }
        for plugin in &plugins {
            for (name, procedure) in plugin.exposed_procedures() {
                debug!(plugin = plugin.name(), procedure = %name, "Registering exposed procedure");
                procedures.register_exposed(name, procedure);
            }
        }

        let registry = SessionRegistry::new(plugins);
        for hook in open_hooks {
            registry.add_open_hook(hook);
        }
        for hook in close_hooks {
            registry.add_close_hook(hook);
        }

        let pending = Arc::new(PendingCalls::new(config.max_pending_calls));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (returns_tx, returns_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        runtime.spawn(outbound::run(
            outbound_rx,
            Arc::clone(&pending),
            shutdown_rx.clone(),
        ));
        runtime.spawn(inbound::run(
            inbound_rx,
            Arc::clone(&procedures),
            shutdown_rx.clone(),
        ));
        runtime.spawn(returns::run(
            returns_rx,
            Arc::clone(&pending),
            shutdown_rx.clone(),
        ));

        let heartbeat_interval = config.heartbeat_interval;
        let inner = Arc::new(BridgeShared {
            config,
            pending,
            procedures,
            registry,
            page_instances: Mutex::new(FxHashMap::default()),
            outbound_tx,
            inbound_tx,
            returns_tx,
            shutdown_tx,
            running: AtomicBool::new(true),
        });

        if let (Some(interval), Some(callback)) = (heartbeat_interval, heartbeat) {
            runtime.spawn(run_heartbeat(
                Arc::downgrade(&inner),
                interval,
                callback,
                shutdown_rx,
            ));
        }

        info!(
            procedures = inner.procedures.len(),
            call_timeout_ms = inner.config.call_timeout.as_millis() as u64,
            "Bridge started"
        );

        Self { inner }
    }
}

// ============================================================================
// Bridge - Sessions
// ============================================================================

impl Bridge {
    /// Registers a new session on `transport`.
    ///
    /// Runs the open hooks before returning.
    pub fn open(&self, transport: Arc<dyn Transport>, info: SessionInfo) -> Connection {
        let id = info.connection_id.unwrap_or_else(ConnectionId::generate);
        let page_instance_id = self.inner.page_instances.lock().get(&id).cloned();
        let tags = self
            .inner
            .config
            .extra_settings
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let connection = Connection::new(
            id,
            info.pathname,
            page_instance_id,
            tags,
            transport,
            Arc::downgrade(&self.inner),
        );

        info!(connection_id = %connection.id(), pathname = connection.pathname(), "Connection opened");
        self.inner.registry.open(connection.clone());
        connection
    }

    /// Closes a session.
    ///
    /// Runs the close hooks, removes the session, closes its transport and
    /// wakes its blocked callers with no value. Unknown ids are ignored.
    pub fn close(&self, connection_id: &ConnectionId) {
        if let Some(connection) = self.inner.registry.get(connection_id) {
            self.close_connection(&connection);
        }
    }

    /// Closes one specific session handle.
    ///
    /// Unlike [`Bridge::close`], a newer connection registered under the
    /// same id after a reconnect is left open, along with its pending calls.
    pub fn close_connection(&self, connection: &Connection) {
        let first = self.inner.registry.close_handle(connection);
        connection.transport().close();
        let failed = self.inner.pending.fail_connection(&connection.owner());

        if first {
            info!(connection_id = %connection.id(), failed_calls = failed, "Connection closed");
        }
    }

    /// Associates a page render with the connection id its page will use.
    ///
    /// The page instance is copied onto every connection opened with this
    /// id, so state keyed by it survives a reconnect.
    pub fn map_page_instance(
        &self,
        connection_id: impl Into<ConnectionId>,
        page_instance_id: impl Into<PageInstanceId>,
    ) {
        self.inner
            .page_instances
            .lock()
            .insert(connection_id.into(), page_instance_id.into());
    }

    /// Forgets a page-instance mapping.
    pub fn unmap_page_instance(&self, connection_id: &ConnectionId) -> Option<PageInstanceId> {
        self.inner.page_instances.lock().remove(connection_id)
    }

    /// Returns a live session by id.
    #[must_use]
    pub fn connection(&self, connection_id: &ConnectionId) -> Option<Connection> {
        self.inner.registry.get(connection_id)
    }

    /// Returns every live session.
    #[must_use]
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.registry.all()
    }

    /// Returns every live session on a page path.
    #[must_use]
    pub fn broadcast(&self, pathname: &str) -> Vec<Connection> {
        self.inner.registry.broadcast(pathname)
    }

    /// Returns every live session matching a predicate.
    #[must_use]
    pub fn broadcast_where(&self, predicate: impl Fn(&Connection) -> bool) -> Vec<Connection> {
        self.inner.registry.broadcast_where(predicate)
    }

    /// Returns the number of live sessions.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }
}

// ============================================================================
// Bridge - Frames
// ============================================================================

impl Bridge {
    /// Processes one text frame from a browser.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the frame is not a known message
    /// - [`Error::BridgeStopped`] if the bridge was shut down
    pub fn handle_frame(&self, connection: &Connection, text: &str) -> Result<()> {
        self.handle_frame_as(connection, text, None)
    }

    /// Verifies the identity cookies of a `Cookie` header.
    ///
    /// Returns `None` if no cookie secret is configured or no claim cookie
    /// carries a valid signature.
    #[must_use]
    pub fn identity_from_cookies(&self, header: &str) -> Option<Identity> {
        let cookies = self.inner.config.cookies.as_ref()?;
        Identity::from_cookie_header(header, cookies)
    }

    /// Processes one text frame carrying request-scoped claims.
    ///
    /// # Errors
    ///
    /// Same as [`Bridge::handle_frame`].
    pub fn handle_frame_as(
        &self,
        connection: &Connection,
        text: &str,
        identity: Option<Identity>,
    ) -> Result<()> {
        if !self.is_running() {
            return Err(Error::BridgeStopped);
        }

        let message = ClientMessage::parse(text)?;
        trace!(connection_id = %connection.id(), cmd = message.cmd(), "Handling frame");
        let synchronize = matches!(message, ClientMessage::SynchronizeTime { .. });
        let event_time_ms = message
            .event_time_ms()
            .map(|client_ms| connection.record_event_time(client_ms, synchronize));

        match message {
            ClientMessage::SynchronizeTime { .. } => {
                debug!(
                    connection_id = %connection.id(),
                    offset_ms = connection.time_offset_ms(),
                    "Client clock synchronized"
                );
                Ok(())
            }

            ClientMessage::CallPy(call) => self
                .inner
                .inbound_tx
                .send(InboundCall {
                    connection: connection.clone(),
                    name: call.py_func_name,
                    args: call.args,
                    pathname: call.window_location_pathname,
                    no_error_if_undefined: call.no_error_if_undefined,
                    new_thread: call.new_thread,
                    identity,
                    event_time_ms,
                })
                .map_err(|_| Error::BridgeStopped),

            ClientMessage::ReturnPy(ret) => self
                .inner
                .returns_tx
                .send(ReturnValue {
                    from: connection.owner(),
                    caller_id: ret.caller_id,
                    value: ret.retval,
                })
                .map_err(|_| Error::BridgeStopped),
        }
    }
}

// ============================================================================
// Bridge - Calls & Procedures
// ============================================================================

impl Bridge {
    /// Evaluates a script on a connection.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::call`].
    pub async fn eval_js(
        &self,
        connection: &Connection,
        script: impl Into<String>,
        blocking: bool,
    ) -> Result<Option<Value>> {
        let options = if blocking {
            CallOptions::blocking()
        } else {
            CallOptions::nowait()
        };
        connection.call(script, options).await
    }

    /// Evaluates a script on the live connection with this id.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionNotFound`] if no live connection has this id
    /// - Otherwise same as [`Connection::call`]
    pub async fn eval_js_on(
        &self,
        connection_id: &ConnectionId,
        script: impl Into<String>,
        blocking: bool,
    ) -> Result<Option<Value>> {
        let connection = self
            .connection(connection_id)
            .ok_or_else(|| Error::connection_not_found(connection_id.clone()))?;
        self.eval_js(&connection, script, blocking).await
    }

    /// Registers an application-wide procedure.
    pub fn register_procedure(&self, name: impl Into<String>, procedure: impl Procedure) {
        self.inner.procedures.register(name, Arc::new(procedure));
    }

    /// Registers a procedure visible only to `page`.
    pub fn register_page_procedure(
        &self,
        page: &str,
        name: impl Into<String>,
        procedure: impl Procedure,
    ) {
        self.inner
            .procedures
            .register_page(page, name, Arc::new(procedure));
    }

    /// Registers a procedure in the exposed tier.
    pub fn register_exposed_procedure(&self, name: impl Into<String>, procedure: impl Procedure) {
        self.inner
            .procedures
            .register_exposed(name, Arc::new(procedure));
    }

    /// Adds a hook run after each session opens.
    pub fn on_connection_open(&self, hook: impl Fn(&Connection) + Send + Sync + 'static) {
        self.inner.registry.add_open_hook(Arc::new(hook));
    }

    /// Adds a hook run before each session is removed.
    pub fn on_connection_close(&self, hook: impl Fn(&Connection) + Send + Sync + 'static) {
        self.inner.registry.add_close_hook(Arc::new(hook));
    }
}

// ============================================================================
// Bridge - Lifecycle
// ============================================================================

impl Bridge {
    /// Returns the validated configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Returns the number of outstanding blocking calls.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Returns `true` until [`Bridge::shutdown`] is called.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Returns a receiver that flips to `true` on shutdown.
    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }

    /// Stops the dispatchers, closes every session and wakes every
    /// blocked caller with no value.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Bridge shutting down");
        self.inner.shutdown_tx.send_replace(true);

        for connection in self.connections() {
            self.close_connection(&connection);
        }

        let failed = self.inner.pending.fail_all();
        if failed > 0 {
            warn!(failed_calls = failed, "Pending calls failed at shutdown");
        }

        info!("Bridge shutdown complete");
    }
}

// ============================================================================
// Heartbeat
// ============================================================================

/// Runs the heartbeat callback until shutdown or until the bridge is dropped.
async fn run_heartbeat(
    shared: Weak<BridgeShared>,
    interval: Duration,
    callback: HeartbeatCallback,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    debug!(interval_ms = interval.as_millis() as u64, "Heartbeat started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait_for(|stopped| *stopped) => break,
        }

        let Some(inner) = shared.upgrade() else {
            break;
        };
        let bridge = Bridge { inner };

        if catch_unwind(AssertUnwindSafe(|| callback(&bridge))).is_err() {
            error!("Heartbeat callback panicked");
        }
    }

    debug!("Heartbeat terminated");
}
