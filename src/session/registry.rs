//! Live session registry.
//!
//! Tracks every open [`Connection`] by id and runs lifecycle hooks.
//!
//! # Hook Order
//!
//! | Event | Order |
//! |-------|-------|
//! | open | insert, application hooks, plugin hooks |
//! | close | application hooks, plugin hooks, remove |
//!
//! Hooks run synchronously on the task that opened or closed the session.
//! A panicking hook is logged and skipped; the remaining hooks still run.

// ============================================================================
// Imports
// ============================================================================

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, error};

use crate::identifiers::ConnectionId;
use crate::plugin::Plugin;

use super::Connection;

// ============================================================================
// Types
// ============================================================================

/// Callback run when a session opens or closes.
pub type ConnectionHook = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Registered lifecycle hooks.
#[derive(Default)]
struct Hooks {
    /// Run after a session is registered.
    open: Vec<ConnectionHook>,
    /// Run before a session is removed.
    close: Vec<ConnectionHook>,
}

// ============================================================================
// SessionRegistry
// ============================================================================

/// Concurrency-safe map of live sessions.
pub struct SessionRegistry {
    /// Live sessions.
    connections: RwLock<FxHashMap<ConnectionId, Connection>>,
    /// Application hooks.
    hooks: RwLock<Hooks>,
    /// Plugins whose hooks run after the application's.
    plugins: Vec<Arc<dyn Plugin>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self {
            connections: RwLock::new(FxHashMap::default()),
            hooks: RwLock::new(Hooks::default()),
            plugins,
        }
    }

    /// Adds a hook run after each session opens.
    pub fn add_open_hook(&self, hook: ConnectionHook) {
        self.hooks.write().open.push(hook);
    }

    /// Adds a hook run before each session is removed.
    pub fn add_close_hook(&self, hook: ConnectionHook) {
        self.hooks.write().close.push(hook);
    }
}

// ============================================================================
// SessionRegistry - Lifecycle
// ============================================================================

impl SessionRegistry {
    /// Registers a session and runs the open hooks.
    ///
    /// A session already registered under the same id is replaced.
    pub fn open(&self, connection: Connection) {
        let replaced = self
            .connections
            .write()
            .insert(connection.id().clone(), connection.clone());

        if replaced.is_some() {
            debug!(connection_id = %connection.id(), "Session id reused, previous handle replaced");
        }

        let hooks = self.hooks.read().open.clone();
        for hook in &hooks {
            run_hook("open", hook.as_ref(), &connection);
        }
        for plugin in &self.plugins {
            run_hook("open", |c| plugin.on_connection_open(c), &connection);
        }
    }

    /// Runs the close hooks and removes the session.
    ///
    /// Returns the removed session, or `None` if it was not registered or
    /// is already closing.
    pub fn close(&self, connection_id: &ConnectionId) -> Option<Connection> {
        let connection = self.get(connection_id)?;
        self.close_handle(&connection).then_some(connection)
    }

    /// Runs the close hooks for one specific handle and deregisters it.
    ///
    /// Returns `false` if the handle was already closing. A newer session
    /// registered under the same id stays registered.
    pub fn close_handle(&self, connection: &Connection) -> bool {
        if !connection.begin_close() {
            return false;
        }

        let hooks = self.hooks.read().close.clone();
        for hook in &hooks {
            run_hook("close", hook.as_ref(), connection);
        }
        for plugin in &self.plugins {
            run_hook("close", |c| plugin.on_connection_close(c), connection);
        }

        let mut connections = self.connections.write();
        if connections
            .get(connection.id())
            .is_some_and(|current| Arc::ptr_eq(&current.inner, &connection.inner))
        {
            connections.remove(connection.id());
        }

        true
    }
}

// ============================================================================
// SessionRegistry - Queries
// ============================================================================

impl SessionRegistry {
    /// Returns a session by id.
    #[must_use]
    pub fn get(&self, connection_id: &ConnectionId) -> Option<Connection> {
        self.connections.read().get(connection_id).cloned()
    }

    /// Returns every live session.
    #[must_use]
    pub fn all(&self) -> Vec<Connection> {
        self.connections.read().values().cloned().collect()
    }

    /// Returns every live session on a page path.
    #[must_use]
    pub fn broadcast(&self, pathname: &str) -> Vec<Connection> {
        self.broadcast_where(|connection| connection.pathname() == pathname)
    }

    /// Returns every live session matching a predicate.
    #[must_use]
    pub fn broadcast_where(&self, predicate: impl Fn(&Connection) -> bool) -> Vec<Connection> {
        self.connections
            .read()
            .values()
            .filter(|connection| predicate(connection))
            .cloned()
            .collect()
    }

    /// Returns the number of live sessions.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Returns `true` if no session is live.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Runs a hook, logging instead of propagating a panic.
fn run_hook(event: &'static str, hook: impl Fn(&Connection), connection: &Connection) {
    if catch_unwind(AssertUnwindSafe(|| hook(connection))).is_err() {
        error!(connection_id = %connection.id(), event, "Connection hook panicked");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Weak;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use crate::transport::channel_transport;

    fn connection(id: &str, pathname: &str) -> Connection {
        let (transport, _peer) = channel_transport();
        Connection::new(
            ConnectionId::new(id),
            pathname.into(),
            None,
            FxHashMap::default(),
            Arc::new(transport),
            Weak::new(),
        )
    }

    struct CountingPlugin {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Plugin for CountingPlugin {
        fn name(&self) -> &str {
            "counting"
        }

        fn on_connection_open(&self, connection: &Connection) {
            self.events.lock().push(format!("plugin-open:{}", connection.id()));
        }

        fn on_connection_close(&self, connection: &Connection) {
            self.events.lock().push(format!("plugin-close:{}", connection.id()));
        }
    }

    #[test]
    fn test_open_get_close() {
        let registry = SessionRegistry::new(Vec::new());
        registry.open(connection("a", "/"));

        assert_eq!(registry.len(), 1);
        assert!(registry.get(&ConnectionId::new("a")).is_some());

        assert!(registry.close(&ConnectionId::new("a")).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let registry = SessionRegistry::new(Vec::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        registry.add_close_hook(Arc::new(move |_: &Connection| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        registry.open(connection("a", "/"));
        assert!(registry.close(&ConnectionId::new("a")).is_some());
        assert!(registry.close(&ConnectionId::new("a")).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let plugin = Arc::new(CountingPlugin {
            events: Arc::clone(&events),
        });
        let registry = SessionRegistry::new(vec![plugin]);

        let log = Arc::clone(&events);
        registry.add_open_hook(Arc::new(move |c: &Connection| log.lock().push(format!("open:{}", c.id()))));
        let log = Arc::clone(&events);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_hook = Arc::clone(&seen);
        let registry = Arc::new(registry);
        let registry_in_hook = Arc::downgrade(&registry);
        registry.add_close_hook(Arc::new(move |c: &Connection| {
            // Still registered while close hooks run.
            if let Some(registry) = registry_in_hook.upgrade() {
                seen_in_hook.store(registry.len(), Ordering::SeqCst);
            }
            log.lock().push(format!("close:{}", c.id()));
        }));

        registry.open(connection("a", "/"));
        registry.close(&ConnectionId::new("a"));

        assert_eq!(
            *events.lock(),
            vec!["open:a", "plugin-open:a", "close:a", "plugin-close:a"]
        );
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_hook_is_contained() {
        let registry = SessionRegistry::new(Vec::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);

        registry.add_open_hook(Arc::new(|_: &Connection| panic!("hook failure")));
        registry.add_open_hook(Arc::new(move |_: &Connection| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        registry.open(connection("a", "/"));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_broadcast_by_pathname() {
        let registry = SessionRegistry::new(Vec::new());
        registry.open(connection("a", "/charts.html"));
        registry.open(connection("b", "/charts.html"));
        registry.open(connection("c", "/other.html"));

        let mut ids: Vec<_> = registry
            .broadcast("/charts.html")
            .iter()
            .map(|c| c.id().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);

        let others = registry.broadcast_where(|c| c.pathname() != "/charts.html");
        assert_eq!(others.len(), 1);
        assert_eq!(registry.all().len(), 3);
    }

    #[test]
    fn test_stale_handle_keeps_replacement() {
        let registry = SessionRegistry::new(Vec::new());
        let stale = connection("a", "/");
        registry.open(stale.clone());
        let fresh = connection("a", "/");
        registry.open(fresh.clone());

        assert!(registry.close_handle(&stale));
        let current = registry.get(&ConnectionId::new("a")).expect("replacement");
        assert!(Arc::ptr_eq(&current.inner, &fresh.inner));
    }
}
