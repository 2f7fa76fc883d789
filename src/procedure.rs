//! Browser-callable procedures.
//!
//! Procedures are registered by name at startup and invoked when the
//! browser sends `call_py`. Every procedure receives the calling
//! [`Connection`] and an [`Invocation`] with the arguments.
//!
//! # Resolution
//!
//! | Order | Tier | Registered with |
//! |-------|------|-----------------|
//! | 1 | [`Tier::Exposed`] | plugins, [`ProcedureTable::register_exposed`] |
//! | 2 | [`Tier::Page`] | [`ProcedureTable::register_page`] |
//! | 3 | [`Tier::Global`] | [`ProcedureTable::register`] |
//!
//! The page tier is keyed by [`page_key`] of the calling page's path, so
//! `/reports/sales.html` and `/reports/sales` both resolve procedures
//! registered for `reports/sales`.
//!
//! # Example
//!
//! ```ignore
//! let bridge = Bridge::builder()
//!     .procedure("btn_clicked", |connection: Connection, invocation: Invocation| async move {
//!         let label: String = invocation.arg(0)?;
//!         connection.eval_js_nowait(format!("$('#out').text({})", js_string(&label)))?;
//!         Ok(())
//!     })
//!     .build()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::session::{Connection, Identity};

// ============================================================================
// Procedure
// ============================================================================

/// A procedure the browser can invoke by name.
///
/// Implemented for every `Fn(Connection, Invocation) -> impl Future<Output = Result<()>>`.
#[async_trait]
pub trait Procedure: Send + Sync + 'static {
    /// Runs the procedure.
    ///
    /// # Errors
    ///
    /// Any error is logged and reported to the browser as an alert.
    async fn call(&self, connection: Connection, invocation: Invocation) -> Result<()>;
}

#[async_trait]
impl<F, Fut> Procedure for F
where
    F: Fn(Connection, Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn call(&self, connection: Connection, invocation: Invocation) -> Result<()> {
        self(connection, invocation).await
    }
}

/// Shared procedure handle.
pub type ProcedureRef = Arc<dyn Procedure>;

// ============================================================================
// Invocation
// ============================================================================

/// Arguments and context of one inbound call.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// Procedure name as sent by the browser.
    pub name: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Authentication claims of the request that carried the call.
    pub identity: Option<Identity>,
    /// Client event time corrected to the server clock.
    pub event_time_ms: Option<f64>,
}

impl Invocation {
    /// Creates an invocation with no identity or timestamp.
    #[must_use]
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
            identity: None,
            event_time_ms: None,
        }
    }

    /// Deserializes a positional argument.
    ///
    /// A missing argument deserializes from `null`, so `Option<T>` targets
    /// accept omitted trailing arguments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the value does not fit `T`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let value = self.args.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| {
            Error::invalid_argument(format!(
                "argument {index} of {}: {e}",
                self.name
            ))
        })
    }

    /// Returns a raw positional argument.
    #[inline]
    #[must_use]
    pub fn raw_arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Returns the authenticated user name, if any.
    #[inline]
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.identity.as_ref()?.username.as_deref()
    }
}

// ============================================================================
// Tier
// ============================================================================

/// Which namespace a procedure was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Plugin-exposed.
    Exposed,
    /// Scoped to the calling page.
    Page,
    /// Application-wide.
    Global,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exposed => write!(f, "exposed"),
            Self::Page => write!(f, "page"),
            Self::Global => write!(f, "global"),
        }
    }
}

// ============================================================================
// ProcedureTable
// ============================================================================

/// Name-to-procedure registry with three resolution tiers.
#[derive(Default)]
pub struct ProcedureTable {
    /// Plugin-exposed procedures.
    exposed: RwLock<FxHashMap<String, ProcedureRef>>,
    /// Page-scoped procedures by page key.
    pages: RwLock<FxHashMap<String, FxHashMap<String, ProcedureRef>>>,
    /// Application-wide procedures.
    global: RwLock<FxHashMap<String, ProcedureRef>>,
}

impl fmt::Debug for ProcedureTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureTable")
            .field("exposed", &self.exposed.read().len())
            .field("pages", &self.pages.read().len())
            .field("global", &self.global.read().len())
            .finish()
    }
}

impl ProcedureTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an application-wide procedure, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, procedure: ProcedureRef) {
        self.global.write().insert(name.into(), procedure);
    }

    /// Registers a procedure visible only to one page.
    ///
    /// `page` is normalized with [`page_key`]. An empty key registers an
    /// application-wide procedure instead.
    pub fn register_page(&self, page: &str, name: impl Into<String>, procedure: ProcedureRef) {
        let key = page_key(page);
        if key.is_empty() {
            self.register(name, procedure);
            return;
        }
        self.pages
            .write()
            .entry(key)
            .or_default()
            .insert(name.into(), procedure);
    }

    /// Registers a plugin-exposed procedure. Exposed procedures win over
    /// every other tier.
    pub fn register_exposed(&self, name: impl Into<String>, procedure: ProcedureRef) {
        self.exposed.write().insert(name.into(), procedure);
    }

    /// Returns a plugin-exposed procedure.
    #[must_use]
    pub fn exposed(&self, name: &str) -> Option<ProcedureRef> {
        self.exposed.read().get(name).cloned()
    }

    /// Resolves a name for a call made from `pathname`.
    #[must_use]
    pub fn resolve(&self, name: &str, pathname: &str) -> Option<(Tier, ProcedureRef)> {
        if let Some(procedure) = self.exposed(name) {
            return Some((Tier::Exposed, procedure));
        }

        let key = page_key(pathname);
        if !key.is_empty()
            && let Some(procedure) = self.pages.read().get(&key).and_then(|page| page.get(name))
        {
            return Some((Tier::Page, Arc::clone(procedure)));
        }

        self.global
            .read()
            .get(name)
            .map(|procedure| (Tier::Global, Arc::clone(procedure)))
    }

    /// Returns the total number of registered procedures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.exposed.read().len()
            + self.pages.read().values().map(FxHashMap::len).sum::<usize>()
            + self.global.read().len()
    }

    /// Returns `true` if nothing is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Page Keys
// ============================================================================

/// Normalizes a page path into a page-tier key.
///
/// Drops any query or fragment, trailing `.html` suffixes and surrounding
/// slashes: `/reports/sales.html?x=1` becomes `reports/sales`.
#[must_use]
pub fn page_key(pathname: &str) -> String {
    let mut key = pathname.split(['?', '#']).next().unwrap_or_default();
    loop {
        let trimmed = key.trim_matches('/');
        let stripped = trimmed.strip_suffix(".html").unwrap_or(trimmed);
        if stripped == key {
            return key.to_string();
        }
        key = stripped;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Weak;

    use proptest::prelude::*;
    use serde_json::json;

    use crate::identifiers::ConnectionId;
    use crate::transport::channel_transport;

    fn noop() -> ProcedureRef {
        Arc::new(|_: Connection, _: Invocation| async { Ok::<_, Error>(()) })
    }

    fn tagging(tag: &'static str) -> ProcedureRef {
        Arc::new(move |connection: Connection, _: Invocation| async move {
            connection.set_tag("hit", tag);
            Ok::<_, Error>(())
        })
    }

    fn connection() -> Connection {
        let (transport, _peer) = channel_transport();
        Connection::new(
            ConnectionId::new("c"),
            "/".into(),
            None,
            FxHashMap::default(),
            Arc::new(transport),
            Weak::new(),
        )
    }

    #[test]
    fn test_page_key() {
        assert_eq!(page_key("/reports/sales.html"), "reports/sales");
        assert_eq!(page_key("/reports/sales"), "reports/sales");
        assert_eq!(page_key("/reports/sales.html?tab=2#top"), "reports/sales");
        assert_eq!(page_key("/"), "");
        assert_eq!(page_key(""), "");
        assert_eq!(page_key("/index.html"), "index");
        assert_eq!(page_key("/dir/"), "dir");
    }

    #[test]
    fn test_resolution_order() {
        let table = ProcedureTable::new();
        table.register("update_chart", noop());
        table.register_page("/charts.html", "update_chart", noop());

        let (tier, _) = table.resolve("update_chart", "/charts.html").expect("resolves");
        assert_eq!(tier, Tier::Page);

        let (tier, _) = table.resolve("update_chart", "/other.html").expect("resolves");
        assert_eq!(tier, Tier::Global);

        table.register_exposed("update_chart", noop());
        let (tier, _) = table.resolve("update_chart", "/charts.html").expect("resolves");
        assert_eq!(tier, Tier::Exposed);

        assert!(table.resolve("missing", "/charts.html").is_none());
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_root_page_registers_globally() {
        let table = ProcedureTable::new();
        table.register_page("/", "ready", noop());

        let (tier, _) = table.resolve("ready", "/anything.html").expect("resolves");
        assert_eq!(tier, Tier::Global);
    }

    #[tokio::test]
    async fn test_exposed_procedure_invoked() {
        let table = ProcedureTable::new();
        table.register("update_chart", tagging("global"));
        table.register_exposed("update_chart", tagging("plugin"));

        let connection = connection();
        let (_, procedure) = table.resolve("update_chart", "/").expect("resolves");
        procedure
            .call(connection.clone(), Invocation::new("update_chart", Vec::new()))
            .await
            .expect("call");

        assert_eq!(connection.tag("hit"), Some(json!("plugin")));
    }

    #[test]
    fn test_invocation_args() {
        let invocation = Invocation::new("f", vec![json!(3), json!("x")]);

        assert_eq!(invocation.arg::<i64>(0).expect("int"), 3);
        assert_eq!(invocation.arg::<String>(1).expect("string"), "x");
        assert_eq!(invocation.arg::<Option<i64>>(5).expect("missing"), None);
        assert!(matches!(
            invocation.arg::<i64>(1),
            Err(Error::InvalidArgument { .. })
        ));
        assert_eq!(invocation.username(), None);
    }

    proptest! {
        #[test]
        fn test_page_key_idempotent(path in "[/a-z.?#=]{0,24}") {
            let once = page_key(&path);
            prop_assert_eq!(page_key(&once), once.clone());
            prop_assert!(!once.starts_with('/'));
            prop_assert!(!once.ends_with('/'));
        }
    }
}
