//! Builder pattern for bridge configuration.
//!
//! Provides a fluent API for configuring and starting a [`Bridge`].
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use weblink::{Bridge, Connection, Invocation};
//!
//! # async fn example() -> weblink::Result<()> {
//! let bridge = Bridge::builder()
//!     .call_timeout(Duration::from_secs(2))
//!     .procedure("ready", |connection: Connection, _: Invocation| async move {
//!         connection.eval_js_nowait("console.log('connected')")?;
//!         Ok(())
//!     })
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::runtime::Handle;

use crate::error::{Error, Result};
use crate::plugin::Plugin;
use crate::procedure::{Procedure, ProcedureRef};
use crate::session::identity::DEFAULT_COOKIE_MAX_AGE;
use crate::session::{Connection, ConnectionHook, SecureCookie};

use super::core::Bridge;

// ============================================================================
// Constants
// ============================================================================

/// Default wait for a blocking outbound call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(1);

/// Default bound on outstanding blocking calls.
pub const DEFAULT_MAX_PENDING_CALLS: usize = 1000;

/// Default WebSocket server port.
pub const DEFAULT_PORT: u16 = 8300;

/// Default WebSocket server address.
pub const DEFAULT_BIND_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT);

// ============================================================================
// Types
// ============================================================================

/// Periodic callback run by the heartbeat task.
pub type HeartbeatCallback = Arc<dyn Fn(&Bridge) + Send + Sync>;

// ============================================================================
// BridgeConfig
// ============================================================================

/// Validated bridge settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Wait for a blocking outbound call when no timeout is given.
    pub call_timeout: Duration,
    /// Maximum number of outstanding blocking calls.
    pub max_pending_calls: usize,
    /// Address the WebSocket server binds to.
    pub bind_addr: SocketAddr,
    /// Initial tags of every new connection.
    pub extra_settings: Map<String, Value>,
    /// Settings readable through [`Connection::setting`].
    pub settings: Map<String, Value>,
    /// Heartbeat period, when a heartbeat is installed.
    pub heartbeat_interval: Option<Duration>,
    /// Verifies identity cookies; without it no call carries an identity.
    pub cookies: Option<SecureCookie>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_pending_calls: DEFAULT_MAX_PENDING_CALLS,
            bind_addr: DEFAULT_BIND_ADDR,
            extra_settings: Map::new(),
            settings: Map::new(),
            heartbeat_interval: None,
            cookies: None,
        }
    }
}

// ============================================================================
// Registration
// ============================================================================

/// Procedures collected by the builder, in registration order.
pub(crate) enum Registration {
    /// Application-wide.
    Global(String, ProcedureRef),
    /// Scoped to one page.
    Page(String, String, ProcedureRef),
    /// Exposed tier.
    Exposed(String, ProcedureRef),
}

/// Everything the bridge needs at start besides its config.
pub(crate) struct Components {
    pub(crate) plugins: Vec<Arc<dyn Plugin>>,
    pub(crate) procedures: Vec<Registration>,
    pub(crate) open_hooks: Vec<ConnectionHook>,
    pub(crate) close_hooks: Vec<ConnectionHook>,
    pub(crate) heartbeat: Option<HeartbeatCallback>,
}

// ============================================================================
// BridgeBuilder
// ============================================================================

/// Builder for configuring a [`Bridge`] instance.
///
/// Use [`Bridge::builder()`] to create a new builder.
pub struct BridgeBuilder {
    /// Wait for blocking calls.
    call_timeout: Duration,
    /// Bound on outstanding blocking calls.
    max_pending_calls: usize,
    /// WebSocket server address.
    bind_addr: SocketAddr,
    /// Initial connection tags.
    extra_settings: Map<String, Value>,
    /// Application settings.
    settings: Map<String, Value>,
    /// Installed plugins.
    plugins: Vec<Arc<dyn Plugin>>,
    /// Registered procedures.
    procedures: Vec<Registration>,
    /// Session open hooks.
    open_hooks: Vec<ConnectionHook>,
    /// Session close hooks.
    close_hooks: Vec<ConnectionHook>,
    /// Heartbeat period and callback.
    heartbeat: Option<(Duration, HeartbeatCallback)>,
    /// Key for identity cookies.
    cookie_secret: Option<Vec<u8>>,
    /// Lifetime of identity cookies.
    cookie_max_age: Duration,
}

impl Default for BridgeBuilder {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_pending_calls: DEFAULT_MAX_PENDING_CALLS,
            bind_addr: DEFAULT_BIND_ADDR,
            extra_settings: Map::new(),
            settings: Map::new(),
            plugins: Vec::new(),
            procedures: Vec::new(),
            open_hooks: Vec::new(),
            close_hooks: Vec::new(),
            heartbeat: None,
            cookie_secret: None,
            cookie_max_age: DEFAULT_COOKIE_MAX_AGE,
        }
    }
}

impl fmt::Debug for BridgeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeBuilder")
            .field("call_timeout", &self.call_timeout)
            .field("max_pending_calls", &self.max_pending_calls)
            .field("bind_addr", &self.bind_addr)
            .field("plugins", &self.plugins.len())
            .field("procedures", &self.procedures.len())
            .field("cookie_secret", &self.cookie_secret.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// BridgeBuilder - Settings
// ============================================================================

impl BridgeBuilder {
    /// Creates a builder with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default wait for blocking outbound calls.
    #[inline]
    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the bound on outstanding blocking calls.
    #[inline]
    #[must_use]
    pub fn max_pending_calls(mut self, max: usize) -> Self {
        self.max_pending_calls = max;
        self
    }

    /// Sets the WebSocket server address.
    #[inline]
    #[must_use]
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Sets the WebSocket server port on localhost.
    #[inline]
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.bind_addr.set_port(port);
        self
    }

    /// Adds an initial tag for every new connection.
    #[must_use]
    pub fn extra_setting(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra_settings.insert(key.into(), value.into());
        self
    }

    /// Adds a bridge-wide setting.
    #[must_use]
    pub fn setting(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Sets the secret that identity cookies are signed with.
    ///
    /// Must match the secret of the login flow that issues them.
    #[must_use]
    pub fn cookie_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.cookie_secret = Some(secret.into());
        self
    }

    /// Sets how long an identity cookie stays valid after signing.
    #[inline]
    #[must_use]
    pub fn cookie_max_age(mut self, max_age: Duration) -> Self {
        self.cookie_max_age = max_age;
        self
    }
}

// ============================================================================
// BridgeBuilder - Components
// ============================================================================

impl BridgeBuilder {
    /// Installs a plugin.
    #[must_use]
    pub fn plugin(mut self, plugin: impl Plugin) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Registers an application-wide procedure.
    #[must_use]
    pub fn procedure(mut self, name: impl Into<String>, procedure: impl Procedure) -> Self {
        self.procedures
            .push(Registration::Global(name.into(), Arc::new(procedure)));
        self
    }

    /// Registers a procedure visible only to `page`.
    #[must_use]
    pub fn page_procedure(
        mut self,
        page: impl Into<String>,
        name: impl Into<String>,
        procedure: impl Procedure,
    ) -> Self {
        self.procedures.push(Registration::Page(
            page.into(),
            name.into(),
            Arc::new(procedure),
        ));
        self
    }

    /// Registers a procedure in the exposed tier.
    #[must_use]
    pub fn exposed_procedure(mut self, name: impl Into<String>, procedure: impl Procedure) -> Self {
        self.procedures
            .push(Registration::Exposed(name.into(), Arc::new(procedure)));
        self
    }

    /// Adds a hook run after each session opens.
    #[must_use]
    pub fn on_connection_open(mut self, hook: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        self.open_hooks.push(Arc::new(hook));
        self
    }

    /// Adds a hook run before each session is removed.
    #[must_use]
    pub fn on_connection_close(
        mut self,
        hook: impl Fn(&Connection) + Send + Sync + 'static,
    ) -> Self {
        self.close_hooks.push(Arc::new(hook));
        self
    }

    /// Runs `callback` every `interval` until shutdown.
    #[must_use]
    pub fn heartbeat(
        mut self,
        interval: Duration,
        callback: impl Fn(&Bridge) + Send + Sync + 'static,
    ) -> Self {
        self.heartbeat = Some((interval, Arc::new(callback)));
        self
    }
}

// ============================================================================
// BridgeBuilder - Build
// ============================================================================

impl BridgeBuilder {
    /// Validates the configuration and starts the bridge.
    ///
    /// Spawns the dispatcher tasks, so it must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if a limit or interval is zero
    /// - [`Error::Config`] if the cookie secret is empty
    /// - [`Error::Config`] if called outside a tokio runtime
    pub fn build(self) -> Result<Bridge> {
        self.validate_limits()?;
        self.validate_heartbeat()?;
        let cookies = self.validate_cookies()?;
        let runtime = Self::validate_runtime()?;

        let settings = self.merged_settings();
        let config = BridgeConfig {
            call_timeout: self.call_timeout,
            max_pending_calls: self.max_pending_calls,
            bind_addr: self.bind_addr,
            extra_settings: self.extra_settings,
            settings,
            heartbeat_interval: self.heartbeat.as_ref().map(|(interval, _)| *interval),
            cookies,
        };

        let components = Components {
            plugins: self.plugins,
            procedures: self.procedures,
            open_hooks: self.open_hooks,
            close_hooks: self.close_hooks,
            heartbeat: self.heartbeat.map(|(_, callback)| callback),
        };

        Ok(Bridge::start(config, components, &runtime))
    }

    /// Plugin settings overlaid with application settings.
    fn merged_settings(&self) -> Map<String, Value> {
        let mut settings = Map::new();
        for plugin in &self.plugins {
            settings.extend(plugin.settings());
        }
        settings.extend(self.settings.clone());
        settings
    }
}

// ============================================================================
// Validation
// ============================================================================

impl BridgeBuilder {
    /// Validates timeouts and limits.
    fn validate_limits(&self) -> Result<()> {
        if self.call_timeout.is_zero() {
            return Err(Error::config(
                "call_timeout must be greater than zero.\n\
                 Example: Bridge::builder().call_timeout(Duration::from_secs(1))",
            ));
        }

        if self.max_pending_calls == 0 {
            return Err(Error::config(
                "max_pending_calls must be greater than zero.\n\
                 Example: Bridge::builder().max_pending_calls(1000)",
            ));
        }

        Ok(())
    }

    /// Validates the heartbeat interval.
    fn validate_heartbeat(&self) -> Result<()> {
        if let Some((interval, _)) = &self.heartbeat
            && interval.is_zero()
        {
            return Err(Error::config("heartbeat interval must be greater than zero"));
        }
        Ok(())
    }

    /// Builds the cookie verifier, if a secret was given.
    fn validate_cookies(&self) -> Result<Option<SecureCookie>> {
        let Some(secret) = &self.cookie_secret else {
            return Ok(None);
        };
        if self.cookie_max_age.is_zero() {
            return Err(Error::config("cookie_max_age must be greater than zero"));
        }
        Ok(Some(SecureCookie::new(secret)?.with_max_age(self.cookie_max_age)))
    }

    /// Returns the current tokio runtime.
    fn validate_runtime() -> Result<Handle> {
        Handle::try_current().map_err(|_| {
            Error::config(
                "Bridge must be built inside a tokio runtime.\n\
                 Call .build() from an async context such as #[tokio::main].",
            )
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
