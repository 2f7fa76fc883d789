//! Bridge extensions.
//!
//! A plugin packages procedures, settings and lifecycle hooks that a
//! reusable component (a charting integration, say) needs, without the
//! application wiring each piece by hand.
//!
//! | Hook | When |
//! |------|------|
//! | [`Plugin::exposed_procedures`] | once, at build; registered in the exposed tier |
//! | [`Plugin::settings`] | once, at build; merged into bridge settings |
//! | [`Plugin::on_connection_open`] | after every session opens, after application hooks |
//! | [`Plugin::on_connection_close`] | before every session is removed, after application hooks |

// ============================================================================
// Imports
// ============================================================================

use serde_json::{Map, Value};

use crate::procedure::ProcedureRef;
use crate::session::Connection;

// ============================================================================
// Plugin
// ============================================================================

/// A bundle of procedures, settings and hooks installed on a bridge.
///
/// Every method except [`Plugin::name`] has a no-op default.
///
/// # Example
///
/// ```ignore
/// struct Charts;
///
/// impl Plugin for Charts {
///     fn name(&self) -> &str {
///         "charts"
///     }
///
///     fn exposed_procedures(&self) -> Vec<(String, ProcedureRef)> {
///         vec![("update_chart".into(), Arc::new(update_chart))]
///     }
/// }
/// ```
pub trait Plugin: Send + Sync + 'static {
    /// Plugin name, for logging.
    fn name(&self) -> &str;

    /// Procedures to register in the exposed tier.
    fn exposed_procedures(&self) -> Vec<(String, ProcedureRef)> {
        Vec::new()
    }

    /// Settings merged into the bridge settings; application values win.
    fn settings(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Called after a session opens.
    fn on_connection_open(&self, _connection: &Connection) {}

    /// Called before a session is removed.
    fn on_connection_close(&self, _connection: &Connection) {}
}
