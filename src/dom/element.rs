//! jQuery element accessor.
//!
//! An [`Element`] names a jQuery selector on one connection and turns
//! method reads and writes into `eval_js` calls.
//!
//! | Call | Script | Waits |
//! |------|--------|-------|
//! | `get("html")` | `$("#out").html()` | yes |
//! | `set("html", "hi")` | `$("#out").html("hi")` | no |
//! | `css("color")` | `$("#out").css("color")` | yes |
//! | `set_css("color", "red")` | `$("#out").css("color", "red")` | no |
//! | `prop("checked")` | `$("#out").prop("checked")` | yes |
//! | `set_prop("checked", true)` | `$("#out").prop("checked", true)` | no |
//!
//! # Example
//!
//! ```ignore
//! use weblink::dom::{Code, element};
//!
//! let out = element(&connection, "#divout");
//! out.set("html", "Current time: 12:00")?;
//! out.set_css("color", "red")?;
//! out.set("click", Code::new("function() { alert('hi'); }"))?;
//!
//! let html = out.get("html").await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde_json::Value;

use crate::error::Result;
use crate::session::Connection;

use super::js_string;

// ============================================================================
// ToJs
// ============================================================================

/// A value that can be written into a script as a JavaScript expression.
///
/// Strings are quoted and escaped. Booleans and numbers are written bare.
/// [`Code`] is written verbatim.
pub trait ToJs {
    /// Returns the JavaScript source for this value.
    fn to_js(&self) -> String;
}

impl<T: ToJs + ?Sized> ToJs for &T {
    fn to_js(&self) -> String {
        (**self).to_js()
    }
}

impl ToJs for str {
    fn to_js(&self) -> String {
        js_string(self)
    }
}

impl ToJs for String {
    fn to_js(&self) -> String {
        js_string(self)
    }
}

impl ToJs for bool {
    fn to_js(&self) -> String {
        if *self { "true" } else { "false" }.to_string()
    }
}

macro_rules! impl_to_js_number {
    ($($ty:ty),*) => {
        $(
            impl ToJs for $ty {
                fn to_js(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

impl_to_js_number!(i32, i64, u32, u64, usize, f32, f64);

impl ToJs for Value {
    fn to_js(&self) -> String {
        self.to_string()
    }
}

// ============================================================================
// Code
// ============================================================================

/// Raw JavaScript written into a script without quoting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Code(String);

impl Code {
    /// Wraps JavaScript source.
    #[inline]
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Returns the JavaScript source.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ToJs for Code {
    fn to_js(&self) -> String {
        self.0.clone()
    }
}

// ============================================================================
// Element
// ============================================================================

/// Elements matched by a jQuery selector on one connection.
#[derive(Clone)]
pub struct Element {
    /// Page the element lives on.
    connection: Connection,
    /// jQuery selector.
    selector: String,
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("connection_id", self.connection.id())
            .field("selector", &self.selector)
            .finish()
    }
}

/// Selects elements on a connection's page.
#[must_use]
pub fn element(connection: &Connection, selector: impl Into<String>) -> Element {
    Element {
        connection: connection.clone(),
        selector: selector.into(),
    }
}

// ============================================================================
// Element - Accessors
// ============================================================================

impl Element {
    /// Returns the selector.
    #[inline]
    #[must_use]
    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// Calls a jQuery getter and waits for its value.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::call`].
    pub async fn get(&self, method: &str) -> Result<Option<Value>> {
        self.connection.eval_js(self.getter_script(method, None)).await
    }

    /// Calls a jQuery setter without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BridgeStopped`](crate::Error::BridgeStopped) if the
    /// bridge was shut down.
    pub fn set(&self, method: &str, value: impl ToJs) -> Result<()> {
        self.connection
            .eval_js_nowait(self.setter_script(method, None, &value))
    }

    /// Reads a CSS property.
    ///
    /// # Errors
    ///
    /// Same as [`Element::get`].
    pub async fn css(&self, name: &str) -> Result<Option<Value>> {
        self.connection
            .eval_js(self.getter_script("css", Some(name)))
            .await
    }

    /// Sets a CSS property without waiting.
    ///
    /// # Errors
    ///
    /// Same as [`Element::set`].
    pub fn set_css(&self, name: &str, value: impl ToJs) -> Result<()> {
        self.connection
            .eval_js_nowait(self.setter_script("css", Some(name), &value))
    }

    /// Reads a DOM property.
    ///
    /// # Errors
    ///
    /// Same as [`Element::get`].
    pub async fn prop(&self, name: &str) -> Result<Option<Value>> {
        self.connection
            .eval_js(self.getter_script("prop", Some(name)))
            .await
    }

    /// Sets a DOM property without waiting.
    ///
    /// # Errors
    ///
    /// Same as [`Element::set`].
    pub fn set_prop(&self, name: &str, value: impl ToJs) -> Result<()> {
        self.connection
            .eval_js_nowait(self.setter_script("prop", Some(name), &value))
    }
}

// ============================================================================
// Element - Scripts
// ============================================================================

impl Element {
    /// `$(<selector>)`
    fn selector_code(&self) -> String {
        format!("$({})", js_string(&self.selector))
    }

    fn getter_script(&self, method: &str, name: Option<&str>) -> String {
        match name {
            Some(name) => format!("{}.{method}({})", self.selector_code(), js_string(name)),
            None => format!("{}.{method}()", self.selector_code()),
        }
    }

    fn setter_script(&self, method: &str, name: Option<&str>, value: &dyn ToJs) -> String {
        match name {
            Some(name) => format!(
                "{}.{method}({}, {})",
                self.selector_code(),
                js_string(name),
                value.to_js()
            ),
            None => format!("{}.{method}({})", self.selector_code(), value.to_js()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Weak};

    use rustc_hash::FxHashMap;
    use serde_json::json;

    use crate::identifiers::ConnectionId;
    use crate::transport::channel_transport;

    fn divout() -> Element {
        let (transport, _peer) = channel_transport();
        let connection = Connection::new(
            ConnectionId::new("c1"),
            "/".into(),
            None,
            FxHashMap::default(),
            Arc::new(transport),
            Weak::new(),
        );
        element(&connection, "#divout")
    }

    #[test]
    fn test_getter_scripts() {
        let el = divout();
        assert_eq!(el.getter_script("html", None), r##"$("#divout").html()"##);
        assert_eq!(el.getter_script("css", Some("color")), r##"$("#divout").css("color")"##);
    }

    #[test]
    fn test_setter_quotes_strings() {
        let el = divout();
        assert_eq!(
            el.setter_script("html", None, &r#"AS"'DF2"#),
            r##"$("#divout").html("AS\"'DF2")"##
        );
        assert_eq!(
            el.setter_script("html", None, &String::from("a\\b")),
            r##"$("#divout").html("a\\b")"##
        );
    }

    #[test]
    fn test_setter_bare_scalars() {
        let el = divout();
        assert_eq!(
            el.setter_script("prop", Some("checked"), &true),
            r##"$("#divout").prop("checked", true)"##
        );
        assert_eq!(
            el.setter_script("css", Some("opacity"), &0.5),
            r##"$("#divout").css("opacity", 0.5)"##
        );
        assert_eq!(el.setter_script("val", None, &42), r##"$("#divout").val(42)"##);
        assert_eq!(
            el.setter_script("data", None, &json!({ "k": [1, 2] })),
            r##"$("#divout").data({"k":[1,2]})"##
        );
    }

    #[test]
    fn test_setter_raw_code() {
        let el = divout();
        let handler = Code::new(r#"function() { alert("AA"); }"#);
        assert_eq!(
            el.setter_script("click", None, &handler),
            r##"$("#divout").click(function() { alert("AA"); })"##
        );
    }

    #[test]
    fn test_selector_is_escaped() {
        let (transport, _peer) = channel_transport();
        let connection = Connection::new(
            ConnectionId::new("c1"),
            "/".into(),
            None,
            FxHashMap::default(),
            Arc::new(transport),
            Weak::new(),
        );
        let el = element(&connection, "input[name='q']");
        assert_eq!(el.selector(), "input[name='q']");
        assert_eq!(el.getter_script("val", None), r#"$("input[name='q']").val()"#);
    }
}
