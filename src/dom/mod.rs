//! Convenience calls into the browser page.
//!
//! Thin wrappers over [`Connection::eval_js`] for things applications do
//! often. The page is expected to load jQuery and Bootstrap; the download
//! helper expects the client script's `browser_download` function.
//!
//! | Helper | Waits |
//! |--------|-------|
//! | [`element()`] getters / setters | yes / no |
//! | [`alert`] | no |
//! | [`browser_download`] | caller's choice |
//! | `select_*` | yes |
//! | `modal_*` | yes |

// ============================================================================
// Submodules
// ============================================================================

pub mod element;

pub use element::{Code, Element, ToJs, element};

// ============================================================================
// Imports
// ============================================================================

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::session::Connection;

// ============================================================================
// Constants
// ============================================================================

/// Element id used when no modal id is given.
pub const DEFAULT_MODAL_ID: &str = "jsclient_modal";

/// Element id of the text box created by [`modal_input`].
const MODAL_INPUT_ID: &str = "modal_input";

// ============================================================================
// Escaping
// ============================================================================

/// Quotes a string as a JavaScript string literal.
#[must_use]
pub fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\""))
}

// ============================================================================
// Alerts & Downloads
// ============================================================================

/// Shows a native `alert()` without waiting for it.
///
/// # Errors
///
/// Returns [`Error::BridgeStopped`](crate::Error::BridgeStopped) if the
/// bridge was shut down.
pub fn alert(connection: &Connection, text: &str) -> Result<()> {
    connection.eval_js_nowait(format!("alert({});", js_string(text)))
}

/// Sends a file to the browser as a download.
///
/// With `blocking`, waits until the browser has handed the file to its
/// download manager.
///
/// # Errors
///
/// Same as [`Connection::call`].
pub async fn browser_download(
    connection: &Connection,
    filename: &str,
    data: &[u8],
    blocking: bool,
) -> Result<()> {
    debug!(connection_id = %connection.id(), filename, len = data.len(), "Sending browser download");

    let script = download_script(filename, data);
    if blocking {
        connection.eval_js(script).await?;
    } else {
        connection.eval_js_nowait(script)?;
    }
    Ok(())
}

fn download_script(filename: &str, data: &[u8]) -> String {
    format!(
        "browser_download({}, {});",
        js_string(filename),
        js_string(&STANDARD.encode(data))
    )
}

// ============================================================================
// Select Elements
// ============================================================================

/// One `<option>` of a `<select>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    /// `value` attribute.
    pub value: String,
    /// Display text.
    pub text: String,
}

impl SelectOption {
    /// Creates an option.
    #[must_use]
    pub fn new(value: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            text: text.into(),
        }
    }
}

impl From<&str> for SelectOption {
    /// Uses the same string for value and text.
    fn from(value: &str) -> Self {
        Self::new(value, value)
    }
}

/// Returns every option of the select matched by `selector`.
///
/// Returns `None` if the browser did not answer in time.
///
/// # Errors
///
/// Same as [`Connection::eval_js`].
pub async fn select_get_options(
    connection: &Connection,
    selector: &str,
) -> Result<Option<Vec<SelectOption>>> {
    let value = connection
        .eval_js(options_query(&format!("{selector} option")))
        .await?;
    Ok(value.map(parse_options))
}

/// Returns the selected options of the select matched by `selector`.
///
/// # Errors
///
/// Same as [`Connection::eval_js`].
pub async fn select_get_selected_options(
    connection: &Connection,
    selector: &str,
) -> Result<Option<Vec<SelectOption>>> {
    let value = connection
        .eval_js(options_query(&format!("{selector} :selected")))
        .await?;
    Ok(value.map(parse_options))
}

/// Replaces every option of the select matched by `selector`.
///
/// # Errors
///
/// Same as [`Connection::eval_js`].
pub async fn select_set_options(
    connection: &Connection,
    selector: &str,
    options: &[SelectOption],
) -> Result<()> {
    let pairs: Vec<[&str; 2]> = options
        .iter()
        .map(|option| [option.value.as_str(), option.text.as_str()])
        .collect();
    let pairs = serde_json::to_string(&pairs)?;
    let selector = js_string(selector);

    connection
        .eval_js(format!(
            "$({selector}).empty();\n\
             $.each({pairs}, function(key, value) {{\n\
                 $({selector}).append($(\"<option></option>\").attr(\"value\", value[0]).text(value[1]));\n\
             }});"
        ))
        .await?;
    Ok(())
}

/// Selects the options with the given values.
///
/// # Errors
///
/// Same as [`Connection::eval_js`].
pub async fn select_set_selected_options<S: AsRef<str>>(
    connection: &Connection,
    selector: &str,
    values: &[S],
) -> Result<()> {
    let values: Vec<&str> = values.iter().map(AsRef::as_ref).collect();
    connection
        .eval_js(format!(
            "$({}).val({})",
            js_string(selector),
            serde_json::to_string(&values)?
        ))
        .await?;
    Ok(())
}

/// Script collecting `[value, html]` pairs of matched options.
fn options_query(selector: &str) -> String {
    format!(
        "$({}).map(function(){{return [[$(this).attr(\"value\"), $(this).html()]]}}).get()",
        js_string(selector)
    )
}

/// Reads `[[value, text], ...]`; a missing value attribute reads as empty.
fn parse_options(value: Value) -> Vec<SelectOption> {
    let Value::Array(items) = value else {
        return Vec::new();
    };

    items
        .into_iter()
        .filter_map(|item| {
            let pair = item.as_array()?;
            let field = |i: usize| {
                pair.get(i)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            Some(SelectOption::new(field(0), field(1)))
        })
        .collect()
}

// ============================================================================
// Modal Dialogs
// ============================================================================

/// A button in a modal footer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModalButton {
    /// Button label (HTML).
    pub text: String,
    /// Extra CSS classes, e.g. `btn-primary`.
    pub classes: String,
    /// Extra attributes, e.g. `onclick="call_py('saved')"`.
    pub attributes: String,
}

impl ModalButton {
    /// Creates a button.
    #[must_use]
    pub fn new(
        text: impl Into<String>,
        classes: impl Into<String>,
        attributes: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            classes: classes.into(),
            attributes: attributes.into(),
        }
    }
}

/// Replaces the modal `modal_id` with a new one and optionally shows it.
///
/// # Errors
///
/// Same as [`Connection::eval_js`].
pub async fn modal_new(
    connection: &Connection,
    title: &str,
    body: &str,
    buttons: &[ModalButton],
    modal_id: &str,
    autoshow: bool,
) -> Result<()> {
    connection
        .eval_js(modal_script(title, body, buttons, modal_id))
        .await?;

    if autoshow {
        modal_show(connection, modal_id).await?;
    }
    Ok(())
}

/// Shows a modal created by [`modal_new`].
///
/// # Errors
///
/// Same as [`Connection::eval_js`].
pub async fn modal_show(connection: &Connection, modal_id: &str) -> Result<()> {
    connection
        .eval_js(format!("$({}).modal('show')", js_string(&format!("#{modal_id}"))))
        .await?;
    Ok(())
}

/// Shows a message with an OK button.
///
/// `callback` is extra attributes for the OK button.
///
/// # Errors
///
/// Same as [`Connection::eval_js`].
pub async fn modal_alert(connection: &Connection, title: &str, body: &str, callback: &str) -> Result<()> {
    let buttons = [ModalButton::new(
        "OK",
        "btn-primary",
        format!("data-bs-dismiss=\"modal\" {callback}"),
    )];
    modal_new(
        connection,
        &format!("<span class=text-danger>{title}</span>"),
        body,
        &buttons,
        DEFAULT_MODAL_ID,
        true,
    )
    .await
}

/// Shows a question with Cancel and OK buttons.
///
/// # Errors
///
/// Same as [`Connection::eval_js`].
pub async fn modal_confirm(
    connection: &Connection,
    title: &str,
    body: &str,
    callback: &str,
) -> Result<()> {
    let buttons = [
        ModalButton::new("Cancel", "btn-secondary", "data-bs-dismiss=\"modal\""),
        ModalButton::new(
            "OK",
            "btn-danger",
            format!("data-bs-dismiss=\"modal\" {callback}"),
        ),
    ];
    modal_new(
        connection,
        &format!("<span class=text-danger>{title}</span>"),
        body,
        &buttons,
        DEFAULT_MODAL_ID,
        true,
    )
    .await
}

/// Shows a text prompt. Read the answer with [`modal_input_get_text`].
///
/// # Errors
///
/// Same as [`Connection::eval_js`].
pub async fn modal_input(
    connection: &Connection,
    title: &str,
    hint: &str,
    callback: &str,
) -> Result<()> {
    let body = format!(
        "<div class=\"form-group\">\
         <input class=\"form-control\" id=\"{MODAL_INPUT_ID}\" placeholder=\"{hint}\" autocomplete=\"off\">\
         </div>"
    );
    let buttons = [
        ModalButton::new("Cancel", "btn-secondary", "data-bs-dismiss=\"modal\""),
        ModalButton::new(
            "OK",
            "btn-primary",
            format!("data-bs-dismiss=\"modal\" {callback}"),
        ),
    ];
    modal_new(connection, title, &body, &buttons, DEFAULT_MODAL_ID, true).await
}

/// Returns the text typed into the last [`modal_input`].
///
/// # Errors
///
/// Same as [`Connection::eval_js`].
pub async fn modal_input_get_text(connection: &Connection) -> Result<Option<String>> {
    let value = connection
        .eval_js(format!("$({}).val()", js_string(&format!("#{MODAL_INPUT_ID}"))))
        .await?;
    Ok(value.and_then(|v| v.as_str().map(str::to_owned)))
}

/// Script removing any previous modal and appending the new markup.
fn modal_script(title: &str, body: &str, buttons: &[ModalButton], modal_id: &str) -> String {
    let buttons: String = buttons
        .iter()
        .map(|button| {
            format!(
                "<button type=\"button\" class=\"btn {}\" {}>{}</button>",
                button.classes, button.attributes, button.text
            )
        })
        .collect();

    let html = format!(
        "<div class=\"modal fade\" id=\"{modal_id}\" data-bs-backdrop=\"static\" data-bs-keyboard=\"false\" tabindex=\"-1\">\
         <div class=\"modal-dialog modal-dialog-centered\"><div class=\"modal-content\">\
         <div class=\"modal-header\"><h5 class=\"modal-title\">{title}</h5>\
         <button type=\"button\" class=\"btn-close\" data-bs-dismiss=\"modal\"></button></div>\
         <div class=\"modal-body\">{body}</div>\
         <div class=\"modal-footer\">{buttons}</div>\
         </div></div></div>"
    );

    format!(
        "$({}).remove();\n$(document.body).append({});",
        js_string(&format!("#{modal_id}")),
        js_string(&html)
    )
}

// ============================================================================
// Tests
// ============================================================================
