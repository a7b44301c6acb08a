//! Small helpers for HTML-formatted replies.

/// Escape HTML special characters for HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn code(text: &str) -> String {
    format!("<code>{}</code>", escape_html(text))
}

pub fn bold(text: &str) -> String {
    format!("<b>{}</b>", escape_html(text))
}
