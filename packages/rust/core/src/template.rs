//! `{{field}}` placeholder rendering against a row.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;
use tracing::debug;

use rowforge_shared::{ContentPart, Row};

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+)\s*\}\}").expect("valid regex"));

/// Replace every `{{field}}` with the row's value.
///
/// Strings are inserted verbatim, other values as compact JSON. Missing
/// fields and `null` render as the empty string.
pub fn render(template: &str, row: &Row) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures| {
            let field = &caps[1];
            match row.get(field) {
                Some(value) => value_text(value),
                None => {
                    debug!(field, "template field missing from row");
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Render text parts and remote image URLs; inline media is left untouched.
pub fn render_parts(parts: &[ContentPart], row: &Row) -> Vec<ContentPart> {
    parts
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => ContentPart::Text {
                text: render(text, row),
            },
            ContentPart::ImageUrl { url } => ContentPart::ImageUrl {
                url: render(url, row),
            },
            other => other.clone(),
        })
        .collect()
}

/// Text form of a value as it appears inside a rendered template.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
