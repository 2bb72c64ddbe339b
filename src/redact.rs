//! Redaction of sensitive request fields before diagnostic logging.

use serde_json::{Map, Value};

/// Replacement written in place of every redacted value.
pub const REDACTED: &str = "***";

const SENSITIVE_FRAGMENTS: [&str; 3] = ["password", "passwd", "secret"];

/// Returns true for password-shaped keys (`password`, `oldPassword`,
/// `new_password`, `clientSecret`, ...).
pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SENSITIVE_FRAGMENTS
        .iter()
        .any(|fragment| lowered.contains(fragment))
}

/// Returns a copy of `body` with every sensitive key's value masked.
///
/// Objects nested at any depth, including inside arrays, are masked too.
pub fn redact_body(body: &Value) -> Value {
    match body {
        Value::Object(fields) => {
            let mut masked = Map::with_capacity(fields.len());
            for (key, value) in fields {
                let value = if is_sensitive_key(key) {
                    Value::String(REDACTED.to_string())
                } else {
                    redact_body(value)
                };
                masked.insert(key.clone(), value);
            }
            Value::Object(masked)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_body).collect()),
        other => other.clone(),
    }
}

/// Renders `body` for a log line with sensitive fields masked.
pub fn redacted_json(body: &Value) -> String {
    redact_body(body).to_string()
}

/// Strips the query string from a URL so embedded credentials never reach logs.
pub fn redact_url(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}
