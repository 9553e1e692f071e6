//! Request Fingerprints
//!
//! A fingerprint is a canonical, key-order-independent rendering of a
//! request's semantically relevant fields. Two requests that differ only in
//! field order or in correlation-only fields produce the same fingerprint,
//! which is what lets the subscription manager collapse duplicate
//! subscriptions onto one upstream channel and the cache key responses by
//! request shape.
//!
//! Correlation-only fields (`req_id`, `subscribe`, `passthrough`) are
//! stripped from the top level before rendering; everything else, including
//! nested structure, participates.

use std::fmt;

use serde_json::Value;

/// Top-level fields that never participate in a fingerprint.
const IGNORED_FIELDS: &[&str] = &["req_id", "subscribe", "passthrough"];

/// Canonical key for one logical request shape.
///
/// # Example
///
/// ```rust
/// use serde_json::json;
/// use tickmux::RequestFingerprint;
///
/// let a = RequestFingerprint::of(&json!({"ticks": "R_100", "req_id": 1}));
/// let b = RequestFingerprint::of(&json!({"req_id": 99, "ticks": "R_100"}));
/// assert_eq!(a, b);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    /// Compute the fingerprint of a request.
    #[must_use]
    pub fn of(request: &Value) -> Self {
        let mut out = String::new();
        match request {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map
                    .iter()
                    .filter(|(key, _)| !IGNORED_FIELDS.contains(&key.as_str()))
                    .collect();
                entries.sort_by_key(|(key, _)| key.as_str());
                write_object(&entries, &mut out);
            }
            other => write_canonical(other, &mut out),
        }
        Self(out)
    }

    /// The canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_object(entries: &[(&String, &Value)], out: &mut String) {
    out.push('{');
    for (index, (key, value)) in entries.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        out.push_str(&Value::String((*key).clone()).to_string());
        out.push(':');
        write_canonical(value, out);
    }
    out.push('}');
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by_key(|(key, _)| key.as_str());
            write_object(&entries, out);
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
