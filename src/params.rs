//! Canonicalization of heterogeneous client-supplied list fields.
//!
//! Clients send list-valued parameters as native JSON arrays, JSON-encoded
//! strings, comma-separated strings, or bare scalars. Everything is folded
//! into one internal representation before it reaches the write coordinator,
//! so no downstream code ever branches on input shape.

use serde_json::Value;

/// Canonicalize a list-valued parameter.
///
/// Accepted shapes, in priority order:
/// 1. a JSON array — each element coerced to a string;
/// 2. a string starting with `[` that parses as a JSON array — parsed and
///    coerced (malformed syntax falls through to comma-splitting);
/// 3. a string containing a comma — split and trimmed, empty segments dropped;
/// 4. any other non-empty scalar — wrapped as a single-element list;
/// 5. `null` or an empty/whitespace string — `None`.
///
/// Pure and total: never fails, never touches a store.
pub fn normalize_list(value: Option<&Value>) -> Option<Vec<String>> {
    let value = value?;
    match value {
        Value::Null => None,
        Value::Array(items) => Some(items.iter().map(coerce_to_string).collect()),
        Value::String(raw) => normalize_string(raw),
        other => Some(vec![coerce_to_string(other)]),
    }
}

fn normalize_string(raw: &str) -> Option<Vec<String>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.starts_with('[')
        && let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed)
    {
        return Some(items.iter().map(coerce_to_string).collect());
    }

    if trimmed.contains(',') {
        return Some(
            trimmed
                .split(',')
                .map(str::trim)
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
        );
    }

    Some(vec![trimmed.to_string()])
}

fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
