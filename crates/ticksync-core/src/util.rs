//! Shared utility functions used across multiple modules.

use std::time::Duration;

use libsql::params::Params;
use libsql::Value;

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Current Unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Milliseconds in a duration, saturating at `i64::MAX`.
pub fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Nullable text column value.
pub fn text_or_null(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |text| Value::Text(text.to_string()))
}

/// Nullable integer column value.
pub fn integer_or_null(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

/// Build named parameters, keeping only the names that occur in `sql`.
///
/// Filter fragments are composed per entity, so a given statement may not
/// reference every parameter the caller has on hand.
pub fn named_params(sql: &str, candidates: Vec<(&'static str, Value)>) -> Params {
    Params::Named(
        candidates
            .into_iter()
            .filter(|(name, _)| sql.contains(name))
            .map(|(name, value)| (name.to_string(), value))
            .collect(),
    )
}

/// Convert a JSON attribute into a column value.
pub fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(flag) => Value::Integer(i64::from(*flag)),
        serde_json::Value::Number(number) => number.as_i64().map_or_else(
            || number.as_f64().map_or(Value::Null, Value::Real),
            Value::Integer,
        ),
        serde_json::Value::String(text) => Value::Text(text.clone()),
        other => Value::Text(other.to_string()),
    }
}
