//! Per-kind record linearization.
//!
//! Each source kind has a dedicated template that turns one structured
//! record into one or more (text, metadata) pairs: header fields first,
//! then repeated sub-sections in a fixed order, skipping anything absent.
//! Metadata carries the identifying keys used for later filtering
//! (`source_id`, `patient_code`, `patient_name`) plus a verbatim,
//! null-pruned copy of the structured sub-lists so downstream consumers
//! can recover structure without re-parsing the narrative.

pub mod appointment;
pub mod condition;
pub mod patient;
pub mod prescription;

use serde_json::Value;

/// Recursively drop null object entries and null list items, so stored
/// metadata round-trips as compact JSON.
pub fn prune_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), prune_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter(|v| !v.is_null())
                .map(prune_nulls)
                .collect(),
        ),
        other => other.clone(),
    }
}

/// String accessor on a sub-list item.
pub(crate) fn item_str<'a>(item: &'a Value, key: &str) -> Option<&'a str> {
    item.get(key).and_then(Value::as_str).filter(|s| !s.trim().is_empty())
}

/// Render a scalar metadata value for narrative text: strings bare,
/// numbers via Display, everything else as compact JSON.
pub(crate) fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Scalar accessor rendered as text, for fields that may arrive as either
/// a string or a number from the source system.
pub(crate) fn field_text(payload: &Value, key: &str) -> Option<String> {
    let v = payload.get(key)?;
    if v.is_null() {
        return None;
    }
    let text = scalar_text(v);
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prune_nulls_nested() {
        let v = json!({
            "a": 1,
            "b": null,
            "c": {"d": null, "e": "kept"},
            "f": [1, null, {"g": null, "h": 2}]
        });
        let pruned = prune_nulls(&v);
        assert_eq!(
            pruned,
            json!({"a": 1, "c": {"e": "kept"}, "f": [1, {"h": 2}]})
        );
    }

    #[test]
    fn test_field_text_coerces_numbers() {
        let payload = json!({"age": 54, "name": "Rita", "blank": "  ", "gone": null});
        assert_eq!(field_text(&payload, "age").as_deref(), Some("54"));
        assert_eq!(field_text(&payload, "name").as_deref(), Some("Rita"));
        assert!(field_text(&payload, "blank").is_none());
        assert!(field_text(&payload, "gone").is_none());
        assert!(field_text(&payload, "missing").is_none());
    }
}
