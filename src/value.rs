// value.rs - Comparison, merge, and coercion helpers for JSON values
//
// Triple values are serde_json::Value end to end. Everything that needs an
// opinion about how two values relate (filters, sorting, merge diffing,
// group keys) goes through here.

use std::cmp::Ordering;

use serde_json::Value;

/// Compare two values of the same kind.
///
/// Returns `None` when the values are of different kinds or the kind has no
/// natural order (arrays, objects). Ordering predicates treat `None` as a
/// failed match.
pub fn partial_compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64()?;
            let y = y.as_f64()?;
            x.partial_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Total order used by `orderBy`.
///
/// Nulls sort before non-null values ascending; same-kind values use the
/// natural order; anything else falls back to comparing string forms.
pub fn sort_compare(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        (false, false) => {}
    }
    partial_compare(a, b).unwrap_or_else(|| string_form(a).cmp(&string_form(b)))
}

/// Canonical string form of a value (group keys, comparison fallback)
///
/// Strings appear unquoted; compound values use their JSON text.
pub fn string_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Reparse a group-key string form back into the most specific value kind:
/// int, then double, then bool, then string.
pub fn reparse(s: &str) -> Value {
    if let Ok(i) = s.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    if let Ok(b) = s.parse::<bool>() {
        return Value::Bool(b);
    }
    Value::String(s.to_string())
}

/// Deep-merge `from` into `into`.
///
/// Objects merge key by key recursively; any other kind is replaced
/// wholesale by the incoming value.
pub fn deep_merge(into: &Value, from: &Value) -> Value {
    match (into, from) {
        (Value::Object(a), Value::Object(b)) => {
            let mut merged = a.clone();
            for (key, incoming) in b {
                let entry = match merged.get(key) {
                    Some(existing) => deep_merge(existing, incoming),
                    None => incoming.clone(),
                };
                merged.insert(key.clone(), entry);
            }
            Value::Object(merged)
        }
        (_, other) => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_compare_same_kind() {
        assert_eq!(
            partial_compare(&json!(1), &json!(2)),
            Some(Ordering::Less)
        );
        assert_eq!(
            partial_compare(&json!("b"), &json!("a")),
            Some(Ordering::Greater)
        );
        assert_eq!(
            partial_compare(&json!(true), &json!(true)),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn test_partial_compare_cross_kind_is_none() {
        assert_eq!(partial_compare(&json!(1), &json!("1")), None);
        assert_eq!(partial_compare(&json!([1]), &json!([1])), None);
    }

    #[test]
    fn test_sort_compare_nulls_first() {
        assert_eq!(sort_compare(&Value::Null, &json!(0)), Ordering::Less);
        assert_eq!(sort_compare(&json!("x"), &Value::Null), Ordering::Greater);
    }

    #[test]
    fn test_sort_compare_cross_kind_falls_back_to_strings() {
        // "10" vs 9 compares as strings: "10" < "9"
        assert_eq!(sort_compare(&json!("10"), &json!(9)), Ordering::Less);
    }

    #[test]
    fn test_reparse() {
        assert_eq!(reparse("42"), json!(42));
        assert_eq!(reparse("2.5"), json!(2.5));
        assert_eq!(reparse("true"), json!(true));
        assert_eq!(reparse("u1"), json!("u1"));
    }

    #[test]
    fn test_deep_merge_nested() {
        let base = json!({"a": {"x": 1, "y": 2}, "b": 3});
        let patch = json!({"a": {"y": 9, "z": 10}, "c": 4});
        let merged = deep_merge(&base, &patch);
        assert_eq!(merged, json!({"a": {"x": 1, "y": 9, "z": 10}, "b": 3, "c": 4}));
    }

    #[test]
    fn test_deep_merge_replaces_non_objects() {
        assert_eq!(deep_merge(&json!([1, 2]), &json!([3])), json!([3]));
        assert_eq!(deep_merge(&json!(1), &json!({"a": 1})), json!({"a": 1}));
    }
}
