//! Expression DSL - guards, predicates and `${var}` interpolation.
//!
//! Expressions run against the execution context, a JSON object shared by the
//! steps of a workflow run.
//!
//! # Expression Syntax
//!
//! ## Variable Access
//! - `$channel` - Top-level context value
//! - `$message.sender` - Nested object field
//! - `$message.labels.0` - Array element
//!
//! ## Operators
//! - Comparison: `==`, `!=`, `>`, `<`, `>=`, `<=`
//! - Logical: `&&`, `||`, `!`
//! - String: `contains`, `startsWith`, `endsWith`
//! - Arithmetic: `+`, `-`, `*`, `/`
//!
//! ## Examples
//! - `$channel == "whatsapp"`
//! - `$retries < 3 && $message.urgent`
//!
//! # Interpolation
//!
//! `${path}` placeholders inside strings are replaced by context values. A
//! string that is exactly one placeholder resolves to the value itself, so
//! `"${count}"` yields the number rather than its text.

use serde_json::{Map, Value};

mod expression;

pub use expression::{
    evaluate_condition, evaluate_expression, resolve_path, value_to_bool, EvalContext, EvalError,
    EvalResult,
};
pub(crate) use expression::{value_to_f64, value_to_string};

/// Replace every `${path}` in `template` with the matching context value.
///
/// Unknown paths become empty strings. An unterminated `${` is copied as-is.
pub fn interpolate(template: &str, vars: &Map<String, Value>) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let value = resolve_path(vars, after[..end].trim());
                result.push_str(&value_to_string(&value));
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    result.push_str(rest);
    result
}

/// Interpolate every string inside a JSON value.
///
/// A string consisting of a single placeholder keeps the JSON type of what it
/// refers to (and becomes `null` when the path is unknown).
pub fn interpolate_value(value: &Value, vars: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => match whole_placeholder(s) {
            Some(path) => resolve_path(vars, path),
            None => Value::String(interpolate(s, vars)),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Interpolate every value of a parameter map.
pub fn interpolate_params(params: &Map<String, Value>, vars: &Map<String, Value>) -> Map<String, Value> {
    params
        .iter()
        .map(|(k, v)| (k.clone(), interpolate_value(v, vars)))
        .collect()
}

fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("${")?.strip_suffix('}')?;
    (!inner.contains('}') && !inner.contains("${")).then(|| inner.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Map<String, Value> {
        match json!({
            "user": {"name": "Ana", "id": 7},
            "count": 42,
            "recipients": ["a@example.com", "b@example.com"]
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_interpolate_simple() {
        let result = interpolate("Hello ${user.name}, count is ${count}", &vars());
        assert_eq!(result, "Hello Ana, count is 42");
    }

    #[test]
    fn test_interpolate_unknown_and_unterminated() {
        assert_eq!(interpolate("[${nope}]", &vars()), "[]");
        assert_eq!(interpolate("cost ${count", &vars()), "cost ${count");
        assert_eq!(interpolate("Plain text", &vars()), "Plain text");
    }

    #[test]
    fn test_interpolate_value_keeps_types() {
        let params = json!({
            "to": "${recipients}",
            "id": "${user.id}",
            "subject": "Hi ${user.name}",
            "missing": "${nope}",
            "nested": ["${count}", true]
        });
        let out = interpolate_value(&params, &vars());
        assert_eq!(out["to"], json!(["a@example.com", "b@example.com"]));
        assert_eq!(out["id"], json!(7));
        assert_eq!(out["subject"], json!("Hi Ana"));
        assert_eq!(out["missing"], Value::Null);
        assert_eq!(out["nested"], json!([42, true]));
    }
}
