//! Expression evaluation over an execution context.

use serde_json::{Map, Value};
use std::cmp::Ordering;
use thiserror::Error;

/// Evaluation error types.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Type error: {0}")]
    TypeError(String),
    #[error("Division by zero")]
    DivisionByZero,
}

/// Evaluation result type alias.
pub type EvalResult<T> = Result<T, EvalError>;

/// Variables visible to an expression.
///
/// `$name.path` looks up `name` in the map and walks the remaining segments
/// through objects (by key) and arrays (by index). Missing segments are `null`.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    vars: &'a Map<String, Value>,
}

impl<'a> EvalContext<'a> {
    pub fn new(vars: &'a Map<String, Value>) -> Self {
        Self { vars }
    }

    /// Resolve a variable reference such as `$retries` or `$message.sender`.
    pub fn resolve(&self, reference: &str) -> Value {
        let path = reference.strip_prefix('$').unwrap_or(reference);
        resolve_path(self.vars, path)
    }
}

/// Resolve a dot path (`a.b.0.c`) against a context map.
pub fn resolve_path(vars: &Map<String, Value>, path: &str) -> Value {
    let mut parts = path.split('.').map(str::trim);
    let Some(root) = parts.next() else {
        return Value::Null;
    };

    let mut current = match vars.get(root) {
        Some(value) => value,
        None => return Value::Null,
    };

    for part in parts {
        let next = match current {
            Value::Object(map) => map.get(part),
            Value::Array(items) => part.parse::<usize>().ok().and_then(|idx| items.get(idx)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }

    current.clone()
}

/// Evaluate an expression.
///
/// Supports, from lowest to highest precedence:
/// - Logical: `||`, `&&`
/// - Comparisons: `==`, `!=`, `>=`, `<=`, `>`, `<`
/// - String operations: `contains`, `startsWith`, `endsWith`
/// - Arithmetic: `+`, `-`, `*`, `/`
/// - Negation `!`, parentheses, `$variables` and literals
pub fn evaluate_expression(expr: &str, context: &EvalContext<'_>) -> EvalResult<Value> {
    let expr = expr.trim();

    if expr.is_empty() {
        return Ok(Value::Null);
    }

    if let Some(inner) = strip_outer_parens(expr) {
        return evaluate_expression(inner, context);
    }

    for op in ["||", "&&"] {
        if let Some(pos) = find_operator(expr, op) {
            let left = value_to_bool(&evaluate_expression(&expr[..pos], context)?);
            // Short-circuit like the host language would.
            let result = match (op, left) {
                ("||", true) => true,
                ("&&", false) => false,
                _ => value_to_bool(&evaluate_expression(&expr[pos + op.len()..], context)?),
            };
            return Ok(Value::Bool(result));
        }
    }

    for op in ["==", "!=", ">=", "<=", ">", "<"] {
        if let Some(pos) = find_operator(expr, op) {
            let left = evaluate_expression(&expr[..pos], context)?;
            let right = evaluate_expression(&expr[pos + op.len()..], context)?;
            let ordering = compare_values(&left, &right);

            let result = match op {
                "==" => values_equal(&left, &right),
                "!=" => !values_equal(&left, &right),
                ">=" => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
                "<=" => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
                ">" => ordering == Some(Ordering::Greater),
                _ => ordering == Some(Ordering::Less),
            };
            return Ok(Value::Bool(result));
        }
    }

    for op in [" contains ", " startsWith ", " endsWith "] {
        if let Some(pos) = find_operator(expr, op) {
            let left = value_to_string(&evaluate_expression(&expr[..pos], context)?);
            let right = value_to_string(&evaluate_expression(&expr[pos + op.len()..], context)?);

            let result = match op.trim() {
                "contains" => left.contains(&right),
                "startsWith" => left.starts_with(&right),
                _ => left.ends_with(&right),
            };
            return Ok(Value::Bool(result));
        }
    }

    // Lowest precedence first; the rightmost operator of a level is the root,
    // which makes `-` and `/` associate to the left.
    for level in [["+", "-"], ["*", "/"]] {
        let split = level
            .iter()
            .filter_map(|op| operator_positions(expr, op).last().map(|pos| (*pos, *op)))
            .max_by_key(|(pos, _)| *pos);
        if let Some((pos, op)) = split {
            let left = evaluate_expression(&expr[..pos], context)?;
            let right = evaluate_expression(&expr[pos + op.len()..], context)?;

            let lhs = value_to_f64(&left).ok_or_else(|| {
                EvalError::TypeError(format!("Cannot convert to number: {}", left))
            })?;
            let rhs = value_to_f64(&right).ok_or_else(|| {
                EvalError::TypeError(format!("Cannot convert to number: {}", right))
            })?;

            let result = match op {
                "+" => lhs + rhs,
                "-" => lhs - rhs,
                "*" => lhs * rhs,
                _ => {
                    if rhs == 0.0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    lhs / rhs
                }
            };
            return Ok(number_value(result));
        }
    }

    if let Some(inner) = expr.strip_prefix('!') {
        let value = evaluate_expression(inner, context)?;
        return Ok(Value::Bool(!value_to_bool(&value)));
    }

    if expr.starts_with('$') {
        return Ok(context.resolve(expr));
    }

    if expr.len() >= 2
        && ((expr.starts_with('"') && expr.ends_with('"'))
            || (expr.starts_with('\'') && expr.ends_with('\'')))
    {
        return Ok(Value::String(expr[1..expr.len() - 1].to_string()));
    }

    if let Ok(n) = expr.parse::<i64>() {
        return Ok(Value::Number(n.into()));
    }
    if let Ok(n) = expr.parse::<f64>() {
        return Ok(number_value(n));
    }

    match expr {
        "true" => Ok(Value::Bool(true)),
        "false" => Ok(Value::Bool(false)),
        "null" => Ok(Value::Null),
        _ => Err(EvalError::Parse(format!("Cannot parse expression: {}", expr))),
    }
}

/// Evaluate an expression and reduce the result to a boolean.
pub fn evaluate_condition(expr: &str, context: &EvalContext<'_>) -> EvalResult<bool> {
    evaluate_expression(expr, context).map(|value| value_to_bool(&value))
}

/// Returns the inner expression when `expr` is wrapped in one balanced pair of parens.
fn strip_outer_parens(expr: &str) -> Option<&str> {
    let inner = expr.strip_prefix('(')?.strip_suffix(')')?;
    let mut depth = 0i32;
    for c in inner.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            _ => {}
        }
    }
    (depth == 0).then_some(inner)
}

/// Find the first occurrence of `op` outside string literals and parentheses.
fn find_operator(expr: &str, op: &str) -> Option<usize> {
    operator_positions(expr, op).first().copied()
}

/// Byte offsets of every binary `op` outside string literals and parentheses.
///
/// An operator at offset 0 is never a binary operator (it is a sign or a
/// negation), so it is ignored.
fn operator_positions(expr: &str, op: &str) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut prev: Option<char> = None;

    for (i, c) in expr.char_indices() {
        match quote {
            Some(q) => {
                if c == q && prev != Some('\\') {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => quote = Some(c),
                '(' => depth += 1,
                ')' => depth -= 1,
                _ if depth == 0 && i > 0 && expr[i..].starts_with(op) => {
                    // `>` and `<` must not match the first half of `>=` / `<=`,
                    // and `-` must not match a sign after another operator.
                    let rest = &expr[i + op.len()..];
                    let is_partial_comparison =
                        matches!(op, ">" | "<") && rest.starts_with('=');
                    let is_sign = op == "-"
                        && expr[..i]
                            .trim_end()
                            .ends_with(['+', '-', '*', '/', '(', '=', '<', '>', '!', '&', '|']);
                    if !is_partial_comparison && !is_sign {
                        positions.push(i);
                    }
                }
                _ => {}
            },
        }
        prev = Some(c);
    }

    positions
}

/// Truthiness used by guards and conditions.
pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub(crate) fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn number_value(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
