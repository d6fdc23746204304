//! Helpers over `serde_json::Value`, the dynamic value type for node
//! inputs, outputs and run state.

use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

/// One step of a dotted/indexed path such as `items[0].name` or `rows[*].id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
    Wildcard,
}

/// Split a path expression into segments.
///
/// Accepts `a.b.c`, `a[0].b`, `a.0.b`, `a[*].b` and `a.*`. A leading `$.`
/// or `$` is ignored so JSONPath-flavoured configs keep working.
pub fn parse_path(path: &str) -> Vec<PathSegment> {
    let trimmed = path.trim();
    let trimmed = trimmed
        .strip_prefix("$.")
        .or_else(|| trimmed.strip_prefix('$'))
        .unwrap_or(trimmed);

    let mut segments = Vec::new();
    for part in trimmed.split('.') {
        if part.is_empty() {
            continue;
        }
        let (head, rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !head.is_empty() {
            segments.push(key_segment(head));
        }
        let mut rest = rest;
        while let Some(stripped) = rest.strip_prefix('[') {
            let Some(end) = stripped.find(']') else {
                break;
            };
            let inner = stripped[..end].trim().trim_matches(|c| c == '"' || c == '\'');
            segments.push(key_segment(inner));
            rest = &stripped[end + 1..];
        }
    }
    segments
}

fn key_segment(raw: &str) -> PathSegment {
    if raw == "*" {
        PathSegment::Wildcard
    } else if let Ok(index) = raw.parse::<usize>() {
        PathSegment::Index(index)
    } else {
        PathSegment::Key(raw.to_string())
    }
}

/// Follow a path without wildcards. Numeric segments also address object
/// keys so `{"0": ..}` is reachable.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in parse_path(path) {
        current = match (&segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map.get(key)?,
            (PathSegment::Index(index), Value::Array(items)) => items.get(*index)?,
            (PathSegment::Index(index), Value::Object(map)) => map.get(&index.to_string())?,
            _ => return None,
        };
    }
    Some(current)
}

/// Collect every value matched by a path, expanding wildcards.
pub fn select_path(value: &Value, path: &str) -> Vec<Value> {
    let segments = parse_path(path);
    let mut current = vec![value];
    for segment in &segments {
        let mut next = Vec::new();
        for candidate in current {
            match (segment, candidate) {
                (PathSegment::Key(key), Value::Object(map)) => next.extend(map.get(key)),
                (PathSegment::Index(index), Value::Array(items)) => next.extend(items.get(*index)),
                (PathSegment::Index(index), Value::Object(map)) => {
                    next.extend(map.get(&index.to_string()))
                }
                (PathSegment::Wildcard, Value::Array(items)) => next.extend(items.iter()),
                (PathSegment::Wildcard, Value::Object(map)) => next.extend(map.values()),
                _ => {}
            }
        }
        current = next;
    }
    current.into_iter().cloned().collect()
}

/// Whether the path contains a wildcard and may therefore match many values.
pub fn is_multi_path(path: &str) -> bool {
    parse_path(path).contains(&PathSegment::Wildcard)
}

/// Render a value for text substitution: strings verbatim, scalars via
/// display, everything else as JSON text.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Numeric view of a value. Numeric strings count; everything else is `None`.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Build a JSON number, preferring an integer representation for whole values.
pub fn number_value(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Equality that tolerates `42 == "42"` and `true == "true"`.
pub fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            s.trim().parse::<f64>().ok() == n.as_f64()
        }
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            match s.to_lowercase().as_str() {
                "true" => *b,
                "false" => !*b,
                _ => false,
            }
        }
        _ => false,
    }
}

/// Ordering for sort and comparison operators. Numbers (including numeric
/// strings) compare numerically, strings lexically, booleans false < true.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => match (as_number(left), as_number(right)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => Some(a.cmp(b)),
        },
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => match (as_number(left), as_number(right)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

/// Wrap a scalar in a one-element list; lists pass through, null is empty.
pub fn into_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Shallow merge of `overlay` into `base`. Non-object values are replaced.
pub fn merge_objects(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        base.insert(key.clone(), value.clone());
    }
}
