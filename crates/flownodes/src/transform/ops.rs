use super::expr::{Expression, ExpressionError};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use flowcore::value::{
    compare_values, get_path, into_list, is_multi_path, is_truthy, loose_eq,
    merge_objects, number_value, select_path, to_text, type_name,
};
use flowcore::{NodeError, Value};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Number};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

impl From<ExpressionError> for NodeError {
    fn from(e: ExpressionError) -> Self {
        NodeError::Expression(e.to_string())
    }
}

/// The operation of a `transform` node, tagged by `transform_type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "transform_type", rename_all = "snake_case")]
pub enum TransformOp {
    Map {
        /// Output field -> source path inside each element.
        #[serde(default)]
        mapping: Option<BTreeMap<String, String>>,
        #[serde(default)]
        expression: Option<String>,
    },
    Filter {
        #[serde(default)]
        condition: Option<Condition>,
        #[serde(default)]
        expression: Option<String>,
    },
    Reduce {
        expression: String,
        #[serde(default)]
        initial: Value,
    },
    Sort {
        #[serde(default)]
        field: Option<String>,
        #[serde(default)]
        order: SortOrder,
    },
    Group {
        field: String,
    },
    Join {
        /// Input name or context path of the right-hand list.
        with: String,
        left_key: String,
        right_key: String,
        #[serde(default)]
        join_type: JoinType,
    },
    Aggregate {
        function: AggregateFunction,
        #[serde(default)]
        field: Option<String>,
    },
    Extract {
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        paths: Option<BTreeMap<String, String>>,
    },
    Validate {
        #[serde(default)]
        schema: Option<Schema>,
        #[serde(default)]
        rules: Vec<ValidationRule>,
        /// Report an invalid result as an unsuccessful node outcome.
        #[serde(default)]
        fail_on_invalid: bool,
    },
    Convert {
        target_type: TargetType,
    },
    Custom {
        #[serde(default)]
        function: Option<String>,
        #[serde(default)]
        expression: Option<String>,
    },
}

impl TransformOp {
    pub fn name(&self) -> &'static str {
        match self {
            TransformOp::Map { .. } => "map",
            TransformOp::Filter { .. } => "filter",
            TransformOp::Reduce { .. } => "reduce",
            TransformOp::Sort { .. } => "sort",
            TransformOp::Group { .. } => "group",
            TransformOp::Join { .. } => "join",
            TransformOp::Aggregate { .. } => "aggregate",
            TransformOp::Extract { .. } => "extract",
            TransformOp::Validate { .. } => "validate",
            TransformOp::Convert { .. } => "convert",
            TransformOp::Custom { .. } => "custom",
        }
    }

    /// Structural problems with the operation's own settings. Named custom
    /// functions are checked by the executor, which owns the registry.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        match self {
            TransformOp::Map { mapping, expression } => match (mapping, expression) {
                (_, Some(expression)) => errors.extend(expression_error(expression, &["item"])),
                (Some(_), None) => {}
                (None, None) => errors.push("map requires mapping or expression".to_string()),
            },
            TransformOp::Filter {
                condition,
                expression,
            } => match (condition, expression) {
                (_, Some(expression)) => errors.extend(expression_error(expression, &["item"])),
                (Some(condition), None) => errors.extend(condition.validate()),
                (None, None) => errors.push("filter requires condition or expression".to_string()),
            },
            TransformOp::Reduce { expression, .. } => {
                errors.extend(expression_error(expression, &["item", "acc"]))
            }
            TransformOp::Group { field } if field.trim().is_empty() => {
                errors.push("group requires field".to_string())
            }
            TransformOp::Join {
                with,
                left_key,
                right_key,
                ..
            } => {
                if with.trim().is_empty() {
                    errors.push("join requires with".to_string());
                }
                if left_key.trim().is_empty() || right_key.trim().is_empty() {
                    errors.push("join requires left_key and right_key".to_string());
                }
            }
            TransformOp::Extract { path: None, paths: None } => {
                errors.push("extract requires path or paths".to_string())
            }
            TransformOp::Validate { rules, .. } => {
                for rule in rules {
                    match (&rule.condition, &rule.expression) {
                        (_, Some(expression)) => errors.extend(expression_error(expression, &["item"])),
                        (Some(condition), None) => errors.extend(condition.validate()),
                        (None, None) => errors.push(format!(
                            "rule '{}' requires condition or expression",
                            rule.name
                        )),
                    }
                }
            }
            TransformOp::Custom {
                function: None,
                expression: None,
            } => errors.push("custom requires function or expression".to_string()),
            TransformOp::Custom {
                expression: Some(expression),
                ..
            } => errors.extend(expression_error(expression, &["item"])),
            _ => {}
        }
        errors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Contains,
    Regex,
}

/// `field operator value` test against one element. An empty field tests
/// the element itself.
#[derive(Debug, Clone, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    fn validate(&self) -> Vec<String> {
        if self.operator == FilterOperator::Regex {
            if let Err(e) = Regex::new(&to_text(&self.value)) {
                return vec![format!("invalid regex '{}': {}", to_text(&self.value), e)];
            }
        }
        if self.operator == FilterOperator::In && !self.value.is_array() {
            return vec!["operator 'in' requires a list value".to_string()];
        }
        Vec::new()
    }

    pub fn matches(&self, item: &Value) -> Result<bool, NodeError> {
        let actual = field_value(item, Some(&self.field));
        let expected = &self.value;
        let ordering = || compare_values(&actual, expected);
        Ok(match self.operator {
            FilterOperator::Eq => loose_eq(&actual, expected),
            FilterOperator::Ne => !loose_eq(&actual, expected),
            FilterOperator::Gt => ordering() == Some(Ordering::Greater),
            FilterOperator::Gte => matches!(ordering(), Some(Ordering::Greater | Ordering::Equal)),
            FilterOperator::Lt => ordering() == Some(Ordering::Less),
            FilterOperator::Lte => matches!(ordering(), Some(Ordering::Less | Ordering::Equal)),
            FilterOperator::In => expected
                .as_array()
                .is_some_and(|options| options.iter().any(|o| loose_eq(&actual, o))),
            FilterOperator::Contains => match &actual {
                Value::Array(items) => items.iter().any(|v| loose_eq(v, expected)),
                Value::Object(map) => map.contains_key(&to_text(expected)),
                Value::Null => false,
                other => to_text(other).contains(&to_text(expected)),
            },
            FilterOperator::Regex => {
                let pattern = Regex::new(&to_text(expected))
                    .map_err(|e| NodeError::Configuration(format!("invalid regex: {}", e)))?;
                !actual.is_null() && pattern.is_match(&to_text(&actual))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    #[serde(alias = "ascending")]
    Asc,
    #[serde(alias = "descending")]
    Desc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    #[default]
    Inner,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Date,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Schema {
    #[serde(default, rename = "type")]
    pub value_type: Option<String>,
    #[serde(default)]
    pub required: Vec<String>,
    /// Field -> expected type name.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Error,
    Warning,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationRule {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub message: Option<String>,
}

fn expression_error(source: &str, bindings: &[&str]) -> Option<String> {
    Expression::compile(source, bindings)
        .err()
        .map(|e| format!("invalid expression '{}': {}", source, e))
}

fn field_value(item: &Value, field: Option<&str>) -> Value {
    match field.map(str::trim) {
        None | Some("") | Some(".") => item.clone(),
        Some(path) => get_path(item, path).cloned().unwrap_or(Value::Null),
    }
}

fn eval_item(expression: &Expression, item: Value) -> Result<Value, NodeError> {
    let scope = HashMap::from([("item", item)]);
    Ok(expression.evaluate(&scope)?)
}

fn single_or_list(mut items: Vec<Value>) -> Value {
    if items.len() == 1 {
        items.remove(0)
    } else {
        Value::Array(items)
    }
}

pub fn map(
    data: Value,
    mapping: Option<&BTreeMap<String, String>>,
    expression: Option<&str>,
) -> Result<Value, NodeError> {
    let items = into_list(data);
    let mapped = match (expression, mapping) {
        (Some(source), _) => {
            let expression = Expression::compile(source, &["item"])?;
            items
                .into_iter()
                .map(|item| eval_item(&expression, item))
                .collect::<Result<Vec<_>, _>>()?
        }
        (None, Some(mapping)) => items
            .iter()
            .map(|item| {
                let object: Map<String, Value> = mapping
                    .iter()
                    .map(|(target, source)| (target.clone(), field_value(item, Some(source))))
                    .collect();
                Value::Object(object)
            })
            .collect(),
        (None, None) => items,
    };
    Ok(single_or_list(mapped))
}

pub fn filter(data: Value, condition: Option<&Condition>, expression: Option<&str>) -> Result<Value, NodeError> {
    let compiled = expression
        .map(|source| Expression::compile(source, &["item"]))
        .transpose()?;
    let mut kept = Vec::new();
    for item in into_list(data) {
        let keep = match (&compiled, condition) {
            (Some(expression), _) => is_truthy(&eval_item(expression, item.clone())?),
            (None, Some(condition)) => condition.matches(&item)?,
            (None, None) => true,
        };
        if keep {
            kept.push(item);
        }
    }
    Ok(Value::Array(kept))
}

pub fn reduce(data: Value, expression: &str, initial: Value) -> Result<Value, NodeError> {
    let expression = Expression::compile(expression, &["item", "acc"])?;
    let mut acc = initial;
    for item in into_list(data) {
        let scope = HashMap::from([("item", item), ("acc", acc)]);
        acc = expression.evaluate(&scope)?;
    }
    Ok(acc)
}

/// Stable sort; elements whose keys do not compare keep their relative order.
pub fn sort(data: Value, field: Option<&str>, order: SortOrder) -> Value {
    let mut items = into_list(data);
    items.sort_by(|a, b| {
        let ordering = compare_values(&field_value(a, field), &field_value(b, field)).unwrap_or(Ordering::Equal);
        match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });
    Value::Array(items)
}

pub fn group(data: Value, field: &str) -> Value {
    let mut groups: Map<String, Value> = Map::new();
    for item in into_list(data) {
        let key = match field_value(&item, Some(field)) {
            Value::Null => "null".to_string(),
            other => to_text(&other),
        };
        if let Value::Array(members) = groups.entry(key).or_insert_with(|| Value::Array(Vec::new())) {
            members.push(item);
        }
    }
    Value::Object(groups)
}

fn as_object(item: Value) -> Map<String, Value> {
    match item {
        Value::Object(map) => map,
        other => Map::from_iter([("value".to_string(), other)]),
    }
}

pub fn join(left: Value, right: Value, left_key: &str, right_key: &str, join_type: JoinType) -> Value {
    let right: Vec<Map<String, Value>> = into_list(right).into_iter().map(as_object).collect();
    let mut joined = Vec::new();
    for item in into_list(left) {
        let left_row = as_object(item);
        let key = field_value(&Value::Object(left_row.clone()), Some(left_key));
        let mut matched = false;
        for right_row in &right {
            let other = right_row.get(right_key).cloned().unwrap_or(Value::Null);
            if !key.is_null() && loose_eq(&key, &other) {
                let mut row = left_row.clone();
                merge_objects(&mut row, right_row);
                joined.push(Value::Object(row));
                matched = true;
            }
        }
        if !matched && join_type == JoinType::Left {
            joined.push(Value::Object(left_row));
        }
    }
    Value::Array(joined)
}

/// Aggregates over JSON numbers only; strings, booleans and nulls are
/// skipped. `sum` of nothing is 0, `avg/min/max` of nothing are null.
pub fn aggregate(data: Value, function: AggregateFunction, field: Option<&str>) -> Value {
    let values: Vec<Value> = into_list(data).iter().map(|item| field_value(item, field)).collect();
    if function == AggregateFunction::Count {
        return Value::from(values.iter().filter(|v| !v.is_null()).count());
    }
    let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
    match function {
        AggregateFunction::Sum => number_value(numbers.iter().sum()),
        _ if numbers.is_empty() => Value::Null,
        AggregateFunction::Avg => number_value(numbers.iter().sum::<f64>() / numbers.len() as f64),
        AggregateFunction::Min => number_value(numbers.iter().copied().fold(f64::INFINITY, f64::min)),
        _ => number_value(numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
    }
}

fn extract_one(data: &Value, path: &str) -> Value {
    if is_multi_path(path) {
        return single_or_list(select_path(data, path));
    }
    get_path(data, path).cloned().unwrap_or(Value::Null)
}

pub fn extract(data: &Value, path: Option<&str>, paths: Option<&BTreeMap<String, String>>) -> Value {
    match (paths, path) {
        (Some(paths), _) => Value::Object(
            paths
                .iter()
                .map(|(name, path)| (name.clone(), extract_one(data, path)))
                .collect(),
        ),
        (None, Some(path)) => extract_one(data, path),
        (None, None) => data.clone(),
    }
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "integer" => value.is_i64() || value.is_u64(),
        "number" | "float" => value.is_number(),
        "bool" => value.is_boolean(),
        "list" => value.is_array(),
        "dict" | "map" => value.is_object(),
        "any" => true,
        other => type_name(value) == other,
    }
}

pub fn validate(data: Value, schema: Option<&Schema>, rules: &[ValidationRule]) -> Result<Value, NodeError> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if let Some(schema) = schema {
        if let Some(expected) = &schema.value_type {
            if !type_matches(&data, expected) {
                errors.push(format!("expected type {}, got {}", expected, type_name(&data)));
            }
        }
        for field in &schema.required {
            if data.get(field).map_or(true, Value::is_null) {
                errors.push(format!("missing required field '{}'", field));
            }
        }
        for (field, expected) in &schema.properties {
            if let Some(value) = data.get(field).filter(|v| !v.is_null()) {
                if !type_matches(value, expected) {
                    errors.push(format!(
                        "field '{}' expected {}, got {}",
                        field,
                        expected,
                        type_name(value)
                    ));
                }
            }
        }
    }

    for rule in rules {
        let outcome = match (&rule.expression, &rule.condition) {
            (Some(source), _) => Expression::compile(source, &["item"])
                .map_err(NodeError::from)
                .and_then(|expression| eval_item(&expression, data.clone()))
                .map(|v| is_truthy(&v)),
            (None, Some(condition)) => condition.matches(&data),
            (None, None) => Ok(true),
        };
        let message = match outcome {
            Ok(true) => continue,
            Ok(false) => rule
                .message
                .clone()
                .unwrap_or_else(|| format!("rule '{}' failed", rule.name)),
            Err(e) => format!("rule '{}' could not be evaluated: {}", rule.name, e),
        };
        match rule.severity {
            Severity::Error => errors.push(message),
            Severity::Warning => warnings.push(message),
        }
    }

    Ok(serde_json::json!({
        "is_valid": errors.is_empty(),
        "data": data,
        "errors": errors,
        "warnings": warnings,
    }))
}

fn to_number(value: &Value) -> Value {
    match value {
        Value::Number(_) => value.clone(),
        Value::Bool(b) => Value::from(u8::from(*b)),
        Value::String(s) => {
            let trimmed = s.trim();
            let digits = trimmed.strip_prefix('-').unwrap_or(trimmed);
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(n) = trimmed.parse::<i64>() {
                    return Value::from(n);
                }
                if let Ok(n) = trimmed.parse::<u64>() {
                    return Value::from(n);
                }
            }
            trimmed
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::from(0))
        }
        _ => Value::from(0),
    }
}

fn to_boolean(value: &Value) -> Value {
    Value::Bool(match value {
        Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on"),
        other => is_truthy(other),
    })
}

fn to_date(value: &Value) -> Result<Value, NodeError> {
    let invalid = || NodeError::InvalidInputType {
        field: "date".to_string(),
        expected: "RFC 3339 text, YYYY-MM-DD or a unix timestamp".to_string(),
        actual: to_text(value),
    };
    let parsed: DateTime<Utc> = match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                dt.with_timezone(&Utc)
            } else if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                naive.and_utc()
            } else {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|naive| naive.and_utc())
                    .ok_or_else(invalid)?
            }
        }
        Value::Number(n) => {
            let seconds = n.as_f64().ok_or_else(invalid)?;
            // Values this large are millisecond timestamps.
            let millis = if seconds.abs() > 1e11 { seconds } else { seconds * 1000.0 };
            Utc.timestamp_millis_opt(millis as i64).single().ok_or_else(invalid)?
        }
        _ => return Err(invalid()),
    };
    Ok(Value::String(parsed.to_rfc3339()))
}

/// Coerce `data` to `target`. Number, boolean and date coercions apply to
/// each element of a list; string and structural coercions take the value whole.
pub fn convert(data: Value, target: TargetType) -> Result<Value, NodeError> {
    match (target, data) {
        (TargetType::Number | TargetType::Boolean | TargetType::Date, Value::Array(items)) => Ok(Value::Array(
            items
                .into_iter()
                .map(|item| convert(item, target))
                .collect::<Result<_, _>>()?,
        )),
        (TargetType::String, data) => Ok(Value::String(to_text(&data))),
        (TargetType::Number, data) => Ok(to_number(&data)),
        (TargetType::Boolean, data) => Ok(to_boolean(&data)),
        (TargetType::Date, data) => to_date(&data),
        (TargetType::Array, Value::String(s)) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Array(items)) => Ok(Value::Array(items)),
            _ => Ok(Value::Array(vec![Value::String(s)])),
        },
        (TargetType::Array, data) => Ok(Value::Array(into_list(data))),
        (TargetType::Object, Value::Object(map)) => Ok(Value::Object(map)),
        (TargetType::Object, Value::String(s)) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Object(map)) => Ok(Value::Object(map)),
            _ => Ok(Value::Object(as_object(Value::String(s)))),
        },
        (TargetType::Object, Value::Array(items)) => Ok(Value::Object(
            items
                .into_iter()
                .enumerate()
                .map(|(i, item)| (i.to_string(), item))
                .collect(),
        )),
        (TargetType::Object, Value::Null) => Ok(Value::Object(Map::new())),
        (TargetType::Object, data) => Ok(Value::Object(as_object(data))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn number_coercion_rules() {
        assert_eq!(to_number(&json!("42")), json!(42));
        assert_eq!(to_number(&json!("-7")), json!(-7));
        assert_eq!(to_number(&json!("3.5")), json!(3.5));
        assert_eq!(to_number(&json!("1e3")), json!(1000.0));
        assert_eq!(to_number(&json!("abc")), json!(0));
        assert_eq!(to_number(&json!(true)), json!(1));
    }

    #[test]
    fn boolean_coercion_rules() {
        for truthy in ["true", "TRUE", "1", "yes", " On "] {
            assert_eq!(to_boolean(&json!(truthy)), json!(true), "{}", truthy);
        }
        for falsy in ["false", "0", "no", "off", ""] {
            assert_eq!(to_boolean(&json!(falsy)), json!(false), "{}", falsy);
        }
    }

    #[test]
    fn dates_normalise_to_rfc3339() {
        assert_eq!(to_date(&json!("2024-03-01")).unwrap(), json!("2024-03-01T00:00:00+00:00"));
        assert_eq!(to_date(&json!(0)).unwrap(), json!("1970-01-01T00:00:00+00:00"));
        assert!(to_date(&json!("yesterday")).is_err());
    }

    #[test]
    fn single_path_with_wildcard_returns_list() {
        let data = json!({"rows": [{"id": 1}, {"id": 2}], "one": [{"id": 9}]});
        assert_eq!(extract(&data, Some("rows[*].id"), None), json!([1, 2]));
        assert_eq!(extract(&data, Some("one[*].id"), None), json!(9));
        assert_eq!(extract(&data, Some("rows[1].id"), None), json!(2));
        assert_eq!(extract(&data, Some("missing"), None), Value::Null);
    }
}
