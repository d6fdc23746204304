//! Data transform node

mod expr;
mod ops;

pub use expr::{Expression, ExpressionError, BUILTINS};
pub use ops::{
    AggregateFunction, Condition, FilterOperator, JoinType, Schema, Severity, SortOrder,
    TargetType, TransformOp, ValidationRule,
};

use async_trait::async_trait;
use flowcore::template::template_scope;
use flowcore::value::{into_list, number_value, to_text, type_name};
use flowcore::{
    ErrorKind, ExecutionContext, ExecutorMetadata, NodeError, NodeExecution, NodeExecutor,
    NodeOutput, NodeSpec, ValidationResult, Value,
};
use serde::Deserialize;
use serde_json::Map;
use std::collections::HashMap;
use std::sync::Arc;

pub const NODE_TYPE: &str = "transform";

/// A named function callable from `custom` transforms.
pub type TransformFn = Arc<dyn Fn(Value) -> Result<Value, NodeError> + Send + Sync>;

/// Where a transform reads its data from.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Connected input name, else a path into the run context.
    pub source: Option<String>,
    /// Path over variables, run input, context data and connected inputs.
    pub source_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransformConfig {
    pub op: TransformOp,
    pub source: SourceConfig,
}

impl TransformConfig {
    pub fn from_node_config(config: &HashMap<String, Value>) -> Result<Self, String> {
        let object: Map<String, Value> = config.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let value = Value::Object(object);
        let op = serde_json::from_value(value.clone()).map_err(|e| format!("invalid transform config: {}", e))?;
        let source = serde_json::from_value(value).map_err(|e| format!("invalid transform source: {}", e))?;
        Ok(Self { op, source })
    }
}

fn context_scope(ctx: &ExecutionContext, inputs: &HashMap<String, Value>) -> Value {
    Value::Object(template_scope(ctx, Some(inputs)))
}

fn object_of(values: &HashMap<String, Value>) -> Value {
    Value::Object(values.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

/// A connected input by name, else a path into the run context.
fn lookup(name: &str, ctx: &ExecutionContext, inputs: &HashMap<String, Value>) -> Value {
    if let Some(value) = inputs.get(name) {
        return value.clone();
    }
    ops::extract(&context_scope(ctx, inputs), Some(name), None)
}

/// Pick the data a transform works on: the named source, then the sole
/// connected input, then the run's input data, then `source_path`, then
/// every connected input as one object.
fn resolve_source(source: &SourceConfig, ctx: &ExecutionContext, inputs: &HashMap<String, Value>) -> Value {
    if let Some(name) = &source.source {
        return lookup(name, ctx, inputs);
    }
    if inputs.len() == 1 {
        if let Some(value) = inputs.values().next() {
            return value.clone();
        }
    }
    if !ctx.input_data.is_empty() {
        return object_of(&ctx.input_data);
    }
    if let Some(path) = &source.source_path {
        return ops::extract(&context_scope(ctx, inputs), Some(path), None);
    }
    if !inputs.is_empty() {
        return object_of(inputs);
    }
    Value::Null
}

fn map_text(value: Value, f: fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(|item| map_text(item, f)).collect()),
        other => other,
    }
}

fn uppercase(value: Value) -> Result<Value, NodeError> {
    Ok(map_text(value, str::to_uppercase))
}

fn lowercase(value: Value) -> Result<Value, NodeError> {
    Ok(map_text(value, str::to_lowercase))
}

fn trim(value: Value) -> Result<Value, NodeError> {
    Ok(map_text(value, |s| s.trim().to_string()))
}

fn flatten(value: Value) -> Result<Value, NodeError> {
    let Value::Array(items) = value else {
        return Ok(value);
    };
    Ok(Value::Array(items.into_iter().flat_map(into_list).collect()))
}

fn unique(value: Value) -> Result<Value, NodeError> {
    let mut seen: Vec<Value> = Vec::new();
    for item in into_list(value) {
        if !seen.contains(&item) {
            seen.push(item);
        }
    }
    Ok(Value::Array(seen))
}

fn reverse(value: Value) -> Result<Value, NodeError> {
    Ok(match value {
        Value::Array(mut items) => {
            items.reverse();
            Value::Array(items)
        }
        Value::String(s) => Value::String(s.chars().rev().collect()),
        other => other,
    })
}

fn compact(value: Value) -> Result<Value, NodeError> {
    let empty = |v: &Value| v.is_null() || v.as_str() == Some("");
    Ok(match value {
        Value::Array(items) => Value::Array(items.into_iter().filter(|v| !empty(v)).collect()),
        Value::Object(map) => Value::Object(map.into_iter().filter(|(_, v)| !empty(v)).collect()),
        other => other,
    })
}

fn count(value: Value) -> Result<Value, NodeError> {
    Ok(Value::from(match &value {
        Value::Null => 0,
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        Value::String(s) => s.chars().count(),
        _ => 1,
    }))
}

fn require_object(value: Value) -> Result<Map<String, Value>, NodeError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(NodeError::InvalidInputType {
            field: "source".to_string(),
            expected: "object".to_string(),
            actual: type_name(&other).to_string(),
        }),
    }
}

fn keys(value: Value) -> Result<Value, NodeError> {
    Ok(Value::Array(require_object(value)?.into_iter().map(|(k, _)| Value::String(k)).collect()))
}

fn values(value: Value) -> Result<Value, NodeError> {
    Ok(Value::Array(require_object(value)?.into_iter().map(|(_, v)| v).collect()))
}

fn sum(value: Value) -> Result<Value, NodeError> {
    Ok(number_value(into_list(value).iter().filter_map(Value::as_f64).sum()))
}

/// Runs `transform` nodes: one operation over the resolved source data.
pub struct TransformExecutor {
    functions: HashMap<String, TransformFn>,
}

impl TransformExecutor {
    pub fn new() -> Self {
        let builtins: [(&str, fn(Value) -> Result<Value, NodeError>); 11] = [
            ("uppercase", uppercase),
            ("lowercase", lowercase),
            ("trim", trim),
            ("flatten", flatten),
            ("unique", unique),
            ("reverse", reverse),
            ("compact", compact),
            ("count", count),
            ("keys", keys),
            ("values", values),
            ("sum", sum),
        ];
        let functions = builtins
            .into_iter()
            .map(|(name, function)| (name.to_string(), Arc::new(function) as TransformFn))
            .collect();
        Self { functions }
    }

    /// Register (or replace) a named function for `custom` transforms.
    pub fn with_function<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(Value) -> Result<Value, NodeError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn function_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn apply(
        &self,
        op: &TransformOp,
        data: Value,
        ctx: &mut ExecutionContext,
        inputs: &HashMap<String, Value>,
    ) -> Result<NodeOutput, NodeError> {
        let result = match op {
            TransformOp::Map { mapping, expression } => ops::map(data, mapping.as_ref(), expression.as_deref())?,
            TransformOp::Filter { condition, expression } => {
                ops::filter(data, condition.as_ref(), expression.as_deref())?
            }
            TransformOp::Reduce { expression, initial } => ops::reduce(data, expression, initial.clone())?,
            TransformOp::Sort { field, order } => ops::sort(data, field.as_deref(), *order),
            TransformOp::Group { field } => ops::group(data, field),
            TransformOp::Join {
                with,
                left_key,
                right_key,
                join_type,
            } => {
                let right = lookup(with, ctx, inputs);
                ops::join(data, right, left_key, right_key, *join_type)
            }
            TransformOp::Aggregate { function, field } => ops::aggregate(data, *function, field.as_deref()),
            TransformOp::Extract { path, paths } => ops::extract(&data, path.as_deref(), paths.as_ref()),
            TransformOp::Validate {
                schema,
                rules,
                fail_on_invalid,
            } => {
                let report = ops::validate(data, schema.as_ref(), rules)?;
                let warnings = report.get("warnings").and_then(Value::as_array);
                if let Some(warnings) = warnings.filter(|w| !w.is_empty()) {
                    ctx.warn("validation_warnings", Value::Array(warnings.clone()));
                }
                if *fail_on_invalid && report.get("is_valid") == Some(&Value::Bool(false)) {
                    let errors = report
                        .get("errors")
                        .and_then(Value::as_array)
                        .map(|errors| errors.iter().map(to_text).collect::<Vec<_>>().join("; "))
                        .unwrap_or_default();
                    return Ok(NodeOutput::failure(
                        report,
                        format!("Validation failed: {}", errors),
                        ErrorKind::Business,
                    ));
                }
                report
            }
            TransformOp::Convert { target_type } => ops::convert(data, *target_type)?,
            TransformOp::Custom {
                function: Some(name),
                ..
            } => {
                let function = self
                    .functions
                    .get(name)
                    .ok_or_else(|| NodeError::Configuration(format!("unknown function '{}'", name)))?;
                function(data)?
            }
            TransformOp::Custom {
                expression: Some(source),
                ..
            } => {
                let expression = Expression::compile(source, &["item"])?;
                expression.evaluate(&HashMap::from([("item", data)]))?
            }
            TransformOp::Custom { .. } => {
                return Err(NodeError::Configuration(
                    "custom requires function or expression".to_string(),
                ))
            }
        };
        Ok(NodeOutput::success(result).with_metadata("transform_type", op.name()))
    }
}

impl Default for TransformExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeExecutor for TransformExecutor {
    fn supported_node_types(&self) -> Vec<&'static str> {
        vec![NODE_TYPE]
    }

    fn validate_config(&self, config: &HashMap<String, Value>) -> ValidationResult {
        let config = match TransformConfig::from_node_config(config) {
            Ok(config) => config,
            Err(e) => return ValidationResult::from_errors(vec![e]),
        };
        let mut errors = config.op.validate();
        if let TransformOp::Custom {
            function: Some(name), ..
        } = &config.op
        {
            if !self.functions.contains_key(name) {
                errors.push(format!(
                    "unknown function '{}' (available: {})",
                    name,
                    self.function_names().join(", ")
                ));
            }
        }
        ValidationResult::from_errors(errors)
    }

    fn metadata(&self) -> ExecutorMetadata {
        ExecutorMetadata {
            description: "Reshape, filter, aggregate and validate data".to_string(),
            category: "transform".to_string(),
        }
    }

    async fn execute(
        &self,
        node: &NodeSpec,
        ctx: &mut ExecutionContext,
        record: &NodeExecution,
    ) -> Result<NodeOutput, NodeError> {
        let config = TransformConfig::from_node_config(&node.config).map_err(NodeError::Configuration)?;
        let data = resolve_source(&config.source, ctx, &record.input_data);
        tracing::debug!(
            "Transform {} on node {} ({} input)",
            config.op.name(),
            node.key,
            type_name(&data)
        );
        ctx.debug(
            "transform",
            serde_json::json!({ "transform_type": config.op.name(), "input_type": type_name(&data) }),
        );
        self.apply(&config.op, data, ctx, &record.input_data)
    }
}
