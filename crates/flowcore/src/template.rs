//! `{{name}}` placeholder substitution against a run's context.

use crate::value::{get_path, to_text};
use crate::{ExecutionContext, Value};
use chrono::Utc;
use regex::{Captures, Regex};
use serde_json::Map;
use std::collections::HashMap;
use std::sync::OnceLock;

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("placeholder pattern is valid")
    })
}

/// Build the lookup scope for a node. Later sources override earlier ones:
/// variables, input data, context data, node outputs, call-site extras and
/// finally the reserved names.
pub fn template_scope(ctx: &ExecutionContext, extras: Option<&HashMap<String, Value>>) -> Map<String, Value> {
    let mut scope = Map::new();
    for source in [&ctx.variables, &ctx.input_data, &ctx.context_data, &ctx.node_outputs] {
        for (key, value) in source {
            scope.insert(key.clone(), value.clone());
        }
    }
    if let Some(extras) = extras {
        for (key, value) in extras {
            scope.insert(key.clone(), value.clone());
        }
    }
    scope.insert("execution_id".into(), Value::String(ctx.execution_id.to_string()));
    scope.insert("workflow_id".into(), Value::String(ctx.workflow_id.to_string()));
    scope.insert("user_id".into(), Value::String(ctx.user_id.clone()));
    scope.insert("current_timestamp".into(), Value::String(Utc::now().to_rfc3339()));
    scope.insert(
        "current_node_id".into(),
        ctx.current_node_id.clone().map(Value::String).unwrap_or(Value::Null),
    );
    scope
}

/// Substitute placeholders from `scope`. A name is looked up verbatim first,
/// then as a dotted path (`fetch.body.id`). Unknown placeholders are kept.
pub fn render(template: &str, scope: &Map<String, Value>) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    let root = Value::Object(scope.clone());
    placeholder()
        .replace_all(template, |caps: &Captures| {
            let name = &caps[1];
            scope
                .get(name)
                .or_else(|| get_path(&root, name))
                .map(to_text)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Resolve a template against the run context.
pub fn resolve_template(template: &str, ctx: &ExecutionContext, extras: Option<&HashMap<String, Value>>) -> String {
    render(template, &template_scope(ctx, extras))
}

/// Resolve every string inside a structured value. A string that is exactly
/// one placeholder keeps the referenced value's type.
pub fn resolve_value(value: &Value, scope: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            if let Some(caps) = placeholder().captures(s) {
                if caps[0].len() == s.len() {
                    let root = Value::Object(scope.clone());
                    if let Some(found) = scope.get(&caps[1]).or_else(|| get_path(&root, &caps[1])) {
                        return found.clone();
                    }
                }
            }
            Value::String(render(s, scope))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}
