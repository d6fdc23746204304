use crate::{ExecutionId, Value, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One entry of the run's debug trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DebugEntry {
    pub timestamp: DateTime<Utc>,
    pub node_id: Option<String>,
    pub event: String,
    pub data: Value,
}

/// Transient per-run state threaded through every node of a run.
///
/// Lives only for the duration of the run task; nothing here is persisted
/// directly. The engine snapshots it with [`ExecutionContext::to_map`] when
/// the run finishes.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub user_id: String,
    pub variables: HashMap<String, Value>,
    pub input_data: HashMap<String, Value>,
    pub context_data: HashMap<String, Value>,
    /// Output of every finished node, keyed by node key.
    pub node_outputs: HashMap<String, Value>,
    pub started_at: DateTime<Utc>,
    pub current_node_id: Option<String>,
    pub error_count: u32,
    pub warning_count: u32,
    pub debug_trail: Vec<DebugEntry>,
}

impl ExecutionContext {
    pub fn new(execution_id: ExecutionId, workflow_id: WorkflowId, user_id: impl Into<String>) -> Self {
        Self {
            execution_id,
            workflow_id,
            user_id: user_id.into(),
            variables: HashMap::new(),
            input_data: HashMap::new(),
            context_data: HashMap::new(),
            node_outputs: HashMap::new(),
            started_at: Utc::now(),
            current_node_id: None,
            error_count: 0,
            warning_count: 0,
            debug_trail: Vec::new(),
        }
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_input(mut self, input_data: HashMap<String, Value>) -> Self {
        self.input_data = input_data;
        self
    }

    pub fn with_context_data(mut self, context_data: HashMap<String, Value>) -> Self {
        self.context_data = context_data;
        self
    }

    pub fn set_node_output(&mut self, node_key: impl Into<String>, output: Value) {
        self.node_outputs.insert(node_key.into(), output);
    }

    pub fn get_node_output(&self, node_key: &str) -> Option<&Value> {
        self.node_outputs.get(node_key)
    }

    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn get_variable_or(&self, name: &str, default: Value) -> Value {
        self.variables.get(name).cloned().unwrap_or(default)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// Append a debug entry stamped with the current time and node.
    pub fn debug(&mut self, event: impl Into<String>, data: Value) {
        self.debug_trail.push(DebugEntry {
            timestamp: Utc::now(),
            node_id: self.current_node_id.clone(),
            event: event.into(),
            data,
        });
    }

    pub fn warn(&mut self, event: impl Into<String>, data: Value) {
        self.warning_count += 1;
        self.debug(event, data);
    }

    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as u64
    }

    /// Plain-map snapshot of the whole context.
    pub fn to_map(&self) -> Value {
        serde_json::json!({
            "execution_id": self.execution_id,
            "workflow_id": self.workflow_id,
            "user_id": self.user_id,
            "variables": self.variables,
            "input_data": self.input_data,
            "context_data": self.context_data,
            "node_outputs": self.node_outputs,
            "started_at": self.started_at.to_rfc3339(),
            "current_node_id": self.current_node_id,
            "error_count": self.error_count,
            "warning_count": self.warning_count,
            "debug_trail": self.debug_trail,
        })
    }
}
