use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type NodeId = Uuid;

/// Complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Variables a run request must supply.
    #[serde(default)]
    pub required_variables: Vec<String>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            connections: Vec::new(),
            required_variables: Vec::new(),
            settings: WorkflowSettings::default(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> String {
        let key = node.key.clone();
        self.nodes.push(node);
        key
    }

    /// Wire `from_node`'s output (or one key of it) into `to_node`'s input `to_port`.
    pub fn connect(
        &mut self,
        from_node: impl Into<String>,
        from_port: Option<&str>,
        to_node: impl Into<String>,
        to_port: impl Into<String>,
    ) {
        self.connections.push(Connection {
            from_node: from_node.into(),
            from_port: from_port.map(str::to_string),
            to_node: to_node.into(),
            to_port: to_port.into(),
        });
    }

    pub fn require_variable(mut self, name: impl Into<String>) -> Self {
        self.required_variables.push(name.into());
        self
    }

    pub fn find_node(&self, key: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.key == key)
    }

    /// Connections feeding the given node, in declaration order.
    pub fn incoming(&self, key: &str) -> impl Iterator<Item = &Connection> {
        let key = key.to_string();
        self.connections.iter().filter(move |c| c.to_node == key)
    }
}

/// Node specification in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(default = "Uuid::new_v4")]
    pub id: NodeId,
    /// Stable key, unique within the workflow; used by connections,
    /// templates and `node_outputs`.
    pub key: String,
    pub node_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    /// Keep the run going when this node fails.
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl NodeSpec {
    pub fn new(key: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            node_type: node_type.into(),
            name: None,
            config: HashMap::new(),
            continue_on_error: false,
            retry_policy: None,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_retry(mut self, max_retries: u32, delay_ms: u64) -> Self {
        self.retry_policy = Some(RetryPolicy {
            max_retries,
            delay_ms,
        });
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn config_value(&self) -> Value {
        Value::Object(self.config.clone().into_iter().collect())
    }
}

/// Connection between nodes. `from_port` selects a key (or path) of the
/// source node's output; without it the whole output is delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub from_node: String,
    #[serde(default)]
    pub from_port: Option<String>,
    pub to_node: String,
    pub to_port: String,
}

/// Per-node retry policy for the generic retry wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay_ms: 1000,
        }
    }
}

/// Global workflow settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Fallback run timeout when the request does not carry one.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Default node retry policy for nodes without their own.
    #[serde(default)]
    pub node_retry: Option<RetryPolicy>,
}
