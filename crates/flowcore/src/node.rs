use crate::records::NodeExecution;
use crate::template;
use crate::value::get_path;
use crate::workflow::{Connection, NodeSpec, RetryPolicy};
use crate::{ErrorKind, ExecutionContext, ExecutionId, NodeError, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::time::{sleep, Duration};

/// Capability interface every node-type handler implements.
///
/// `execute` may return `Err`; the engine never sees it directly. It always
/// goes through [`execute_with_retry`], which routes errors into
/// [`NodeExecutor::handle_error`] so a node's outcome is a [`NodeOutput`].
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Node-type tags handled by this executor (e.g. "http.request").
    fn supported_node_types(&self) -> Vec<&'static str>;

    /// Execute one node against the run context.
    async fn execute(
        &self,
        node: &NodeSpec,
        ctx: &mut ExecutionContext,
        record: &NodeExecution,
    ) -> Result<NodeOutput, NodeError>;

    /// Check a node config before any run is created.
    fn validate_config(&self, _config: &HashMap<String, Value>) -> ValidationResult {
        ValidationResult::valid()
    }

    fn metadata(&self) -> ExecutorMetadata {
        ExecutorMetadata::default()
    }

    /// Optional: Initialize stateful resources (connection pools, etc.)
    async fn initialize(&self) -> Result<(), NodeError> {
        Ok(())
    }

    /// Optional: Cleanup resources
    async fn shutdown(&self) {}

    /// Drop any per-run resources once a run has finished.
    fn release_execution(&self, _execution_id: ExecutionId) {}

    fn pre_execute(&self, node: &NodeSpec, ctx: &mut ExecutionContext) {
        ctx.current_node_id = Some(node.key.clone());
        ctx.debug(
            "node_started",
            serde_json::json!({ "node_type": node.node_type }),
        );
        tracing::debug!("Executing node {} ({})", node.key, node.node_type);
    }

    fn post_execute(&self, node: &NodeSpec, ctx: &mut ExecutionContext, result: &NodeOutput) {
        ctx.set_node_output(node.key.clone(), result.output.clone());
        ctx.debug(
            "node_completed",
            serde_json::json!({ "success": result.success }),
        );
        tracing::debug!("Node {} finished (success: {})", node.key, result.success);
    }

    /// The only way an error leaves an executor: a failure envelope.
    fn handle_error(&self, node: &NodeSpec, ctx: &mut ExecutionContext, error: &NodeError) -> NodeOutput {
        ctx.error_count += 1;
        ctx.debug(
            "node_error",
            serde_json::json!({ "error": error.to_string(), "error_type": error.kind() }),
        );
        tracing::warn!("Node {} failed: {}", node.key, error);
        NodeOutput::from_error(error)
    }

    fn resolve_template(
        &self,
        template: &str,
        ctx: &ExecutionContext,
        extras: Option<&HashMap<String, Value>>,
    ) -> String {
        template::resolve_template(template, ctx, extras)
    }
}

/// Result envelope of one node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    pub success: bool,
    /// Copied into `ExecutionContext::node_outputs` on success.
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_type: Option<ErrorKind>,
    #[serde(default)]
    pub trace: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl NodeOutput {
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            error_type: None,
            trace: None,
            metadata: HashMap::new(),
        }
    }

    /// A deliberate unsuccessful outcome. Carries no `error`, so the retry
    /// wrapper does not attempt it again.
    pub fn business_failure(output: Value) -> Self {
        Self {
            success: false,
            output,
            error: None,
            error_type: Some(ErrorKind::Business),
            trace: None,
            metadata: HashMap::new(),
        }
    }

    pub fn failure(output: Value, error: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            success: false,
            output,
            error: Some(error.into()),
            error_type: Some(kind),
            trace: None,
            metadata: HashMap::new(),
        }
    }

    pub fn from_error(error: &NodeError) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error.to_string()),
            error_type: Some(error.kind()),
            trace: Some(format!("{:?}", error)),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether the retry wrapper should attempt this node again.
    pub fn is_retryable(&self) -> bool {
        !self.success
            && self.error.is_some()
            && self.error_type.map_or(true, |kind| kind.is_retryable())
    }

    /// Short message for the node record.
    pub fn error_message(&self) -> String {
        if let Some(error) = &self.error {
            return error.clone();
        }
        self.output
            .get("message")
            .or_else(|| self.output.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| "Node reported an unsuccessful result".to_string())
    }
}

/// Outcome of `validate_config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }

    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
        }
    }
}

/// Metadata about an executor, for listings.
#[derive(Debug, Clone)]
pub struct ExecutorMetadata {
    pub description: String,
    pub category: String,
}

impl Default for ExecutorMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

/// Resolve a node's input bindings against the outputs produced so far.
/// Bindings whose source has not produced output are left out.
pub fn resolve_inputs<'a>(
    bindings: impl IntoIterator<Item = &'a Connection>,
    ctx: &ExecutionContext,
) -> HashMap<String, Value> {
    let mut inputs = HashMap::new();
    for binding in bindings {
        let Some(output) = ctx.get_node_output(&binding.from_node) else {
            tracing::debug!(
                "Input '{}' unresolved: node {} has no output",
                binding.to_port,
                binding.from_node
            );
            continue;
        };
        let value = match &binding.from_port {
            Some(port) => get_path(output, port).cloned(),
            None => Some(output.clone()),
        };
        if let Some(value) = value {
            inputs.insert(binding.to_port.clone(), value);
        }
    }
    inputs
}

/// Run `execute` up to `max_retries + 1` times with a linear backoff of
/// `delay_ms * attempt`. Returns the final envelope and the number of
/// attempts made.
pub async fn execute_with_retry(
    executor: &dyn NodeExecutor,
    node: &NodeSpec,
    ctx: &mut ExecutionContext,
    record: &NodeExecution,
    policy: &RetryPolicy,
) -> (NodeOutput, u32) {
    let max_attempts = policy.max_retries.saturating_add(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = executor.execute(node, ctx, record).await;
        let retry = match &result {
            Ok(output) => output.is_retryable(),
            Err(error) => error.is_retryable(),
        };

        if !retry || attempt >= max_attempts {
            let output = match result {
                Ok(output) => output,
                Err(error) => executor.handle_error(node, ctx, &error),
            };
            return (output, attempt);
        }

        let reason = match &result {
            Ok(output) => output.error_message(),
            Err(error) => error.to_string(),
        };
        let delay = Duration::from_millis(policy.delay_ms.saturating_mul(attempt as u64));
        tracing::info!(
            "Node {} attempt {}/{} failed ({}), retrying in {}ms",
            node.key,
            attempt,
            max_attempts,
            reason,
            delay.as_millis()
        );
        ctx.debug(
            "node_retry",
            serde_json::json!({ "attempt": attempt, "error": reason }),
        );
        sleep(delay).await;
    }
}
