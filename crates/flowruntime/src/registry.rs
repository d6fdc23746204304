use flowcore::{ExecutorMetadata, NodeError, NodeExecutor, ValidationResult, Value, WorkflowError};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of node executors, keyed by node-type tag.
///
/// Built once at start-up and handed to the engine behind an `Arc`; it is
/// read-only while runs execute.
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor under every node type it supports
    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) {
        for node_type in executor.supported_node_types() {
            tracing::info!("Registering node type: {}", node_type);
            self.executors.insert(node_type.to_string(), executor.clone());
        }
    }

    pub fn get(&self, node_type: &str) -> Result<Arc<dyn NodeExecutor>, WorkflowError> {
        self.executors
            .get(node_type)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownNodeType(node_type.to_string()))
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.executors.contains_key(node_type)
    }

    /// Validate a node config with the executor for its type.
    pub fn validate_config(
        &self,
        node_type: &str,
        config: &HashMap<String, Value>,
    ) -> Result<ValidationResult, WorkflowError> {
        Ok(self.get(node_type)?.validate_config(config))
    }

    /// Get all registered node types, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for a node type
    pub fn get_metadata(&self, node_type: &str) -> Option<ExecutorMetadata> {
        self.executors.get(node_type).map(|e| e.metadata())
    }

    /// Distinct executor instances (one executor may serve several types).
    fn distinct(&self) -> Vec<Arc<dyn NodeExecutor>> {
        let mut seen: Vec<Arc<dyn NodeExecutor>> = Vec::new();
        for executor in self.executors.values() {
            if !seen.iter().any(|e| Arc::ptr_eq(e, executor)) {
                seen.push(executor.clone());
            }
        }
        seen
    }

    pub async fn initialize_all(&self) -> Result<(), NodeError> {
        for executor in self.distinct() {
            executor.initialize().await?;
        }
        Ok(())
    }

    pub async fn shutdown_all(&self) {
        for executor in self.distinct() {
            executor.shutdown().await;
        }
    }

    pub fn release_execution(&self, execution_id: flowcore::ExecutionId) {
        for executor in self.distinct() {
            executor.release_execution(execution_id);
        }
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
