use crate::engine::ExecutionEngine;
use crate::registry::ExecutorRegistry;
use crate::store::{ExecutionStore, InMemoryStore};
use flowcore::{
    CreateExecutionRequest, CreateExecutionResponse, EventBus, ExecutionEvent, FlowError,
    NotificationSink, Workflow, WorkflowExecution,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Main runtime: wires a registry, a store and the event bus into an engine.
pub struct FlowRuntime {
    registry: Arc<ExecutorRegistry>,
    store: Arc<dyn ExecutionStore>,
    event_bus: Arc<EventBus>,
    engine: Arc<ExecutionEngine>,
}

impl FlowRuntime {
    /// Create a new runtime with default settings and no executors
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(ExecutorRegistry::new()), config)
    }

    /// Create a new runtime with a pre-configured registry and an in-memory store
    pub fn with_registry(registry: Arc<ExecutorRegistry>, config: RuntimeConfig) -> Self {
        Self::with_store(registry, Arc::new(InMemoryStore::new()), config)
    }

    pub fn with_store(
        registry: Arc<ExecutorRegistry>,
        store: Arc<dyn ExecutionStore>,
        config: RuntimeConfig,
    ) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let sink: Arc<dyn NotificationSink> = event_bus.clone();
        let engine = Arc::new(ExecutionEngine::new(
            registry.clone(),
            store.clone(),
            sink,
            config,
        ));

        Self {
            registry,
            store,
            event_bus,
            engine,
        }
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// Register a workflow
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<(), FlowError> {
        self.store.put_workflow(workflow).await?;
        Ok(())
    }

    /// Create a run; it is picked up by the dispatch loop.
    pub async fn submit(
        &self,
        request: CreateExecutionRequest,
        user_id: &str,
    ) -> Result<CreateExecutionResponse, FlowError> {
        self.engine.create_execution(request, user_id).await
    }

    /// Register, submit, start and wait for one run of `workflow`.
    pub async fn execute(
        &self,
        workflow: Workflow,
        request: CreateExecutionRequest,
        user_id: &str,
        wait: Duration,
    ) -> Result<WorkflowExecution, FlowError> {
        self.register_workflow(workflow).await?;
        let created = self.submit(request, user_id).await?;
        self.engine.start(created.execution_id).await?;
        self.engine.wait_for_completion(created.execution_id, wait).await
    }

    /// Start the background dispatch loop.
    pub fn start_dispatcher(&self) -> JoinHandle<()> {
        self.engine.spawn_dispatcher()
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Written into claimed queue items.
    pub worker_id: String,
    pub poll_interval_ms: u64,
    pub max_concurrent_runs: usize,
    pub default_timeout_seconds: u64,
    pub default_max_retries: u32,
    /// Base delay of the node retry wrapper when a node has no policy.
    pub node_retry_delay_ms: u64,
    /// Base delay before an automatically retried run becomes claimable.
    pub auto_retry_delay_ms: u64,
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", std::process::id()),
            poll_interval_ms: 500,
            max_concurrent_runs: 10,
            default_timeout_seconds: 3600,
            default_max_retries: 3,
            node_retry_delay_ms: 1000,
            auto_retry_delay_ms: 5000,
            event_buffer_size: 1000,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> Result<Self, FlowError> {
        Ok(serde_json::from_str(json)?)
    }
}
