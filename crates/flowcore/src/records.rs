//! Run records: one `WorkflowExecution` per run, one `NodeExecution` per
//! node per run, the queue item that schedules the run and the metrics
//! recorded against it.

use crate::{ErrorKind, ExecutionId, NodeId, NodeSpec, Value, WorkflowId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;
const MAX_TIMEOUT_SECONDS: u64 = 10 * 365 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
        )
    }

    /// Statuses from which `retry` is accepted.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Failed | ExecutionStatus::Cancelled | ExecutionStatus::Timeout
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// Structured failure detail stored next to the short `error_message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub kind: ErrorKind,
    #[serde(default)]
    pub trace: Option<String>,
    #[serde(default)]
    pub node_key: Option<String>,
}

/// Inbound "create run" request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateExecutionRequest {
    pub workflow_id: WorkflowId,
    #[serde(default)]
    pub input_data: HashMap<String, Value>,
    #[serde(default)]
    pub context_data: HashMap<String, Value>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub auto_retry: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl CreateExecutionRequest {
    pub fn new(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id,
            input_data: HashMap::new(),
            context_data: HashMap::new(),
            variables: HashMap::new(),
            priority: DEFAULT_PRIORITY,
            timeout_seconds: None,
            max_retries: None,
            auto_retry: false,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.input_data.insert(key.into(), value.into());
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, auto_retry: bool) -> Self {
        self.max_retries = Some(max_retries);
        self.auto_retry = auto_retry;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateExecutionResponse {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
}

/// One run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub correlation_id: Uuid,
    pub workflow_id: WorkflowId,
    pub user_id: String,
    pub status: ExecutionStatus,
    pub priority: u8,
    pub input_data: HashMap<String, Value>,
    pub output_data: HashMap<String, Value>,
    pub context_data: HashMap<String, Value>,
    pub variables: HashMap<String, Value>,
    pub total_nodes: u32,
    pub completed_nodes: u32,
    pub failed_nodes: u32,
    progress_percentage: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_seconds: Option<u64>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub auto_retry: bool,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, Value>,
    pub error_message: Option<String>,
    pub error_details: Option<ErrorDetails>,
}

impl WorkflowExecution {
    pub fn new(request: &CreateExecutionRequest, user_id: impl Into<String>, total_nodes: u32, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            workflow_id: request.workflow_id,
            user_id: user_id.into(),
            status: ExecutionStatus::Pending,
            priority: request.priority,
            input_data: request.input_data.clone(),
            output_data: HashMap::new(),
            context_data: request.context_data.clone(),
            variables: request.variables.clone(),
            total_nodes,
            completed_nodes: 0,
            failed_nodes: 0,
            progress_percentage: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout_seconds: request.timeout_seconds,
            timeout_at: None,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(max_retries),
            auto_retry: request.auto_retry,
            tags: request.tags.clone(),
            metadata: request.metadata.clone(),
            error_message: None,
            error_details: None,
        }
    }

    /// Always derived from the node counters.
    pub fn progress_percentage(&self) -> u8 {
        self.progress_percentage
    }

    fn recompute_progress(&mut self) {
        self.progress_percentage = if self.total_nodes == 0 {
            0
        } else {
            ((100 * self.completed_nodes as u64) / self.total_nodes as u64) as u8
        };
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(now);
        self.timeout_at = self
            .timeout_seconds
            .map(|secs| now + Duration::seconds(secs.min(MAX_TIMEOUT_SECONDS) as i64));
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.timeout_at.is_some_and(|deadline| now >= deadline)
    }

    pub fn record_node_completed(&mut self) {
        if self.completed_nodes + self.failed_nodes < self.total_nodes {
            self.completed_nodes += 1;
        }
        self.recompute_progress();
    }

    pub fn record_node_failed(&mut self) {
        if self.completed_nodes + self.failed_nodes < self.total_nodes {
            self.failed_nodes += 1;
        }
        self.recompute_progress();
    }

    pub fn finish(&mut self, status: ExecutionStatus, now: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(now);
    }

    pub fn fail_with(&mut self, status: ExecutionStatus, message: impl Into<String>, details: ErrorDetails, now: DateTime<Utc>) {
        self.error_message = Some(message.into());
        self.error_details = Some(details);
        self.finish(status, now);
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }

    /// Return to `PENDING` for another attempt, keeping the plan intact.
    pub fn reset_for_retry(&mut self) {
        self.status = ExecutionStatus::Pending;
        self.retry_count += 1;
        self.completed_nodes = 0;
        self.failed_nodes = 0;
        self.recompute_progress();
        self.output_data.clear();
        self.started_at = None;
        self.completed_at = None;
        self.timeout_at = None;
        self.error_message = None;
        self.error_details = None;
    }
}

/// One node of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: Uuid,
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub node_key: String,
    pub node_type: String,
    /// Position in the run's sequential order.
    pub execution_order: u32,
    pub status: NodeStatus,
    pub input_data: HashMap<String, Value>,
    pub output_data: Option<Value>,
    pub config: HashMap<String, Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Upstream node keys. Informational only; order comes from `execution_order`.
    pub dependencies: Vec<String>,
    pub error_message: Option<String>,
    pub error_details: Option<ErrorDetails>,
}

impl NodeExecution {
    /// A pending record for `spec` at position `execution_order`.
    pub fn new(execution_id: ExecutionId, spec: &NodeSpec, execution_order: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            node_id: spec.id,
            node_key: spec.key.clone(),
            node_type: spec.node_type.clone(),
            execution_order,
            status: NodeStatus::Pending,
            input_data: HashMap::new(),
            output_data: None,
            config: spec.config.clone(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            retry_count: 0,
            max_retries: 0,
            dependencies: Vec::new(),
            error_message: None,
            error_details: None,
        }
    }

    pub fn mark_running(&mut self, inputs: HashMap<String, Value>, now: DateTime<Utc>) {
        self.status = NodeStatus::Running;
        self.input_data = inputs;
        self.started_at = Some(now);
    }

    pub fn finish(&mut self, status: NodeStatus, now: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|start| (now - start).num_milliseconds().max(0) as u64);
    }

    pub fn skip(&mut self, now: DateTime<Utc>) {
        self.status = NodeStatus::Skipped;
        self.completed_at = Some(now);
    }

    pub fn reset(&mut self) {
        self.status = NodeStatus::Pending;
        self.input_data.clear();
        self.output_data = None;
        self.started_at = None;
        self.completed_at = None;
        self.duration_ms = None;
        self.retry_count = 0;
        self.error_message = None;
        self.error_details = None;
    }
}

/// Scheduling handle that links a run to the dispatch loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionQueueItem {
    pub id: Uuid,
    pub execution_id: ExecutionId,
    pub priority: u8,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: QueueStatus,
    pub worker_id: Option<String>,
    pub max_execution_time: Option<u64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionQueueItem {
    pub fn for_execution(execution: &WorkflowExecution) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id: execution.id,
            priority: execution.priority,
            scheduled_at: None,
            status: QueueStatus::Queued,
            worker_id: None,
            max_execution_time: execution.timeout_seconds,
            retry_count: execution.retry_count,
            max_retries: execution.max_retries,
            created_at: Utc::now(),
            claimed_at: None,
            completed_at: None,
        }
    }

    /// Queued and not scheduled in the future.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Queued && self.scheduled_at.map_or(true, |at| at <= now)
    }

    pub fn claim(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = QueueStatus::Processing;
        self.worker_id = Some(worker_id.to_string());
        self.claimed_at = Some(now);
    }

    pub fn release(&mut self, status: QueueStatus, now: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(now);
    }

    pub fn requeue(&mut self, scheduled_at: Option<DateTime<Utc>>) {
        self.status = QueueStatus::Queued;
        self.worker_id = None;
        self.claimed_at = None;
        self.completed_at = None;
        self.scheduled_at = scheduled_at;
        self.retry_count += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Structured(Value),
}

/// A typed measurement tied to a run and optionally one of its nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetric {
    pub id: Uuid,
    pub execution_id: ExecutionId,
    pub node_execution_id: Option<Uuid>,
    pub name: String,
    pub value: MetricValue,
    pub context: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ExecutionMetric {
    pub fn new(execution_id: ExecutionId, name: impl Into<String>, value: MetricValue) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            node_execution_id: None,
            name: name.into(),
            value,
            context: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn for_node(mut self, node_execution_id: Uuid) -> Self {
        self.node_execution_id = Some(node_execution_id);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}
