//! Persistence port for run records plus an in-memory implementation.
//!
//! Every method is a single-row read or write (or a range read); the engine
//! never needs a transaction spanning rows.

use crate::queue;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowcore::{
    ExecutionId, ExecutionMetric, ExecutionQueueItem, ExecutionStatus, FlowError, NodeExecution,
    NodeStatus, Workflow, WorkflowExecution, WorkflowId,
};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for FlowError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => FlowError::NotFound(what),
            other => FlowError::Store(other.to_string()),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Range filter for [`ExecutionStore::list_executions`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub status: Option<ExecutionStatus>,
    pub min_priority: Option<u8>,
    pub created_after: Option<DateTime<Utc>>,
    pub workflow_id: Option<WorkflowId>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn put_workflow(&self, workflow: Workflow) -> StoreResult<()>;
    async fn get_workflow(&self, id: WorkflowId) -> StoreResult<Workflow>;

    async fn insert_execution(&self, execution: WorkflowExecution) -> StoreResult<()>;
    async fn get_execution(&self, id: ExecutionId) -> StoreResult<WorkflowExecution>;
    async fn update_execution(&self, execution: &WorkflowExecution) -> StoreResult<()>;
    /// Newest first.
    async fn list_executions(&self, filter: &ExecutionFilter) -> StoreResult<Vec<WorkflowExecution>>;

    async fn insert_node_executions(&self, nodes: Vec<NodeExecution>) -> StoreResult<()>;
    /// Ordered by `execution_order`.
    async fn list_node_executions(&self, execution_id: ExecutionId) -> StoreResult<Vec<NodeExecution>>;
    async fn update_node_execution(&self, node: &NodeExecution) -> StoreResult<()>;
    /// Move every `PENDING`/`RUNNING` node of a run to `SKIPPED`; returns how many moved.
    async fn skip_unfinished_nodes(&self, execution_id: ExecutionId, now: DateTime<Utc>) -> StoreResult<u32>;

    async fn enqueue(&self, item: ExecutionQueueItem) -> StoreResult<()>;
    /// Atomically claim the best ready item for `worker_id`.
    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> StoreResult<Option<ExecutionQueueItem>>;
    /// Atomically claim the queued item of one run.
    async fn claim_execution(
        &self,
        execution_id: ExecutionId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ExecutionQueueItem>>;
    async fn get_queue_item(&self, execution_id: ExecutionId) -> StoreResult<ExecutionQueueItem>;
    async fn update_queue_item(&self, item: &ExecutionQueueItem) -> StoreResult<()>;

    async fn record_metric(&self, metric: ExecutionMetric) -> StoreResult<()>;
    async fn list_metrics(&self, execution_id: ExecutionId) -> StoreResult<Vec<ExecutionMetric>>;
}

#[derive(Default)]
struct Tables {
    workflows: HashMap<WorkflowId, Workflow>,
    executions: HashMap<ExecutionId, WorkflowExecution>,
    nodes: HashMap<ExecutionId, Vec<NodeExecution>>,
    queue: HashMap<ExecutionId, ExecutionQueueItem>,
    metrics: HashMap<ExecutionId, Vec<ExecutionMetric>>,
}

/// Single-process store. Each call takes the lock once, so every row
/// operation is atomic with respect to the others.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn put_workflow(&self, workflow: Workflow) -> StoreResult<()> {
        self.tables.write().await.workflows.insert(workflow.id, workflow);
        Ok(())
    }

    async fn get_workflow(&self, id: WorkflowId) -> StoreResult<Workflow> {
        self.tables
            .read()
            .await
            .workflows
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("workflow {}", id)))
    }

    async fn insert_execution(&self, execution: WorkflowExecution) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.executions.contains_key(&execution.id) {
            return Err(StoreError::Conflict(format!("execution {} exists", execution.id)));
        }
        tables.executions.insert(execution.id, execution);
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> StoreResult<WorkflowExecution> {
        self.tables
            .read()
            .await
            .executions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("execution {}", id)))
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let row = tables
            .executions
            .get_mut(&execution.id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {}", execution.id)))?;
        *row = execution.clone();
        Ok(())
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> StoreResult<Vec<WorkflowExecution>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<WorkflowExecution> = tables
            .executions
            .values()
            .filter(|e| filter.status.map_or(true, |s| e.status == s))
            .filter(|e| filter.min_priority.map_or(true, |p| e.priority >= p))
            .filter(|e| filter.created_after.map_or(true, |t| e.created_at > t))
            .filter(|e| filter.workflow_id.map_or(true, |w| e.workflow_id == w))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert_node_executions(&self, nodes: Vec<NodeExecution>) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        for node in nodes {
            tables.nodes.entry(node.execution_id).or_default().push(node);
        }
        Ok(())
    }

    async fn list_node_executions(&self, execution_id: ExecutionId) -> StoreResult<Vec<NodeExecution>> {
        let tables = self.tables.read().await;
        let mut rows = tables.nodes.get(&execution_id).cloned().unwrap_or_default();
        rows.sort_by_key(|n| n.execution_order);
        Ok(rows)
    }

    async fn update_node_execution(&self, node: &NodeExecution) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let row = tables
            .nodes
            .get_mut(&node.execution_id)
            .and_then(|rows| rows.iter_mut().find(|n| n.id == node.id))
            .ok_or_else(|| StoreError::NotFound(format!("node execution {}", node.id)))?;
        *row = node.clone();
        Ok(())
    }

    async fn skip_unfinished_nodes(&self, execution_id: ExecutionId, now: DateTime<Utc>) -> StoreResult<u32> {
        let mut tables = self.tables.write().await;
        let mut skipped = 0;
        if let Some(rows) = tables.nodes.get_mut(&execution_id) {
            for node in rows
                .iter_mut()
                .filter(|n| matches!(n.status, NodeStatus::Pending | NodeStatus::Running))
            {
                node.skip(now);
                skipped += 1;
            }
        }
        Ok(skipped)
    }

    async fn enqueue(&self, item: ExecutionQueueItem) -> StoreResult<()> {
        self.tables.write().await.queue.insert(item.execution_id, item);
        Ok(())
    }

    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> StoreResult<Option<ExecutionQueueItem>> {
        let mut tables = self.tables.write().await;
        let Some(execution_id) = queue::pick_next(tables.queue.values(), now) else {
            return Ok(None);
        };
        let item = tables
            .queue
            .get_mut(&execution_id)
            .ok_or_else(|| StoreError::NotFound(format!("queue item {}", execution_id)))?;
        item.claim(worker_id, now);
        Ok(Some(item.clone()))
    }

    async fn claim_execution(
        &self,
        execution_id: ExecutionId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ExecutionQueueItem>> {
        let mut tables = self.tables.write().await;
        let item = tables
            .queue
            .get_mut(&execution_id)
            .ok_or_else(|| StoreError::NotFound(format!("queue item {}", execution_id)))?;
        if item.status != flowcore::QueueStatus::Queued {
            return Ok(None);
        }
        item.claim(worker_id, now);
        Ok(Some(item.clone()))
    }

    async fn get_queue_item(&self, execution_id: ExecutionId) -> StoreResult<ExecutionQueueItem> {
        self.tables
            .read()
            .await
            .queue
            .get(&execution_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("queue item {}", execution_id)))
    }

    async fn update_queue_item(&self, item: &ExecutionQueueItem) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let row = tables
            .queue
            .get_mut(&item.execution_id)
            .ok_or_else(|| StoreError::NotFound(format!("queue item {}", item.execution_id)))?;
        *row = item.clone();
        Ok(())
    }

    async fn record_metric(&self, metric: ExecutionMetric) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .metrics
            .entry(metric.execution_id)
            .or_default()
            .push(metric);
        Ok(())
    }

    async fn list_metrics(&self, execution_id: ExecutionId) -> StoreResult<Vec<ExecutionMetric>> {
        Ok(self
            .tables
            .read()
            .await
            .metrics
            .get(&execution_id)
            .cloned()
            .unwrap_or_default())
    }
}
