use crate::records::{ExecutionStatus, NodeStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Notifications emitted over a run's lifecycle. Best effort only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionCreated {
        execution_id: ExecutionId,
        workflow_id: Uuid,
        total_nodes: u32,
        retry_count: u32,
        timestamp: DateTime<Utc>,
    },
    ExecutionStarted {
        execution_id: ExecutionId,
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    ExecutionProgress {
        execution_id: ExecutionId,
        node_key: String,
        node_status: NodeStatus,
        completed_nodes: u32,
        failed_nodes: u32,
        total_nodes: u32,
        progress_percentage: u8,
        timestamp: DateTime<Utc>,
    },
    ExecutionCompleted {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        duration_ms: u64,
        error_message: Option<String>,
        timestamp: DateTime<Utc>,
    },
    ExecutionCancelled {
        execution_id: ExecutionId,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ExecutionEvent::ExecutionCreated { execution_id, .. }
            | ExecutionEvent::ExecutionStarted { execution_id, .. }
            | ExecutionEvent::ExecutionProgress { execution_id, .. }
            | ExecutionEvent::ExecutionCompleted { execution_id, .. }
            | ExecutionEvent::ExecutionCancelled { execution_id, .. } => *execution_id,
        }
    }
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("No subscribers")]
    NoSubscribers,

    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Push-messaging port for live progress. Failures are logged by the
/// engine and never block it.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, event: ExecutionEvent) -> Result<(), SinkError>;
}

/// In-process event bus
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) -> Result<(), SinkError> {
        self.sender
            .send(event)
            .map(|_| ())
            .map_err(|_| SinkError::NoSubscribers)
    }
}

#[async_trait]
impl NotificationSink for EventBus {
    async fn publish(&self, event: ExecutionEvent) -> Result<(), SinkError> {
        self.emit(event)
    }
}

/// Sink that drops every event.
pub struct NullSink;

#[async_trait]
impl NotificationSink for NullSink {
    async fn publish(&self, _event: ExecutionEvent) -> Result<(), SinkError> {
        Ok(())
    }
}
