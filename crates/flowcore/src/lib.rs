//! Core abstractions for the flow engine
//!
//! This crate provides the fundamental types and traits that all other
//! components depend on: workflow definitions, run records, the per-run
//! execution context and the contract every node executor implements.

mod context;
mod error;
pub mod events;
mod node;
pub mod records;
pub mod template;
pub mod value;
mod workflow;

pub use context::{DebugEntry, ExecutionContext};
pub use error::{ErrorKind, FlowError, NodeError, WorkflowError};
pub use events::*;
pub use node::{
    execute_with_retry, resolve_inputs, ExecutorMetadata, NodeExecutor, NodeOutput,
    ValidationResult,
};
pub use records::{
    CreateExecutionRequest, CreateExecutionResponse, ErrorDetails, ExecutionMetric,
    ExecutionQueueItem, ExecutionStatus, MetricValue, NodeExecution, NodeStatus, QueueStatus,
    WorkflowExecution,
};
pub use serde_json::Value;
pub use workflow::{
    Connection, NodeId, NodeSpec, RetryPolicy, Workflow, WorkflowId, WorkflowSettings,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
