//! Workflow execution runtime
//!
//! This crate provides the engine that runs workflows: the executor registry,
//! the run store, the priority queue, the execution planner, and the dispatch
//! loop with its control operations (start, cancel, retry).

mod engine;
pub mod planner;
pub mod queue;
mod registry;
mod runtime;
mod store;

pub use engine::ExecutionEngine;
pub use registry::ExecutorRegistry;
pub use runtime::{FlowRuntime, RuntimeConfig};
pub use store::{ExecutionFilter, ExecutionStore, InMemoryStore, StoreError, StoreResult};
