//! Standard node library
//!
//! Reference executors for the engine:
//! - `llm.chat`: chat completion against OpenAI, Anthropic, a generic REST
//!   endpoint or a local Ollama server, with token accounting
//! - `http.request`: templated outbound requests with auth and a response cache
//! - `transform`: map/filter/reduce style reshaping with a sandboxed expression language

pub mod http;
pub mod llm;
pub mod transform;

pub use http::{HttpConfig, HttpExecutor, HttpMethod, InMemoryResponseCache, ResponseCache};
pub use llm::{InMemoryUsageLedger, LlmConfig, LlmExecutor, Provider, UsageLedger};
pub use transform::{TransformExecutor, TransformOp};

use flowruntime::ExecutorRegistry;
use std::sync::Arc;

/// Register all standard executors with a registry
pub fn register_all(registry: &mut ExecutorRegistry) {
    registry.register(Arc::new(HttpExecutor::new()));
    registry.register(Arc::new(LlmExecutor::new()));
    registry.register(Arc::new(TransformExecutor::new()));
}
