//! LLM chat node

mod providers;
mod usage;

pub use providers::{ChatMessage, ChatRole, Completion, Provider, ProviderError, TokenUsage};
pub use usage::{estimate_cost, rate_for, InMemoryUsageLedger, UsageLedger, UsageTotals};

use async_trait::async_trait;
use flowcore::template::{render, template_scope};
use flowcore::{
    ExecutionContext, ExecutorMetadata, NodeError, NodeExecution, NodeExecutor, NodeOutput,
    NodeSpec, ValidationResult, Value,
};
use providers::ChatRequest;
use serde::Deserialize;
use serde_json::Map;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

pub const NODE_TYPE: &str = "llm.chat";

const MAX_TOKENS_LIMIT: i64 = 100_000;

/// Config of an `llm.chat` node.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: Option<Provider>,
    pub model: String,
    pub prompt: Option<String>,
    pub system_prompt: Option<String>,
    /// Used instead of `prompt`/`system_prompt` when non-empty.
    pub messages: Vec<ChatMessage>,
    pub max_tokens: i64,
    pub temperature: f64,
    pub api_key: Option<String>,
    /// Run variable holding the user's own credential.
    pub api_key_variable: Option<String>,
    pub base_url: Option<String>,
    /// Seconds.
    pub timeout: u64,
    /// Extra attempts on transient provider errors, on top of the engine's node retry.
    pub provider_retries: u32,
    pub provider_retry_delay_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: String::new(),
            prompt: None,
            system_prompt: None,
            messages: Vec::new(),
            max_tokens: 1000,
            temperature: 0.7,
            api_key: None,
            api_key_variable: None,
            base_url: None,
            timeout: 60,
            provider_retries: 0,
            provider_retry_delay_ms: 500,
        }
    }
}

impl LlmConfig {
    pub fn from_node_config(config: &HashMap<String, Value>) -> Result<Self, String> {
        let object: Map<String, Value> = config.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        serde_json::from_value(Value::Object(object)).map_err(|e| format!("invalid llm config: {}", e))
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let Some(provider) = self.provider else {
            errors.push("provider is required".to_string());
            return errors;
        };
        if self.model.trim().is_empty() {
            errors.push("model is required".to_string());
        }
        if self.prompt.as_deref().map_or(true, |p| p.trim().is_empty()) && self.messages.is_empty() {
            errors.push("prompt or messages is required".to_string());
        }
        if !(1..=MAX_TOKENS_LIMIT).contains(&self.max_tokens) {
            errors.push(format!(
                "max_tokens must be between 1 and {}, got {}",
                MAX_TOKENS_LIMIT, self.max_tokens
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            errors.push(format!("temperature must be between 0 and 2, got {}", self.temperature));
        }
        if provider.requires_credential() && self.api_key.is_none() && self.api_key_variable.is_none() {
            errors.push(format!(
                "provider '{}' requires api_key or api_key_variable",
                provider.as_str()
            ));
        }
        if provider == Provider::Rest && self.base_url.is_none() {
            errors.push("provider 'rest' requires base_url".to_string());
        }
        errors
    }

    /// Template-resolve the conversation.
    fn messages(&self, scope: &Map<String, Value>) -> Vec<ChatMessage> {
        if !self.messages.is_empty() {
            return self
                .messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role,
                    content: render(&m.content, scope),
                })
                .collect();
        }
        let mut messages = Vec::new();
        if let Some(system) = &self.system_prompt {
            messages.push(ChatMessage {
                role: ChatRole::System,
                content: render(system, scope),
            });
        }
        if let Some(prompt) = &self.prompt {
            messages.push(ChatMessage {
                role: ChatRole::User,
                content: render(prompt, scope),
            });
        }
        messages
    }
}

/// LLM chat node executor
pub struct LlmExecutor {
    client: reqwest::Client,
    ledger: Arc<dyn UsageLedger>,
}

impl LlmExecutor {
    pub fn new() -> Self {
        Self::with_ledger(Arc::new(InMemoryUsageLedger::new()))
    }

    pub fn with_ledger(ledger: Arc<dyn UsageLedger>) -> Self {
        Self {
            client: reqwest::Client::new(),
            ledger,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn UsageLedger> {
        &self.ledger
    }

    async fn complete_with_retries(
        &self,
        provider: Provider,
        request: &ChatRequest,
        config: &LlmConfig,
        user_id: &str,
    ) -> Result<Completion, ProviderError> {
        let mut attempt = 0;
        loop {
            match providers::complete(&self.client, provider, request).await {
                Ok(completion) => return Ok(completion),
                Err(e) => {
                    if matches!(e, ProviderError::RateLimited { .. }) {
                        tracing::warn!("{} rate limited user {} on {}", provider.as_str(), user_id, request.model);
                        self.ledger.record_rate_limit(user_id, &request.model).await;
                    }
                    if !e.is_transient() || attempt >= config.provider_retries {
                        return Err(e);
                    }
                    attempt += 1;
                    let delay = config.provider_retry_delay_ms.saturating_mul(attempt as u64);
                    tracing::info!(
                        "{} call failed ({}), provider retry {}/{} in {}ms",
                        provider.as_str(),
                        e,
                        attempt,
                        config.provider_retries,
                        delay
                    );
                    sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }
}

impl Default for LlmExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeExecutor for LlmExecutor {
    fn supported_node_types(&self) -> Vec<&'static str> {
        vec![NODE_TYPE]
    }

    fn validate_config(&self, config: &HashMap<String, Value>) -> ValidationResult {
        match LlmConfig::from_node_config(config) {
            Ok(config) => ValidationResult::from_errors(config.validate()),
            Err(e) => ValidationResult::from_errors(vec![e]),
        }
    }

    fn metadata(&self) -> ExecutorMetadata {
        ExecutorMetadata {
            description: "Chat completion against a hosted, REST or local model".to_string(),
            category: "ai".to_string(),
        }
    }

    async fn execute(
        &self,
        node: &NodeSpec,
        ctx: &mut ExecutionContext,
        record: &NodeExecution,
    ) -> Result<NodeOutput, NodeError> {
        let config = LlmConfig::from_node_config(&node.config).map_err(NodeError::Configuration)?;
        let provider = config
            .provider
            .ok_or_else(|| NodeError::Configuration("provider is required".to_string()))?;
        let scope = template_scope(ctx, Some(&record.input_data));

        let api_key = match (&config.api_key, &config.api_key_variable) {
            (Some(key), _) => Some(render(key, &scope)),
            (None, Some(variable)) => Some(
                ctx.get_variable(variable)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| NodeError::MissingInput(format!("credential variable '{}'", variable)))?,
            ),
            (None, None) => None,
        };

        let request = ChatRequest {
            model: config.model.clone(),
            messages: config.messages(&scope),
            max_tokens: config.max_tokens.clamp(1, MAX_TOKENS_LIMIT) as u32,
            temperature: config.temperature,
            api_key,
            base_url: config.base_url.as_ref().map(|url| render(url, &scope)),
            timeout: Duration::from_secs(config.timeout.max(1)),
        };

        tracing::info!("{} chat completion with {}", provider.as_str(), request.model);
        let completion = self
            .complete_with_retries(provider, &request, &config, &ctx.user_id)
            .await?;

        let cost = estimate_cost(&completion.model, &completion.usage);
        self.ledger
            .record_usage(&ctx.user_id, &config.model, &completion.usage, cost)
            .await;
        let token_usage = serde_json::to_value(completion.usage)
            .map_err(|e| NodeError::ExecutionFailed(e.to_string()))?;
        ctx.debug(
            "llm_completion",
            serde_json::json!({
                "provider": provider.as_str(),
                "model": completion.model,
                "total_tokens": completion.usage.total_tokens,
            }),
        );

        let output = serde_json::json!({
            "content": completion.content,
            "finish_reason": completion.finish_reason,
            "token_usage": token_usage,
            "estimated_cost": cost,
            "model": completion.model,
            "provider": provider.as_str(),
        });
        Ok(NodeOutput::success(output).with_metadata("token_usage", token_usage))
    }
}
