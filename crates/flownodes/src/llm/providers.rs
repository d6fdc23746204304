use flowcore::{NodeError, Value};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Provider strategy of an LLM node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Hosted chat-completions API.
    Openai,
    /// Hosted messages API.
    Anthropic,
    /// Any REST endpoint accepting `{model, messages}`.
    Rest,
    /// Locally served model.
    Ollama,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Openai => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Rest => "rest",
            Provider::Ollama => "ollama",
        }
    }

    pub fn requires_credential(&self) -> bool {
        !matches!(self, Provider::Ollama)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(rename = "prompt")]
    pub prompt_tokens: u64,
    #[serde(rename = "completion")]
    pub completion_tokens: u64,
    #[serde(rename = "total")]
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// What every strategy hands back before costing.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: TokenUsage,
    pub model: String,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded: retry after {retry_after:?}s")]
    RateLimited { retry_after: Option<u64> },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout")]
    Timeout,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. } | ProviderError::Network(_) | ProviderError::Timeout => true,
            ProviderError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    fn from_status(status: u16, retry_after: Option<u64>, body: String) -> Self {
        match status {
            401 | 403 => ProviderError::Authentication(body),
            429 => ProviderError::RateLimited { retry_after },
            400 | 404 | 422 => ProviderError::InvalidRequest(body),
            _ => ProviderError::Api { status, message: body },
        }
    }
}

impl From<ProviderError> for NodeError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::InvalidResponse(_) => NodeError::ExecutionFailed(e.to_string()),
            ProviderError::Timeout => NodeError::Transient(e.to_string()),
            ref err if err.is_transient() => NodeError::Transient(e.to_string()),
            _ => NodeError::Permanent(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_builder() {
            ProviderError::InvalidRequest(e.to_string())
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

/// Dispatch `request` to the strategy for `provider`.
pub async fn complete(
    client: &reqwest::Client,
    provider: Provider,
    request: &ChatRequest,
) -> Result<Completion, ProviderError> {
    match provider {
        Provider::Openai => openai(client, request).await,
        Provider::Anthropic => anthropic(client, request).await,
        Provider::Rest => rest(client, request).await,
        Provider::Ollama => ollama(client, request).await,
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ProviderError> {
    HeaderValue::from_str(value).map_err(|e| ProviderError::InvalidRequest(e.to_string()))
}

fn bearer_headers(api_key: Option<&str>) -> Result<HeaderMap, ProviderError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(key) = api_key {
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", key))?);
    }
    Ok(headers)
}

async fn post_json(
    client: &reqwest::Client,
    url: String,
    headers: HeaderMap,
    payload: &Value,
    timeout: Duration,
) -> Result<Value, ProviderError> {
    let response = client
        .post(&url)
        .headers(headers)
        .timeout(timeout)
        .json(payload)
        .send()
        .await?;
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let text = response.text().await?;
    if !(200..300).contains(&status) {
        return Err(ProviderError::from_status(status, retry_after, text));
    }
    serde_json::from_str(&text).map_err(|e| ProviderError::InvalidResponse(e.to_string()))
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn u64_at(value: &Value, pointer: &str) -> Option<u64> {
    value.pointer(pointer).and_then(Value::as_u64)
}

async fn openai(client: &reqwest::Client, request: &ChatRequest) -> Result<Completion, ProviderError> {
    let base = request.base_url.as_deref().unwrap_or(OPENAI_BASE_URL).trim_end_matches('/');
    let payload = serde_json::json!({
        "model": request.model,
        "messages": request.messages,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
    });
    let body = post_json(
        client,
        format!("{}/chat/completions", base),
        bearer_headers(request.api_key.as_deref())?,
        &payload,
        request.timeout,
    )
    .await?;

    let content = str_at(&body, "/choices/0/message/content")
        .ok_or_else(|| ProviderError::InvalidResponse("missing choices[0].message.content".into()))?;
    Ok(Completion {
        content: content.to_string(),
        finish_reason: str_at(&body, "/choices/0/finish_reason").map(str::to_string),
        usage: TokenUsage::new(
            u64_at(&body, "/usage/prompt_tokens").unwrap_or(0),
            u64_at(&body, "/usage/completion_tokens").unwrap_or(0),
        ),
        model: str_at(&body, "/model").unwrap_or(&request.model).to_string(),
    })
}

async fn anthropic(client: &reqwest::Client, request: &ChatRequest) -> Result<Completion, ProviderError> {
    let base = request.base_url.as_deref().unwrap_or(ANTHROPIC_BASE_URL).trim_end_matches('/');
    let system: Vec<&str> = request
        .messages
        .iter()
        .filter(|m| m.role == ChatRole::System)
        .map(|m| m.content.as_str())
        .collect();
    let messages: Vec<&ChatMessage> = request
        .messages
        .iter()
        .filter(|m| m.role != ChatRole::System)
        .collect();
    let mut payload = serde_json::json!({
        "model": request.model,
        "messages": messages,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
    });
    if !system.is_empty() {
        payload["system"] = Value::String(system.join("\n\n"));
    }

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
    if let Some(key) = request.api_key.as_deref() {
        headers.insert("x-api-key", header_value(key)?);
    }

    let body = post_json(client, format!("{}/messages", base), headers, &payload, request.timeout).await?;
    let content = body
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .ok_or_else(|| ProviderError::InvalidResponse("missing content blocks".into()))?;
    Ok(Completion {
        content,
        finish_reason: str_at(&body, "/stop_reason").map(str::to_string),
        usage: TokenUsage::new(
            u64_at(&body, "/usage/input_tokens").unwrap_or(0),
            u64_at(&body, "/usage/output_tokens").unwrap_or(0),
        ),
        model: str_at(&body, "/model").unwrap_or(&request.model).to_string(),
    })
}

/// Generic REST provider. The response may use any of the common shapes.
async fn rest(client: &reqwest::Client, request: &ChatRequest) -> Result<Completion, ProviderError> {
    let url = request
        .base_url
        .clone()
        .ok_or_else(|| ProviderError::InvalidRequest("rest provider requires base_url".into()))?;
    let payload = serde_json::json!({
        "model": request.model,
        "messages": request.messages,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
    });
    let body = post_json(
        client,
        url,
        bearer_headers(request.api_key.as_deref())?,
        &payload,
        request.timeout,
    )
    .await?;

    let content = ["/content", "/text", "/output", "/choices/0/message/content", "/choices/0/text"]
        .iter()
        .find_map(|p| str_at(&body, p))
        .ok_or_else(|| ProviderError::InvalidResponse("no completion text in response".into()))?;
    let prompt = ["/usage/prompt_tokens", "/usage/input_tokens"]
        .iter()
        .find_map(|p| u64_at(&body, p))
        .unwrap_or(0);
    let completion = ["/usage/completion_tokens", "/usage/output_tokens"]
        .iter()
        .find_map(|p| u64_at(&body, p))
        .unwrap_or(0);
    let finish_reason = ["/finish_reason", "/stop_reason", "/choices/0/finish_reason"]
        .iter()
        .find_map(|p| str_at(&body, p))
        .map(str::to_string);

    Ok(Completion {
        content: content.to_string(),
        finish_reason,
        usage: TokenUsage::new(prompt, completion),
        model: str_at(&body, "/model").unwrap_or(&request.model).to_string(),
    })
}

async fn ollama(client: &reqwest::Client, request: &ChatRequest) -> Result<Completion, ProviderError> {
    let base = request.base_url.as_deref().unwrap_or(OLLAMA_BASE_URL).trim_end_matches('/');
    let payload = serde_json::json!({
        "model": request.model,
        "messages": request.messages,
        "stream": false,
        "options": {
            "temperature": request.temperature,
            "num_predict": request.max_tokens,
        },
    });
    let body = post_json(
        client,
        format!("{}/api/chat", base),
        bearer_headers(request.api_key.as_deref())?,
        &payload,
        request.timeout,
    )
    .await?;

    let content = str_at(&body, "/message/content")
        .ok_or_else(|| ProviderError::InvalidResponse("missing message.content".into()))?;
    Ok(Completion {
        content: content.to_string(),
        finish_reason: str_at(&body, "/done_reason").map(str::to_string),
        usage: TokenUsage::new(
            u64_at(&body, "/prompt_eval_count").unwrap_or(0),
            u64_at(&body, "/eval_count").unwrap_or(0),
        ),
        model: str_at(&body, "/model").unwrap_or(&request.model).to_string(),
    })
}
