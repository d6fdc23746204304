//! HTTP request node

mod auth;
mod cache;

pub use auth::{AuthType, Credentials};
pub use cache::{
    cache_key, CacheKeyParts, InMemoryResponseCache, ResponseCache, DEFAULT_MAX_ENTRIES,
    DEFAULT_TTL_SECONDS,
};

use async_trait::async_trait;
use flowcore::template::{render, template_scope};
use flowcore::value::{get_path, to_text};
use flowcore::{
    ErrorKind, ExecutionContext, ExecutionId, ExecutorMetadata, NodeError, NodeExecution,
    NodeExecutor, NodeOutput, NodeSpec, ValidationResult, Value,
};
use serde::Deserialize;
use serde_json::Map;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

pub const NODE_TYPE: &str = "http.request";

const MIN_TIMEOUT_SECONDS: u64 = 1;
const MAX_TIMEOUT_SECONDS: u64 = 300;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    #[serde(alias = "get")]
    Get,
    #[serde(alias = "post")]
    Post,
    #[serde(alias = "put")]
    Put,
    #[serde(alias = "patch")]
    Patch,
    #[serde(alias = "delete")]
    Delete,
    #[serde(alias = "head")]
    Head,
    #[serde(alias = "options")]
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }
}

/// Config of an `http.request` node.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub url: String,
    pub method: HttpMethod,
    pub headers: BTreeMap<String, Value>,
    pub params: BTreeMap<String, Value>,
    /// Sent as-is.
    pub body: Option<Value>,
    /// Rendered, then parsed as JSON if possible; takes precedence over `body`.
    pub body_template: Option<String>,
    pub auth_type: AuthType,
    #[serde(flatten)]
    pub credentials: Credentials,
    /// Run variable holding a credential object that fills missing fields.
    pub credentials_variable: Option<String>,
    /// Seconds.
    pub timeout: u64,
    pub cache_enabled: bool,
    pub cache_ttl: u64,
    pub response_path: Option<String>,
    pub validate_status: Option<u16>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            params: BTreeMap::new(),
            body: None,
            body_template: None,
            auth_type: AuthType::None,
            credentials: Credentials::default(),
            credentials_variable: None,
            timeout: 30,
            cache_enabled: false,
            cache_ttl: DEFAULT_TTL_SECONDS,
            response_path: None,
            validate_status: None,
        }
    }
}

impl HttpConfig {
    pub fn from_node_config(config: &HashMap<String, Value>) -> Result<Self, String> {
        let object: Map<String, Value> = config.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        serde_json::from_value(Value::Object(object)).map_err(|e| format!("invalid http config: {}", e))
    }
}

/// HTTP request node executor
pub struct HttpExecutor {
    cache: Arc<dyn ResponseCache>,
    clients: RwLock<HashMap<ExecutionId, reqwest::Client>>,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self::with_cache(Arc::new(InMemoryResponseCache::new()))
    }

    pub fn with_cache(cache: Arc<dyn ResponseCache>) -> Self {
        Self {
            cache,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<dyn ResponseCache> {
        &self.cache
    }

    /// Number of runs currently holding a pooled client.
    pub fn pooled_clients(&self) -> usize {
        self.clients.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn client_for(&self, execution_id: ExecutionId) -> Result<reqwest::Client, NodeError> {
        if let Some(client) = self
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&execution_id)
        {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| NodeError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        Ok(clients.entry(execution_id).or_insert(client).clone())
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn request_body(config: &HttpConfig, scope: &Map<String, Value>) -> Option<Value> {
    if let Some(template) = &config.body_template {
        let rendered = render(template, scope);
        return Some(serde_json::from_str(&rendered).unwrap_or(Value::String(rendered)));
    }
    config.body.clone()
}

fn request_error(error: reqwest::Error, timeout: u64) -> NodeError {
    if error.is_timeout() {
        NodeError::Timeout { seconds: timeout }
    } else if error.is_builder() {
        NodeError::Configuration(format!("invalid request: {}", error))
    } else if error.is_connect() {
        NodeError::Transient(format!("connection failed: {}", error))
    } else {
        NodeError::Transient(format!("HTTP request failed: {}", error))
    }
}

#[async_trait]
impl NodeExecutor for HttpExecutor {
    fn supported_node_types(&self) -> Vec<&'static str> {
        vec![NODE_TYPE]
    }

    fn validate_config(&self, config: &HashMap<String, Value>) -> ValidationResult {
        let config = match HttpConfig::from_node_config(config) {
            Ok(config) => config,
            Err(e) => return ValidationResult::from_errors(vec![e]),
        };
        let mut errors = Vec::new();
        if config.url.trim().is_empty() {
            errors.push("url is required".to_string());
        }
        if !(MIN_TIMEOUT_SECONDS..=MAX_TIMEOUT_SECONDS).contains(&config.timeout) {
            errors.push(format!(
                "timeout must be between {} and {} seconds, got {}",
                MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS, config.timeout
            ));
        }
        if let Some(status) = config.validate_status {
            if !(100..=599).contains(&status) {
                errors.push(format!("validate_status {} is not an HTTP status code", status));
            }
        }
        errors.extend(auth::validate(
            config.auth_type,
            &config.credentials,
            config.credentials_variable.is_some(),
        ));
        ValidationResult::from_errors(errors)
    }

    fn metadata(&self) -> ExecutorMetadata {
        ExecutorMetadata {
            description: "Make HTTP requests".to_string(),
            category: "http".to_string(),
        }
    }

    async fn shutdown(&self) {
        self.clients.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn release_execution(&self, execution_id: ExecutionId) {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&execution_id);
    }

    async fn execute(
        &self,
        node: &NodeSpec,
        ctx: &mut ExecutionContext,
        record: &NodeExecution,
    ) -> Result<NodeOutput, NodeError> {
        let config = HttpConfig::from_node_config(&node.config).map_err(NodeError::Configuration)?;
        let scope = template_scope(ctx, Some(&record.input_data));

        let url = render(&config.url, &scope);
        let method = config.method.as_str();
        let mut headers: BTreeMap<String, String> = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), render(&to_text(v), &scope)))
            .collect();
        let params: BTreeMap<String, String> = config
            .params
            .iter()
            .map(|(k, v)| (k.clone(), render(&to_text(v), &scope)))
            .collect();
        let body = request_body(&config, &scope);

        let mut credentials = config.credentials.clone().map(|s| render(&s, &scope));
        if let Some(variable) = &config.credentials_variable {
            let delegated = ctx.get_variable(variable).ok_or_else(|| {
                NodeError::MissingInput(format!("credentials variable '{}'", variable))
            })?;
            credentials.merge_delegated(delegated);
        }
        auth::apply(config.auth_type, &credentials, &mut headers)?;

        let key = config.cache_enabled.then(|| {
            cache_key(&CacheKeyParts {
                url: &url,
                method,
                params: &params,
                headers: &headers,
                body: body.as_ref(),
                inputs: &record.input_data,
            })
        });
        if let Some(key) = &key {
            if let Some(mut cached) = self.cache.get(key).await {
                tracing::debug!("HTTP cache hit for {} {}", method, url);
                ctx.debug("http_cache_hit", serde_json::json!({ "url": url }));
                cached["cached"] = Value::Bool(true);
                return Ok(NodeOutput::success(cached));
            }
            tracing::debug!("HTTP cache miss for {} {}", method, url);
        }

        tracing::info!("{} {}", method, url);
        ctx.debug("http_request", serde_json::json!({ "method": method, "url": url }));

        let client = self.client_for(ctx.execution_id)?;
        let mut request = client
            .request(config.method.to_reqwest(), &url)
            .timeout(Duration::from_secs(config.timeout));
        if !params.is_empty() {
            request = request.query(&params);
        }
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        request = match body {
            Some(Value::String(text)) => request.body(text),
            Some(json) => request.json(&json),
            None => request,
        };

        let started = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| request_error(e, config.timeout))?;

        let status = response.status().as_u16();
        let response_headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or("").to_string())))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| NodeError::Transient(format!("Failed to read response: {}", e)))?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        let extracted = config
            .response_path
            .as_deref()
            .map(|path| get_path(&body, path).cloned().unwrap_or(Value::Null));

        tracing::info!("Response status: {}", status);

        let mut output = serde_json::json!({
            "status": status,
            "headers": response_headers,
            "body": body,
            "url": url,
            "method": method,
            "reachable": true,
            "cached": false,
            "duration_ms": started.elapsed().as_millis() as u64,
        });
        if let Some(extracted) = extracted {
            output["extracted_value"] = extracted;
        }

        match config.validate_status {
            Some(expected) if expected != status => {
                return Ok(NodeOutput::failure(
                    output,
                    format!("Status code mismatch: expected {}, got {}", expected, status),
                    ErrorKind::Business,
                ));
            }
            Some(_) => {}
            None if !(200..300).contains(&status) => {
                let kind = if status >= 500 || status == 429 {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                };
                return Ok(NodeOutput::failure(
                    output,
                    format!("{} {} returned status {}", method, url, status),
                    kind,
                ));
            }
            None => {}
        }

        if let Some(key) = key {
            self.cache.put(key, output.clone(), config.cache_ttl).await;
        }
        Ok(NodeOutput::success(output))
    }
}
