// crates/flownodes/tests/http_test.rs

use flowcore::{ErrorKind, ExecutionContext, ExecutionId, NodeExecution, NodeExecutor, NodeSpec, Value};
use flownodes::http::{cache_key, CacheKeyParts, InMemoryResponseCache, ResponseCache};
use flownodes::HttpExecutor;
use mockito::{Matcher, Server};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn http_node(config: Value) -> NodeSpec {
    let mut node = NodeSpec::new("fetch", "http.request");
    if let Value::Object(map) = config {
        node.config = map.into_iter().collect();
    }
    node
}

fn create_test_context() -> ExecutionContext {
    ExecutionContext::new(ExecutionId::new_v4(), Uuid::new_v4(), "user-1")
}

fn record_for(ctx: &ExecutionContext, node: &NodeSpec, inputs: HashMap<String, Value>) -> NodeExecution {
    let mut record = NodeExecution::new(ctx.execution_id, node, 0);
    record.input_data = inputs;
    record
}

#[tokio::test]
async fn test_http_get_with_templates_and_extraction() {
    init_tracing();
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/users/42")
        .match_query(Matcher::UrlEncoded("verbose".into(), "yes".into()))
        .match_header("x-request-user", "user-1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"user": {"id": 42, "name": "Ada"}}"#)
        .create_async()
        .await;

    let executor = HttpExecutor::new();
    let node = http_node(json!({
        "url": format!("{}/users/{{{{user_id}}}}", server.url()),
        "params": {"verbose": "yes"},
        "headers": {"x-request-user": "{{user_id_header}}"},
        "response_path": "user.name",
    }));
    let mut ctx = create_test_context();
    ctx.set_variable("user_id", json!(42));
    ctx.set_variable("user_id_header", json!("user-1"));
    let record = record_for(&ctx, &node, HashMap::new());

    let output = executor.execute(&node, &mut ctx, &record).await.unwrap();

    assert!(output.success);
    assert_eq!(output.output["status"], json!(200));
    assert_eq!(output.output["body"]["user"]["id"], json!(42));
    assert_eq!(output.output["extracted_value"], json!("Ada"));
    assert_eq!(output.output["reachable"], json!(true));
    assert_eq!(output.output["cached"], json!(false));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_http_post_with_bearer_auth_and_body_template() {
    init_tracing();
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/items")
        .match_header("authorization", "Bearer secret-token")
        .match_body(Matcher::Json(json!({"name": "widget", "qty": 3})))
        .with_status(201)
        .with_body("created")
        .create_async()
        .await;

    let executor = HttpExecutor::new();
    let node = http_node(json!({
        "url": format!("{}/items", server.url()),
        "method": "POST",
        "auth_type": "bearer",
        "token": "secret-token",
        "body_template": r#"{"name": "{{item}}", "qty": {{qty}}}"#,
    }));
    let mut ctx = create_test_context();
    let inputs = HashMap::from([
        ("item".to_string(), json!("widget")),
        ("qty".to_string(), json!(3)),
    ]);
    let record = record_for(&ctx, &node, inputs);

    let output = executor.execute(&node, &mut ctx, &record).await.unwrap();

    assert!(output.success);
    assert_eq!(output.output["status"], json!(201));
    assert_eq!(output.output["body"], json!("created"));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_http_status_mismatch_is_business_failure() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/health")
        .with_status(500)
        .with_body("boom")
        .create_async()
        .await;

    let executor = HttpExecutor::new();
    let node = http_node(json!({
        "url": format!("{}/health", server.url()),
        "validate_status": 200,
    }));
    let mut ctx = create_test_context();
    let record = record_for(&ctx, &node, HashMap::new());

    let output = executor.execute(&node, &mut ctx, &record).await.unwrap();

    assert!(!output.success);
    assert_eq!(output.error.as_deref(), Some("Status code mismatch: expected 200, got 500"));
    assert_eq!(output.error_type, Some(ErrorKind::Business));
    assert_eq!(output.output["reachable"], json!(true));
    assert!(!output.is_retryable());
}

#[tokio::test]
async fn test_http_server_error_is_transient_without_status_check() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/flaky")
        .with_status(503)
        .create_async()
        .await;

    let executor = HttpExecutor::new();
    let node = http_node(json!({ "url": format!("{}/flaky", server.url()) }));
    let mut ctx = create_test_context();
    let record = record_for(&ctx, &node, HashMap::new());

    let output = executor.execute(&node, &mut ctx, &record).await.unwrap();

    assert!(!output.success);
    assert_eq!(output.error_type, Some(ErrorKind::Transient));
    assert!(output.is_retryable());
}

#[tokio::test]
async fn test_http_not_found_is_permanent() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/missing")
        .with_status(404)
        .create_async()
        .await;

    let executor = HttpExecutor::new();
    let node = http_node(json!({ "url": format!("{}/missing", server.url()) }));
    let mut ctx = create_test_context();
    let record = record_for(&ctx, &node, HashMap::new());

    let output = executor.execute(&node, &mut ctx, &record).await.unwrap();

    assert_eq!(output.error_type, Some(ErrorKind::Permanent));
    assert!(!output.is_retryable());
}

#[tokio::test]
async fn test_http_cache_serves_repeated_request() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/rates")
        .with_status(200)
        .with_body(r#"{"eur": 1.1}"#)
        .expect(1)
        .create_async()
        .await;

    let executor = HttpExecutor::new();
    let node = http_node(json!({
        "url": format!("{}/rates", server.url()),
        "cache_enabled": true,
        "cache_ttl": 60,
    }));
    let mut ctx = create_test_context();
    let record = record_for(&ctx, &node, HashMap::new());

    let first = executor.execute(&node, &mut ctx, &record).await.unwrap();
    let second = executor.execute(&node, &mut ctx, &record).await.unwrap();

    assert_eq!(first.output["cached"], json!(false));
    assert_eq!(second.output["cached"], json!(true));
    assert_eq!(second.output["body"], json!({"eur": 1.1}));
    assert_eq!(executor.cache().len().await, 1);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_http_connection_failure_is_transient_error() {
    let executor = HttpExecutor::new();
    // Nothing listens on port 9 of localhost.
    let node = http_node(json!({ "url": "http://127.0.0.1:9/unreachable", "timeout": 2 }));
    let mut ctx = create_test_context();
    let record = record_for(&ctx, &node, HashMap::new());

    let error = executor.execute(&node, &mut ctx, &record).await.unwrap_err();

    assert!(error.is_retryable(), "unexpected error: {}", error);
}

#[tokio::test]
async fn test_http_release_execution_drops_pooled_client() {
    let mut server = Server::new_async().await;
    let _mock = server.mock("GET", "/").with_status(200).create_async().await;

    let executor = HttpExecutor::new();
    let node = http_node(json!({ "url": server.url() }));
    let mut ctx = create_test_context();
    let record = record_for(&ctx, &node, HashMap::new());

    executor.execute(&node, &mut ctx, &record).await.unwrap();
    assert_eq!(executor.pooled_clients(), 1);

    executor.release_execution(ctx.execution_id);
    assert_eq!(executor.pooled_clients(), 0);
}

#[test]
fn test_http_config_validation() {
    let executor = HttpExecutor::new();
    let config = |value: Value| -> HashMap<String, Value> {
        value.as_object().unwrap().clone().into_iter().collect()
    };

    assert!(executor.validate_config(&config(json!({"url": "https://example.com"}))).is_valid);

    let result = executor.validate_config(&config(json!({"url": "", "timeout": 0})));
    assert!(!result.is_valid);
    assert!(result.errors.iter().any(|e| e.contains("url is required")));
    assert!(result.errors.iter().any(|e| e.contains("timeout")));

    let result = executor.validate_config(&config(json!({"url": "https://x", "auth_type": "bearer"})));
    assert!(!result.is_valid);

    let result = executor.validate_config(&config(json!({"url": "https://x", "auth_type": "oauth2"})));
    assert!(result.errors.iter().any(|e| e.contains("not supported")));

    let result = executor.validate_config(&config(json!({"url": "https://x", "method": "FETCH"})));
    assert!(!result.is_valid);
}

#[test]
fn test_cache_key_is_stable_and_input_sensitive() {
    let params = BTreeMap::from([("page".to_string(), "1".to_string())]);
    let headers = BTreeMap::new();
    let inputs = HashMap::from([("q".to_string(), json!("rust"))]);
    let parts = CacheKeyParts {
        url: "https://api.example.com/search",
        method: "GET",
        params: &params,
        headers: &headers,
        body: None,
        inputs: &inputs,
    };
    let key = cache_key(&parts);
    assert_eq!(key, cache_key(&parts));
    assert_eq!(key.len(), 64);

    let other_inputs = HashMap::from([("q".to_string(), json!("go"))]);
    let changed = CacheKeyParts {
        inputs: &other_inputs,
        ..parts
    };
    assert_ne!(key, cache_key(&changed));

    let post = CacheKeyParts { method: "POST", ..parts };
    assert_ne!(key, cache_key(&post));

    let moved = CacheKeyParts {
        url: "https://api.example.com/lookup",
        ..parts
    };
    assert_ne!(key, cache_key(&moved));

    let next_page = BTreeMap::from([("page".to_string(), "2".to_string())]);
    let paged = CacheKeyParts {
        params: &next_page,
        ..parts
    };
    assert_ne!(key, cache_key(&paged));

    let accept = BTreeMap::from([("Accept".to_string(), "text/csv".to_string())]);
    let negotiated = CacheKeyParts {
        headers: &accept,
        ..parts
    };
    assert_ne!(key, cache_key(&negotiated));

    let payload = json!({"q": "rust"});
    let with_body = CacheKeyParts {
        body: Some(&payload),
        ..parts
    };
    assert_ne!(key, cache_key(&with_body));
}

#[tokio::test]
async fn test_cache_entries_expire() {
    let cache = InMemoryResponseCache::new();
    cache.put("short".to_string(), json!({"v": 1}), 1).await;
    cache.put("long".to_string(), json!({"v": 2}), 60).await;

    assert_eq!(cache.get("short").await, Some(json!({"v": 1})));
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(cache.get("short").await, None);
    assert_eq!(cache.get("long").await, Some(json!({"v": 2})));
}

#[tokio::test]
async fn test_cache_evicts_oldest_fifth_when_full() {
    let cache: Arc<dyn ResponseCache> = Arc::new(InMemoryResponseCache::with_capacity(10));
    for i in 0..11 {
        cache.put(format!("k{}", i), json!(i), 300).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert!(cache.len().await <= 10);
    assert_eq!(cache.get("k0").await, None);
    assert_eq!(cache.get("k10").await, Some(json!(10)));
}
