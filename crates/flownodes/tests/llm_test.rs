// crates/flownodes/tests/llm_test.rs

use flowcore::{ErrorKind, ExecutionContext, ExecutionId, NodeError, NodeExecution, NodeExecutor, NodeSpec, Value};
use flownodes::llm::{InMemoryUsageLedger, UsageLedger};
use flownodes::LlmExecutor;
use mockito::{Matcher, Server};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

fn llm_node(config: Value) -> NodeSpec {
    let mut node = NodeSpec::new("summarize", "llm.chat");
    if let Value::Object(map) = config {
        node.config = map.into_iter().collect();
    }
    node
}

fn create_test_context() -> ExecutionContext {
    ExecutionContext::new(ExecutionId::new_v4(), Uuid::new_v4(), "user-7")
}

fn config_map(value: Value) -> HashMap<String, Value> {
    value.as_object().unwrap().clone().into_iter().collect()
}

const OPENAI_REPLY: &str = r#"{
    "model": "gpt-4o-mini",
    "choices": [{"message": {"role": "assistant", "content": "Short summary."}, "finish_reason": "stop"}],
    "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
}"#;

#[tokio::test]
async fn test_openai_completion_records_usage() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-test")
        .match_body(Matcher::PartialJson(json!({
            "model": "gpt-4o-mini",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "Summarize: Rust 1.0"}
            ]
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(OPENAI_REPLY)
        .create_async()
        .await;

    let ledger = Arc::new(InMemoryUsageLedger::new());
    let executor = LlmExecutor::with_ledger(ledger.clone());
    let node = llm_node(json!({
        "provider": "openai",
        "model": "gpt-4o-mini",
        "system_prompt": "Be brief.",
        "prompt": "Summarize: {{title}}",
        "api_key": "sk-test",
        "base_url": server.url(),
    }));
    let mut ctx = create_test_context().with_input(HashMap::from([("title".to_string(), json!("Rust 1.0"))]));
    let record = NodeExecution::new(ctx.execution_id, &node, 0);

    let output = executor.execute(&node, &mut ctx, &record).await.unwrap();

    assert!(output.success);
    assert_eq!(output.output["content"], json!("Short summary."));
    assert_eq!(output.output["finish_reason"], json!("stop"));
    assert_eq!(output.output["token_usage"], json!({"prompt": 12, "completion": 4, "total": 16}));
    assert_eq!(output.output["provider"], json!("openai"));
    assert_eq!(output.metadata["token_usage"]["total"], json!(16));
    // 12/1000 * 0.00015 + 4/1000 * 0.0006
    assert_eq!(output.output["estimated_cost"], json!(0.000004));

    let totals = ledger.totals("user-7", "gpt-4o-mini").await;
    assert_eq!(totals.total_tokens, 16);
    assert_eq!(totals.requests, 1);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_anthropic_sends_system_prompt_separately() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/messages")
        .match_header("x-api-key", "ak-test")
        .match_header("anthropic-version", Matcher::Any)
        .match_body(Matcher::PartialJson(json!({
            "system": "You are terse.",
            "messages": [{"role": "user", "content": "Hi"}]
        })))
        .with_status(200)
        .with_body(
            r#"{
                "model": "claude-3-5-haiku-20241022",
                "content": [{"type": "text", "text": "Hel"}, {"type": "text", "text": "lo"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 5, "output_tokens": 2}
            }"#,
        )
        .create_async()
        .await;

    let executor = LlmExecutor::new();
    let node = llm_node(json!({
        "provider": "anthropic",
        "model": "claude-3-5-haiku-20241022",
        "messages": [
            {"role": "system", "content": "You are terse."},
            {"role": "user", "content": "Hi"}
        ],
        "api_key_variable": "anthropic_key",
        "base_url": server.url(),
    }));
    let mut ctx = create_test_context();
    ctx.set_variable("anthropic_key", json!("ak-test"));
    let record = NodeExecution::new(ctx.execution_id, &node, 0);

    let output = executor.execute(&node, &mut ctx, &record).await.unwrap();

    assert_eq!(output.output["content"], json!("Hello"));
    assert_eq!(output.output["finish_reason"], json!("end_turn"));
    assert_eq!(output.output["token_usage"]["total"], json!(7));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_rate_limit_is_transient_and_counted() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat/completions")
        .with_status(429)
        .with_header("retry-after", "30")
        .with_body(r#"{"error": "slow down"}"#)
        .expect(2)
        .create_async()
        .await;

    let ledger = Arc::new(InMemoryUsageLedger::new());
    let executor = LlmExecutor::with_ledger(ledger.clone());
    let node = llm_node(json!({
        "provider": "openai",
        "model": "gpt-4",
        "prompt": "hello",
        "api_key": "sk-test",
        "base_url": server.url(),
        "provider_retries": 1,
        "provider_retry_delay_ms": 1,
    }));
    let mut ctx = create_test_context();
    let record = NodeExecution::new(ctx.execution_id, &node, 0);

    let error = executor.execute(&node, &mut ctx, &record).await.unwrap_err();

    assert!(matches!(error, NodeError::Transient(_)), "got {:?}", error);
    assert_eq!(error.kind(), ErrorKind::Transient);
    let totals = ledger.totals("user-7", "gpt-4").await;
    assert_eq!(totals.rate_limit_hits, 2);
    assert_eq!(totals.requests, 0);
}

#[tokio::test]
async fn test_authentication_failure_is_permanent() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat/completions")
        .with_status(401)
        .with_body("bad key")
        .create_async()
        .await;

    let executor = LlmExecutor::new();
    let node = llm_node(json!({
        "provider": "openai",
        "model": "gpt-4o",
        "prompt": "hello",
        "api_key": "wrong",
        "base_url": server.url(),
    }));
    let mut ctx = create_test_context();
    let record = NodeExecution::new(ctx.execution_id, &node, 0);

    let error = executor.execute(&node, &mut ctx, &record).await.unwrap_err();

    assert!(matches!(error, NodeError::Permanent(_)), "got {:?}", error);
    assert!(!error.is_retryable());
}

#[tokio::test]
async fn test_ollama_needs_no_credential() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/chat")
        .with_status(200)
        .with_body(
            r#"{"model": "llama3", "message": {"role": "assistant", "content": "local"},
                "done_reason": "stop", "prompt_eval_count": 3, "eval_count": 1}"#,
        )
        .create_async()
        .await;

    let executor = LlmExecutor::new();
    let config = json!({
        "provider": "ollama",
        "model": "llama3",
        "prompt": "ping",
        "base_url": server.url(),
    });
    assert!(executor.validate_config(&config_map(config.clone())).is_valid);

    let node = llm_node(config);
    let mut ctx = create_test_context();
    let record = NodeExecution::new(ctx.execution_id, &node, 0);
    let output = executor.execute(&node, &mut ctx, &record).await.unwrap();

    assert_eq!(output.output["content"], json!("local"));
    assert_eq!(output.output["token_usage"]["total"], json!(4));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_missing_credential_variable_fails() {
    let executor = LlmExecutor::new();
    let node = llm_node(json!({
        "provider": "openai",
        "model": "gpt-4o",
        "prompt": "hello",
        "api_key_variable": "openai_key",
    }));
    let mut ctx = create_test_context();
    let record = NodeExecution::new(ctx.execution_id, &node, 0);

    let error = executor.execute(&node, &mut ctx, &record).await.unwrap_err();
    assert!(matches!(error, NodeError::MissingInput(_)));
}

#[test]
fn test_llm_config_validation() {
    let executor = LlmExecutor::new();

    let result = executor.validate_config(&config_map(json!({"model": "gpt-4o", "prompt": "x"})));
    assert_eq!(result.errors, vec!["provider is required".to_string()]);

    let result = executor.validate_config(&config_map(json!({
        "provider": "openai",
        "model": "gpt-4o",
        "prompt": "x",
        "max_tokens": 0,
        "temperature": 3.0,
    })));
    assert!(result.errors.iter().any(|e| e.contains("max_tokens")));
    assert!(result.errors.iter().any(|e| e.contains("temperature")));
    assert!(result.errors.iter().any(|e| e.contains("api_key")));

    let result = executor.validate_config(&config_map(json!({
        "provider": "rest",
        "model": "custom",
        "prompt": "x",
        "api_key": "k",
    })));
    assert!(result.errors.iter().any(|e| e.contains("base_url")));

    let result = executor.validate_config(&config_map(json!({"provider": "cohere", "model": "m", "prompt": "x"})));
    assert!(!result.is_valid);
}
