// crates/flownodes/tests/pipeline_test.rs

use flowcore::{
    CreateExecutionRequest, ExecutionEvent, ExecutionStatus, NodeSpec, NodeStatus, Workflow,
};
use flownodes::register_all;
use flowruntime::{ExecutorRegistry, FlowRuntime, RuntimeConfig};
use mockito::{Matcher, Server};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn create_runtime() -> FlowRuntime {
    let mut registry = ExecutorRegistry::new();
    register_all(&mut registry);
    let config = RuntimeConfig {
        node_retry_delay_ms: 1,
        ..RuntimeConfig::default()
    };
    FlowRuntime::with_registry(Arc::new(registry), config)
}

fn fetch_extract_summarize(api_url: &str, llm_url: &str) -> Workflow {
    let mut workflow = Workflow::new("article summary");
    workflow.add_node(
        NodeSpec::new("fetch", "http.request")
            .with_config("url", format!("{}/articles/{{{{article_id}}}}", api_url))
            .with_config("validate_status", 200),
    );
    workflow.add_node(
        NodeSpec::new("extract", "transform")
            .with_config("transform_type", "extract")
            .with_config("path", "body.title"),
    );
    workflow.add_node(
        NodeSpec::new("summarize", "llm.chat")
            .with_config("provider", "openai")
            .with_config("model", "gpt-4o-mini")
            .with_config("prompt", "Summarize: {{extract}}")
            .with_config("api_key", "sk-test")
            .with_config("base_url", llm_url),
    );
    workflow.connect("fetch", None, "extract", "response");
    workflow.connect("extract", None, "summarize", "title");
    workflow
}

#[tokio::test]
async fn test_http_transform_llm_pipeline_completes() {
    init_tracing();
    let mut api = Server::new_async().await;
    let article = api
        .mock("GET", "/articles/7")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"title": "Rust 1.0 released", "words": 812}"#)
        .create_async()
        .await;

    let mut llm = Server::new_async().await;
    let completion = llm
        .mock("POST", "/chat/completions")
        .match_body(Matcher::PartialJson(json!({
            "messages": [{"role": "user", "content": "Summarize: Rust 1.0 released"}]
        })))
        .with_status(200)
        .with_body(
            r#"{"model": "gpt-4o-mini",
                "choices": [{"message": {"role": "assistant", "content": "Rust is stable."}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}}"#,
        )
        .create_async()
        .await;

    let runtime = create_runtime();
    let mut events = runtime.subscribe_events();
    let workflow = fetch_extract_summarize(&api.url(), &llm.url());
    let request = CreateExecutionRequest::new(workflow.id).with_variable("article_id", 7);

    let execution = runtime
        .execute(workflow, request, "user-1", Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed, "{:?}", execution.error_message);
    assert_eq!(execution.total_nodes, 3);
    assert_eq!(execution.completed_nodes, 3);
    assert_eq!(execution.failed_nodes, 0);
    assert_eq!(execution.progress_percentage(), 100);
    assert_eq!(execution.output_data["fetch"]["status"], json!(200));
    assert_eq!(execution.output_data["extract"], json!("Rust 1.0 released"));
    assert_eq!(execution.output_data["summarize"]["content"], json!("Rust is stable."));

    let nodes = runtime.engine().node_executions(execution.id).await.unwrap();
    let keys: Vec<&str> = nodes.iter().map(|n| n.node_key.as_str()).collect();
    assert_eq!(keys, vec!["fetch", "extract", "summarize"]);
    assert!(nodes.iter().all(|n| n.status == NodeStatus::Completed));
    assert_eq!(nodes[1].input_data["response"]["body"]["words"], json!(812));

    let metrics = runtime.engine().metrics(execution.id).await.unwrap();
    assert!(metrics.iter().any(|m| m.name == "token_usage"));

    let mut progress = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ExecutionEvent::ExecutionProgress { .. }) {
            progress += 1;
        }
    }
    assert_eq!(progress, 3);

    article.assert_async().await;
    completion.assert_async().await;
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_pipeline_stops_after_failed_fetch() {
    init_tracing();
    let mut api = Server::new_async().await;
    let _article = api
        .mock("GET", "/articles/404")
        .with_status(500)
        .create_async()
        .await;
    let mut llm = Server::new_async().await;
    let completion = llm
        .mock("POST", "/chat/completions")
        .expect(0)
        .create_async()
        .await;

    let runtime = create_runtime();
    let workflow = fetch_extract_summarize(&api.url(), &llm.url());
    let request = CreateExecutionRequest::new(workflow.id)
        .with_variable("article_id", 404)
        .with_retries(0, false);

    let execution = runtime
        .execute(workflow, request, "user-1", Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.failed_nodes, 1);
    assert!(execution
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("Status code mismatch"));

    let nodes = runtime.engine().node_executions(execution.id).await.unwrap();
    assert_eq!(nodes[0].status, NodeStatus::Failed);
    assert_eq!(nodes[1].status, NodeStatus::Skipped);
    assert_eq!(nodes[2].status, NodeStatus::Skipped);
    completion.assert_async().await;
}

#[tokio::test]
async fn test_invalid_node_config_rejects_run() {
    let runtime = create_runtime();
    let mut workflow = Workflow::new("broken");
    workflow.add_node(NodeSpec::new("fetch", "http.request"));
    workflow.add_node(NodeSpec::new("shape", "transform").with_config("transform_type", "teleport"));
    runtime.register_workflow(workflow.clone()).await.unwrap();

    let error = runtime
        .submit(CreateExecutionRequest::new(workflow.id), "user-1")
        .await
        .unwrap_err();

    let message = error.to_string();
    assert!(message.contains("node 'fetch'"), "{}", message);
    assert!(message.contains("node 'shape'"), "{}", message);
}
