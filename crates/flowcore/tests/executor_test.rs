// crates/flowcore/tests/executor_test.rs

use async_trait::async_trait;
use flowcore::{
    execute_with_retry, resolve_inputs, Connection, ErrorKind, ExecutionContext, ExecutionId,
    NodeError, NodeExecution, NodeExecutor, NodeOutput, NodeSpec, RetryPolicy, Value,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

/// Replays scripted outcomes, then keeps returning the last one.
struct ScriptedExecutor {
    script: Mutex<VecDeque<Result<NodeOutput, NodeError>>>,
    calls: AtomicU32,
}

impl ScriptedExecutor {
    fn new(script: Vec<Result<NodeOutput, NodeError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeExecutor for ScriptedExecutor {
    fn supported_node_types(&self) -> Vec<&'static str> {
        vec!["test.scripted"]
    }

    async fn execute(
        &self,
        _node: &NodeSpec,
        _ctx: &mut ExecutionContext,
        _record: &NodeExecution,
    ) -> Result<NodeOutput, NodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap()
        }
    }
}

fn create_test_context() -> ExecutionContext {
    ExecutionContext::new(ExecutionId::new_v4(), Uuid::new_v4(), "user-1")
}

fn policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        delay_ms: 1,
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn run(executor: &ScriptedExecutor, max_retries: u32) -> (NodeOutput, u32, ExecutionContext) {
    init_tracing();
    let node = NodeSpec::new("step", "test.scripted");
    let mut ctx = create_test_context();
    let record = NodeExecution::new(ctx.execution_id, &node, 0);
    let (output, attempts) = execute_with_retry(executor, &node, &mut ctx, &record, &policy(max_retries)).await;
    (output, attempts, ctx)
}

#[tokio::test]
async fn test_transient_errors_retry_until_limit() {
    let executor = ScriptedExecutor::new(vec![Err(NodeError::Transient("upstream 503".to_string()))]);

    let (output, attempts, ctx) = run(&executor, 2).await;

    assert_eq!(attempts, 3);
    assert_eq!(executor.calls(), 3);
    assert!(!output.success);
    assert_eq!(output.error_type, Some(ErrorKind::Transient));
    assert_eq!(ctx.error_count, 1);
    assert_eq!(
        ctx.debug_trail.iter().filter(|e| e.event == "node_retry").count(),
        2
    );
}

#[tokio::test]
async fn test_success_after_transient_failure() {
    let executor = ScriptedExecutor::new(vec![
        Err(NodeError::Timeout { seconds: 5 }),
        Ok(NodeOutput::success(json!({"ok": true}))),
    ]);

    let (output, attempts, ctx) = run(&executor, 3).await;

    assert!(output.success);
    assert_eq!(attempts, 2);
    assert_eq!(ctx.error_count, 0);
}

#[tokio::test]
async fn test_business_and_permanent_failures_are_not_retried() {
    let executor = ScriptedExecutor::new(vec![Ok(NodeOutput::business_failure(json!({"message": "no match"})))]);
    let (output, attempts, _) = run(&executor, 5).await;
    assert_eq!(attempts, 1);
    assert_eq!(output.error_message(), "no match");

    let executor = ScriptedExecutor::new(vec![Err(NodeError::Permanent("401".to_string()))]);
    let (output, attempts, _) = run(&executor, 5).await;
    assert_eq!(attempts, 1);
    assert_eq!(output.error_type, Some(ErrorKind::Permanent));
    assert!(output.trace.is_some());
}

#[tokio::test]
async fn test_retryable_failure_envelope_is_retried() {
    let executor = ScriptedExecutor::new(vec![
        Ok(NodeOutput::failure(Value::Null, "flaky", ErrorKind::Internal)),
        Ok(NodeOutput::success(json!(1))),
    ]);

    let (output, attempts, _) = run(&executor, 1).await;

    assert!(output.success);
    assert_eq!(attempts, 2);
}

#[tokio::test]
async fn test_zero_retries_runs_once() {
    let executor = ScriptedExecutor::new(vec![Err(NodeError::Transient("down".to_string()))]);
    let (_, attempts, _) = run(&executor, 0).await;
    assert_eq!(attempts, 1);
    assert_eq!(executor.calls(), 1);
}

#[tokio::test]
async fn test_maximum_retry_limit_does_not_overflow() {
    let executor = ScriptedExecutor::new(vec![
        Err(NodeError::Transient("down".to_string())),
        Ok(NodeOutput::success(json!("up"))),
    ]);
    let (output, attempts, _) = run(&executor, u32::MAX).await;
    assert!(output.success);
    assert_eq!(attempts, 2);
}

#[test]
fn test_error_kinds_classify_retryability() {
    assert!(NodeError::Timeout { seconds: 30 }.is_retryable());
    assert!(NodeError::ExecutionFailed("boom".to_string()).is_retryable());
    assert!(!NodeError::Expression("bad".to_string()).is_retryable());
    assert!(!NodeError::MissingInput("url".to_string()).is_retryable());
    assert!(!NodeError::Configuration("x".to_string()).is_retryable());
    assert_eq!(ErrorKind::Business.as_str(), "business");
}

#[test]
fn test_resolve_inputs_follows_connections() {
    let mut ctx = create_test_context();
    ctx.set_node_output("fetch", json!({"body": {"id": 7}, "status": 200}));

    let bindings = vec![
        Connection {
            from_node: "fetch".to_string(),
            from_port: None,
            to_node: "next".to_string(),
            to_port: "response".to_string(),
        },
        Connection {
            from_node: "fetch".to_string(),
            from_port: Some("body.id".to_string()),
            to_node: "next".to_string(),
            to_port: "id".to_string(),
        },
        Connection {
            from_node: "not_run".to_string(),
            from_port: None,
            to_node: "next".to_string(),
            to_port: "missing".to_string(),
        },
    ];

    let inputs = resolve_inputs(&bindings, &ctx);

    assert_eq!(inputs.len(), 2);
    assert_eq!(inputs["response"]["status"], json!(200));
    assert_eq!(inputs["id"], json!(7));
}

#[test]
fn test_context_helpers_and_snapshot() {
    let mut ctx = create_test_context();
    ctx.current_node_id = Some("step".to_string());
    ctx.warn("slow_response", json!({"ms": 900}));
    ctx.debug("note", json!(null));

    assert_eq!(ctx.warning_count, 1);
    assert_eq!(ctx.debug_trail.len(), 2);
    assert_eq!(ctx.debug_trail[0].node_id.as_deref(), Some("step"));
    assert_eq!(ctx.get_variable_or("missing", json!("fallback")), json!("fallback"));
    assert!(ctx.elapsed_ms() < 60_000);

    let snapshot = ctx.to_map();
    assert_eq!(snapshot["user_id"], json!("user-1"));
    assert_eq!(snapshot["warning_count"], json!(1));
    assert_eq!(snapshot["debug_trail"][0]["event"], json!("slow_response"));
}
