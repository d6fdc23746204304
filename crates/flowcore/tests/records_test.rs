// crates/flowcore/tests/records_test.rs

use chrono::{Duration, Utc};
use flowcore::{
    CreateExecutionRequest, ExecutionQueueItem, ExecutionStatus, NodeExecution, NodeSpec, NodeStatus,
    QueueStatus, Workflow, WorkflowExecution,
};
use serde_json::json;

fn execution(total_nodes: u32) -> WorkflowExecution {
    let workflow = Workflow::new("records");
    WorkflowExecution::new(&CreateExecutionRequest::new(workflow.id), "user-1", total_nodes, 3)
}

#[test]
fn test_progress_follows_node_counters() {
    let mut execution = execution(3);
    assert_eq!(execution.progress_percentage(), 0);

    execution.record_node_completed();
    assert_eq!(execution.progress_percentage(), 33);
    execution.record_node_failed();
    assert_eq!(execution.progress_percentage(), 33);
    execution.record_node_completed();
    assert_eq!(execution.progress_percentage(), 66);

    // Counters never exceed total_nodes.
    execution.record_node_completed();
    assert_eq!(execution.completed_nodes + execution.failed_nodes, 3);

    execution.reset_for_retry();
    assert_eq!(execution.progress_percentage(), 0);
    assert_eq!(execution.retry_count, 1);
    assert_eq!(execution.status, ExecutionStatus::Pending);
}

#[test]
fn test_empty_run_has_zero_progress() {
    let mut execution = execution(0);
    execution.record_node_completed();
    assert_eq!(execution.completed_nodes, 0);
    assert_eq!(execution.progress_percentage(), 0);
}

#[test]
fn test_deadline_starts_when_running() {
    let request = CreateExecutionRequest::new(Workflow::new("t").id).with_timeout(30);
    let mut execution = WorkflowExecution::new(&request, "user-1", 1, 0);
    let now = Utc::now();
    assert!(!execution.is_past_deadline(now + Duration::hours(1)));

    execution.mark_running(now);
    assert!(!execution.is_past_deadline(now + Duration::seconds(29)));
    assert!(execution.is_past_deadline(now + Duration::seconds(30)));
}

#[test]
fn test_status_classification() {
    assert!(ExecutionStatus::Completed.is_terminal());
    assert!(ExecutionStatus::Cancelled.is_terminal());
    assert!(!ExecutionStatus::Running.is_terminal());
    assert!(ExecutionStatus::Timeout.is_retryable());
    assert!(!ExecutionStatus::Completed.is_retryable());
    assert!(NodeStatus::Skipped.is_terminal());
    assert!(!NodeStatus::Pending.is_terminal());
}

#[test]
fn test_node_record_lifecycle() {
    let spec = NodeSpec::new("fetch", "http.request").with_config("url", "https://example.com");
    let mut record = NodeExecution::new(uuid::Uuid::new_v4(), &spec, 2);
    assert_eq!(record.status, NodeStatus::Pending);
    assert_eq!(record.execution_order, 2);
    assert_eq!(record.config["url"], json!("https://example.com"));

    let start = Utc::now();
    record.mark_running(Default::default(), start);
    record.output_data = Some(json!({"status": 200}));
    record.finish(NodeStatus::Completed, start + Duration::milliseconds(250));
    assert_eq!(record.duration_ms, Some(250));

    record.reset();
    assert_eq!(record.status, NodeStatus::Pending);
    assert!(record.output_data.is_none());
    assert!(record.duration_ms.is_none());
}

#[test]
fn test_queue_item_scheduling() {
    let execution = execution(1);
    let mut item = ExecutionQueueItem::for_execution(&execution);
    let now = Utc::now();
    assert!(item.is_ready(now));

    item.claim("worker-a", now);
    assert_eq!(item.status, QueueStatus::Processing);
    assert!(!item.is_ready(now));

    item.requeue(Some(now + Duration::seconds(5)));
    assert!(!item.is_ready(now));
    assert!(item.is_ready(now + Duration::seconds(5)));
    assert_eq!(item.retry_count, 1);
    assert!(item.worker_id.is_none());
}

#[test]
fn test_create_request_defaults_from_json() {
    let workflow_id = uuid::Uuid::new_v4();
    let request: CreateExecutionRequest =
        serde_json::from_value(json!({ "workflow_id": workflow_id, "variables": {"city": "Oslo"} })).unwrap();
    assert_eq!(request.priority, 5);
    assert!(!request.auto_retry);
    assert_eq!(request.variables["city"], json!("Oslo"));
}
