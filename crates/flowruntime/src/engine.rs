use crate::planner;
use crate::registry::ExecutorRegistry;
use crate::runtime::RuntimeConfig;
use crate::store::{ExecutionFilter, ExecutionStore, StoreError};
use chrono::{Duration as ChronoDuration, Utc};
use flowcore::records::{MAX_PRIORITY, MIN_PRIORITY};
use flowcore::{
    execute_with_retry, resolve_inputs, CreateExecutionRequest, CreateExecutionResponse,
    ErrorDetails, ErrorKind, ExecutionContext, ExecutionEvent, ExecutionId, ExecutionMetric,
    ExecutionQueueItem, ExecutionStatus, FlowError, MetricValue, NodeError, NodeExecution,
    NodeExecutor, NodeOutput, NodeStatus, NotificationSink, QueueStatus, Value, Workflow,
    WorkflowError, WorkflowExecution,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Handle of one in-flight run task.
struct RunHandle {
    run_id: Uuid,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// How a run task left its node loop.
enum RunOutcome {
    Completed,
    Failed { message: String, details: ErrorDetails },
    Timeout,
    Cancelled,
}

enum NodeStep {
    Finished(NodeOutput),
    Cancelled,
}

/// Owns the dispatch loop, the per-run tasks and the control operations.
///
/// The registry is shared read-only. Run tasks and the dispatch loop only
/// talk to each other through the store; the `runs` table exists so that
/// `cancel` can reach a task.
pub struct ExecutionEngine {
    registry: Arc<ExecutorRegistry>,
    store: Arc<dyn ExecutionStore>,
    sink: Arc<dyn NotificationSink>,
    config: RuntimeConfig,
    runs: Mutex<HashMap<ExecutionId, RunHandle>>,
    shutdown: CancellationToken,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        store: Arc<dyn ExecutionStore>,
        sink: Arc<dyn NotificationSink>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            store,
            sink,
            config,
            runs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    /// Check a workflow against the registry and a set of run variables.
    /// Returns every problem found; an empty list means the workflow can run.
    pub fn validate_workflow(&self, workflow: &Workflow, variables: &HashMap<String, Value>) -> Vec<String> {
        let mut errors = Vec::new();

        if let Err(e) = planner::plan(workflow) {
            errors.push(e.to_string());
        }

        for node in &workflow.nodes {
            match self.registry.validate_config(&node.node_type, &node.config) {
                Ok(result) => {
                    for error in result.errors {
                        errors.push(format!("node '{}': {}", node.key, error));
                    }
                }
                Err(e) => errors.push(format!("node '{}': {}", node.key, e)),
            }
        }

        let missing: Vec<String> = workflow
            .required_variables
            .iter()
            .filter(|name| !variables.contains_key(*name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            errors.push(WorkflowError::MissingVariables(missing).to_string());
        }

        errors
    }

    /// Validate, plan and persist a new run, then queue it.
    pub async fn create_execution(
        &self,
        request: CreateExecutionRequest,
        user_id: &str,
    ) -> Result<CreateExecutionResponse, FlowError> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&request.priority) {
            return Err(FlowError::Validation(vec![format!(
                "priority must be between {} and {}, got {}",
                MIN_PRIORITY, MAX_PRIORITY, request.priority
            )]));
        }

        let workflow = self.store.get_workflow(request.workflow_id).await.map_err(|e| match e {
            StoreError::NotFound(_) => {
                FlowError::Workflow(WorkflowError::NotFound(request.workflow_id.to_string()))
            }
            other => other.into(),
        })?;

        let errors = self.validate_workflow(&workflow, &request.variables);
        if !errors.is_empty() {
            tracing::warn!("Rejected run of workflow {}: {}", workflow.id, errors.join("; "));
            return Err(FlowError::Validation(errors));
        }

        let planned = planner::plan(&workflow)?;
        let mut execution = WorkflowExecution::new(
            &request,
            user_id,
            planned.len() as u32,
            self.config.default_max_retries,
        );
        if execution.timeout_seconds.is_none() {
            execution.timeout_seconds = workflow
                .settings
                .timeout_seconds
                .or(Some(self.config.default_timeout_seconds));
        }

        let nodes = planner::node_executions(
            execution.id,
            &workflow,
            &planned,
            self.config.node_retry_delay_ms,
        );
        let queue_item = ExecutionQueueItem::for_execution(&execution);
        let execution_id = execution.id;
        let total_nodes = execution.total_nodes;

        self.store.insert_execution(execution).await?;
        self.store.insert_node_executions(nodes).await?;
        self.store.enqueue(queue_item).await?;

        tracing::info!(
            "Created execution {} for workflow {} ({} nodes, priority {})",
            execution_id,
            workflow.id,
            total_nodes,
            request.priority
        );

        self.notify(ExecutionEvent::ExecutionCreated {
            execution_id,
            workflow_id: workflow.id,
            total_nodes,
            retry_count: 0,
            timestamp: Utc::now(),
        })
        .await;

        Ok(CreateExecutionResponse {
            execution_id,
            status: ExecutionStatus::Pending,
        })
    }

    /// Start a pending run now, bypassing the dispatch loop's ordering.
    pub async fn start(self: &Arc<Self>, execution_id: ExecutionId) -> Result<(), FlowError> {
        let mut runs = self.runs.lock().await;
        let execution = self.store.get_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Pending {
            return Err(FlowError::InvalidState(format!(
                "execution {} is {:?}, expected Pending",
                execution_id, execution.status
            )));
        }
        let claimed = self
            .store
            .claim_execution(execution_id, &self.config.worker_id, Utc::now())
            .await?;
        if claimed.is_none() {
            return Err(FlowError::InvalidState(format!(
                "execution {} is already claimed",
                execution_id
            )));
        }
        self.spawn_run(&mut runs, execution_id);
        Ok(())
    }

    /// Cancel a run that has not finished yet.
    pub async fn cancel(&self, execution_id: ExecutionId, reason: Option<String>) -> Result<(), FlowError> {
        let handle = {
            let mut runs = self.runs.lock().await;
            let execution = self.store.get_execution(execution_id).await?;
            if execution.status.is_terminal() {
                return Err(FlowError::InvalidState(format!(
                    "execution {} already finished as {:?}",
                    execution_id, execution.status
                )));
            }
            let handle = runs.remove(&execution_id);
            if handle.is_none() {
                // Not running yet: take the queue item so nothing dispatches it.
                match self
                    .store
                    .claim_execution(execution_id, &self.config.worker_id, Utc::now())
                    .await
                {
                    Ok(_) | Err(StoreError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            handle
        };

        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                tracing::error!("Run task of {} ended abnormally: {}", execution_id, e);
            }
        }

        let mut execution = self.store.get_execution(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(FlowError::InvalidState(format!(
                "execution {} finished as {:?} before it could be cancelled",
                execution_id, execution.status
            )));
        }

        let now = Utc::now();
        let message = reason.clone().unwrap_or_else(|| "Cancelled by user".to_string());
        execution.fail_with(
            ExecutionStatus::Cancelled,
            message,
            ErrorDetails {
                kind: ErrorKind::Cancelled,
                trace: None,
                node_key: None,
            },
            now,
        );
        self.store.update_execution(&execution).await?;
        let skipped = self.store.skip_unfinished_nodes(execution_id, now).await?;
        self.release_queue_item(execution_id, QueueStatus::Completed).await;
        self.registry.release_execution(execution_id);

        tracing::info!("Cancelled execution {} ({} nodes skipped)", execution_id, skipped);
        self.notify(ExecutionEvent::ExecutionCancelled {
            execution_id,
            reason,
            timestamp: now,
        })
        .await;
        Ok(())
    }

    /// Reset a finished, unsuccessful run to its original plan and queue it again.
    pub async fn retry(&self, execution_id: ExecutionId) -> Result<CreateExecutionResponse, FlowError> {
        self.retry_with_delay(execution_id, None).await
    }

    async fn retry_with_delay(
        &self,
        execution_id: ExecutionId,
        delay: Option<Duration>,
    ) -> Result<CreateExecutionResponse, FlowError> {
        let mut execution = self.store.get_execution(execution_id).await?;
        if !execution.status.is_retryable() {
            return Err(FlowError::InvalidState(format!(
                "execution {} is {:?}; only failed, cancelled or timed out runs can be retried",
                execution_id, execution.status
            )));
        }
        if execution.retry_count >= execution.max_retries {
            return Err(FlowError::InvalidState(format!(
                "execution {} reached its retry limit ({})",
                execution_id, execution.max_retries
            )));
        }

        for mut node in self.store.list_node_executions(execution_id).await? {
            node.reset();
            self.store.update_node_execution(&node).await?;
        }
        execution.reset_for_retry();
        self.store.update_execution(&execution).await?;

        let scheduled_at = delay.and_then(|d| ChronoDuration::from_std(d).ok()).map(|d| Utc::now() + d);
        match self.store.get_queue_item(execution_id).await {
            Ok(mut item) => {
                item.requeue(scheduled_at);
                self.store.update_queue_item(&item).await?;
            }
            Err(StoreError::NotFound(_)) => {
                let mut item = ExecutionQueueItem::for_execution(&execution);
                item.scheduled_at = scheduled_at;
                self.store.enqueue(item).await?;
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            "Execution {} queued for retry {}/{}",
            execution_id,
            execution.retry_count,
            execution.max_retries
        );
        self.notify(ExecutionEvent::ExecutionCreated {
            execution_id,
            workflow_id: execution.workflow_id,
            total_nodes: execution.total_nodes,
            retry_count: execution.retry_count,
            timestamp: Utc::now(),
        })
        .await;

        Ok(CreateExecutionResponse {
            execution_id,
            status: execution.status,
        })
    }

    pub async fn get_execution(&self, execution_id: ExecutionId) -> Result<WorkflowExecution, FlowError> {
        Ok(self.store.get_execution(execution_id).await?)
    }

    pub async fn node_executions(&self, execution_id: ExecutionId) -> Result<Vec<NodeExecution>, FlowError> {
        Ok(self.store.list_node_executions(execution_id).await?)
    }

    pub async fn metrics(&self, execution_id: ExecutionId) -> Result<Vec<ExecutionMetric>, FlowError> {
        Ok(self.store.list_metrics(execution_id).await?)
    }

    pub async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>, FlowError> {
        Ok(self.store.list_executions(filter).await?)
    }

    /// Poll until the run is terminal and its task has exited.
    pub async fn wait_for_completion(
        &self,
        execution_id: ExecutionId,
        timeout: Duration,
    ) -> Result<WorkflowExecution, FlowError> {
        let deadline = Instant::now() + timeout;
        loop {
            let execution = self.store.get_execution(execution_id).await?;
            let running = self.runs.lock().await.contains_key(&execution_id);
            if execution.status.is_terminal() && !running {
                return Ok(execution);
            }
            if Instant::now() >= deadline {
                return Err(FlowError::Execution(format!(
                    "timed out waiting for execution {} (status {:?})",
                    execution_id, execution.status
                )));
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Number of run tasks currently in flight.
    pub async fn active_runs(&self) -> usize {
        self.runs.lock().await.len()
    }

    /// Claim at most one ready queue item and start its run.
    pub async fn dispatch_once(self: &Arc<Self>) -> Result<Option<ExecutionId>, FlowError> {
        let mut runs = self.runs.lock().await;
        if runs.len() >= self.config.max_concurrent_runs {
            return Ok(None);
        }
        let Some(item) = self.store.claim_next(&self.config.worker_id, Utc::now()).await? else {
            return Ok(None);
        };
        tracing::info!(
            "Worker {} claimed execution {} (priority {})",
            self.config.worker_id,
            item.execution_id,
            item.priority
        );
        self.spawn_run(&mut runs, item.execution_id);
        Ok(Some(item.execution_id))
    }

    pub fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.dispatch_loop().await })
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        tracing::info!(
            "Dispatcher {} started (poll every {}ms)",
            self.config.worker_id,
            self.config.poll_interval_ms
        );
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.dispatch_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => tracing::error!("Dispatch failed: {}", e),
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(poll_interval) => {}
            }
        }
        tracing::info!("Dispatcher {} stopped", self.config.worker_id);
    }

    /// Stop dispatching, let in-flight runs finish and shut executors down.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<RunHandle> = self.runs.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(e) = handle.task.await {
                tracing::error!("Run task ended abnormally during shutdown: {}", e);
            }
        }
        self.registry.shutdown_all().await;
    }

    fn spawn_run(self: &Arc<Self>, runs: &mut HashMap<ExecutionId, RunHandle>, execution_id: ExecutionId) {
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let engine = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = engine.run_execution(execution_id, token).await {
                tracing::error!("Execution {} aborted: {}", execution_id, e);
                engine.abort_execution(execution_id, &e).await;
            }
            let mut runs = engine.runs.lock().await;
            if runs.get(&execution_id).is_some_and(|h| h.run_id == run_id) {
                runs.remove(&execution_id);
            }
            drop(runs);
            engine.registry.release_execution(execution_id);
        });
        runs.insert(execution_id, RunHandle { run_id, cancel, task });
    }

    /// The run task: executes the run's nodes strictly by `execution_order`.
    async fn run_execution(&self, execution_id: ExecutionId, cancel: CancellationToken) -> Result<(), FlowError> {
        let mut execution = self.store.get_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Pending {
            tracing::warn!(
                "Execution {} is {:?}, not starting it",
                execution_id,
                execution.status
            );
            return Ok(());
        }

        execution.mark_running(Utc::now());
        self.store.update_execution(&execution).await?;
        tracing::info!("Starting execution {} of workflow {}", execution_id, execution.workflow_id);
        self.notify(ExecutionEvent::ExecutionStarted {
            execution_id,
            worker_id: self.config.worker_id.clone(),
            timestamp: Utc::now(),
        })
        .await;

        let workflow = match self.store.get_workflow(execution.workflow_id).await {
            Ok(workflow) => workflow,
            Err(e) => {
                let outcome = RunOutcome::Failed {
                    message: format!("workflow unavailable: {}", e),
                    details: ErrorDetails {
                        kind: ErrorKind::Configuration,
                        trace: None,
                        node_key: None,
                    },
                };
                return self.finish_execution(execution, None, outcome).await;
            }
        };

        let mut ctx = ExecutionContext::new(execution_id, execution.workflow_id, execution.user_id.clone())
            .with_variables(execution.variables.clone())
            .with_input(execution.input_data.clone())
            .with_context_data(execution.context_data.clone());

        let nodes = self.store.list_node_executions(execution_id).await?;
        let mut outcome = RunOutcome::Completed;

        for mut record in nodes {
            if record.status.is_terminal() {
                continue;
            }
            if cancel.is_cancelled() {
                outcome = RunOutcome::Cancelled;
                break;
            }
            if execution.is_past_deadline(Utc::now()) {
                tracing::warn!(
                    "Execution {} passed its deadline before node {}",
                    execution_id,
                    record.node_key
                );
                outcome = RunOutcome::Timeout;
                break;
            }

            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => NodeStep::Cancelled,
                output = self.run_node(&workflow, &mut record, &mut ctx) => NodeStep::Finished(output?),
            };
            let NodeStep::Finished(output) = step else {
                outcome = RunOutcome::Cancelled;
                break;
            };

            let now = Utc::now();
            record.output_data = Some(output.output.clone());
            if output.success {
                record.finish(NodeStatus::Completed, now);
                execution.record_node_completed();
            } else {
                record.error_message = Some(output.error_message());
                record.error_details = Some(ErrorDetails {
                    kind: output.error_type.unwrap_or(ErrorKind::Internal),
                    trace: output.trace.clone(),
                    node_key: Some(record.node_key.clone()),
                });
                record.finish(NodeStatus::Failed, now);
                execution.record_node_failed();
            }
            self.store.update_node_execution(&record).await?;
            self.store.update_execution(&execution).await?;
            self.record_node_metrics(&record, &output).await;

            tracing::info!(
                "Node {} of execution {} {:?} in {}ms ({}%)",
                record.node_key,
                execution_id,
                record.status,
                record.duration_ms.unwrap_or(0),
                execution.progress_percentage()
            );
            self.notify(ExecutionEvent::ExecutionProgress {
                execution_id,
                node_key: record.node_key.clone(),
                node_status: record.status,
                completed_nodes: execution.completed_nodes,
                failed_nodes: execution.failed_nodes,
                total_nodes: execution.total_nodes,
                progress_percentage: execution.progress_percentage(),
                timestamp: now,
            })
            .await;

            let continue_on_error = workflow
                .find_node(&record.node_key)
                .is_some_and(|spec| spec.continue_on_error);
            if !output.success && !continue_on_error {
                outcome = RunOutcome::Failed {
                    message: format!(
                        "Node '{}' failed: {}",
                        record.node_key,
                        record.error_message.clone().unwrap_or_default()
                    ),
                    details: record.error_details.clone().unwrap_or(ErrorDetails {
                        kind: ErrorKind::Internal,
                        trace: None,
                        node_key: Some(record.node_key.clone()),
                    }),
                };
                break;
            }
        }

        if matches!(outcome, RunOutcome::Cancelled) {
            // `cancel` finishes the records once this task has exited.
            tracing::info!("Execution {} observed cancellation", execution_id);
            return Ok(());
        }
        self.finish_execution(execution, Some(&ctx), outcome).await
    }

    /// Execute one node. Executor failures become failure envelopes; only
    /// store errors are returned as `Err`.
    async fn run_node(
        &self,
        workflow: &Workflow,
        record: &mut NodeExecution,
        ctx: &mut ExecutionContext,
    ) -> Result<NodeOutput, FlowError> {
        let spec = workflow.find_node(&record.node_key);
        let inputs = resolve_inputs(workflow.incoming(&record.node_key), ctx);
        record.mark_running(inputs, Utc::now());
        self.store.update_node_execution(record).await?;

        let Some(spec) = spec else {
            let error = NodeError::Configuration(WorkflowError::NodeNotFound(record.node_key.clone()).to_string());
            ctx.error_count += 1;
            return Ok(NodeOutput::from_error(&error));
        };
        let executor: Arc<dyn NodeExecutor> = match self.registry.get(&spec.node_type) {
            Ok(executor) => executor,
            Err(e) => {
                ctx.error_count += 1;
                return Ok(NodeOutput::from_error(&NodeError::Configuration(e.to_string())));
            }
        };

        let policy = planner::retry_policy_for(workflow, spec, self.config.node_retry_delay_ms);
        executor.pre_execute(spec, ctx);
        let (output, attempts) = execute_with_retry(executor.as_ref(), spec, ctx, record, &policy).await;
        if output.success {
            executor.post_execute(spec, ctx, &output);
        }
        record.retry_count = attempts.saturating_sub(1);
        Ok(output)
    }

    async fn finish_execution(
        &self,
        mut execution: WorkflowExecution,
        ctx: Option<&ExecutionContext>,
        outcome: RunOutcome,
    ) -> Result<(), FlowError> {
        let now = Utc::now();
        let execution_id = execution.id;
        if let Some(ctx) = ctx {
            execution.output_data = ctx.node_outputs.clone();
            execution.metadata.insert("execution_context".to_string(), ctx.to_map());
        }

        let status = match outcome {
            RunOutcome::Completed => {
                execution.finish(ExecutionStatus::Completed, now);
                ExecutionStatus::Completed
            }
            RunOutcome::Failed { message, details } => {
                execution.fail_with(ExecutionStatus::Failed, message, details, now);
                ExecutionStatus::Failed
            }
            RunOutcome::Timeout => {
                let message = format!(
                    "Execution exceeded its timeout of {}s",
                    execution.timeout_seconds.unwrap_or_default()
                );
                execution.fail_with(
                    ExecutionStatus::Timeout,
                    message,
                    ErrorDetails {
                        kind: ErrorKind::Timeout,
                        trace: None,
                        node_key: None,
                    },
                    now,
                );
                ExecutionStatus::Timeout
            }
            RunOutcome::Cancelled => return Ok(()),
        };

        self.store.update_execution(&execution).await?;
        if status != ExecutionStatus::Completed {
            self.store.skip_unfinished_nodes(execution_id, now).await?;
        }
        let queue_status = if status == ExecutionStatus::Completed {
            QueueStatus::Completed
        } else {
            QueueStatus::Failed
        };
        self.release_queue_item(execution_id, queue_status).await;

        let duration_ms = execution.duration_ms().unwrap_or(0);
        self.record_metric(ExecutionMetric::new(
            execution_id,
            "execution_duration_ms",
            MetricValue::Float(duration_ms as f64),
        ))
        .await;
        self.record_metric(ExecutionMetric::new(
            execution_id,
            "nodes_completed",
            MetricValue::Integer(execution.completed_nodes as i64),
        ))
        .await;

        match status {
            ExecutionStatus::Completed => tracing::info!(
                "Execution {} completed in {}ms ({}/{} nodes)",
                execution_id,
                duration_ms,
                execution.completed_nodes,
                execution.total_nodes
            ),
            _ => tracing::warn!(
                "Execution {} ended {:?}: {}",
                execution_id,
                status,
                execution.error_message.clone().unwrap_or_default()
            ),
        }
        self.notify(ExecutionEvent::ExecutionCompleted {
            execution_id,
            status,
            duration_ms,
            error_message: execution.error_message.clone(),
            timestamp: now,
        })
        .await;

        if matches!(status, ExecutionStatus::Failed | ExecutionStatus::Timeout)
            && execution.auto_retry
            && execution.retry_count < execution.max_retries
        {
            let delay = Duration::from_millis(
                self.config
                    .auto_retry_delay_ms
                    .saturating_mul(execution.retry_count as u64 + 1),
            );
            if let Err(e) = self.retry_with_delay(execution_id, Some(delay)).await {
                tracing::error!("Automatic retry of {} failed: {}", execution_id, e);
            }
        }
        Ok(())
    }

    /// Last resort when a run task hit a store error mid-run.
    async fn abort_execution(&self, execution_id: ExecutionId, error: &FlowError) {
        let Ok(mut execution) = self.store.get_execution(execution_id).await else {
            return;
        };
        if execution.status.is_terminal() {
            return;
        }
        let now = Utc::now();
        execution.fail_with(
            ExecutionStatus::Failed,
            error.to_string(),
            ErrorDetails {
                kind: ErrorKind::Internal,
                trace: Some(format!("{:?}", error)),
                node_key: None,
            },
            now,
        );
        if let Err(e) = self.store.update_execution(&execution).await {
            tracing::error!("Could not mark execution {} failed: {}", execution_id, e);
            return;
        }
        if let Err(e) = self.store.skip_unfinished_nodes(execution_id, now).await {
            tracing::error!("Could not skip nodes of {}: {}", execution_id, e);
        }
        self.release_queue_item(execution_id, QueueStatus::Failed).await;
        self.notify(ExecutionEvent::ExecutionCompleted {
            execution_id,
            status: ExecutionStatus::Failed,
            duration_ms: execution.duration_ms().unwrap_or(0),
            error_message: execution.error_message.clone(),
            timestamp: now,
        })
        .await;
    }

    async fn release_queue_item(&self, execution_id: ExecutionId, status: QueueStatus) {
        match self.store.get_queue_item(execution_id).await {
            Ok(mut item) => {
                item.release(status, Utc::now());
                if let Err(e) = self.store.update_queue_item(&item).await {
                    tracing::error!("Could not release queue item of {}: {}", execution_id, e);
                }
            }
            Err(e) => tracing::debug!("No queue item for {}: {}", execution_id, e),
        }
    }

    async fn record_node_metrics(&self, record: &NodeExecution, output: &NodeOutput) {
        let context = format!("{}:{}", record.node_type, record.node_key);
        self.record_metric(
            ExecutionMetric::new(
                record.execution_id,
                "node_duration_ms",
                MetricValue::Float(record.duration_ms.unwrap_or(0) as f64),
            )
            .for_node(record.id)
            .with_context(context.clone()),
        )
        .await;
        self.record_metric(
            ExecutionMetric::new(
                record.execution_id,
                "node_status",
                MetricValue::Text(format!("{:?}", record.status).to_uppercase()),
            )
            .for_node(record.id)
            .with_context(context.clone()),
        )
        .await;
        if let Some(usage) = output.metadata.get("token_usage") {
            self.record_metric(
                ExecutionMetric::new(
                    record.execution_id,
                    "token_usage",
                    MetricValue::Structured(usage.clone()),
                )
                .for_node(record.id)
                .with_context(context),
            )
            .await;
        }
    }

    async fn record_metric(&self, metric: ExecutionMetric) {
        if let Err(e) = self.store.record_metric(metric).await {
            tracing::warn!("Failed to record metric: {}", e);
        }
    }

    async fn notify(&self, event: ExecutionEvent) {
        let execution_id = event.execution_id();
        if let Err(e) = self.sink.publish(event).await {
            tracing::debug!("Notification for {} not delivered: {}", execution_id, e);
        }
    }
}
