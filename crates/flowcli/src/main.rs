// crates/flowcli/src/main.rs

mod config;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use config::RuntimeArgs;
use flowcore::{
    CreateExecutionRequest, ExecutionEvent, ExecutionStatus, NodeSpec, Value, Workflow,
    WorkflowExecution,
};
use flowruntime::{planner, ExecutorRegistry, FlowRuntime};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    runtime: RuntimeArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input data as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Run variables as a JSON object
        #[arg(long)]
        variables: Option<String>,

        /// Queue priority, 1 (lowest) to 10 (highest)
        #[arg(short, long, default_value_t = 5)]
        priority: u8,

        /// Run timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,

        /// Run variables as a JSON object; required variables are only checked when given
        #[arg(long)]
        variables: Option<String>,
    },

    /// List available node types
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = if verbose {
        EnvFilter::new(default_level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            file,
            input,
            variables,
            priority,
            timeout,
        } => {
            let request = RunRequest {
                input: parse_object(input.as_deref(), "--input")?,
                variables: parse_object(variables.as_deref(), "--variables")?,
                priority,
                timeout,
            };
            run_workflow(&file, request, &cli.runtime).await?;
        }

        Commands::Validate { file, variables } => {
            let variables = variables
                .as_deref()
                .map(|raw| parse_object(Some(raw), "--variables"))
                .transpose()?;
            validate_workflow(&file, variables, &cli.runtime)?;
        }

        Commands::Nodes => list_nodes(),

        Commands::Init { output } => create_example_workflow(&output)?,
    }

    Ok(())
}

struct RunRequest {
    input: HashMap<String, Value>,
    variables: HashMap<String, Value>,
    priority: u8,
    timeout: Option<u64>,
}

fn parse_object(raw: Option<&str>, flag: &str) -> Result<HashMap<String, Value>> {
    let Some(raw) = raw else {
        return Ok(HashMap::new());
    };
    match serde_json::from_str::<Value>(raw).with_context(|| format!("{} is not valid JSON", flag))? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err(anyhow!("{} must be a JSON object", flag)),
    }
}

fn load_workflow(file: &Path) -> Result<Workflow> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read workflow {}", file.display()))?;
    serde_json::from_str(&json).with_context(|| format!("invalid workflow file {}", file.display()))
}

fn standard_registry() -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    flownodes::register_all(&mut registry);
    registry
}

async fn run_workflow(file: &Path, run: RunRequest, runtime_args: &RuntimeArgs) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());
    let workflow = load_workflow(file)?;
    println!("📋 Workflow: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());
    println!();

    let config = runtime_args.load()?;
    let wait = Duration::from_secs(
        run.timeout
            .or(workflow.settings.timeout_seconds)
            .unwrap_or(config.default_timeout_seconds)
            .saturating_add(30),
    );

    let registry = standard_registry();
    registry
        .initialize_all()
        .await
        .context("failed to initialize executors")?;
    let runtime = FlowRuntime::with_registry(Arc::new(registry), config);

    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    let workflow_id = workflow.id;
    runtime.register_workflow(workflow).await?;
    let dispatcher = runtime.start_dispatcher();

    let mut request = CreateExecutionRequest::new(workflow_id).with_priority(run.priority);
    request.input_data = run.input;
    request.variables = run.variables;
    request.timeout_seconds = run.timeout;

    let created = runtime.submit(request, "cli").await?;
    tracing::debug!("Submitted execution {}", created.execution_id);
    let execution = runtime
        .engine()
        .wait_for_completion(created.execution_id, wait)
        .await?;

    // Let the printer drain before the summary.
    tokio::time::sleep(Duration::from_millis(100)).await;
    event_task.abort();
    runtime.shutdown().await;
    if let Err(e) = dispatcher.await {
        tracing::warn!("Dispatcher ended abnormally: {}", e);
    }

    print_summary(&execution);
    if execution.status != ExecutionStatus::Completed {
        return Err(anyhow!("execution ended {:?}", execution.status));
    }
    Ok(())
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::ExecutionCreated {
            total_nodes,
            retry_count,
            ..
        } => {
            if *retry_count > 0 {
                println!("🔁 Queued for retry {} ({} nodes)", retry_count, total_nodes);
            } else {
                println!("🗂️  Queued ({} nodes)", total_nodes);
            }
        }
        ExecutionEvent::ExecutionStarted { worker_id, .. } => {
            println!("▶️  Started on {}", worker_id);
        }
        ExecutionEvent::ExecutionProgress {
            node_key,
            node_status,
            progress_percentage,
            ..
        } => {
            println!("  ⚡ {} {:?} ({}%)", node_key, node_status, progress_percentage);
        }
        ExecutionEvent::ExecutionCompleted {
            status,
            duration_ms,
            error_message,
            ..
        } => match error_message {
            Some(message) => println!("💥 {:?} after {}ms: {}", status, duration_ms, message),
            None => println!("✨ {:?} in {}ms", status, duration_ms),
        },
        ExecutionEvent::ExecutionCancelled { reason, .. } => {
            println!("🛑 Cancelled: {}", reason.as_deref().unwrap_or("no reason given"));
        }
    }
}

fn print_summary(execution: &WorkflowExecution) {
    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", execution.id);
    println!("   Status: {:?}", execution.status);
    println!(
        "   Nodes: {}/{} completed, {} failed ({}%)",
        execution.completed_nodes,
        execution.total_nodes,
        execution.failed_nodes,
        execution.progress_percentage()
    );
    if let Some(ms) = execution.duration_ms() {
        println!("   Duration: {}ms", ms);
    }
    if execution.retry_count > 0 {
        println!("   Retries: {}", execution.retry_count);
    }
    if let Some(message) = &execution.error_message {
        println!("   Error: {}", message);
    }

    if !execution.output_data.is_empty() {
        println!();
        println!("📤 Outputs:");
        let mut keys: Vec<&String> = execution.output_data.keys().collect();
        keys.sort();
        for key in keys {
            let rendered = serde_json::to_string_pretty(&execution.output_data[key])
                .unwrap_or_else(|_| execution.output_data[key].to_string());
            println!("   {}:", key);
            for line in rendered.lines() {
                println!("     {}", line);
            }
        }
    }
}

fn validate_workflow(
    file: &Path,
    variables: Option<HashMap<String, Value>>,
    runtime_args: &RuntimeArgs,
) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());
    let workflow = load_workflow(file)?;

    // Without --variables, required variables count as supplied at run time.
    let variables = variables.unwrap_or_else(|| {
        workflow
            .required_variables
            .iter()
            .map(|name| (name.clone(), Value::Null))
            .collect()
    });

    let runtime = FlowRuntime::with_registry(Arc::new(standard_registry()), runtime_args.load()?);
    let errors = runtime.engine().validate_workflow(&workflow, &variables);
    if !errors.is_empty() {
        println!("❌ Workflow is invalid:");
        for error in &errors {
            println!("   - {}", error);
        }
        return Err(anyhow!("{} validation error(s)", errors.len()));
    }

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());
    if !workflow.required_variables.is_empty() {
        println!("   Required variables: {}", workflow.required_variables.join(", "));
    }
    println!("   Execution order:");
    for planned in planner::plan(&workflow)? {
        println!(
            "     {}. {} ({})",
            planned.execution_order + 1,
            planned.spec.key,
            planned.spec.node_type
        );
    }
    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = standard_registry();
    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  • {} ({})", node_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", node_type);
        }
    }
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let mut workflow = Workflow::new("Example Summary Workflow");
    workflow.description =
        Some("Fetches a document, extracts its title and summarizes it with a local model".to_string());

    let fetch = workflow.add_node(
        NodeSpec::new("fetch", "http.request")
            .with_name("Fetch Document")
            .with_config("url", "{{document_url}}")
            .with_config("validate_status", 200)
            .with_retry(2, 1000),
    );
    let extract = workflow.add_node(
        NodeSpec::new("extract", "transform")
            .with_name("Extract Title")
            .with_config("transform_type", "extract")
            .with_config("path", "body.slideshow.title"),
    );
    let summarize = workflow.add_node(
        NodeSpec::new("summarize", "llm.chat")
            .with_name("Summarize")
            .with_config("provider", "ollama")
            .with_config("model", "llama3")
            .with_config("prompt", "Write one sentence about a talk titled: {{extract}}"),
    );

    workflow.connect(fetch.as_str(), None, extract.as_str(), "response");
    workflow.connect(extract.as_str(), None, summarize.as_str(), "title");
    let workflow = workflow.require_variable("document_url");

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(output, json).with_context(|| format!("failed to write {}", output.display()))?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  flow run --file {} --variables '{{\"document_url\": \"https://httpbin.org/json\"}}'",
        output.display()
    );
    Ok(())
}
