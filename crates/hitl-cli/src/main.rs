//! CLI binary for serving and driving HITL workflows.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use hitl_engine::{status, ResumeRequest, StartRequest, WireEvent, WorkflowService};
use hitl_llm::{LlmClient, LlmConfig, UsageTrackingMiddleware};
use hitl_server::ServerConfig;
use hitl_types::ApprovalStatus;
use hitl_workflows::{editor, AnalysisConfig, ProcessAnalysisTool};
use serde_json::Value;
use tokio_stream::StreamExt;

#[derive(Parser)]
#[command(name = "hitl", version, about = "Resumable human-in-the-loop workflow engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Generation provider: openai, ollama or scripted (offline)
    #[arg(long, global = true)]
    provider: Option<String>,

    /// Model name passed to the provider
    #[arg(long, global = true)]
    model: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP/SSE API
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Persist checkpoints as JSON files in this directory
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Allowed CORS origin (repeatable; default allows any)
        #[arg(long = "cors-origin")]
        cors_origins: Vec<String>,

        /// Stage executions allowed per run before it is aborted
        #[arg(long)]
        max_steps: Option<usize>,
    },

    /// Run a workflow interactively in the terminal
    Run {
        /// Workflow name (review, sections, analysis, editor)
        workflow: String,

        /// The request to work on
        query: String,

        /// Input data file (analysis workflow)
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Persist checkpoints as JSON files in this directory
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
    },

    /// Describe a workflow graph
    Graph {
        /// Workflow name
        workflow: String,

        /// Print Graphviz DOT instead of a description
        #[arg(long)]
        dot: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let usage = UsageTrackingMiddleware::new();
    let llm = Arc::new(llm_client(&cli, usage.clone())?);

    match cli.command {
        Commands::Serve {
            host,
            port,
            checkpoint_dir,
            cors_origins,
            max_steps,
        } => {
            let mut config = ServerConfig::from_env()?;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if checkpoint_dir.is_some() {
                config.checkpoint_dir = checkpoint_dir;
            }
            if !cors_origins.is_empty() {
                config.cors_origins = cors_origins;
            }
            if let Some(steps) = max_steps {
                config.max_steps = steps;
            }
            let service = build_service(&config, llm)?;
            hitl_server::serve(&config, service).await?;
        }
        Commands::Run {
            workflow,
            query,
            file,
            checkpoint_dir,
        } => {
            let mut config = ServerConfig::from_env()?;
            if checkpoint_dir.is_some() {
                config.checkpoint_dir = checkpoint_dir;
            }
            let service = build_service(&config, llm)?;
            let request = StartRequest {
                workflow,
                query,
                file: file.map(|f| f.display().to_string()),
            };
            cmd_run(&service, request).await?;
            println!(
                "\nModel usage: {} requests, {} input tokens, {} output tokens",
                usage.requests(),
                usage.total_input_tokens(),
                usage.total_output_tokens()
            );
        }
        Commands::Graph { workflow, dot } => {
            let service = build_service(&ServerConfig::default(), llm)?;
            cmd_graph(&service, &workflow, dot)?;
        }
    }

    Ok(())
}

fn llm_client(cli: &Cli, usage: UsageTrackingMiddleware) -> anyhow::Result<LlmClient> {
    let mut config = LlmConfig::from_env()?;
    if let Some(provider) = &cli.provider {
        config.provider = provider.parse()?;
    }
    if let Some(model) = &cli.model {
        config.model = Some(model.clone());
    }
    Ok(config.build_client(usage)?)
}

fn build_service(config: &ServerConfig, llm: Arc<LlmClient>) -> anyhow::Result<WorkflowService> {
    let tool = Arc::new(ProcessAnalysisTool::new(AnalysisConfig::from_env()?));
    let catalog = hitl_workflows::default_catalog(tool)?;
    tracing::debug!(workflows = ?catalog.names(), "Workflow catalog ready");
    Ok(WorkflowService::new(catalog, config.checkpoint_store(), llm)
        .with_engine_config(config.engine()))
}

fn cmd_graph(service: &WorkflowService, name: &str, dot: bool) -> anyhow::Result<()> {
    let workflow = service.catalog().get(name)?;
    let graph = workflow.graph();
    if dot {
        print!("{}", graph.to_dot());
        return Ok(());
    }

    println!("Workflow: {}", workflow.name());
    println!("{}", workflow.description());
    println!("Start: {}", graph.start());
    println!("Interrupt points: {}", graph.interrupt_points().join(", "));
    println!("\nStages:");
    for id in graph.stage_ids() {
        let mut marks = Vec::new();
        if graph.is_interrupt(id) {
            marks.push("interrupt");
        }
        if graph.is_streamed(id) {
            marks.push("streamed");
        }
        println!(
            "  {} -> {} {}",
            id,
            graph.successors(id).join(" | "),
            if marks.is_empty() {
                String::new()
            } else {
                format!("[{}]", marks.join(", "))
            }
        );
    }

    for diag in hitl_engine::validate(graph) {
        let severity = match diag.severity {
            hitl_engine::Severity::Error => "ERROR",
            hitl_engine::Severity::Warning => "WARN",
            hitl_engine::Severity::Info => "INFO",
        };
        println!("[{}] {}: {}", severity, diag.rule, diag.message);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Console session
// ---------------------------------------------------------------------------

async fn cmd_run(service: &WorkflowService, request: StartRequest) -> anyhow::Result<()> {
    let editing = request.workflow == editor::NAME;
    let ack = service.start(request).await?;
    let thread_id = ack.thread_id;
    println!("Thread: {thread_id}");

    loop {
        let outcome = print_stream(service, &thread_id).await?;
        let status_name = outcome["status"].as_str().unwrap_or_default().to_string();

        match status_name.as_str() {
            status::FINISHED => {
                println!("\n=== Final output ===\n");
                println!("{}", outcome["final_output"].as_str().unwrap_or_default());
                return Ok(());
            }
            status::ERROR => {
                println!("\nRun failed: {}", outcome["error"].as_str().unwrap_or_default());
                match ask("What next?", &["retry", "quit"])?.as_str() {
                    "retry" => continue,
                    _ => return Ok(()),
                }
            }
            _ => {
                print_pause(&outcome);
                match review(service, &thread_id, editing).await? {
                    Some(request) => {
                        service.resume(request).await?;
                    }
                    None => {
                        println!("Paused. Thread {thread_id} can be resumed later.");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Print tokens as they arrive and return the terminal status event.
async fn print_stream(service: &WorkflowService, thread_id: &str) -> anyhow::Result<Value> {
    let mut events = service.stream(thread_id).await?;
    let mut node = String::new();
    let mut last = Value::Null;
    while let Some(event) = events.next().await {
        match &event {
            WireEvent::Token {
                content, node: n, ..
            } => {
                if *n != node {
                    println!("\n--- {n} ---");
                    node = n.clone();
                }
                print!("{content}");
                std::io::stdout().flush()?;
            }
            WireEvent::Error { error, .. } => {
                eprintln!("\nerror: {error}");
            }
            WireEvent::Status { .. } => last = event.to_json(),
            WireEvent::Handshake { .. } => {}
        }
    }
    println!();
    Ok(last)
}

fn print_pause(outcome: &Value) {
    let status_name = outcome["status"].as_str().unwrap_or_default();
    println!("\n=== Waiting for review ({status_name}) ===");
    let Some(fields) = outcome.as_object() else {
        return;
    };
    for (key, value) in fields {
        if matches!(key.as_str(), "event" | "status" | "timestamp") {
            continue;
        }
        match value {
            Value::String(s) => println!("\n{key}:\n{s}"),
            Value::Null => {}
            other => println!("\n{key}: {other}"),
        }
    }
}

/// Ask for a decision. `None` means the user chose to stop.
async fn review(
    service: &WorkflowService,
    thread_id: &str,
    editing: bool,
) -> anyhow::Result<Option<ResumeRequest>> {
    let choices: &[&str] = if editing {
        &["approve", "revise", "edit sentence", "comment on sentence", "quit"]
    } else {
        &["approve", "revise", "quit"]
    };

    loop {
        match ask("Your decision:", choices)?.as_str() {
            "approve" => {
                return Ok(Some(ResumeRequest::new(thread_id, ApprovalStatus::Approved)));
            }
            "revise" => {
                let comment = read_line("Feedback (blank for none): ")?;
                let decision = if editing {
                    ApprovalStatus::Editing
                } else {
                    ApprovalStatus::Feedback
                };
                let mut request = ResumeRequest::new(thread_id, decision);
                if !comment.is_empty() {
                    request = request.with_comment(comment);
                }
                return Ok(Some(request));
            }
            "edit sentence" => {
                let id = read_line("Sentence id: ")?;
                let text = read_line("Replacement: ")?;
                match editor::edit_sentence(service, thread_id, &id, &text).await {
                    Ok(_) => println!("Recorded."),
                    Err(e) => println!("{e}"),
                }
            }
            "comment on sentence" => {
                let id = read_line("Sentence id: ")?;
                let note = read_line("Comment: ")?;
                match editor::feedback_sentence(service, thread_id, &id, &note).await {
                    Ok(_) => println!("Recorded."),
                    Err(e) => println!("{e}"),
                }
            }
            _ => return Ok(None),
        }
    }
}

fn ask(question: &str, choices: &[&str]) -> anyhow::Result<String> {
    println!("\n{question}");
    for (i, choice) in choices.iter().enumerate() {
        println!("  [{}] {}", i + 1, choice);
    }
    let answer = read_line("> ")?;
    if let Ok(idx) = answer.parse::<usize>() {
        if idx > 0 && idx <= choices.len() {
            return Ok(choices[idx - 1].to_string());
        }
    }
    Ok(answer)
}

fn read_line(prompt: &str) -> anyhow::Result<String> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}
