use attractor_core::{
    AgentSessionBackend, AttrValue, AttractorError, AutoApproveInterviewer, BackendOptions,
    CheckpointState, CommandJjRunner, ConsoleInterviewer, DiagnosticSubject, Graph, HumanAnswer,
    Interviewer, ModelRegistry, PipelineEvent, PipelineRunResult, PipelineRunner, PipelineStatus,
    QueueInterviewer, RunConfig, RuntimeEvent, RuntimeEventSink, ScriptedSession, ScriptedTurn,
    Severity, ToolMode, handlers::NodeKind, parse_dot, runtime_event_channel, validate,
};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "attractor")]
#[command(about = "Graph-driven workflow runner for LLM coding pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a workflow file
    Run(RunArgs),
    /// Validate a workflow file and print diagnostics
    Validate(ValidateArgs),
    /// Render a workflow file
    Show(ShowArgs),
    /// List the models the backend can resolve
    ListModels(ListModelsArgs),
    /// Dump a checkpoint file
    InspectCheckpoint(InspectCheckpointArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    workflow: PathBuf,
    #[arg(long)]
    logs: Option<PathBuf>,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    resume: Option<PathBuf>,
    #[arg(long)]
    goal: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long, value_enum, default_value_t = ToolModeArg::Coding)]
    tools: ToolModeArg,
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    approve_all: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
    #[arg(long = "human-answer")]
    human_answers: Vec<String>,
    /// Canned responses for the scripted backend; without any, codergen
    /// stages return simulated responses
    #[arg(long = "scripted-response")]
    scripted_responses: Vec<String>,
    #[arg(long, action = ArgAction::SetTrue)]
    emergency_cleanup: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    no_jj: bool,
}

#[derive(clap::Args, Debug)]
struct ValidateArgs {
    workflow: PathBuf,
}

#[derive(clap::Args, Debug)]
struct ShowArgs {
    workflow: PathBuf,
    #[arg(long, value_enum, default_value_t = ShowFormat::Auto)]
    format: ShowFormat,
}

#[derive(clap::Args, Debug)]
struct ListModelsArgs {
    #[arg(long)]
    provider: Option<String>,
}

#[derive(clap::Args, Debug)]
struct InspectCheckpointArgs {
    checkpoint: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ToolModeArg {
    None,
    ReadOnly,
    Coding,
}

impl From<ToolModeArg> for ToolMode {
    fn from(arg: ToolModeArg) -> Self {
        match arg {
            ToolModeArg::None => ToolMode::None,
            ToolModeArg::ReadOnly => ToolMode::ReadOnly,
            ToolModeArg::Coding => ToolMode::Coding,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ShowFormat {
    Ascii,
    Dot,
    Auto,
}

const EXIT_CANCELLED: u8 = 130;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    load_env_files();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Validate(args) => validate_command(args),
        Commands::Show(args) => show_command(args),
        Commands::ListModels(args) => list_models_command(args),
        Commands::InspectCheckpoint(args) => inspect_checkpoint_command(args),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

fn load_env_files() {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_graph(path: &PathBuf) -> Result<Graph, AttractorError> {
    let source = std::fs::read_to_string(path).map_err(|error| {
        AttractorError::Runtime(format!("failed to read '{}': {}", path.display(), error))
    })?;
    parse_dot(&source)
}

async fn run_command(args: RunArgs) -> Result<ExitCode, AttractorError> {
    let mut graph = load_graph(&args.workflow)?;
    apply_overrides(&mut graph, &args);

    if args.dry_run {
        let diagnostics = validate(&graph, &[]);
        print_diagnostics(&diagnostics);
        if diagnostics.iter().any(|d| d.is_error()) {
            return Ok(ExitCode::from(1));
        }
        println!("dry run: {} stages would execute", execution_order_hint(&graph));
        return Ok(ExitCode::SUCCESS);
    }

    let interviewer: Arc<dyn Interviewer> = if !args.human_answers.is_empty() {
        Arc::new(QueueInterviewer::with_answers(
            args.human_answers
                .iter()
                .map(|answer| HumanAnswer::Selected(answer.clone()))
                .collect::<Vec<_>>(),
        ))
    } else if args.approve_all {
        Arc::new(AutoApproveInterviewer)
    } else {
        Arc::new(ConsoleInterviewer)
    };

    let backend = if args.scripted_responses.is_empty() {
        None
    } else {
        let turns: Vec<ScriptedTurn> = args
            .scripted_responses
            .iter()
            .map(|text| ScriptedTurn::text(text.clone()))
            .collect();
        let options = BackendOptions {
            tool_mode: args.tools.into(),
            models: ModelRegistry::builtin(),
            ..BackendOptions::default()
        };
        Some(Arc::new(AgentSessionBackend::with_options(
            Box::new(ScriptedSession::new(turns)),
            options,
        )) as Arc<dyn attractor_core::handlers::codergen::CodergenBackend>)
    };

    let (event_tx, mut event_rx) = runtime_event_channel();
    let event_json = args.event_json;
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(&event, event_json);
        }
    });

    let config = RunConfig {
        run_id: args.run_id,
        events: RuntimeEventSink::with_sender(event_tx),
        backend,
        interviewer,
        jj: if args.no_jj {
            None
        } else {
            Some(Arc::new(CommandJjRunner::default()))
        },
        logs_root: args.logs,
        resume_from_checkpoint: args.resume,
        emergency_cleanup: args.emergency_cleanup,
        ..RunConfig::default()
    };

    // ctrl-c trips the run's cancellation token
    let cancel = config.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = PipelineRunner.run(&graph, config).await?;
    let _ = printer.await;
    print_result(&result);

    Ok(match result.status {
        PipelineStatus::Success => ExitCode::SUCCESS,
        PipelineStatus::Fail => ExitCode::from(1),
        PipelineStatus::Cancelled => ExitCode::from(EXIT_CANCELLED),
    })
}

fn apply_overrides(graph: &mut Graph, args: &RunArgs) {
    if let Some(goal) = args.goal.as_ref() {
        graph.attrs.set_explicit("goal", AttrValue::String(goal.clone()));
    }
    // --model/--provider become defaults for codergen stages that did not
    // pin their own
    for node in graph.nodes.values_mut() {
        if NodeKind::of(node) != NodeKind::Codergen {
            continue;
        }
        if let Some(model) = args.model.as_ref() {
            if node.attrs.get_str("llm_model").is_none() {
                node.attrs
                    .set_inherited("llm_model", AttrValue::String(model.clone()));
            }
        }
        if let Some(provider) = args.provider.as_ref() {
            if node.attrs.get_str("llm_provider").is_none() {
                node.attrs
                    .set_inherited("llm_provider", AttrValue::String(provider.clone()));
            }
        }
    }
}

fn validate_command(args: ValidateArgs) -> Result<ExitCode, AttractorError> {
    let graph = load_graph(&args.workflow)?;
    let diagnostics = validate(&graph, &[]);
    if diagnostics.is_empty() {
        println!("ok: {} nodes, {} edges", graph.nodes.len(), graph.edges.len());
        return Ok(ExitCode::SUCCESS);
    }
    print_diagnostics(&diagnostics);
    if diagnostics.iter().any(|d| d.is_error()) {
        Ok(ExitCode::from(1))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn print_diagnostics(diagnostics: &[attractor_core::Diagnostic]) {
    for diagnostic in diagnostics {
        let severity = match diagnostic.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        let location = match &diagnostic.subject {
            DiagnosticSubject::Graph => String::new(),
            DiagnosticSubject::Node { id } => format!(" [{id}]"),
            DiagnosticSubject::Edge { from, to } => format!(" [{from} -> {to}]"),
        };
        println!("{severity}: {} ({}){location}", diagnostic.message, diagnostic.rule);
    }
}

fn show_command(args: ShowArgs) -> Result<ExitCode, AttractorError> {
    let graph = load_graph(&args.workflow)?;
    let format = match args.format {
        ShowFormat::Auto => {
            use std::io::IsTerminal;
            if std::io::stdout().is_terminal() {
                ShowFormat::Ascii
            } else {
                ShowFormat::Dot
            }
        }
        other => other,
    };

    match format {
        ShowFormat::Dot => {
            match graph.source_dot.as_deref() {
                Some(source) => println!("{source}"),
                None => println!("digraph {} {{ }}", graph.id),
            }
        }
        ShowFormat::Ascii | ShowFormat::Auto => {
            println!("{}", render_ascii(&graph));
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn render_ascii(graph: &Graph) -> String {
    let mut out = String::new();
    out.push_str(&format!("pipeline: {}\n", graph.id));
    if let Some(goal) = graph.attrs.get_str("goal") {
        out.push_str(&format!("goal: {goal}\n"));
    }
    out.push('\n');
    for node in graph.nodes.values() {
        let kind = NodeKind::of(node);
        let label = node
            .attrs
            .get_str("label")
            .filter(|label| !label.is_empty())
            .map(|label| format!(" \"{label}\""))
            .unwrap_or_default();
        out.push_str(&format!("  [{}] {}{label}\n", kind.as_str(), node.id));
        for edge in graph.outgoing_edges(&node.id) {
            let mut annotation = String::new();
            if let Some(condition) = edge.attrs.get_str("condition") {
                annotation = format!(" if {condition}");
            } else if let Some(edge_label) = edge.attrs.get_str("label") {
                annotation = format!(" on \"{edge_label}\"");
            }
            out.push_str(&format!("    -> {}{annotation}\n", edge.to));
        }
    }
    out
}

fn execution_order_hint(graph: &Graph) -> usize {
    graph
        .nodes
        .values()
        .filter(|node| !NodeKind::of(node).is_marker())
        .count()
}

fn list_models_command(args: ListModelsArgs) -> Result<ExitCode, AttractorError> {
    let registry = ModelRegistry::builtin();
    for model in registry.list(args.provider.as_deref()) {
        if model.aliases.is_empty() {
            println!("{}\t{}", model.id, model.provider);
        } else {
            println!("{}\t{}\t({})", model.id, model.provider, model.aliases.join(", "));
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn inspect_checkpoint_command(args: InspectCheckpointArgs) -> Result<ExitCode, AttractorError> {
    let checkpoint = CheckpointState::load_from_path(&args.checkpoint)?;
    if args.json {
        let rendered = serde_json::to_string_pretty(&checkpoint).map_err(|error| {
            AttractorError::Runtime(format!("failed to render checkpoint: {error}"))
        })?;
        println!("{rendered}");
        return Ok(ExitCode::SUCCESS);
    }

    println!("run: {}", checkpoint.run_id);
    println!("saved at: {}", checkpoint.timestamp);
    println!("current node: {}", checkpoint.current_node);
    if let Some(resume_at) = checkpoint.resume_at.as_deref() {
        println!("resumes at: {resume_at}");
    }
    if let Some(terminal) = checkpoint.terminal_status.as_deref() {
        println!("terminal status: {terminal}");
    }
    println!("completed: {}", checkpoint.completed_nodes.join(" -> "));
    println!(
        "context keys: {}, log lines: {}",
        checkpoint.context_values.len(),
        checkpoint.logs.len()
    );
    Ok(ExitCode::SUCCESS)
}

fn print_event(event: &RuntimeEvent, as_json: bool) {
    if as_json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{line}");
        }
        return;
    }

    match &event.event {
        PipelineEvent::PipelineStarted {
            name, stage_count, ..
        } => println!("pipeline {name} started ({stage_count} stages)"),
        PipelineEvent::PipelineResumed { resume_node, .. } => {
            println!("pipeline resumed at {resume_node}")
        }
        PipelineEvent::StageStarted { name, attempt, .. } => {
            if *attempt > 1 {
                println!("stage {name} started (attempt {attempt})");
            } else {
                println!("stage {name} started");
            }
        }
        PipelineEvent::AgentText { text, .. } => {
            for line in text.lines() {
                println!("  | {line}");
            }
        }
        PipelineEvent::AgentToolStart { tool, .. } => println!("  > tool {tool}"),
        PipelineEvent::AgentToolEnd { tool, .. } => println!("  < tool {tool}"),
        PipelineEvent::StageCompleted { name, status, .. } => {
            println!("stage {name} completed ({status})")
        }
        PipelineEvent::StageFailed {
            name,
            failure_reason,
            ..
        } => println!(
            "stage {name} failed: {}",
            failure_reason.as_deref().unwrap_or("unknown reason")
        ),
        PipelineEvent::StageRetrying {
            name,
            next_attempt,
            delay_ms,
            ..
        } => println!("stage {name} retrying (attempt {next_attempt} in {delay_ms}ms)"),
        PipelineEvent::CheckpointSaved { path, .. } => {
            tracing::debug!(path = %path, "checkpoint saved")
        }
        PipelineEvent::UsageUpdate { name, totals, .. } => tracing::debug!(
            stage = %name,
            total_tokens = totals.total_tokens,
            "usage updated"
        ),
        PipelineEvent::PipelineCompleted { .. } => println!("pipeline completed"),
        PipelineEvent::PipelineFailed { reason, .. } => println!("pipeline failed: {reason}"),
        PipelineEvent::PipelineCancelled { at_node, .. } => {
            println!("pipeline cancelled at {at_node}")
        }
    }
}

fn print_result(result: &PipelineRunResult) {
    println!();
    println!(
        "run {} finished: {}",
        result.run_id,
        result.status.as_str()
    );
    println!("completed: {}", result.completed_nodes.join(" -> "));
    if result.usage.totals.total_tokens > 0 {
        println!(
            "usage: {} in / {} out / {} total tokens, ${:.4}",
            result.usage.totals.input_tokens,
            result.usage.totals.output_tokens,
            result.usage.totals.total_tokens,
            result.usage.totals.cost
        );
    }
    if let Some(summary) = result.failure_summary.as_ref() {
        println!("failed node: {}", summary.failed_node);
        if let Some(class) = summary.failure_class {
            println!("failure class: {}", class.as_str());
        }
        println!("digest: {}", summary.digest);
        if let Some(check) = summary.first_failing_check.as_deref() {
            println!("first failing check: {check}");
        }
        if let Some(command) = summary.rerun_command.as_deref() {
            println!("rerun: {command}");
        }
        if let Some(logs) = summary.logs_path.as_deref() {
            println!("logs: {logs}");
        }
    }
}
