use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use maestro::config::Config;
use maestro::orchestration::{CommandInvoker, ControllerOptions, ExecutionController, SchedulerEvent};
use maestro::util::parse_duration;
use maestro::workflow::{RunResult, RunStatus};
use maestro::{Error, Result, WorkflowDefinition, WorkflowGraph};

/// Maestro - multi-agent workflow orchestrator
#[derive(Parser, Debug)]
#[command(name = "maestro")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    MAESTRO_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.maestro/maestro.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a workflow definition
    Run {
        /// Path to the workflow definition (.toml or .json)
        definition: PathBuf,

        /// Maximum number of concurrent agent invocations
        #[arg(short = 'c', long)]
        concurrency: Option<usize>,

        /// Timeout applied to every task instead of its own (e.g. 30s, 5m)
        #[arg(long, value_parser = duration_arg)]
        timeout_override: Option<Duration>,

        /// Time in-flight tasks get to finish after Ctrl-C
        #[arg(long, value_parser = duration_arg)]
        grace: Option<Duration>,

        /// Write the JSON run report to this path
        #[arg(long)]
        report: Option<PathBuf>,

        /// Print the run result as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Check a workflow definition and print its execution order
    Validate {
        /// Path to the workflow definition (.toml or .json)
        definition: PathBuf,
    },
}

fn duration_arg(s: &str) -> std::result::Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on debug flag
    maestro::log::init_with_debug(cli.debug);

    let outcome = match cli.command {
        Command::Run {
            definition,
            concurrency,
            timeout_override,
            grace,
            report,
            json,
        } => run_workflow(RunArgs {
            definition,
            concurrency,
            timeout_override,
            grace,
            report,
            json,
        }),
        Command::Validate { definition } => validate(&definition).map(|()| ExitCode::SUCCESS),
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("\x1b[31mError: {}\x1b[0m", e);
            ExitCode::from(1)
        }
    }
}

struct RunArgs {
    definition: PathBuf,
    concurrency: Option<usize>,
    timeout_override: Option<Duration>,
    grace: Option<Duration>,
    report: Option<PathBuf>,
    json: bool,
}

/// Run a workflow with the command invoker and report the outcome.
fn run_workflow(args: RunArgs) -> Result<ExitCode> {
    info!(definition = %args.definition.display(), "run command");

    let config = Config::load()?;
    let definition = WorkflowDefinition::load(&args.definition)?;

    let mut options = ControllerOptions::from_config(&config).timeout_override(args.timeout_override);
    if let Some(concurrency) = args.concurrency {
        if concurrency == 0 {
            return Err(Error::Validation("concurrency must be at least 1".to_string()));
        }
        options = options.concurrency(concurrency);
    }
    if let Some(grace) = args.grace {
        options = options.grace_period(grace);
    }
    let concurrency = options.concurrency;
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let options = options.events(event_tx);
    let invoker = Arc::new(CommandInvoker::new(config.agents.clone()));
    let show_progress = !args.json;

    // Create async runtime for the controller
    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async move {
        let controller = ExecutionController::new(invoker).with_options(options);

        let token = controller.cancellation_token();
        let signal = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling run");
                eprintln!("\x1b[33mCancelling... waiting for running tasks\x1b[0m");
                token.cancel();
            }
        });
        let progress = tokio::spawn(print_progress(event_rx, show_progress));

        let result = controller.run(definition, concurrency).await;
        // Closing the last sender lets the progress printer drain and exit.
        drop(controller);
        let _ = progress.await;
        signal.abort();
        result
    })?;

    let report_path = args
        .report
        .or_else(|| config.report_dir().map(|dir| result.report_path(&dir)));
    if let Some(path) = &report_path {
        result.write_report(path)?;
        info!(path = %path.display(), "report written");
    }

    if args.json {
        println!("{}", result.to_json()?);
    } else {
        print_summary(&result, report_path.as_deref());
    }

    Ok(ExitCode::from(exit_code(result.status)))
}

async fn print_progress(mut events: mpsc::UnboundedReceiver<SchedulerEvent>, enabled: bool) {
    while let Some(event) = events.recv().await {
        if !enabled {
            continue;
        }
        if let Some(line) = format_event(&event) {
            println!("{}", line);
        }
    }
}

/// One progress line per task event.
fn format_event(event: &SchedulerEvent) -> Option<String> {
    let line = match event {
        SchedulerEvent::TaskStarted { task_id, attempt } if *attempt > 1 => {
            format!("  started   {} (attempt {})", task_id, attempt)
        }
        SchedulerEvent::TaskStarted { task_id, .. } => format!("  started   {}", task_id),
        SchedulerEvent::TaskSucceeded { task_id, .. } => {
            format!("  \x1b[32msucceeded\x1b[0m {}", task_id)
        }
        SchedulerEvent::TaskRetrying {
            task_id,
            delay,
            error,
            ..
        } => format!(
            "  \x1b[33mretrying\x1b[0m  {} in {}ms: {}",
            task_id,
            delay.as_millis(),
            error
        ),
        SchedulerEvent::TaskFailed { task_id, error } => {
            format!("  \x1b[31mfailed\x1b[0m    {}: {}", task_id, error)
        }
        SchedulerEvent::TaskSkipped { task_id, cause } => {
            format!("  \x1b[90mskipped\x1b[0m   {} ({} did not succeed)", task_id, cause)
        }
        SchedulerEvent::TaskCancelled { task_id } => {
            format!("  \x1b[90mcancelled\x1b[0m {}", task_id)
        }
        SchedulerEvent::RunFinished { .. } => return None,
    };
    Some(line)
}

fn print_summary(result: &RunResult, report: Option<&Path>) {
    println!();
    print!("{}", result.summary());
    println!("Status: {}", format_status(result.status));
    if let Some(path) = report {
        println!("Report: {}", path.display());
    }
    if let Some(line) = log_hint(maestro::log::is_debug(), maestro::log::log_path()) {
        println!("{}", line);
    }
}

/// Where to find the debug log, shown only in debug mode.
fn log_hint(debug: bool, path: Option<&PathBuf>) -> Option<String> {
    match path {
        Some(path) if debug => Some(format!("Log: {}", path.display())),
        _ => None,
    }
}

/// Build the graph and print the order tasks would run in.
fn validate(path: &Path) -> Result<()> {
    let definition = WorkflowDefinition::load(path)?;
    let graph = WorkflowGraph::build(definition)?;

    println!(
        "Workflow {}: {} tasks, {} dependencies",
        graph.name(),
        graph.task_count(),
        graph.dependency_count()
    );
    for (i, task) in graph.topological_order().into_iter().enumerate() {
        if task.depends_on.is_empty() {
            println!("  {:>3}. {} [{}]", i + 1, task.id, task.agent);
        } else {
            let deps: Vec<&str> = task.depends_on.iter().map(|d| d.as_str()).collect();
            println!(
                "  {:>3}. {} [{}] after {}",
                i + 1,
                task.id,
                task.agent,
                deps.join(", ")
            );
        }
    }
    println!("\x1b[32mDefinition is valid\x1b[0m");
    Ok(())
}

/// Process exit code for a finished run.
fn exit_code(status: RunStatus) -> u8 {
    match status {
        RunStatus::Completed => 0,
        RunStatus::PartiallyFailed => 2,
        RunStatus::Failed => 3,
        RunStatus::Cancelled => 4,
    }
}

/// Format run status with color codes for terminal.
fn format_status(status: RunStatus) -> String {
    match status {
        RunStatus::Completed => format!("\x1b[32m{}\x1b[0m", status), // Green
        RunStatus::PartiallyFailed => format!("\x1b[33m{}\x1b[0m", status), // Yellow
        RunStatus::Failed => format!("\x1b[31m{}\x1b[0m", status),    // Red
        RunStatus::Cancelled => format!("\x1b[90m{}\x1b[0m", status), // Gray
    }
}
