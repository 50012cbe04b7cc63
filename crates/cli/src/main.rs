use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rev_core::events::RunEvent;
use rev_core::{Orchestrator, PhaseClients, RunReport};

#[derive(Parser)]
#[command(name = "rev", version, about = "Autonomous coding agent with adaptive planning")]
struct Cli {
    /// Project directory to operate on.
    #[arg(long, global = true, default_value = ".")]
    dir: PathBuf,

    /// Parallel workers for independent tasks.
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Step budget override.
    #[arg(long, global = true)]
    max_steps: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a natural-language request against the project.
    Run {
        /// The request, e.g. "split lib/m.py into one file per class".
        request: Vec<String>,
    },
    /// Continue from the latest checkpoint.
    Resume,
    /// List checkpoints for this project.
    Checkpoints,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let repo_root = cli.dir.canonicalize()?;
    let mut config = rev_config::Config::load(&repo_root)?;
    if let Some(workers) = cli.workers {
        config.execution.workers = workers.max(1);
    }
    if let Some(max_steps) = cli.max_steps {
        config.budget.max_steps = max_steps;
    }

    match cli.command {
        Command::Run { request } => {
            let request = request.join(" ");
            if request.trim().is_empty() {
                anyhow::bail!("empty request; tell rev what to do");
            }
            let clients = PhaseClients::from_config(&config)?;
            let mut orchestrator = Orchestrator::new(&repo_root, config, clients, &request);
            spawn_event_printer(&orchestrator);
            let report = orchestrator.run().await?;
            print_report(&report);
            Ok(report.exit_code())
        }
        Command::Resume => {
            let clients = PhaseClients::from_config(&config)?;
            let mut orchestrator = Orchestrator::new(&repo_root, config, clients, "");
            spawn_event_printer(&orchestrator);
            let report = orchestrator.resume().await?;
            print_report(&report);
            Ok(report.exit_code())
        }
        Command::Checkpoints => {
            let dir = if config.checkpoint.dir.is_absolute() {
                config.checkpoint.dir.clone()
            } else {
                repo_root.join(&config.checkpoint.dir)
            };
            if !dir.exists() {
                println!("no checkpoints in {}", dir.display());
                return Ok(0);
            }
            let mut names: Vec<String> = std::fs::read_dir(&dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|n| n.starts_with("checkpoint_"))
                .collect();
            names.sort();
            for name in names {
                println!("{name}");
            }
            Ok(0)
        }
    }
}

fn spawn_event_printer(orchestrator: &Orchestrator) {
    let mut events = orchestrator.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RunEvent::PhaseChanged { from, to } => println!("phase: {from} -> {to}"),
                RunEvent::TaskStarted {
                    task_id,
                    description,
                } => println!("task {task_id}: {description}"),
                RunEvent::TaskCompleted { task_id } => println!("task {task_id}: done"),
                RunEvent::TaskFailed {
                    task_id,
                    kind,
                    message,
                } => println!("task {task_id}: failed ({kind}) {message}"),
                RunEvent::TaskRequeued {
                    task_id, retries, ..
                } => println!("task {task_id}: retrying (attempt {})", retries + 1),
                RunEvent::Replanning { reason } => println!("replanning: {reason}"),
                RunEvent::CheckpointSaved { path } => println!("checkpoint saved: {path}"),
                RunEvent::BudgetWarning {
                    resource,
                    used,
                    limit,
                } => println!("budget: {resource} at {used}/{limit}"),
                RunEvent::SystemMessage(message) => println!("{message}"),
                RunEvent::ToolCallStarted { .. }
                | RunEvent::ToolCallFinished { .. }
                | RunEvent::Retrying { .. } => {}
            }
        }
    });
}

fn print_report(report: &RunReport) {
    println!();
    print!("{}", report.summary());
    match report.exit_code() {
        0 => println!("run completed: all goals met"),
        4 => println!("run stopped: budget exhausted (resume with `rev resume`)"),
        5 => println!("run interrupted (resume with `rev resume`)"),
        code => println!("run failed (exit {code})"),
    }
}
