//! Runs a JSON workflow file.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use pipewright::cancellation::cancel_on_interrupt;
use pipewright::config::RunConfig;
use pipewright::events::LoggingEventSink;
use pipewright::observability::{init_tracing, LogFormat};
use pipewright::scheduler::Scheduler;
use pipewright::workflow::{Compiler, WorkflowSpec};

/// Compile and run a pipewright workflow
#[derive(Parser, Debug)]
#[command(name = "pipewright")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the workflow file (JSON)
    workflow: PathBuf,

    /// Run identifier
    #[arg(long, env = "PIPEWRIGHT_RUN_ID")]
    run_id: Option<String>,

    /// Host directory for artifacts
    #[arg(long, env = "PIPEWRIGHT_ARTIFACT_ROOT")]
    artifact_root: Option<PathBuf>,

    /// Directory under which executor workspaces are created
    #[arg(long, env = "PIPEWRIGHT_WORKSPACE_ROOT")]
    workspace_root: Option<PathBuf>,

    /// Leave workspaces on disk after the run
    #[arg(long)]
    keep_workspace: bool,

    /// Log format: plain or json
    #[arg(long, default_value = "plain")]
    log_format: String,

    /// Write the JSON run report to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Only compile and print the levels
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format.parse::<LogFormat>()?, "info")?;

    let spec = WorkflowSpec::from_path(&cli.workflow)
        .with_context(|| format!("failed to load {}", cli.workflow.display()))?;
    let workflow = Compiler::new()
        .compile(&spec)
        .with_context(|| format!("failed to compile workflow '{}'", spec.name))?;

    if cli.check {
        for (index, level) in workflow.levels.iter().enumerate() {
            println!("level {index}: {}", level.join(", "));
        }
        return Ok(());
    }

    let mut config = RunConfig::from_env()?;
    if let Some(run_id) = cli.run_id {
        config = config.with_run_id(run_id);
    }
    if let Some(root) = cli.artifact_root {
        config = config.with_artifact_root(root);
    }
    if let Some(root) = cli.workspace_root {
        config = config.with_workspace_root(root);
    }
    if cli.keep_workspace {
        config = config.with_keep_workspace(true);
    }

    let scheduler = Scheduler::new(config).with_event_sink(Arc::new(LoggingEventSink::debug()));
    let interrupt = cancel_on_interrupt(scheduler.cancellation_token());
    let report = scheduler.run(&workflow).await?;
    interrupt.abort();

    print!("{}", report.render_summary());
    if let Some(path) = cli.report {
        std::fs::write(&path, report.to_json()?)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    std::process::exit(report.exit_code());
}
