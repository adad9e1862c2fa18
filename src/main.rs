use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sandbox_runner::logs::{self, LogSource, LogStream};
use sandbox_runner::models::EXIT_CODE_UNKNOWN;
use sandbox_runner::{
    RunResult, RunnerConfig, RunnerError, RunnerResult, Service, Workflow, WorkflowOrchestrator, WorkflowRequest,
};

#[derive(Parser, Debug)]
#[command(name = "sandbox-runner", version, about = "Run a repository's workflow in a locked-down container")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Verbose logs
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sync a repository and run one of its workflows
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Remote repository URL (local paths are rejected)
    #[arg(long)]
    repo: String,
    /// run | test | build | lint
    #[arg(long)]
    workflow: Workflow,
    /// Branch, tag or commit
    #[arg(long = "ref", default_value = "main")]
    git_ref: String,
    /// ui | api | all
    #[arg(long, default_value = "all")]
    service: Service,
    /// Entry file for single-service `run`
    #[arg(long)]
    entry: Option<String>,
    /// Host port for the UI (0 picks one)
    #[arg(long, default_value_t = 0)]
    ui_port: u16,
    /// Host port for the API or the single service (0 picks one)
    #[arg(long, visible_alias = "publish", default_value_t = 0)]
    api_port: u16,
    /// Overall deadline, e.g. 90s or 10m
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10m")]
    timeout: Duration,
    /// Where to keep the working copy (default: <repos root>/<repo name>)
    #[arg(long)]
    checkout_dir: Option<PathBuf>,
    /// Env file passed to the container runtime as is
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Extra container environment, KEY=VALUE
    #[arg(short = 'e', long = "env", value_parser = parse_key_val)]
    env: Vec<(String, String)>,
    /// Emit log lines and the result as JSON
    #[arg(long)]
    json: bool,
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUNNER_LOG").unwrap_or_else(|_| filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let outcome = match cli.command {
        Commands::Run(args) => cmd_run(args).await,
    };
    let code = match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            e.downcast_ref::<RunnerError>()
                .map(RunnerError::exit_code)
                .unwrap_or(EXIT_CODE_UNKNOWN)
        }
    };
    std::process::exit(code);
}

async fn cmd_run(args: RunArgs) -> Result<i32> {
    let request = WorkflowRequest {
        repo_url: args.repo,
        git_ref: args.git_ref,
        workflow: args.workflow,
        service: args.service,
        entry: args.entry,
        ui_port: args.ui_port,
        api_port: args.api_port,
        checkout_dir: args.checkout_dir,
        timeout: args.timeout,
        env: args.env,
        env_file: args.env_file,
    };
    let config = RunnerConfig::from_env();
    tracing::info!(tool_dir = %config.tool_dir.display(), repos_root = %config.repos_root.display(), "loaded config");
    let orchestrator = WorkflowOrchestrator::from_config(config);

    let (sink, stream) = logs::channel();
    let (outcome, printed) = tokio::join!(orchestrator.execute(&request, sink), print_lines(stream, args.json));
    printed?;

    if args.json {
        println!("{}", json_report(&outcome).context("serializing result")?);
    }
    let result = outcome.with_context(|| format!("{} workflow for {} failed", request.workflow, request.repo_url))?;
    Ok(result.exit_code)
}

/// Final `--json` record. Failed runs still report what they captured.
fn json_report(outcome: &RunnerResult<RunResult>) -> serde_json::Result<Value> {
    let e = match outcome {
        Ok(result) => return serde_json::to_value(result),
        Err(e) => e,
    };
    let mut report = match e.partial_output() {
        Some(partial) => serde_json::to_value(partial)?,
        None => json!({ "exit_code": e.exit_code(), "stdout": "", "stderr": "" }),
    };
    report["error"] = json!(e.to_string());
    if let Some(output) = e.tool_output() {
        report["output"] = json!(output);
    }
    Ok(report)
}

async fn print_lines(mut stream: LogStream, json: bool) -> Result<()> {
    while let Some(line) = stream.next_line().await {
        if json {
            println!("{}", serde_json::to_string(&line)?);
        } else if line.source == LogSource::Stderr {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }
    Ok(())
}
