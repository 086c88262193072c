//! Binary entry point for the spotrun CLI.

mod cli;

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use cli::{Cli, Command, RunCommand};
use spotrun::logging::{self, LogFormat};
use spotrun::selector::rank;
use spotrun::{
    ComfyEngine, ComputeProvider, ErrorKind, HttpProvider, JobRunner, JobSpec, RunError,
    RunOutput, SpotrunConfig, files,
};
use spotrun::files::FileError;

/// Exit status when no offer satisfied the constraints (`EX_TEMPFAIL`).
const EXIT_UNAVAILABLE: i32 = 75;
/// Exit status after an interrupt.
const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("engine error: {0}")]
    Engine(String),
    #[error("workflow error: {0}")]
    Workflow(String),
    #[error("failed to write artifact: {0}")]
    Output(#[source] FileError),
    #[error("run failed ({}): {0}", .0.kind())]
    Run(#[from] RunError),
}

impl CliError {
    const fn exit_code(&self) -> i32 {
        match self {
            Self::Run(err) => match err.kind() {
                ErrorKind::ResourceUnavailable => EXIT_UNAVAILABLE,
                ErrorKind::Cancelled => EXIT_CANCELLED,
                _ => 1,
            },
            _ => 1,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(LogFormat::from_flag(cli.log_json));
    let exit_code = match dispatch(cli.command).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            err.exit_code()
        }
    };

    process::exit(exit_code);
}

async fn dispatch(command: Command) -> Result<(), CliError> {
    let config =
        SpotrunConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;

    match command {
        Command::Run(args) => run_command(&config, args).await,
        Command::Offers => offers_command(&config).await,
    }
}

async fn run_command(config: &SpotrunConfig, args: RunCommand) -> Result<(), CliError> {
    let spec = job_spec(&args)?;
    let provider = Arc::new(
        HttpProvider::new(config.provider_config())
            .map_err(|err| CliError::Provider(err.to_string()))?,
    );
    let engine = ComfyEngine::new(format!("spotrun-{}", Uuid::new_v4()), config.request_timeout())
        .map_err(|err| CliError::Engine(err.to_string()))?;
    let template = config
        .bootstrap_template()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let runner = JobRunner::new(provider, engine)
        .with_template(template)
        .with_settings(config.run_settings());

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());
    let output = runner.run_job(&spec, &config.constraints(), &cancel).await?;

    files::write_bytes(&args.output, &output.artifact.bytes).map_err(CliError::Output)?;
    write_summary(io::stdout(), &args.output, &output);
    if let Some(err) = &output.teardown_error {
        writeln!(io::stderr(), "warning: {err}; destroy it manually").ok();
    }
    Ok(())
}

async fn offers_command(config: &SpotrunConfig) -> Result<(), CliError> {
    let provider = HttpProvider::new(config.provider_config())
        .map_err(|err| CliError::Provider(err.to_string()))?;
    let catalog = provider
        .list_offers()
        .await
        .map_err(|err| CliError::Provider(err.to_string()))?;
    let mut stdout = io::stdout();
    for offer in rank(&catalog, &config.constraints()) {
        writeln!(
            stdout,
            "{}\t{:.4}/h\t{} GB\t{}\t{:.3}",
            offer.id,
            offer.price_per_hour,
            offer.gpu_memory_gb,
            offer.compute_class,
            offer.reliability
        )
        .ok();
    }
    Ok(())
}

fn job_spec(args: &RunCommand) -> Result<JobSpec, CliError> {
    let text = files::read_to_string(&args.workflow)
        .map_err(|err| CliError::Workflow(err.to_string()))?;
    let graph: Value = serde_json::from_str(&text)
        .map_err(|err| CliError::Workflow(format!("{}: {err}", args.workflow)))?;
    let key = args
        .idempotency_key
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut spec = JobSpec::new(graph, key);
    if let Some(input) = &args.input {
        spec = spec.with_input(input.as_str());
    }
    for (name, raw) in &args.params {
        spec = spec.with_param(name.as_str(), param_value(raw));
    }
    Ok(spec)
}

fn param_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

fn cancel_on_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling run");
            cancel.cancel();
        }
    });
}

fn write_summary(mut target: impl Write, path: &str, output: &RunOutput) {
    writeln!(
        target,
        "artifact: {path} ({} bytes, {})",
        output.artifact.bytes.len(),
        output.artifact.content_type
    )
    .ok();
    writeln!(target, "job: {} on {}", output.job.job_id, output.instance_id).ok();
    writeln!(target, "cost: {}", output.cost).ok();
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
