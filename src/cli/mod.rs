//! Command-line interface definitions for the `spotrun` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Parser, Subcommand};

/// Top-level CLI for the `spotrun` binary.
#[derive(Debug, Parser)]
#[command(
    name = "spotrun",
    about = "Run one workflow job on a rented GPU instance and tear it down",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Emit log records as JSON objects.
    #[arg(long, global = true)]
    pub(crate) log_json: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands understood by `spotrun`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Provision an instance, run a job, fetch its artifact, and destroy the instance.
    #[command(
        name = "run",
        about = "Run a workflow job on the cheapest matching offer"
    )]
    Run(RunCommand),
    /// List offers that satisfy the configured constraints.
    #[command(
        name = "offers",
        about = "List matching offers, cheapest first, without provisioning"
    )]
    Offers,
}

/// Arguments for the `spotrun run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Workflow graph in the engine's JSON format.
    #[arg(long, value_name = "GRAPH_JSON")]
    pub(crate) workflow: String,
    /// Destination for the primary artifact.
    #[arg(long, value_name = "PATH")]
    pub(crate) output: String,
    /// Input reference substituted for the `{{input}}` placeholder.
    #[arg(long, value_name = "REF")]
    pub(crate) input: Option<String>,
    /// Workflow parameter substituted for `{{KEY}}`; repeatable.
    ///
    /// Values that parse as JSON (numbers, booleans, objects) are inserted
    /// as JSON; anything else is inserted as a string.
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub(crate) params: Vec<(String, String)>,
    /// Key identifying this job to the engine; a fresh UUID when omitted.
    #[arg(long, value_name = "KEY")]
    pub(crate) idempotency_key: Option<String>,
}

/// Splits `KEY=VALUE` at the first `=`.
pub(crate) fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return Err(format!("parameter name is empty in `{raw}`"));
    }
    Ok((trimmed.to_owned(), value.to_owned()))
}
