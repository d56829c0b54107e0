//! CLI argument definitions.
//!
//! This module defines all CLI arguments using clap's derive macros.
//! The main entry point is the [`Cli`] struct.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// opsctl - unified DevOps CLI.
#[derive(Debug, Parser)]
#[command(name = "opsctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Minimal output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run and inspect workflows
    Workflow(WorkflowArgs),
}

/// Arguments for the `workflow` command group.
#[derive(Debug, Args)]
pub struct WorkflowArgs {
    #[command(subcommand)]
    pub command: WorkflowCommands,
}

/// Workflow subcommands.
#[derive(Debug, Subcommand)]
pub enum WorkflowCommands {
    /// Execute a workflow file
    Run(RunArgs),

    /// Validate a workflow file without executing it
    Check(CheckArgs),
}

/// Arguments for `workflow run`.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to the workflow YAML file
    pub file: PathBuf,

    /// Variables passed to the workflow (name=value, repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub vars: Vec<String>,

    /// Show what would be executed without dispatching anything
    #[arg(long)]
    pub dry_run: bool,

    /// Bound the entire run, in seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Print the result as JSON instead of a summary table
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `workflow check`.
#[derive(Debug, Args)]
pub struct CheckArgs {
    /// Path to the workflow YAML file
    pub file: PathBuf,
}

/// Parse a `name=value` variable argument.
pub fn parse_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("invalid variable '{raw}', expected name=value")),
    }
}
