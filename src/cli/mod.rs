//! Command-line interface and argument parsing.

pub mod args;
pub mod commands;

pub use args::{CheckArgs, Cli, Commands, RunArgs, WorkflowArgs, WorkflowCommands};
