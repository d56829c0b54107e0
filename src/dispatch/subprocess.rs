//! Internal-command dispatch via a child `opsctl` process.
//!
//! Workflow commands like `aws s3 ls` are opsctl's own subcommands. Running
//! them as a child process keeps each step isolated from the engine: a
//! crashing handler becomes a failed step, not a crashed run.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dispatch::shell::run_child;
use crate::dispatch::{params_to_args, CommandDispatcher, DispatchOutput, RenderedParams};
use crate::error::{OpsctlError, Result};

/// Dispatcher that re-invokes the hosting binary with the command path and
/// rendered params as arguments.
#[derive(Debug, Clone)]
pub struct SubprocessDispatcher {
    binary: PathBuf,
}

impl SubprocessDispatcher {
    /// Dispatch through the currently running executable.
    pub fn current() -> Result<Self> {
        let binary = std::env::current_exe().map_err(|e| OpsctlError::DispatchError {
            command: "opsctl".to_string(),
            message: format!("cannot locate own binary: {e}"),
        })?;
        Ok(Self { binary })
    }

    /// Dispatch through an explicit binary, mainly for tests.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl CommandDispatcher for SubprocessDispatcher {
    async fn dispatch(
        &self,
        command: &str,
        params: &RenderedParams,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<DispatchOutput> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(command.split_whitespace());
        cmd.args(params_to_args(params));

        debug!(%command, binary = %self.binary.display(), "command dispatch");

        run_child(cmd, command, cancel, deadline).await
    }
}
