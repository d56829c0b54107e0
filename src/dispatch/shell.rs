//! Shell command execution.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dispatch::{DispatchOutput, ShellRunner};
use crate::error::{OpsctlError, Result};

/// Shell runner backed by the user's login shell.
#[derive(Debug, Clone, Default)]
pub struct SystemShell {
    /// Working directory; inherits the process cwd when unset.
    pub cwd: Option<std::path::PathBuf>,
}

impl SystemShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the given working directory for every command.
    pub fn with_cwd(cwd: impl Into<std::path::PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
        }
    }
}

#[async_trait]
impl ShellRunner for SystemShell {
    async fn run(
        &self,
        command_line: &str,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<DispatchOutput> {
        let shell = detect_shell();
        debug!(%command_line, %shell, "shell dispatch");

        let mut cmd = Command::new(&shell);
        cmd.arg(shell_flag());
        cmd.arg(command_line);

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }

        run_child(cmd, command_line, cancel, deadline).await
    }
}

/// Spawn a child process and wait for it, honoring cancellation and the
/// deadline. The child is killed when either fires.
pub(crate) async fn run_child(
    mut cmd: Command,
    what: &str,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> Result<DispatchOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let started = Instant::now();
    let child = cmd.spawn().map_err(|e| OpsctlError::DispatchError {
        command: what.to_string(),
        message: e.to_string(),
    })?;

    let wait = child.wait_with_output();
    tokio::pin!(wait);

    let output = tokio::select! {
        output = &mut wait => output.map_err(|e| OpsctlError::DispatchError {
            command: what.to_string(),
            message: e.to_string(),
        })?,
        _ = cancel.cancelled() => {
            // dropping the wait future kills the child via kill_on_drop
            return Err(OpsctlError::Cancelled {
                operation: what.to_string(),
            });
        }
        _ = sleep_until_deadline(deadline) => {
            return Err(OpsctlError::Timeout {
                operation: what.to_string(),
                seconds: started.elapsed().as_secs(),
            });
        }
    };

    Ok(DispatchOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Sleep until the deadline, or forever when there is none.
pub(crate) async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Detect the shell to execute commands with.
fn detect_shell() -> String {
    if cfg!(target_os = "windows") {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

/// Get the flag to pass commands to the shell.
fn shell_flag() -> &'static str {
    if cfg!(target_os = "windows") {
        "/C"
    } else {
        "-c"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn env() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[tokio::test]
    async fn runs_successful_command() {
        let shell = SystemShell::new();
        let cancel = CancellationToken::new();

        let out = shell.run("echo hello", &env(), &cancel, None).await.unwrap();

        assert!(out.success());
        assert_eq!(out.exit_code, Some(0));
        assert!(out.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn captures_nonzero_exit_and_stderr() {
        let shell = SystemShell::new();
        let cancel = CancellationToken::new();

        let out = shell
            .run("echo oops >&2; exit 3", &env(), &cancel, None)
            .await
            .unwrap();

        assert!(!out.success());
        assert_eq!(out.exit_code, Some(3));
        assert!(out.stderr.contains("oops"));
    }

    #[tokio::test]
    async fn passes_environment() {
        let shell = SystemShell::new();
        let cancel = CancellationToken::new();
        let mut env = env();
        env.insert("WF_VAR".to_string(), "wf_value".to_string());

        let out = shell
            .run("echo $WF_VAR", &env, &cancel, None)
            .await
            .unwrap();

        assert!(out.stdout.contains("wf_value"));
    }

    #[tokio::test]
    async fn respects_working_directory() {
        let temp = tempfile::TempDir::new().unwrap();
        let shell = SystemShell::with_cwd(temp.path());
        let cancel = CancellationToken::new();

        let out = shell.run("pwd", &env(), &cancel, None).await.unwrap();

        let canonical = temp.path().canonicalize().unwrap();
        assert!(out.stdout.contains(canonical.to_str().unwrap()));
    }

    #[tokio::test]
    async fn deadline_kills_long_command() {
        let shell = SystemShell::new();
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_millis(100);

        let started = std::time::Instant::now();
        let result = shell.run("sleep 5", &env(), &cancel, Some(deadline)).await;

        assert!(matches!(result, Err(OpsctlError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn cancellation_kills_running_command() {
        let shell = SystemShell::new();
        let cancel = CancellationToken::new();

        let killer = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            killer.cancel();
        });

        let started = std::time::Instant::now();
        let result = shell.run("sleep 5", &env(), &cancel, None).await;

        assert!(matches!(result, Err(OpsctlError::Cancelled { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn already_cancelled_token_stops_immediately() {
        let shell = SystemShell::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = shell.run("sleep 5", &env(), &cancel, None).await;
        assert!(matches!(result, Err(OpsctlError::Cancelled { .. })));
    }
}
