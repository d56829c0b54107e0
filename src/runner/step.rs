//! Single-step execution.
//!
//! The step runner takes a step and a scope snapshot and drives the step to
//! exactly one terminal [`StepResult`]: condition check, template rendering,
//! dispatch routing, dry-run short-circuit, deadline enforcement, and the
//! retry loop all live here. It never writes to the scope; recording results
//! is the executor's job.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dispatch::{
    params_to_args, shell_quote, CommandDispatcher, ParamValue, RenderedParams, ShellRunner,
};
use crate::error::{OpsctlError, Result};
use crate::workflow::results::StepResult;
use crate::workflow::schema::{Step, StepFailurePolicy, DEFAULT_STEP_TIMEOUT_SECS};
use crate::workflow::template::{render, render_bool, Scope};

/// Retry backoff starts here and doubles per attempt.
const RETRY_BASE_DELAY_SECS: u64 = 1;
/// Retry backoff never exceeds this.
const RETRY_MAX_DELAY_SECS: u64 = 30;

/// Executes one step to a terminal result.
pub struct StepRunner {
    dispatcher: Arc<dyn CommandDispatcher>,
    shell: Arc<dyn ShellRunner>,
    env: BTreeMap<String, String>,
    dry_run: bool,
}

/// A step's command and params after template rendering.
#[derive(Debug)]
struct RenderedCommand {
    /// Shell command line, or internal command path.
    command: String,
    /// Whether the command routes to the shell runner.
    shell: bool,
    params: RenderedParams,
}

impl RenderedCommand {
    /// Human-readable form for dry runs and logs.
    fn display(&self) -> String {
        let args = params_to_args(&self.params);
        if args.is_empty() {
            self.command.clone()
        } else {
            let mut parts = vec![self.command.clone()];
            parts.extend(args);
            parts.join(" ")
        }
    }

    /// Full shell line with params appended as quoted flags.
    fn shell_line(&self) -> String {
        let args = params_to_args(&self.params);
        if args.is_empty() {
            self.command.clone()
        } else {
            let quoted: Vec<String> = args.iter().map(|a| shell_quote(a)).collect();
            format!("{} {}", self.command, quoted.join(" "))
        }
    }
}

impl StepRunner {
    /// Create a step runner over the two dispatch collaborators.
    pub fn new(dispatcher: Arc<dyn CommandDispatcher>, shell: Arc<dyn ShellRunner>) -> Self {
        Self {
            dispatcher,
            shell,
            env: BTreeMap::new(),
            dry_run: false,
        }
    }

    /// Environment variables passed to every shell dispatch.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Enable preview mode: no dispatch occurs, every non-skipped step
    /// succeeds and records what it would have done.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Run a step to completion.
    ///
    /// `deadline` is the caller's bound (engine timeout, block timeout); the
    /// effective deadline is the earlier of it and the step's own timeout.
    pub async fn run(
        &self,
        step: &Step,
        scope: &Scope,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> StepResult {
        let started_at = Utc::now();
        let start = Instant::now();

        let mut result = self.run_inner(step, scope, cancel, deadline, start).await;

        result.started_at = started_at;
        result.completed_at = Utc::now();
        result.duration_seconds = start.elapsed().as_secs_f64();
        result.continue_on_failure =
            step.on_failure == StepFailurePolicy::Continue && result.status.is_failure();
        result
    }

    async fn run_inner(
        &self,
        step: &Step,
        scope: &Scope,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        start: Instant,
    ) -> StepResult {
        // condition gate, evaluated once before any dispatch
        if let Some(condition) = &step.condition {
            match render_bool(condition, scope) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(step = %step.name, "condition not met, skipping");
                    return StepResult::skipped(&step.name);
                }
                Err(e) => return self.render_failure(step, e),
            }
        }

        let step_timeout = Duration::from_secs(step.timeout.unwrap_or(DEFAULT_STEP_TIMEOUT_SECS));
        let effective_deadline = match deadline {
            Some(d) => Some(d.min(start + step_timeout)),
            None => Some(start + step_timeout),
        };

        let max_attempts = match step.on_failure {
            StepFailurePolicy::Retry => step.retries + 1,
            _ => 1,
        };

        let mut last_failure = StepResult::failed(
            &step.name,
            "step never dispatched".to_string(),
            String::new(),
            String::new(),
            None,
        );

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                let mut result = StepResult::cancelled(&step.name);
                result.attempts = attempt;
                return result;
            }

            let rendered = match self.render_command(step, scope) {
                Ok(rendered) => rendered,
                Err(e) => {
                    let mut result = self.render_failure(step, e);
                    result.attempts = attempt;
                    return result;
                }
            };

            if self.dry_run {
                let mut result = StepResult::succeeded(
                    &step.name,
                    format!("Would execute: {}", rendered.display()),
                    String::new(),
                    None,
                );
                result.dry_run = true;
                result.attempts = attempt;
                return result;
            }

            let outcome = if rendered.shell {
                self.shell
                    .run(&rendered.shell_line(), &self.env, cancel, effective_deadline)
                    .await
            } else {
                self.dispatcher
                    .dispatch(
                        &rendered.command,
                        &rendered.params,
                        cancel,
                        effective_deadline,
                    )
                    .await
            };

            match outcome {
                Ok(output) if output.success() => {
                    let mut result = StepResult::succeeded(
                        &step.name,
                        output.stdout,
                        output.stderr,
                        output.exit_code,
                    );
                    result.attempts = attempt;
                    return result;
                }
                Ok(output) => {
                    last_failure = StepResult::failed(
                        &step.name,
                        format!("command failed with exit code {:?}", output.exit_code),
                        output.stdout,
                        output.stderr,
                        output.exit_code,
                    );
                }
                Err(OpsctlError::Cancelled { .. }) => {
                    let mut result = StepResult::cancelled(&step.name);
                    result.attempts = attempt;
                    return result;
                }
                Err(OpsctlError::Timeout { .. }) => {
                    // a timed-out attempt is terminal; it still counts
                    let mut result = StepResult::timed_out(&step.name);
                    result.attempts = attempt;
                    return result;
                }
                Err(e) => {
                    warn!(step = %step.name, error = %e, "dispatch error");
                    last_failure = StepResult::failed(
                        &step.name,
                        e.to_string(),
                        String::new(),
                        String::new(),
                        None,
                    );
                }
            }

            last_failure.attempts = attempt;

            if attempt < max_attempts {
                let delay = retry_delay(attempt);
                if let Some(d) = effective_deadline {
                    if Instant::now() + delay >= d {
                        debug!(step = %step.name, "deadline leaves no room for retry");
                        break;
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        let mut result = StepResult::cancelled(&step.name);
                        result.attempts = attempt;
                        return result;
                    }
                }
            }
        }

        last_failure
    }

    /// Render errors fail the step without retrying; rendering is
    /// deterministic, so another attempt cannot change the outcome.
    fn render_failure(&self, step: &Step, error: OpsctlError) -> StepResult {
        StepResult::failed(
            &step.name,
            error.to_string(),
            String::new(),
            String::new(),
            None,
        )
    }

    fn render_command(&self, step: &Step, scope: &Scope) -> Result<RenderedCommand> {
        let command = render(&step.command, scope)?;
        let mut params = RenderedParams::new();
        for (key, value) in &step.params {
            if let Some(rendered) = render_param(value, scope)? {
                params.insert(key.clone(), rendered);
            }
        }

        match command.strip_prefix('!') {
            Some(rest) => Ok(RenderedCommand {
                command: rest.trim().to_string(),
                shell: true,
                params,
            }),
            None => Ok(RenderedCommand {
                command: command.trim().to_string(),
                shell: false,
                params,
            }),
        }
    }
}

/// Render a single param value. String values are templated, lists render
/// element-wise, booleans become flags, and nulls drop the param.
fn render_param(value: &JsonValue, scope: &Scope) -> Result<Option<ParamValue>> {
    match value {
        JsonValue::String(s) => Ok(Some(ParamValue::Str(render(s, scope)?))),
        JsonValue::Bool(b) => Ok(Some(ParamValue::Bool(*b))),
        JsonValue::Number(n) => Ok(Some(ParamValue::Str(n.to_string()))),
        JsonValue::Null => Ok(None),
        JsonValue::Array(items) => {
            let mut rendered = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    JsonValue::String(s) => rendered.push(render(s, scope)?),
                    JsonValue::Number(n) => rendered.push(n.to_string()),
                    JsonValue::Bool(b) => rendered.push(b.to_string()),
                    other => {
                        return Err(OpsctlError::RenderError {
                            message: format!("unsupported param list element: {other}"),
                        })
                    }
                }
            }
            Ok(Some(ParamValue::List(rendered)))
        }
        other => Err(OpsctlError::RenderError {
            message: format!("unsupported param value: {other}"),
        }),
    }
}

fn retry_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(6);
    Duration::from_secs((RETRY_BASE_DELAY_SECS << exp).min(RETRY_MAX_DELAY_SECS))
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted dispatch doubles shared by the runner test suites.

    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    use crate::dispatch::{
        CommandDispatcher, DispatchOutput, RenderedParams, ShellRunner,
    };
    use crate::error::{OpsctlError, Result};

    /// One scripted behavior per invocation of a command.
    #[derive(Debug, Clone)]
    pub enum Script {
        /// Succeed with the given stdout.
        Ok(&'static str),
        /// Exit non-zero with the given stderr.
        Fail(&'static str),
        /// Sleep, then succeed. Honors cancellation and the deadline.
        SleepThenOk(Duration),
        /// Fail the first `n` calls, then succeed.
        FailTimes(u32),
    }

    /// Dispatcher/shell double that scripts outcomes per command string and
    /// records every invocation.
    #[derive(Debug, Default)]
    pub struct MockDispatcher {
        scripts: Mutex<BTreeMap<String, Script>>,
        counters: Mutex<BTreeMap<String, u32>>,
        pub calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl MockDispatcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(self, command: &str, script: Script) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(command.to_string(), script);
            self
        }

        pub fn call_count(&self, command: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, _)| c == command)
                .count()
        }

        async fn execute(
            &self,
            command: &str,
            params: Vec<(String, String)>,
            cancel: &CancellationToken,
            deadline: Option<Instant>,
        ) -> Result<DispatchOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((command.to_string(), params));

            let script = self
                .scripts
                .lock()
                .unwrap()
                .get(command)
                .cloned()
                .unwrap_or(Script::Ok(""));

            match script {
                Script::Ok(stdout) => Ok(DispatchOutput {
                    exit_code: Some(0),
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                }),
                Script::Fail(stderr) => Ok(DispatchOutput {
                    exit_code: Some(1),
                    stdout: String::new(),
                    stderr: stderr.to_string(),
                }),
                Script::SleepThenOk(duration) => {
                    let timer = tokio::time::sleep(duration);
                    tokio::pin!(timer);
                    tokio::select! {
                        _ = &mut timer => Ok(DispatchOutput {
                            exit_code: Some(0),
                            stdout: "slept".to_string(),
                            stderr: String::new(),
                        }),
                        _ = cancel.cancelled() => Err(OpsctlError::Cancelled {
                            operation: command.to_string(),
                        }),
                        _ = crate::dispatch::shell::sleep_until_deadline(deadline) => {
                            Err(OpsctlError::Timeout {
                                operation: command.to_string(),
                                seconds: duration.as_secs(),
                            })
                        }
                    }
                }
                Script::FailTimes(n) => {
                    let count = {
                        let mut counters = self.counters.lock().unwrap();
                        let counter = counters.entry(command.to_string()).or_insert(0);
                        let current = *counter;
                        *counter += 1;
                        current
                    };
                    if count < n {
                        Ok(DispatchOutput {
                            exit_code: Some(1),
                            stdout: String::new(),
                            stderr: format!("transient failure {}", count + 1),
                        })
                    } else {
                        Ok(DispatchOutput {
                            exit_code: Some(0),
                            stdout: "recovered".to_string(),
                            stderr: String::new(),
                        })
                    }
                }
            }
        }
    }

    #[async_trait]
    impl CommandDispatcher for MockDispatcher {
        async fn dispatch(
            &self,
            command: &str,
            params: &RenderedParams,
            cancel: &CancellationToken,
            deadline: Option<Instant>,
        ) -> Result<DispatchOutput> {
            let flat: Vec<(String, String)> = params
                .iter()
                .map(|(k, v)| (k.clone(), format!("{v:?}")))
                .collect();
            self.execute(command, flat, cancel, deadline).await
        }
    }

    #[async_trait]
    impl ShellRunner for MockDispatcher {
        async fn run(
            &self,
            command_line: &str,
            _env: &BTreeMap<String, String>,
            cancel: &CancellationToken,
            deadline: Option<Instant>,
        ) -> Result<DispatchOutput> {
            self.execute(command_line, Vec::new(), cancel, deadline).await
        }
    }
}
