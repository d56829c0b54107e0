//! The `workflow run` and `workflow check` commands.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::time::Duration;
use tracing::debug;

use crate::cli::args::{parse_var, CheckArgs, RunArgs};
use crate::dispatch::{SubprocessDispatcher, SystemShell};
use crate::error::{OpsctlError, Result};
use crate::runner::engine::{EngineOptions, WorkflowEngine};
use crate::ui::{render_summary, ConsoleObserver};
use crate::workflow::schema::Workflow;

/// Execute a workflow file. Returns whether the workflow succeeded.
pub async fn run(args: &RunArgs, quiet: bool) -> Result<bool> {
    let workflow = load_workflow_file(&args.file)?;

    let mut variables: BTreeMap<String, JsonValue> = BTreeMap::new();
    for raw in &args.vars {
        let (name, value) =
            parse_var(raw).map_err(|message| OpsctlError::WorkflowInvalid { message })?;
        variables.insert(name, JsonValue::String(value));
    }

    let dispatcher = Arc::new(SubprocessDispatcher::current()?);
    let shell = Arc::new(SystemShell::new());
    let engine = WorkflowEngine::new(dispatcher, shell)
        .with_observer(Arc::new(ConsoleObserver::new(quiet || args.json)));

    // ctrl-c aborts the run; the engine fans the signal out to every step
    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupt received, cancelling workflow");
            cancel.cancel();
        }
    });

    let options = EngineOptions {
        variables,
        dry_run: args.dry_run,
        timeout: args.timeout.map(Duration::from_secs),
    };

    let result = engine.run(&workflow, &options).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result).unwrap_or_default());
    } else if !quiet {
        println!("{}", render_summary(&result));
    }

    Ok(result.success)
}

/// Validate a workflow file and report every problem found.
pub fn check(args: &CheckArgs, quiet: bool) -> Result<bool> {
    let text = read_workflow_text(&args.file)?;
    let workflow: Workflow =
        serde_yaml::from_str(&text).map_err(|e| OpsctlError::WorkflowParseError {
            message: e.to_string(),
        })?;

    let errors = workflow.validate();
    if errors.is_empty() {
        if !quiet {
            println!("{} is valid", args.file.display());
        }
        Ok(true)
    } else {
        for error in &errors {
            eprintln!("{}: {}", error.rule, error.message);
        }
        Ok(false)
    }
}

fn load_workflow_file(path: &std::path::Path) -> Result<Workflow> {
    Workflow::load_str(&read_workflow_text(path)?)
}

fn read_workflow_text(path: &std::path::Path) -> Result<String> {
    if !path.exists() {
        return Err(OpsctlError::WorkflowNotFound {
            path: path.to_path_buf(),
        });
    }
    Ok(std::fs::read_to_string(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn check_accepts_valid_workflow() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ok.yml");
        fs::write(
            &path,
            r#"
            name: ok
            steps:
              - name: hello
                command: "!echo hi"
        "#,
        )
        .unwrap();

        let args = CheckArgs { file: path };
        assert!(check(&args, true).unwrap());
    }

    #[test]
    fn check_reports_invalid_workflow() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.yml");
        fs::write(
            &path,
            r#"
            name: bad
            steps:
              - name: a
                command: "!true"
                depends_on: [a]
        "#,
        )
        .unwrap();

        let args = CheckArgs { file: path };
        assert!(!check(&args, true).unwrap());
    }

    #[test]
    fn missing_file_is_a_not_found_error() {
        let args = CheckArgs {
            file: "/nonexistent/workflow.yml".into(),
        };
        assert!(matches!(
            check(&args, true),
            Err(OpsctlError::WorkflowNotFound { .. })
        ));
    }
}
