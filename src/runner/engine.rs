//! Workflow engine facade and sequential execution.
//!
//! The engine validates a document, merges caller variables over the
//! document defaults, initializes the scope, and picks the execution path:
//! the plain step list in declared order, or dependency-graph execution when
//! any step declares `depends_on`. One engine is built per run; there is no
//! shared global state.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dispatch::{CommandDispatcher, ShellRunner};
use crate::error::{self, Result};
use crate::runner::parallel::ParallelExecutor;
use crate::runner::step::StepRunner;
use crate::workflow::observer::{NullObserver, ProgressEvent, ProgressObserver};
use crate::workflow::results::{EntryResult, StepResult, StepStatus, WorkflowResult};
use crate::workflow::schema::{StepOrBlock, Workflow};
use crate::workflow::template::Scope;

/// Per-run options supplied by the caller.
#[derive(Debug, Default)]
pub struct EngineOptions {
    /// Caller variables; merged over document defaults, caller wins.
    pub variables: BTreeMap<String, JsonValue>,
    /// Preview mode: no dispatch occurs.
    pub dry_run: bool,
    /// Bound on the entire run.
    pub timeout: Option<Duration>,
}

/// Entry point for executing a validated workflow.
pub struct WorkflowEngine {
    dispatcher: Arc<dyn CommandDispatcher>,
    shell: Arc<dyn ShellRunner>,
    observer: Arc<dyn ProgressObserver>,
    cancel: CancellationToken,
}

impl WorkflowEngine {
    /// Create an engine over the two dispatch collaborators.
    pub fn new(dispatcher: Arc<dyn CommandDispatcher>, shell: Arc<dyn ShellRunner>) -> Self {
        Self {
            dispatcher,
            shell,
            observer: Arc::new(NullObserver),
            cancel: CancellationToken::new(),
        }
    }

    /// Attach a progress observer.
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token the caller can use to abort the run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute a workflow to an aggregated result.
    ///
    /// A failing step produces a failed [`WorkflowResult`], not an `Err`;
    /// errors are reserved for invalid documents.
    pub async fn run(&self, workflow: &Workflow, options: &EngineOptions) -> Result<WorkflowResult> {
        error::into_result(workflow.validate())?;

        let start = Instant::now();
        let deadline = options.timeout.map(|t| start + t);

        let mut vars = workflow.vars.clone();
        vars.extend(options.variables.clone());
        let mut scope = Scope::new(vars);

        let runner = Arc::new(
            StepRunner::new(self.dispatcher.clone(), self.shell.clone())
                .with_env(workflow.env.clone())
                .with_dry_run(options.dry_run),
        );
        let parallel = ParallelExecutor::new(
            runner.clone(),
            self.observer.clone(),
            workflow.parallel.clone(),
        );

        info!(workflow = %workflow.name, dry_run = options.dry_run, "running workflow");
        if let Some(description) = &workflow.description {
            debug!(workflow = %workflow.name, %description);
        }
        self.observer.on_event(&ProgressEvent::WorkflowStarted {
            name: workflow.name.clone(),
        });

        let entries = if workflow.has_dependencies() {
            self.run_dag(workflow, &parallel, &mut scope, deadline).await?
        } else {
            self.run_sequential(workflow, &runner, &parallel, &mut scope, deadline)
                .await
        };

        let success = WorkflowResult::compute_success(&entries);
        self.observer
            .on_event(&ProgressEvent::WorkflowCompleted { success });
        if success {
            info!(workflow = %workflow.name, "workflow completed");
        } else {
            info!(workflow = %workflow.name, "workflow failed");
        }

        Ok(WorkflowResult {
            name: workflow.name.clone(),
            success,
            entries,
            duration_seconds: start.elapsed().as_secs_f64(),
        })
    }

    /// Dependency-graph path: every top-level entry is a plain step
    /// (validation rejects blocks alongside `depends_on`).
    async fn run_dag(
        &self,
        workflow: &Workflow,
        parallel: &ParallelExecutor,
        scope: &mut Scope,
        deadline: Option<Instant>,
    ) -> Result<Vec<EntryResult>> {
        let graph = workflow.dependency_graph()?;
        let steps: Vec<_> = workflow.top_level_steps().cloned().collect();

        debug!(steps = steps.len(), "using dependency-based execution");
        let mut results = parallel
            .run_dag(&steps, &graph, scope, &self.cancel, deadline)
            .await;

        Ok(steps
            .iter()
            .filter_map(|step| results.remove(&step.name))
            .map(EntryResult::Step)
            .collect())
    }

    /// Sequential path: walk the declared list, merging results into the
    /// scope as each entry completes.
    async fn run_sequential(
        &self,
        workflow: &Workflow,
        runner: &Arc<StepRunner>,
        parallel: &ParallelExecutor,
        scope: &mut Scope,
        deadline: Option<Instant>,
    ) -> Vec<EntryResult> {
        let mut entries = Vec::new();

        for (position, entry) in workflow.steps.iter().enumerate() {
            match entry {
                StepOrBlock::Step(step) => {
                    self.observer.on_event(&ProgressEvent::StepStarted {
                        name: step.name.clone(),
                    });

                    let result = runner.run(step, scope, &self.cancel, deadline).await;

                    self.observer.on_event(&ProgressEvent::StepCompleted {
                        name: result.name.clone(),
                        status: result.status,
                        duration_seconds: result.duration_seconds,
                    });
                    record_into_scope(scope, &result);

                    let halt = !result.success() && !result.continue_on_failure;
                    if halt {
                        debug!(step = %step.name, status = %result.status, "halting workflow");
                    }
                    entries.push(EntryResult::Step(result));
                    if halt {
                        break;
                    }
                }
                StepOrBlock::Block { parallel: block } => {
                    let result = parallel
                        .run_block(block, position + 1, scope, &self.cancel, deadline)
                        .await;

                    for child in &result.step_results {
                        record_into_scope(scope, child);
                    }

                    // a failed block halts unconditionally; its children
                    // already observed their own failure policies
                    let halt = result.status != StepStatus::Succeeded;
                    entries.push(EntryResult::Block(result));
                    if halt {
                        break;
                    }
                }
            }
        }

        entries
    }
}

fn record_into_scope(scope: &mut Scope, result: &StepResult) {
    scope.record_result(
        &result.name,
        &result.stdout,
        &result.stderr,
        result.exit_code,
        &result.status.to_string(),
    );
}
