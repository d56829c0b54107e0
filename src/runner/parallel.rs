//! Bounded-concurrency execution of parallel blocks and DAG workflows.
//!
//! Worker tasks are spawned into a `JoinSet` and gated by a semaphore sized
//! to `max_concurrent`, plus an optional token-bucket rate limit. Cancellation
//! fans out through child `CancellationToken`s: the block failure modes and
//! the block timeout cancel the block token, and every dispatch derives from
//! it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dispatch::shell::sleep_until_deadline;
use crate::runner::rate_limit::RateLimiter;
use crate::runner::step::StepRunner;
use crate::workflow::graph::DependencyGraph;
use crate::workflow::observer::{ProgressEvent, ProgressObserver};
use crate::workflow::results::{BlockResult, StepResult, StepStatus};
use crate::workflow::schema::{BlockFailurePolicy, ParallelBlock, ParallelConfig, Step};
use crate::workflow::template::Scope;

/// Drives parallel blocks and DAG layers under bounded concurrency.
pub struct ParallelExecutor {
    runner: Arc<StepRunner>,
    observer: Arc<dyn ProgressObserver>,
    config: ParallelConfig,
    limiter: Option<Arc<RateLimiter>>,
}

impl ParallelExecutor {
    pub fn new(
        runner: Arc<StepRunner>,
        observer: Arc<dyn ProgressObserver>,
        config: ParallelConfig,
    ) -> Self {
        let limiter = config.rate_limit.map(|rate| Arc::new(RateLimiter::new(rate)));
        Self {
            runner,
            observer,
            config,
            limiter,
        }
    }

    /// Run a parallel block to completion.
    ///
    /// Children see the scope snapshot taken at block entry; siblings never
    /// observe each other's results. `step_results` comes back in declared
    /// order regardless of completion order.
    pub async fn run_block(
        &self,
        block: &ParallelBlock,
        position: usize,
        scope: &Scope,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> BlockResult {
        let name = block.display_name(position);
        let started_at = Utc::now();
        let start = Instant::now();

        self.observer
            .on_event(&ProgressEvent::BlockStarted { name: name.clone() });
        debug!(block = %name, children = block.steps.len(), "running parallel block");

        let block_deadline = earliest(deadline, block.timeout.map(|t| start + Duration::from_secs(t)));
        let block_token = cancel.child_token();
        // gate that rejects children which have not started dispatch yet
        let intake = CancellationToken::new();
        let max_concurrent = block.max_concurrent.unwrap_or(self.config.max_concurrent);
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let snapshot = Arc::new(scope.clone());

        let mut join_set: JoinSet<(usize, StepResult)> = JoinSet::new();
        for (index, step) in block.steps.iter().enumerate() {
            let worker = BoundedStep {
                step: step.clone(),
                runner: self.runner.clone(),
                scope: snapshot.clone(),
                observer: self.observer.clone(),
                limiter: self.limiter.clone(),
                semaphore: semaphore.clone(),
                cancel: block_token.clone(),
                intake: Some(intake.clone()),
                deadline: block_deadline,
                on_failure: FailureFanout::Block(block.on_failure),
            };
            join_set.spawn(async move { (index, worker.run().await) });
        }

        let mut slots: Vec<Option<StepResult>> = block.steps.iter().map(|_| None).collect();
        let mut failed_before_timeout = false;
        let mut timed_out = false;

        let block_timer = sleep_until_deadline(block_deadline);
        tokio::pin!(block_timer);

        loop {
            tokio::select! {
                next = join_set.join_next() => {
                    let Some(next) = next else { break };
                    match next {
                        Ok((index, result)) => {
                            // the worker already fanned the failure out; here
                            // only the block status bookkeeping remains
                            if result.status.is_failure() && !result.continue_on_failure {
                                // a failure at or past the block deadline belongs
                                // to the timeout, not to the block
                                let deadline_passed =
                                    block_deadline.is_some_and(|d| Instant::now() >= d);
                                if !timed_out && !deadline_passed {
                                    failed_before_timeout = true;
                                }
                            }
                            self.observer.on_event(&ProgressEvent::StepCompleted {
                                name: result.name.clone(),
                                status: result.status,
                                duration_seconds: result.duration_seconds,
                            });
                            slots[index] = Some(result);
                        }
                        Err(join_err) => {
                            warn!(block = %name, error = %join_err, "block worker panicked");
                        }
                    }
                }
                _ = &mut block_timer, if !timed_out => {
                    debug!(block = %name, "block timeout elapsed, cancelling children");
                    timed_out = true;
                    block_token.cancel();
                }
            }
        }

        let step_results: Vec<StepResult> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    StepResult::failed(
                        &block.steps[index].name,
                        "worker task panicked".to_string(),
                        String::new(),
                        String::new(),
                        None,
                    )
                })
            })
            .collect();

        // a failure observed before the timeout keeps the block failed;
        // otherwise the timeout wins
        let status = if timed_out && !failed_before_timeout {
            StepStatus::TimedOut
        } else {
            BlockResult::derive_status(&step_results, false)
        };

        let result = BlockResult {
            name: name.clone(),
            status,
            step_results,
            started_at,
            completed_at: Utc::now(),
            duration_seconds: start.elapsed().as_secs_f64(),
        };

        self.observer.on_event(&ProgressEvent::BlockCompleted {
            name,
            status: result.status,
            succeeded: result.succeeded_count(),
            failed: result.failed_count(),
            skipped: result.skipped_count(),
        });

        result
    }

    /// Run a DAG workflow: release each step the moment every predecessor is
    /// terminal, bounded by the global concurrency and rate limits.
    ///
    /// Results are recorded into `scope` as steps complete, so a step's
    /// rendered templates observe all of its predecessors. Descendants of an
    /// unsatisfied predecessor are recorded `cancelled` without dispatching.
    pub async fn run_dag(
        &self,
        steps: &[Step],
        graph: &DependencyGraph,
        scope: &mut Scope,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> HashMap<String, StepResult> {
        let steps_by_name: HashMap<String, Step> = steps
            .iter()
            .map(|s| (s.name.clone(), s.clone()))
            .collect();

        let dag_token = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let total = graph.len();

        let mut results: HashMap<String, StepResult> = HashMap::new();
        let mut terminal: HashSet<String> = HashSet::new();
        let mut satisfied: HashSet<String> = HashSet::new();
        let mut scheduled: HashSet<String> = HashSet::new();
        let mut halted = false;
        let mut join_set: JoinSet<StepResult> = JoinSet::new();

        while terminal.len() < total {
            // release phase: repeat until no step changes state, because a
            // cancelled step can make further steps ready in the same pass
            loop {
                let mut progressed = false;
                for name in graph.ready(&terminal) {
                    if scheduled.contains(&name) {
                        continue;
                    }
                    scheduled.insert(name.clone());
                    progressed = true;

                    let step = steps_by_name
                        .get(&name)
                        .expect("graph built from these steps")
                        .clone();
                    let preds_satisfied =
                        step.depends_on.iter().all(|d| satisfied.contains(d));

                    if halted || dag_token.is_cancelled() || !preds_satisfied {
                        let result = StepResult::cancelled(&name);
                        self.record_dag_result(scope, &mut terminal, &mut satisfied, &mut results, result);
                        continue;
                    }

                    let worker = BoundedStep {
                        step,
                        runner: self.runner.clone(),
                        scope: Arc::new(scope.clone()),
                        observer: self.observer.clone(),
                        limiter: self.limiter.clone(),
                        semaphore: semaphore.clone(),
                        cancel: dag_token.clone(),
                        intake: None,
                        deadline,
                        on_failure: FailureFanout::Dag {
                            fail_fast: self.config.fail_fast,
                        },
                    };
                    join_set.spawn(worker.run());
                }
                if !progressed {
                    break;
                }
            }

            if terminal.len() >= total {
                break;
            }

            match join_set.join_next().await {
                Some(Ok(result)) => {
                    if result.status.is_failure()
                        && !result.continue_on_failure
                        && self.config.fail_fast
                        && !halted
                    {
                        debug!(step = %result.name, "step failed, halting DAG release");
                        halted = true;
                        dag_token.cancel();
                    }
                    self.record_dag_result(scope, &mut terminal, &mut satisfied, &mut results, result);
                }
                Some(Err(join_err)) => {
                    warn!(error = %join_err, "DAG worker panicked");
                }
                None => {
                    // no tasks in flight and nothing newly terminal: every
                    // remaining step must have panicked out of the join set
                    for name in graph.steps() {
                        if !terminal.contains(name) {
                            let result = StepResult::failed(
                                name,
                                "worker task panicked".to_string(),
                                String::new(),
                                String::new(),
                                None,
                            );
                            self.record_dag_result(
                                scope,
                                &mut terminal,
                                &mut satisfied,
                                &mut results,
                                result,
                            );
                        }
                    }
                }
            }
        }

        results
    }

    fn record_dag_result(
        &self,
        scope: &mut Scope,
        terminal: &mut HashSet<String>,
        satisfied: &mut HashSet<String>,
        results: &mut HashMap<String, StepResult>,
        result: StepResult,
    ) {
        let name = result.name.clone();

        // scope write happens before dependents are released
        scope.record_result(
            &name,
            &result.stdout,
            &result.stderr,
            result.exit_code,
            &result.status.to_string(),
        );

        let absorbed = result.status.is_failure() && result.continue_on_failure;
        if result.success() || absorbed {
            satisfied.insert(name.clone());
        }

        self.observer.on_event(&ProgressEvent::StepCompleted {
            name: name.clone(),
            status: result.status,
            duration_seconds: result.duration_seconds,
        });

        terminal.insert(name.clone());
        results.insert(name, result);
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// How a worker propagates an unabsorbed failure to its siblings.
#[derive(Debug, Clone, Copy)]
enum FailureFanout {
    Block(BlockFailurePolicy),
    Dag { fail_fast: bool },
}

/// One step bounded by the block's semaphore, rate limit, and tokens.
struct BoundedStep {
    step: Step,
    runner: Arc<StepRunner>,
    scope: Arc<Scope>,
    observer: Arc<dyn ProgressObserver>,
    limiter: Option<Arc<RateLimiter>>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    /// Gate closed by `complete_running`: children past it keep running,
    /// children before it are rejected.
    intake: Option<CancellationToken>,
    deadline: Option<Instant>,
    on_failure: FailureFanout,
}

impl BoundedStep {
    async fn run(self) -> StepResult {
        let name = self.step.name.clone();

        let permit = tokio::select! {
            _ = self.cancel.cancelled() => return StepResult::cancelled(&name),
            _ = gate_closed(&self.intake) => return StepResult::cancelled(&name),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.expect("semaphore is never closed")
            }
        };

        // the gate may have closed while waiting on the semaphore
        if self.cancel.is_cancelled()
            || self.intake.as_ref().is_some_and(|g| g.is_cancelled())
        {
            return StepResult::cancelled(&name);
        }

        if let Some(limiter) = &self.limiter {
            let acquired = tokio::select! {
                _ = self.cancel.cancelled() => return StepResult::cancelled(&name),
                _ = gate_closed(&self.intake) => return StepResult::cancelled(&name),
                acquired = limiter.acquire(self.deadline) => acquired,
            };
            if acquired.is_err() {
                return StepResult::timed_out(&name);
            }
        }

        self.observer
            .on_event(&ProgressEvent::StepStarted { name: name.clone() });

        let result = self
            .runner
            .run(&self.step, &self.scope, &self.cancel, self.deadline)
            .await;

        // fan the failure out before the permit frees a waiting sibling, so
        // no new dispatch can slip past the failure mode
        if result.status.is_failure() && !result.continue_on_failure {
            match self.on_failure {
                FailureFanout::Block(BlockFailurePolicy::FailAll) => self.cancel.cancel(),
                FailureFanout::Block(BlockFailurePolicy::CompleteRunning) => {
                    if let Some(intake) = &self.intake {
                        intake.cancel();
                    }
                }
                FailureFanout::Block(BlockFailurePolicy::Continue) => {}
                FailureFanout::Dag { fail_fast: true } => self.cancel.cancel(),
                FailureFanout::Dag { fail_fast: false } => {}
            }
        }

        drop(permit);
        result
    }
}

async fn gate_closed(gate: &Option<CancellationToken>) {
    match gate {
        Some(gate) => gate.cancelled().await,
        None => std::future::pending().await,
    }
}
