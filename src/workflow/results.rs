//! Workflow execution result types.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Terminal status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step completed successfully.
    Succeeded,
    /// Step failed (non-zero exit, dispatch error, or render error).
    Failed,
    /// Step was skipped (condition rendered false).
    Skipped,
    /// Step was cancelled before or during execution.
    Cancelled,
    /// Step exceeded its effective deadline.
    TimedOut,
}

impl StepStatus {
    /// Whether this status counts as a failure for block aggregation.
    pub fn is_failure(&self) -> bool {
        matches!(self, StepStatus::Failed | StepStatus::TimedOut)
    }

    /// Get a display character for this status.
    pub fn display_char(&self) -> char {
        match self {
            StepStatus::Succeeded => '✓',
            StepStatus::Failed => '✗',
            StepStatus::Skipped => '⊘',
            StepStatus::Cancelled => '⊖',
            StepStatus::TimedOut => '⏱',
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
            StepStatus::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

/// Result of executing a single step.
///
/// Emitted exactly once per step per run; retries are folded into
/// [`attempts`](Self::attempts).
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// Step name.
    pub name: String,
    /// Terminal status.
    pub status: StepStatus,
    /// Wall-clock start time.
    pub started_at: DateTime<Utc>,
    /// Wall-clock completion time.
    pub completed_at: DateTime<Utc>,
    /// Execution duration in seconds.
    pub duration_seconds: f64,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit code; absent for steps that never reached a process exit.
    pub exit_code: Option<i32>,
    /// Error message; present iff the step did not succeed.
    pub error_message: Option<String>,
    /// 1 + number of retries performed.
    pub attempts: u32,
    /// Whether the engine ran in preview mode.
    pub dry_run: bool,
    /// Tells the executor to proceed past a failure (`on_failure: continue`).
    #[serde(skip)]
    pub continue_on_failure: bool,
}

impl StepResult {
    fn base(name: &str, status: StepStatus) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            status,
            started_at: now,
            completed_at: now,
            duration_seconds: 0.0,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            error_message: None,
            attempts: 1,
            dry_run: false,
            continue_on_failure: false,
        }
    }

    /// Create a success result.
    pub fn succeeded(name: &str, stdout: String, stderr: String, exit_code: Option<i32>) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
            ..Self::base(name, StepStatus::Succeeded)
        }
    }

    /// Create a failure result.
    pub fn failed(
        name: &str,
        error: String,
        stdout: String,
        stderr: String,
        exit_code: Option<i32>,
    ) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
            error_message: Some(error),
            ..Self::base(name, StepStatus::Failed)
        }
    }

    /// Create a skipped result (condition rendered false).
    pub fn skipped(name: &str) -> Self {
        Self {
            error_message: Some("condition not met".to_string()),
            ..Self::base(name, StepStatus::Skipped)
        }
    }

    /// Create a cancelled result.
    pub fn cancelled(name: &str) -> Self {
        Self {
            error_message: Some("execution cancelled".to_string()),
            ..Self::base(name, StepStatus::Cancelled)
        }
    }

    /// Create a timed-out result.
    pub fn timed_out(name: &str) -> Self {
        Self {
            error_message: Some("exceeded deadline".to_string()),
            ..Self::base(name, StepStatus::TimedOut)
        }
    }

    /// Whether the step reached a successful terminal status.
    ///
    /// Skipped steps count as success for halting decisions.
    pub fn success(&self) -> bool {
        matches!(self.status, StepStatus::Succeeded | StepStatus::Skipped)
    }

    /// Generate a summary line for display.
    pub fn summary_line(&self) -> String {
        let status = self.status;
        let duration = format_duration_seconds(self.duration_seconds);

        match status {
            StepStatus::Succeeded => {
                format!("{} {} ({})", status.display_char(), self.name, duration)
            }
            StepStatus::Skipped => {
                format!("{} {} (condition not met)", status.display_char(), self.name)
            }
            _ => {
                let error = self.error_message.as_deref().unwrap_or("unknown error");
                format!("{} {} - {}", status.display_char(), self.name, error)
            }
        }
    }
}

/// Format a duration in seconds for display.
pub fn format_duration_seconds(seconds: f64) -> String {
    if seconds < 1.0 {
        format!("{:.0}ms", seconds * 1000.0)
    } else if seconds < 60.0 {
        format!("{seconds:.1}s")
    } else {
        let mins = (seconds / 60.0).floor() as u64;
        let secs = (seconds % 60.0).floor() as u64;
        format!("{mins}m {secs}s")
    }
}

/// Aggregated result of a parallel block.
#[derive(Debug, Clone, Serialize)]
pub struct BlockResult {
    /// Block name (assigned when the document omits one).
    pub name: String,
    /// Block-level status.
    pub status: StepStatus,
    /// Child results in declared order, one per child step.
    pub step_results: Vec<StepResult>,
    /// Wall-clock start time.
    pub started_at: DateTime<Utc>,
    /// Wall-clock completion time.
    pub completed_at: DateTime<Utc>,
    /// Block duration in seconds.
    pub duration_seconds: f64,
}

impl BlockResult {
    /// Find a child result by step name.
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|s| s.name == name)
    }

    /// Count of children that succeeded.
    pub fn succeeded_count(&self) -> usize {
        self.step_results
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .count()
    }

    /// Count of children that failed or timed out.
    pub fn failed_count(&self) -> usize {
        self.step_results
            .iter()
            .filter(|s| s.status.is_failure())
            .count()
    }

    /// Count of children that were skipped.
    pub fn skipped_count(&self) -> usize {
        self.step_results
            .iter()
            .filter(|s| s.status == StepStatus::Skipped)
            .count()
    }

    /// Count of children that were cancelled.
    pub fn cancelled_count(&self) -> usize {
        self.step_results
            .iter()
            .filter(|s| s.status == StepStatus::Cancelled)
            .count()
    }

    /// Block status derived from child statuses: succeeded iff every
    /// non-skipped child succeeded.
    pub fn derive_status(step_results: &[StepResult], timed_out: bool) -> StepStatus {
        if timed_out {
            return StepStatus::TimedOut;
        }
        let all_ok = step_results
            .iter()
            .all(|s| matches!(s.status, StepStatus::Succeeded | StepStatus::Skipped));
        if all_ok {
            StepStatus::Succeeded
        } else {
            StepStatus::Failed
        }
    }
}

/// Result of one top-level workflow entry.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EntryResult {
    Step(StepResult),
    Block(BlockResult),
}

impl EntryResult {
    /// Iterate over all step results in this entry.
    pub fn step_results(&self) -> impl Iterator<Item = &StepResult> {
        match self {
            EntryResult::Step(s) => std::slice::from_ref(s).iter(),
            EntryResult::Block(b) => b.step_results.iter(),
        }
    }
}

/// Aggregated result of a workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    /// Workflow name.
    pub name: String,
    /// Whether every non-skipped step succeeded.
    pub success: bool,
    /// Per-entry results in declared order.
    pub entries: Vec<EntryResult>,
    /// Total duration in seconds.
    pub duration_seconds: f64,
}

impl WorkflowResult {
    /// Iterate over every step result across all entries.
    pub fn step_results(&self) -> impl Iterator<Item = &StepResult> {
        self.entries.iter().flat_map(|e| e.step_results())
    }

    /// Find a step result by name.
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.step_results().find(|s| s.name == name)
    }

    /// Compute overall success from the collected entries.
    pub fn compute_success(entries: &[EntryResult]) -> bool {
        entries
            .iter()
            .flat_map(|e| e.step_results())
            .all(|s| matches!(s.status, StepStatus::Succeeded | StepStatus::Skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_matches_wire_names() {
        assert_eq!(StepStatus::Succeeded.to_string(), "succeeded");
        assert_eq!(StepStatus::TimedOut.to_string(), "timed_out");
        assert_eq!(StepStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn failure_statuses() {
        assert!(StepStatus::Failed.is_failure());
        assert!(StepStatus::TimedOut.is_failure());
        assert!(!StepStatus::Succeeded.is_failure());
        assert!(!StepStatus::Skipped.is_failure());
        assert!(!StepStatus::Cancelled.is_failure());
    }

    #[test]
    fn succeeded_result_has_no_error() {
        let result = StepResult::succeeded("a", "out".into(), String::new(), Some(0));
        assert_eq!(result.status, StepStatus::Succeeded);
        assert!(result.error_message.is_none());
        assert!(result.success());
    }

    #[test]
    fn failed_result_carries_error_message() {
        let result = StepResult::failed(
            "a",
            "exit code 2".into(),
            String::new(),
            "boom".into(),
            Some(2),
        );
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.error_message.as_deref(), Some("exit code 2"));
        assert!(!result.success());
    }

    #[test]
    fn skipped_counts_as_success() {
        assert!(StepResult::skipped("a").success());
    }

    #[test]
    fn cancelled_and_timed_out_carry_messages() {
        assert!(StepResult::cancelled("a").error_message.is_some());
        assert!(StepResult::timed_out("a").error_message.is_some());
    }

    #[test]
    fn summary_line_includes_status_char() {
        let result = StepResult::succeeded("deploy", String::new(), String::new(), Some(0));
        let line = result.summary_line();
        assert!(line.contains('✓'));
        assert!(line.contains("deploy"));
    }

    #[test]
    fn format_duration_ranges() {
        assert_eq!(format_duration_seconds(0.5), "500ms");
        assert_eq!(format_duration_seconds(5.04), "5.0s");
        assert_eq!(format_duration_seconds(65.0), "1m 5s");
    }

    #[test]
    fn block_counts() {
        let block = BlockResult {
            name: "fanout".into(),
            status: StepStatus::Failed,
            step_results: vec![
                StepResult::succeeded("a", String::new(), String::new(), Some(0)),
                StepResult::failed("b", "err".into(), String::new(), String::new(), Some(1)),
                StepResult::skipped("c"),
                StepResult::cancelled("d"),
                StepResult::timed_out("e"),
            ],
            started_at: Utc::now(),
            completed_at: Utc::now(),
            duration_seconds: 0.1,
        };

        assert_eq!(block.succeeded_count(), 1);
        assert_eq!(block.failed_count(), 2);
        assert_eq!(block.skipped_count(), 1);
        assert_eq!(block.cancelled_count(), 1);
    }

    #[test]
    fn derive_status_succeeds_when_only_skips_and_successes() {
        let results = vec![
            StepResult::succeeded("a", String::new(), String::new(), Some(0)),
            StepResult::skipped("b"),
        ];
        assert_eq!(
            BlockResult::derive_status(&results, false),
            StepStatus::Succeeded
        );
    }

    #[test]
    fn derive_status_fails_on_cancelled_child() {
        let results = vec![StepResult::cancelled("a")];
        assert_eq!(
            BlockResult::derive_status(&results, false),
            StepStatus::Failed
        );
    }

    #[test]
    fn derive_status_timeout_wins() {
        let results = vec![StepResult::failed(
            "a",
            "err".into(),
            String::new(),
            String::new(),
            None,
        )];
        assert_eq!(
            BlockResult::derive_status(&results, true),
            StepStatus::TimedOut
        );
    }

    #[test]
    fn workflow_success_ignores_skips() {
        let entries = vec![
            EntryResult::Step(StepResult::succeeded(
                "a",
                String::new(),
                String::new(),
                Some(0),
            )),
            EntryResult::Step(StepResult::skipped("b")),
        ];
        assert!(WorkflowResult::compute_success(&entries));
    }

    #[test]
    fn workflow_failure_on_any_failed_step() {
        let entries = vec![EntryResult::Step(StepResult::failed(
            "a",
            "err".into(),
            String::new(),
            String::new(),
            Some(1),
        ))];
        assert!(!WorkflowResult::compute_success(&entries));
    }
}
