//! Terminal output for workflow runs.

use console::style;

use crate::workflow::observer::{ProgressEvent, ProgressObserver};
use crate::workflow::results::{format_duration_seconds, StepStatus, WorkflowResult};

/// Observer that prints progress lines to stdout as the run advances.
#[derive(Debug, Default)]
pub struct ConsoleObserver {
    quiet: bool,
}

impl ConsoleObserver {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl ProgressObserver for ConsoleObserver {
    fn on_event(&self, event: &ProgressEvent) {
        if self.quiet {
            return;
        }
        match event {
            ProgressEvent::WorkflowStarted { name } => {
                println!("{} {}", style("Running workflow:").bold(), name);
            }
            ProgressEvent::StepStarted { name } => {
                println!("  {} {}", style("→").dim(), name);
            }
            ProgressEvent::StepCompleted {
                name,
                status,
                duration_seconds,
            } => {
                let line = format!(
                    "  {} {} ({})",
                    status.display_char(),
                    name,
                    format_duration_seconds(*duration_seconds)
                );
                match status {
                    StepStatus::Succeeded => println!("{}", style(line).green()),
                    StepStatus::Skipped => println!("{}", style(line).dim()),
                    _ => println!("{}", style(line).red()),
                }
            }
            ProgressEvent::BlockStarted { name } => {
                println!("{} {}", style("Parallel:").bold(), name);
            }
            ProgressEvent::BlockCompleted {
                name,
                status,
                succeeded,
                failed,
                skipped,
            } => {
                println!(
                    "{}",
                    style(format!(
                        "  {name}: {succeeded} succeeded, {failed} failed, {skipped} skipped ({status})"
                    ))
                    .dim()
                );
            }
            ProgressEvent::WorkflowCompleted { success } => {
                if *success {
                    println!("{}", style("Workflow completed successfully").green().bold());
                } else {
                    println!("{}", style("Workflow failed").red().bold());
                }
            }
        }
    }
}

/// Render the final per-step summary plus a counts line.
///
/// Columns are padded to the widest step name so statuses line up:
///
/// ```text
/// Step     Status     Duration  Attempts
/// build    succeeded      1.2s         1
/// deploy   failed       450ms          3
///
/// 1 succeeded, 1 failed, 0 skipped, 0 cancelled in 2.5s
/// ```
pub fn render_summary(result: &WorkflowResult) -> String {
    let name_width = result
        .step_results()
        .map(|s| s.name.chars().count())
        .chain(std::iter::once("Step".len()))
        .max()
        .unwrap_or(4);

    let mut lines = vec![format!(
        "{:<name_width$}  {:<10}  {:>8}  {:>8}",
        "Step", "Status", "Duration", "Attempts"
    )];

    let mut succeeded = 0;
    let mut failed = 0;
    let mut skipped = 0;
    let mut cancelled = 0;

    for step in result.step_results() {
        lines.push(format!(
            "{:<name_width$}  {:<10}  {:>8}  {:>8}",
            step.name,
            step.status.to_string(),
            format_duration_seconds(step.duration_seconds),
            step.attempts,
        ));
        match step.status {
            StepStatus::Succeeded => succeeded += 1,
            StepStatus::Skipped => skipped += 1,
            StepStatus::Cancelled => cancelled += 1,
            StepStatus::Failed | StepStatus::TimedOut => failed += 1,
        }
    }

    lines.push(String::new());
    lines.push(format!(
        "{succeeded} succeeded, {failed} failed, {skipped} skipped, {cancelled} cancelled in {}",
        format_duration_seconds(result.duration_seconds)
    ));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::results::{EntryResult, StepResult};

    fn sample_result() -> WorkflowResult {
        WorkflowResult {
            name: "sample".into(),
            success: false,
            entries: vec![
                EntryResult::Step(StepResult::succeeded(
                    "build",
                    String::new(),
                    String::new(),
                    Some(0),
                )),
                EntryResult::Step(StepResult::failed(
                    "deploy-to-staging",
                    "denied".into(),
                    String::new(),
                    String::new(),
                    Some(1),
                )),
                EntryResult::Step(StepResult::skipped("notify")),
            ],
            duration_seconds: 2.5,
        }
    }

    #[test]
    fn summary_lists_every_step() {
        let summary = render_summary(&sample_result());
        assert!(summary.contains("build"));
        assert!(summary.contains("deploy-to-staging"));
        assert!(summary.contains("notify"));
    }

    #[test]
    fn summary_counts_line() {
        let summary = render_summary(&sample_result());
        assert!(summary.contains("1 succeeded, 1 failed, 1 skipped, 0 cancelled"));
    }

    #[test]
    fn summary_columns_align_on_longest_name() {
        let summary = render_summary(&sample_result());
        let lines: Vec<&str> = summary.lines().collect();

        // status column starts at the same offset on every populated row
        let offset = lines[0].find("Status").unwrap();
        assert_eq!(&lines[1][offset..offset + 9], "succeeded");
        assert_eq!(&lines[2][offset..offset + 6], "failed");
    }

    #[test]
    fn summary_of_empty_result_still_renders() {
        let result = WorkflowResult {
            name: "empty".into(),
            success: true,
            entries: Vec::new(),
            duration_seconds: 0.0,
        };
        let summary = render_summary(&result);
        assert!(summary.contains("0 succeeded"));
    }
}
