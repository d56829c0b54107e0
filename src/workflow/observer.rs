//! Progress events emitted during workflow execution.

use crate::workflow::results::StepStatus;

/// An observable event on the progress stream.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A workflow run began.
    WorkflowStarted { name: String },
    /// A step was released for execution.
    StepStarted { name: String },
    /// A step reached a terminal status.
    StepCompleted {
        name: String,
        status: StepStatus,
        duration_seconds: f64,
    },
    /// A parallel block began.
    BlockStarted { name: String },
    /// A parallel block finished.
    BlockCompleted {
        name: String,
        status: StepStatus,
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
    /// The workflow run finished.
    WorkflowCompleted { success: bool },
}

/// Receiver for progress events.
///
/// Events may be delivered from concurrent tasks; implementations must be
/// safe to call from multiple threads. The observer is injected into the
/// engine and may be a no-op.
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Observer that discards all events.
#[derive(Debug, Default)]
pub struct NullObserver;

impl ProgressObserver for NullObserver {
    fn on_event(&self, _event: &ProgressEvent) {}
}

/// Observer that forwards events to tracing at debug level.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::WorkflowStarted { name } => {
                tracing::debug!(workflow = %name, "workflow started");
            }
            ProgressEvent::StepStarted { name } => {
                tracing::debug!(step = %name, "step started");
            }
            ProgressEvent::StepCompleted {
                name,
                status,
                duration_seconds,
            } => {
                tracing::debug!(step = %name, %status, duration_seconds, "step completed");
            }
            ProgressEvent::BlockStarted { name } => {
                tracing::debug!(block = %name, "block started");
            }
            ProgressEvent::BlockCompleted {
                name,
                status,
                succeeded,
                failed,
                skipped,
            } => {
                tracing::debug!(
                    block = %name, %status, succeeded, failed, skipped,
                    "block completed"
                );
            }
            ProgressEvent::WorkflowCompleted { success } => {
                tracing::debug!(success, "workflow completed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Observer that records event names, used across the test suite.
    #[derive(Debug, Default)]
    pub struct RecordingObserver {
        pub events: Mutex<Vec<String>>,
    }

    impl ProgressObserver for RecordingObserver {
        fn on_event(&self, event: &ProgressEvent) {
            let label = match event {
                ProgressEvent::WorkflowStarted { name } => format!("workflow_started:{name}"),
                ProgressEvent::StepStarted { name } => format!("step_started:{name}"),
                ProgressEvent::StepCompleted { name, status, .. } => {
                    format!("step_completed:{name}:{status}")
                }
                ProgressEvent::BlockStarted { name } => format!("block_started:{name}"),
                ProgressEvent::BlockCompleted { name, status, .. } => {
                    format!("block_completed:{name}:{status}")
                }
                ProgressEvent::WorkflowCompleted { success } => {
                    format!("workflow_completed:{success}")
                }
            };
            self.events.lock().unwrap().push(label);
        }
    }

    #[test]
    fn null_observer_accepts_events() {
        let observer = NullObserver;
        observer.on_event(&ProgressEvent::WorkflowStarted {
            name: "deploy".into(),
        });
    }

    #[test]
    fn recording_observer_captures_labels() {
        let observer = RecordingObserver::default();
        observer.on_event(&ProgressEvent::StepStarted {
            name: "build".into(),
        });
        observer.on_event(&ProgressEvent::StepCompleted {
            name: "build".into(),
            status: StepStatus::Succeeded,
            duration_seconds: 0.2,
        });

        let events = observer.events.lock().unwrap();
        assert_eq!(
            *events,
            vec!["step_started:build", "step_completed:build:succeeded"]
        );
    }
}
