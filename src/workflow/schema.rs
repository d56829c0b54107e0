//! Workflow document schema and validation.
//!
//! This module contains the struct definitions that map to the workflow YAML
//! format, plus the validation pass that turns a parsed document into a
//! trusted [`Workflow`]. Validation collects every problem it finds rather
//! than stopping at the first one.
//!
//! ```yaml
//! name: deploy
//! vars: { environment: staging }
//! steps:
//!   - name: build
//!     command: "!make build"
//!   - name: push
//!     command: aws ecr push
//!     depends_on: [build]
//! ```

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{self, Result, ValidationError};
use crate::workflow::graph::DependencyGraph;
use crate::workflow::template;

/// Default dispatch timeout applied when a step declares none.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

fn default_max_concurrent() -> usize {
    10
}

fn default_true() -> bool {
    true
}

/// What to do when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFailurePolicy {
    /// Halt the sequence (or trigger the block's failure mode).
    #[default]
    Fail,
    /// Record the failure and proceed.
    Continue,
    /// Re-dispatch with exponential backoff, up to `retries` extra attempts.
    Retry,
}

/// What a parallel block does when a child fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockFailurePolicy {
    /// Cancel running children, reject unstarted children.
    #[default]
    FailAll,
    /// Run every child to completion regardless of failures.
    Continue,
    /// Stop starting new children; let running children finish.
    CompleteRunning,
}

/// A single dispatchable step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Step {
    /// Unique name; identity for `depends_on` and result lookup.
    pub name: String,
    /// Internal command path, or a shell form marked by a leading `!`.
    pub command: String,
    /// Templated parameters passed to the dispatcher.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, JsonValue>,
    /// Optional templated condition; the step is skipped when it renders false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Failure policy, default `fail`.
    pub on_failure: StepFailurePolicy,
    /// Extra attempts when `on_failure: retry`.
    pub retries: u32,
    /// Per-step timeout in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Names of steps that must reach a terminal status first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl Step {
    /// Whether the command routes to the shell runner.
    pub fn is_shell(&self) -> bool {
        self.command.starts_with('!')
    }
}

/// An explicit concurrent group of steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelBlock {
    /// Optional name for result attribution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Child steps; nested blocks are not representable.
    pub steps: Vec<Step>,
    /// Failure mode, default `fail_all`.
    pub on_failure: BlockFailurePolicy,
    /// Bound on the entire block, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Concurrency override for this block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
}

impl ParallelBlock {
    /// Name used for result attribution and events.
    pub fn display_name(&self, position: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("parallel block {position}"))
    }
}

/// Global parallel execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Maximum concurrently dispatched steps.
    pub max_concurrent: usize,
    /// Steps-per-second cap across a block, when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<f64>,
    /// Whether a DAG run stops releasing steps on the first failure.
    pub fail_fast: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            rate_limit: None,
            fail_fast: default_true(),
        }
    }
}

/// A top-level workflow entry: a step or a parallel block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepOrBlock {
    Block { parallel: ParallelBlock },
    Step(Step),
}

/// A workflow document. Immutable after validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Workflow {
    /// Workflow name.
    pub name: String,
    /// Free-text description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Default variables; caller-provided values win on merge.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, JsonValue>,
    /// Environment variables passed to every shell dispatch.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Global parallel configuration.
    pub parallel: ParallelConfig,
    /// Ordered entries.
    pub steps: Vec<StepOrBlock>,
}

impl Workflow {
    /// Parse and validate a workflow from YAML text.
    pub fn load_str(text: &str) -> Result<Self> {
        let workflow: Workflow = serde_yaml::from_str(text).map_err(|e| {
            crate::error::OpsctlError::WorkflowParseError {
                message: e.to_string(),
            }
        })?;
        error::into_result(workflow.validate())?;
        Ok(workflow)
    }

    /// Whether any top-level step declares `depends_on`.
    pub fn has_dependencies(&self) -> bool {
        self.steps.iter().any(|entry| match entry {
            StepOrBlock::Step(step) => !step.depends_on.is_empty(),
            StepOrBlock::Block { .. } => false,
        })
    }

    /// Top-level plain steps, in declaration order.
    pub fn top_level_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter_map(|entry| match entry {
            StepOrBlock::Step(step) => Some(step),
            StepOrBlock::Block { .. } => None,
        })
    }

    /// Build the dependency graph over the top-level steps.
    pub fn dependency_graph(&self) -> Result<DependencyGraph> {
        let mut builder = DependencyGraph::builder();
        for step in self.top_level_steps() {
            builder = builder.add_step(step.name.clone(), &step.depends_on);
        }
        builder.build()
    }

    /// Validate the document and return all problems found.
    ///
    /// Rules, applied in order: non-empty name and steps; unique names;
    /// retries meaningful only with `on_failure: retry`; positive timeouts;
    /// resolvable, acyclic, non-self `depends_on`; well-formed templates.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(ValidationError::new(
                "empty-name",
                "workflow name must not be empty",
            ));
        }
        if self.steps.is_empty() {
            errors.push(ValidationError::new(
                "no-steps",
                "workflow must declare at least one step",
            ));
        }

        if self.parallel.max_concurrent == 0 {
            errors.push(ValidationError::new(
                "bad-concurrency",
                "parallel.max_concurrent must be positive",
            ));
        }
        if let Some(rate) = self.parallel.rate_limit {
            if rate <= 0.0 {
                errors.push(ValidationError::new(
                    "bad-rate-limit",
                    "parallel.rate_limit must be positive",
                ));
            }
        }

        self.validate_unique_names(&mut errors);

        for (position, entry) in self.steps.iter().enumerate() {
            match entry {
                StepOrBlock::Step(step) => validate_step(step, false, &mut errors),
                StepOrBlock::Block { parallel } => {
                    validate_block(parallel, position + 1, &mut errors)
                }
            }
        }

        self.validate_dependencies(&mut errors);

        errors
    }

    fn validate_unique_names(&self, errors: &mut Vec<ValidationError>) {
        let mut names: Vec<&str> = Vec::new();
        for entry in &self.steps {
            match entry {
                StepOrBlock::Step(step) => names.push(&step.name),
                StepOrBlock::Block { parallel } => {
                    if let Some(name) = &parallel.name {
                        names.push(name);
                    }
                    for step in &parallel.steps {
                        names.push(&step.name);
                    }
                }
            }
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for name in names {
            if !name.is_empty() && !seen.insert(name) {
                errors.push(ValidationError::new(
                    "duplicate-name",
                    format!("duplicate step name '{name}'"),
                ));
            }
        }
    }

    fn validate_dependencies(&self, errors: &mut Vec<ValidationError>) {
        let declared: HashSet<&str> = self.top_level_steps().map(|s| s.name.as_str()).collect();
        let mut builder = DependencyGraph::builder();

        for step in self.top_level_steps() {
            let mut clean_deps = Vec::new();
            for dep in &step.depends_on {
                if dep == &step.name {
                    errors.push(ValidationError::for_step(
                        "self-dependency",
                        &step.name,
                        format!("step '{}' depends on itself", step.name),
                    ));
                } else if !declared.contains(dep.as_str()) {
                    errors.push(ValidationError::for_step(
                        "unknown-dependency",
                        &step.name,
                        format!("step '{}' depends on unknown step '{dep}'", step.name),
                    ));
                } else {
                    clean_deps.push(dep.clone());
                }
            }
            builder = builder.add_step(step.name.clone(), &clean_deps);
        }

        // Cleaned of unknown and self edges, so build only fails on a cycle.
        if let Err(e) = builder.build() {
            errors.push(ValidationError::new("circular-dependency", e.to_string()));
        }

        if self.has_dependencies() {
            let has_block = self
                .steps
                .iter()
                .any(|e| matches!(e, StepOrBlock::Block { .. }));
            if has_block {
                errors.push(ValidationError::new(
                    "block-in-dag",
                    "a workflow using depends_on cannot also declare parallel blocks",
                ));
            }
        }
    }
}

fn validate_step(step: &Step, in_block: bool, errors: &mut Vec<ValidationError>) {
    if step.name.trim().is_empty() {
        errors.push(ValidationError::new(
            "empty-step-name",
            "step name must not be empty",
        ));
        return;
    }

    if step.command.trim().is_empty() {
        errors.push(ValidationError::for_step(
            "missing-command",
            &step.name,
            format!("step '{}' has no command", step.name),
        ));
    }

    if step.retries > 0 && step.on_failure != StepFailurePolicy::Retry {
        errors.push(ValidationError::for_step(
            "retries-without-retry",
            &step.name,
            format!(
                "step '{}' sets retries but on_failure is not 'retry'",
                step.name
            ),
        ));
    }

    if step.timeout == Some(0) {
        errors.push(ValidationError::for_step(
            "bad-timeout",
            &step.name,
            format!("step '{}' timeout must be positive", step.name),
        ));
    }

    if in_block && !step.depends_on.is_empty() {
        errors.push(ValidationError::for_step(
            "depends-in-block",
            &step.name,
            format!(
                "step '{}' inside a parallel block cannot declare depends_on",
                step.name
            ),
        ));
    }

    validate_template(&step.command, &step.name, errors);
    if let Some(condition) = &step.condition {
        validate_template(condition, &step.name, errors);
    }
    for value in step.params.values() {
        validate_param_templates(value, &step.name, errors);
    }
}

fn validate_block(block: &ParallelBlock, position: usize, errors: &mut Vec<ValidationError>) {
    let name = block.display_name(position);

    if block.steps.is_empty() {
        errors.push(ValidationError::new(
            "empty-block",
            format!("{name} has no steps"),
        ));
    }

    if block.timeout == Some(0) {
        errors.push(ValidationError::new(
            "bad-timeout",
            format!("{name} timeout must be positive"),
        ));
    }

    if block.max_concurrent == Some(0) {
        errors.push(ValidationError::new(
            "bad-concurrency",
            format!("{name} max_concurrent must be positive"),
        ));
    }

    for step in &block.steps {
        validate_step(step, true, errors);
    }
}

fn validate_template(text: &str, step: &str, errors: &mut Vec<ValidationError>) {
    if let Err(e) = template::parse(text) {
        errors.push(ValidationError::for_step(
            "bad-template",
            step,
            format!("step '{step}': {e}"),
        ));
    }
}

fn validate_param_templates(value: &JsonValue, step: &str, errors: &mut Vec<ValidationError>) {
    match value {
        JsonValue::String(s) => validate_template(s, step, errors),
        JsonValue::Array(items) => {
            for item in items {
                validate_param_templates(item, step, errors);
            }
        }
        _ => {}
    }
}
