//! Dispatch contracts between the engine and the outside world.
//!
//! The engine never talks to external services directly. Every step is handed
//! to one of two collaborators:
//!
//! - [`CommandDispatcher`] - executes an internal command path such as
//!   `aws s3 ls` with rendered params
//! - [`ShellRunner`] - executes a shell command line (steps whose command
//!   starts with `!`)
//!
//! Both must honor cancellation and deadlines promptly, and neither may touch
//! the [`Scope`](crate::workflow::Scope).

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub mod shell;
pub mod subprocess;

pub use shell::SystemShell;
pub use subprocess::SubprocessDispatcher;

/// A rendered step parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Rendered scalar, passed as `--key value`.
    Str(String),
    /// Flag; `true` becomes `--key`, `false` is omitted.
    Bool(bool),
    /// Repeated flag, one `--key value` pair per element.
    List(Vec<String>),
}

/// Rendered parameters in stable (sorted) order.
pub type RenderedParams = BTreeMap<String, ParamValue>;

/// Output of a dispatched command.
#[derive(Debug, Clone, Default)]
pub struct DispatchOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl DispatchOutput {
    /// Whether the dispatch succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes an internal command path with rendered params.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        command: &str,
        params: &RenderedParams,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<DispatchOutput>;
}

/// Executes a shell command line.
#[async_trait]
pub trait ShellRunner: Send + Sync {
    async fn run(
        &self,
        command_line: &str,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<DispatchOutput>;
}

/// Convert rendered params to command-line arguments.
///
/// Booleans become bare flags when true and disappear when false; lists
/// repeat the flag per element.
pub fn params_to_args(params: &RenderedParams) -> Vec<String> {
    let mut args = Vec::new();
    for (key, value) in params {
        match value {
            ParamValue::Str(v) => {
                args.push(format!("--{key}"));
                args.push(v.clone());
            }
            ParamValue::Bool(true) => args.push(format!("--{key}")),
            ParamValue::Bool(false) => {}
            ParamValue::List(items) => {
                for item in items {
                    args.push(format!("--{key}"));
                    args.push(item.clone());
                }
            }
        }
    }
    args
}

/// Quote an argument for inclusion in a shell command line.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(entries: &[(&str, ParamValue)]) -> RenderedParams {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn success_requires_zero_exit() {
        assert!(DispatchOutput {
            exit_code: Some(0),
            ..Default::default()
        }
        .success());
        assert!(!DispatchOutput {
            exit_code: Some(1),
            ..Default::default()
        }
        .success());
        assert!(!DispatchOutput::default().success());
    }

    #[test]
    fn string_params_become_key_value_pairs() {
        let args = params_to_args(&params(&[("region", ParamValue::Str("us-east-1".into()))]));
        assert_eq!(args, vec!["--region", "us-east-1"]);
    }

    #[test]
    fn true_flag_is_bare() {
        let args = params_to_args(&params(&[("force", ParamValue::Bool(true))]));
        assert_eq!(args, vec!["--force"]);
    }

    #[test]
    fn false_flag_is_omitted() {
        let args = params_to_args(&params(&[("force", ParamValue::Bool(false))]));
        assert!(args.is_empty());
    }

    #[test]
    fn list_param_repeats_flag() {
        let args = params_to_args(&params(&[(
            "tag",
            ParamValue::List(vec!["a".into(), "b".into()]),
        )]));
        assert_eq!(args, vec!["--tag", "a", "--tag", "b"]);
    }

    #[test]
    fn params_emit_in_sorted_key_order() {
        let args = params_to_args(&params(&[
            ("zone", ParamValue::Str("z".into())),
            ("app", ParamValue::Str("a".into())),
        ]));
        assert_eq!(args, vec!["--app", "a", "--zone", "z"]);
    }

    #[test]
    fn shell_quote_passes_plain_words() {
        assert_eq!(shell_quote("plain-word_1.txt"), "plain-word_1.txt");
    }

    #[test]
    fn shell_quote_wraps_spaces_and_specials() {
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("a;b"), "'a;b'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
