//! Template rendering for workflow values.
//!
//! Workflow commands, params, and conditions support `{{ expr }}` interpolation
//! with an optional filter pipeline:
//!
//! ```yaml
//! command: "aws s3 sync {{ vars.source }} s3://{{ vars.bucket | lower }}"
//! params:
//!   message: "{{ results['build'].stdout | trim }} done"
//! condition: "{{ vars.deploy | default('false') }}"
//! ```
//!
//! # Syntax
//!
//! - `{{ path }}` - variable lookup; `vars` and `results` are the reserved
//!   roots, a bare name resolves through `vars`
//! - `{{ path.field }}` / `{{ path['key'] }}` - dotted and index lookup
//! - `{{ 'literal' }}` / `{{ 42 }}` - string and number literals
//! - `{{ expr | filter | filter(arg) }}` - filter chaining
//!
//! The filter set is closed: `default(x)`, `trim`, `lower`, `upper`, and
//! `strftime` (the value is a format string rendered against the current
//! wall-clock time). Rendering is pure: it reads the [`Scope`] and produces a
//! string, nothing else.

use std::collections::BTreeMap;

use chrono::format::{Item, StrftimeItems};
use chrono::Local;
use serde_json::Value as JsonValue;

use crate::error::{OpsctlError, Result};

/// The evaluation environment for template rendering.
///
/// Holds the merged variable map under `vars` and completed step results
/// under `results`. Results are append-only during a run: once recorded, an
/// entry is never replaced.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: BTreeMap<String, JsonValue>,
    results: BTreeMap<String, JsonValue>,
}

impl Scope {
    /// Create a scope over the merged variable map.
    pub fn new(vars: BTreeMap<String, JsonValue>) -> Self {
        Self {
            vars,
            results: BTreeMap::new(),
        }
    }

    /// Record a completed step's template-visible fields.
    ///
    /// The first write for a name wins; results are immutable once visible.
    pub fn record_result(
        &mut self,
        name: &str,
        stdout: &str,
        stderr: &str,
        exit_code: Option<i32>,
        status: &str,
    ) {
        self.results
            .entry(name.to_string())
            .or_insert_with(|| {
                serde_json::json!({
                    "stdout": stdout,
                    "stderr": stderr,
                    "exit_code": exit_code,
                    "status": status,
                })
            });
    }

    /// Check whether a step result has been recorded.
    pub fn has_result(&self, name: &str) -> bool {
        self.results.contains_key(name)
    }

    /// Resolve a dotted path to a value.
    fn lookup(&self, path: &[String]) -> Resolved {
        let (root, rest): (&BTreeMap<String, JsonValue>, &[String]) = match path[0].as_str() {
            "vars" => (&self.vars, &path[1..]),
            "results" => (&self.results, &path[1..]),
            _ => (&self.vars, path),
        };

        let Some(first) = rest.first() else {
            return Resolved::Undefined;
        };
        let Some(mut value) = root.get(first) else {
            return Resolved::Undefined;
        };

        for key in &rest[1..] {
            match value.get(key) {
                Some(v) => value = v,
                None => return Resolved::Undefined,
            }
        }

        if value.is_null() {
            Resolved::Undefined
        } else {
            Resolved::Value(value.clone())
        }
    }
}

/// A value produced while evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
enum Resolved {
    /// Lookup missed (or hit an explicit null).
    Undefined,
    Value(JsonValue),
}

impl Resolved {
    fn into_display(self, source: &str) -> Result<String> {
        match self {
            Resolved::Undefined => Err(render_error(format!("undefined value: {source}"))),
            Resolved::Value(v) => Ok(display_value(&v)),
        }
    }
}

fn display_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

fn render_error(message: impl Into<String>) -> OpsctlError {
    OpsctlError::RenderError {
        message: message.into(),
    }
}

/// A parsed template, ready for repeated rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Expr(Pipeline),
}

#[derive(Debug, Clone, PartialEq)]
struct Pipeline {
    operand: Operand,
    filters: Vec<FilterCall>,
    /// Raw expression text, kept for error messages.
    source: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Path(Vec<String>),
    Literal(Literal),
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Str(String),
    Num(f64),
}

#[derive(Debug, Clone, PartialEq)]
struct FilterCall {
    name: String,
    args: Vec<Literal>,
}

impl Template {
    /// Check whether the template contains any expression.
    pub fn has_expressions(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Expr(_)))
    }
}

/// Parse a template without evaluating it.
///
/// Used by document validation to reject malformed expressions before any
/// step runs.
pub fn parse(input: &str) -> Result<Template> {
    let mut segments = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut pos = 0;
    let mut literal = String::new();

    while pos < chars.len() {
        if chars[pos] == '{' && pos + 1 < chars.len() && chars[pos + 1] == '{' {
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }

            let close = find_close(&chars, pos + 2)
                .ok_or_else(|| render_error(format!("unterminated expression in '{input}'")))?;
            let expr: String = chars[pos + 2..close].iter().collect();
            segments.push(Segment::Expr(parse_pipeline(&expr)?));
            pos = close + 2;
        } else {
            literal.push(chars[pos]);
            pos += 1;
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    Ok(Template { segments })
}

fn find_close(chars: &[char], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 1 < chars.len() {
        if chars[i] == '}' && chars[i + 1] == '}' {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Parser over a single `{{ ... }}` expression body.
struct ExprParser {
    chars: Vec<char>,
    pos: usize,
}

impl ExprParser {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos].is_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn expect(&mut self, wanted: char) -> Result<()> {
        match self.bump() {
            Some(c) if c == wanted => Ok(()),
            other => Err(render_error(format!(
                "expected '{wanted}', found {:?}",
                other.map(String::from).unwrap_or_else(|| "end".into())
            ))),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn parse_ident(&mut self) -> Result<String> {
        let mut ident = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                ident.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        if ident.is_empty() {
            Err(render_error("expected identifier"))
        } else {
            Ok(ident)
        }
    }

    fn parse_quoted(&mut self) -> Result<String> {
        let quote = self.bump().expect("caller checked quote");
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok(out),
                Some(c) => out.push(c),
                None => return Err(render_error("unterminated string literal")),
            }
        }
    }

    fn parse_number(&mut self) -> Result<f64> {
        let mut text = String::new();
        if self.peek() == Some('-') {
            text.push('-');
            self.pos += 1;
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '.' {
                text.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        text.parse::<f64>()
            .map_err(|_| render_error(format!("invalid number literal '{text}'")))
    }

    fn parse_literal(&mut self) -> Result<Literal> {
        match self.peek() {
            Some('\'') | Some('"') => Ok(Literal::Str(self.parse_quoted()?)),
            Some(c) if c.is_ascii_digit() || c == '-' => Ok(Literal::Num(self.parse_number()?)),
            other => Err(render_error(format!("expected literal, found {other:?}"))),
        }
    }

    fn parse_path(&mut self) -> Result<Vec<String>> {
        let mut path = vec![self.parse_ident()?];
        loop {
            match self.peek() {
                Some('.') => {
                    self.pos += 1;
                    path.push(self.parse_ident()?);
                }
                Some('[') => {
                    self.pos += 1;
                    self.skip_ws();
                    match self.peek() {
                        Some('\'') | Some('"') => path.push(self.parse_quoted()?),
                        _ => return Err(render_error("expected quoted key in index lookup")),
                    }
                    self.skip_ws();
                    self.expect(']')?;
                }
                _ => break,
            }
        }
        Ok(path)
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        match self.peek() {
            Some('\'') | Some('"') => Ok(Operand::Literal(Literal::Str(self.parse_quoted()?))),
            Some(c) if c.is_ascii_digit() || c == '-' => {
                Ok(Operand::Literal(Literal::Num(self.parse_number()?)))
            }
            Some(c) if c.is_alphanumeric() || c == '_' => Ok(Operand::Path(self.parse_path()?)),
            other => Err(render_error(format!("expected expression, found {other:?}"))),
        }
    }

    fn parse_filter(&mut self) -> Result<FilterCall> {
        let name = self.parse_ident()?;
        let mut args = Vec::new();

        self.skip_ws();
        if self.peek() == Some('(') {
            self.pos += 1;
            self.skip_ws();
            if self.peek() != Some(')') {
                loop {
                    args.push(self.parse_literal()?);
                    self.skip_ws();
                    match self.peek() {
                        Some(',') => {
                            self.pos += 1;
                            self.skip_ws();
                        }
                        _ => break,
                    }
                }
            }
            self.expect(')')?;
        }

        Ok(FilterCall { name, args })
    }
}

fn parse_pipeline(input: &str) -> Result<Pipeline> {
    let mut parser = ExprParser::new(input);

    parser.skip_ws();
    let operand = parser.parse_operand()?;

    let mut filters = Vec::new();
    loop {
        parser.skip_ws();
        match parser.peek() {
            Some('|') => {
                parser.pos += 1;
                parser.skip_ws();
                let filter = parser.parse_filter()?;
                validate_filter(&filter)?;
                filters.push(filter);
            }
            None => break,
            Some(c) => {
                return Err(render_error(format!(
                    "unexpected '{c}' in expression '{}'",
                    input.trim()
                )))
            }
        }
        if parser.at_end() {
            break;
        }
    }

    Ok(Pipeline {
        operand,
        filters,
        source: input.trim().to_string(),
    })
}

/// Reject unknown filters and bad arities at parse time.
///
/// The filter set is deliberately closed so documents stay auditable.
fn validate_filter(filter: &FilterCall) -> Result<()> {
    match (filter.name.as_str(), filter.args.len()) {
        ("default", 1) => Ok(()),
        ("default", n) => Err(render_error(format!(
            "filter 'default' takes one argument, got {n}"
        ))),
        ("trim" | "lower" | "upper" | "strftime", 0) => Ok(()),
        ("trim" | "lower" | "upper" | "strftime", _) => Err(render_error(format!(
            "filter '{}' takes no arguments",
            filter.name
        ))),
        (name, _) => Err(render_error(format!("unknown filter '{name}'"))),
    }
}

fn literal_value(literal: &Literal) -> JsonValue {
    match literal {
        Literal::Str(s) => JsonValue::String(s.clone()),
        Literal::Num(n) => serde_json::Number::from_f64(*n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
    }
}

fn eval_pipeline(pipeline: &Pipeline, scope: &Scope) -> Result<Resolved> {
    let mut value = match &pipeline.operand {
        Operand::Path(path) => scope.lookup(path),
        Operand::Literal(lit) => Resolved::Value(literal_value(lit)),
    };

    for filter in &pipeline.filters {
        value = apply_filter(filter, value)?;
    }

    Ok(value)
}

fn apply_filter(filter: &FilterCall, value: Resolved) -> Result<Resolved> {
    match filter.name.as_str() {
        "default" => {
            let empty = matches!(&value, Resolved::Value(JsonValue::String(s)) if s.is_empty());
            if value == Resolved::Undefined || empty {
                Ok(Resolved::Value(literal_value(&filter.args[0])))
            } else {
                Ok(value)
            }
        }
        "trim" => map_string(value, |s| s.trim().to_string()),
        "lower" => map_string(value, |s| s.to_lowercase()),
        "upper" => map_string(value, |s| s.to_uppercase()),
        "strftime" => strftime(value),
        name => Err(render_error(format!("unknown filter '{name}'"))),
    }
}

fn map_string(value: Resolved, f: impl Fn(&str) -> String) -> Result<Resolved> {
    match value {
        Resolved::Undefined => Ok(Resolved::Undefined),
        Resolved::Value(v) => Ok(Resolved::Value(JsonValue::String(f(&display_value(&v))))),
    }
}

/// Interpret the value as a strftime format string and render the current
/// wall-clock time.
fn strftime(value: Resolved) -> Result<Resolved> {
    let Resolved::Value(v) = value else {
        return Ok(Resolved::Undefined);
    };
    let format = display_value(&v);

    // chrono panics on bad format items at display time, so check first
    let items: Vec<Item> = StrftimeItems::new(&format).collect();
    if items.iter().any(|i| matches!(i, Item::Error)) {
        return Err(render_error(format!("invalid strftime format '{format}'")));
    }

    Ok(Resolved::Value(JsonValue::String(
        Local::now().format(&format).to_string(),
    )))
}

/// Render a template against the scope.
///
/// An undefined lookup that survives the filter pipeline is an error; use
/// `default(..)` for optional values.
pub fn render(template: &str, scope: &Scope) -> Result<String> {
    let parsed = parse(template)?;
    let mut out = String::new();

    for segment in &parsed.segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Expr(pipeline) => {
                let value = eval_pipeline(pipeline, scope)?;
                out.push_str(&value.into_display(&pipeline.source)?);
            }
        }
    }

    Ok(out)
}

/// Render a template and coerce the result to a boolean.
///
/// The rendered string, lower-cased and trimmed, is true for `true`, `1`,
/// `yes` and false for `false`, `0`, `no`, and the empty string. An undefined
/// lookup is false. Any other value is an error.
pub fn render_bool(template: &str, scope: &Scope) -> Result<bool> {
    let parsed = parse(template)?;
    let mut out = String::new();

    for segment in &parsed.segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Expr(pipeline) => match eval_pipeline(pipeline, scope)? {
                Resolved::Undefined => return Ok(false),
                Resolved::Value(v) => out.push_str(&display_value(&v)),
            },
        }
    }

    match out.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        other => Err(render_error(format!(
            "condition must render to a boolean, got '{other}'"
        ))),
    }
}
