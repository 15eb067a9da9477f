//! Purpose: Translate structured requests into engine command lines.
//! Exports: `Query`, `ExportMode`, `Encoding`, `ExportRequest`, `Invocation`,
//!          `CommandSyntax`, `TenzirCtl`, `DEFAULT_PROGRAM`.
//! Role: Query builder; the only place that knows engine flag spelling.
//! Invariants: Building an invocation is pure (no I/O, no process state).
//! Invariants: An empty query expression is sent by omitting the argument.
use crate::core::endpoint::Endpoint;
use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_PROGRAM: &str = "tenzir-ctl";

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Query {
    expression: String,
}

impl Query {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into().trim().to_string(),
        }
    }

    /// Matches every event the engine holds.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn is_match_all(&self) -> bool {
        self.expression.is_empty()
    }
}

impl From<&str> for Query {
    fn from(expression: &str) -> Self {
        Self::new(expression)
    }
}

impl From<String> for Query {
    fn from(expression: String) -> Self {
        Self::new(expression)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum ExportMode {
    /// Replay already ingested events, then finish.
    #[default]
    Historical,
    /// Subscribe to future matching events; never finishes on its own.
    Continuous,
    /// Historical replay followed by a continuous subscription.
    Unified,
}

impl ExportMode {
    pub fn is_finite(self) -> bool {
        matches!(self, ExportMode::Historical)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExportMode::Historical => "historical",
            ExportMode::Continuous => "continuous",
            ExportMode::Unified => "unified",
        }
    }
}

impl fmt::Display for ExportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum Encoding {
    /// One JSON object per line.
    #[default]
    Json,
    /// Arrow IPC stream format, one stream per schema run.
    Arrow,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Arrow => "arrow",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExportRequest {
    pub query: Query,
    pub mode: ExportMode,
    pub max_events: Option<u64>,
    pub encoding: Encoding,
}

impl ExportRequest {
    pub fn new(query: impl Into<Query>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn mode(mut self, mode: ExportMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn max_events(mut self, max_events: u64) -> Self {
        self.max_events = Some(max_events);
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }
}

/// A program plus its argument list, ready to spawn.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Invocation {
    program: PathBuf,
    args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `--name`, with underscores spelled as dashes.
    pub fn flag(mut self, name: &str) -> Self {
        self.args.push(format!("--{}", option_name(name)));
        self
    }

    /// `--name=value`, with underscores spelled as dashes.
    pub fn option(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.args.push(format!("--{}={value}", option_name(name)));
        self
    }

    fn expression(self, query: &Query) -> Self {
        if query.is_match_all() {
            self
        } else {
            self.arg(query.expression())
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) || arg.contains('"') {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

fn option_name(name: &str) -> String {
    name.replace('_', "-")
}

/// Maps requests onto one engine's command-line dialect.
pub trait CommandSyntax: fmt::Debug + Send + Sync {
    fn status(&self, endpoint: &Endpoint) -> Invocation;

    fn count(&self, endpoint: &Endpoint, query: &Query) -> Invocation;

    fn export(&self, endpoint: &Endpoint, request: &ExportRequest) -> Invocation;
}

/// The `tenzir-ctl` dialect.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TenzirCtl {
    program: PathBuf,
}

impl TenzirCtl {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn base(&self, endpoint: &Endpoint) -> Invocation {
        Invocation::new(&self.program).option("endpoint", endpoint)
    }
}

impl Default for TenzirCtl {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

impl CommandSyntax for TenzirCtl {
    fn status(&self, endpoint: &Endpoint) -> Invocation {
        self.base(endpoint).arg("status")
    }

    fn count(&self, endpoint: &Endpoint, query: &Query) -> Invocation {
        self.base(endpoint).arg("count").expression(query)
    }

    fn export(&self, endpoint: &Endpoint, request: &ExportRequest) -> Invocation {
        let mut invocation = self.base(endpoint).arg("export");
        invocation = match request.mode {
            ExportMode::Historical => invocation,
            ExportMode::Continuous => invocation.flag("continuous"),
            ExportMode::Unified => invocation.flag("unified"),
        };
        if let Some(max_events) = request.max_events {
            invocation = invocation.option("max_events", max_events);
        }
        invocation
            .arg(request.encoding.as_str())
            .expression(&request.query)
    }
}
