//! Purpose: Single error type for engine invocation, streaming decode, and CLI reporting.
//! Exports: `Error`, `ErrorKind`, `to_exit_code`.
//! Role: Every fallible operation in the crate returns this type.
//! Invariants: Kinds are stable; context (stderr, raw bytes, input) is additive.
//! Invariants: Raw units keep their full bytes; `Display` only renders a preview.
use std::error::Error as StdError;
use std::fmt;

const RAW_PREVIEW_BYTES: usize = 256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    Unreachable,
    Execution,
    Protocol,
    Timeout,
    Cancelled,
    Io,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    stderr: Option<String>,
    raw: Option<Vec<u8>>,
    exit_code: Option<i32>,
    input: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            stderr: None,
            raw: None,
            exit_code: None,
            input: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    /// Diagnostics the engine wrote to stderr before failing.
    pub fn stderr(&self) -> Option<&str> {
        self.stderr.as_deref()
    }

    /// The offending output unit (a JSON line or an Arrow IPC message).
    pub fn raw(&self) -> Option<&[u8]> {
        self.raw.as_deref()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// The caller input (query, observable) that led to the failure.
    pub fn input(&self) -> Option<&str> {
        self.input.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        let stderr = stderr.into();
        if !stderr.trim().is_empty() {
            self.stderr = Some(stderr);
        }
        self
    }

    pub fn with_raw(mut self, raw: impl Into<Vec<u8>>) -> Self {
        self.raw = Some(raw.into());
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Lossy, truncated rendering of the raw unit for logs and reports.
    pub fn raw_preview(&self) -> Option<String> {
        self.raw.as_deref().map(|raw| {
            let cut = raw.len().min(RAW_PREVIEW_BYTES);
            let mut preview = String::from_utf8_lossy(&raw[..cut]).into_owned();
            if raw.len() > cut {
                preview.push_str(&format!("... ({} bytes)", raw.len()));
            }
            preview
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(code) = self.exit_code {
            write!(f, " (exit code: {code})")?;
        }
        if let Some(input) = &self.input {
            write!(f, " (input: {input})")?;
        }
        if let Some(preview) = self.raw_preview() {
            write!(f, " (raw: {preview:?})")?;
        }
        if let Some(stderr) = &self.stderr {
            write!(f, " (stderr: {})", stderr.trim())?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::Unreachable => 3,
        ErrorKind::Execution => 4,
        ErrorKind::Protocol => 5,
        ErrorKind::Timeout => 6,
        ErrorKind::Cancelled => 7,
        ErrorKind::Io => 8,
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, to_exit_code};

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Usage, 2),
            (ErrorKind::Unreachable, 3),
            (ErrorKind::Execution, 4),
            (ErrorKind::Protocol, 5),
            (ErrorKind::Timeout, 6),
            (ErrorKind::Cancelled, 7),
            (ErrorKind::Io, 8),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn display_includes_context() {
        let err = Error::new(ErrorKind::Execution)
            .with_message("engine exited with failure")
            .with_exit_code(1)
            .with_stderr("failed to connect to node\n");
        let text = err.to_string();
        assert!(text.starts_with("Execution: engine exited with failure"));
        assert!(text.contains("exit code: 1"));
        assert!(text.contains("stderr: failed to connect to node"));
    }

    #[test]
    fn blank_stderr_is_dropped() {
        let err = Error::new(ErrorKind::Execution).with_stderr("  \n");
        assert!(err.stderr().is_none());
    }

    #[test]
    fn raw_preview_truncates_long_units() {
        let err = Error::new(ErrorKind::Protocol).with_raw(vec![b'x'; 1000]);
        let preview = err.raw_preview().expect("preview");
        assert!(preview.ends_with("... (1000 bytes)"));
        assert_eq!(err.raw().map(<[u8]>::len), Some(1000));
    }
}
