//! Notifications published to dispatcher observers.

use std::fmt;

/// Where a diagnostic came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSource {
    /// Raw bytes from the worker's stderr.
    Stderr,
    /// A stdout line that did not decode as a response.
    Parser,
}

/// Unstructured output from the worker that is not a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub source: DiagnosticSource,
    /// The raw text, lossily decoded as UTF-8.
    pub data: String,
    /// Decoder message for parser diagnostics.
    pub reason: Option<String>,
}

impl Diagnostic {
    pub fn stderr(bytes: &[u8]) -> Self {
        Self {
            source: DiagnosticSource::Stderr,
            data: String::from_utf8_lossy(bytes).into_owned(),
            reason: None,
        }
    }

    pub fn parser(line: impl Into<String>, err: &serde_json::Error) -> Self {
        Self {
            source: DiagnosticSource::Parser,
            data: line.into(),
            reason: Some(err.to_string()),
        }
    }

    pub fn is_parser(&self) -> bool {
        self.source == DiagnosticSource::Parser
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.source, &self.reason) {
            (DiagnosticSource::Parser, Some(reason)) => {
                write!(f, "undecodable worker output ({reason}): {}", self.data)
            }
            _ => write!(f, "{}", self.data),
        }
    }
}

/// Events observers can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Diagnostic(Diagnostic),
    /// The worker process exited. Emitted once per session.
    Closed { exit_code: Option<i32> },
}
