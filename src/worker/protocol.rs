//! Wire protocol spoken with the worker process.
//!
//! One JSON object per `\n`-terminated UTF-8 line in each direction:
//!
//! ```text
//! host   -> worker   {"id":3,"cmd":{"text":"hi"},"signal":-1}
//! worker -> host     {"id":3,"data":{"text":"hi"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier correlating a command with its response.
pub type CommandId = u64;

// ============================================================================
// Signals
// ============================================================================

/// In-band instruction carried next to (or instead of) a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum Signal {
    /// Ordinary command, handled by the worker's processor.
    None,
    /// Ask the worker to stop reading commands and exit.
    Termination,
}

impl Signal {
    /// Integer used on the wire.
    pub const fn code(self) -> i8 {
        match self {
            Signal::None => -1,
            Signal::Termination => 1,
        }
    }
}

impl From<Signal> for i8 {
    fn from(signal: Signal) -> Self {
        signal.code()
    }
}

impl TryFrom<i8> for Signal {
    type Error = String;

    fn try_from(code: i8) -> Result<Self, Self::Error> {
        match code {
            -1 => Ok(Signal::None),
            1 => Ok(Signal::Termination),
            other => Err(format!("unknown signal code {other}")),
        }
    }
}

// ============================================================================
// Envelopes
// ============================================================================

/// Command frame written to the worker's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Command ID for correlation.
    pub id: CommandId,
    /// Application payload; `null` for signal-only frames.
    pub cmd: Value,
    /// In-band signal.
    pub signal: Signal,
}

impl RequestEnvelope {
    /// Encode as a single newline-terminated line.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Response frame read from the worker's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// ID of the command this response answers.
    pub id: CommandId,
    /// Application payload.
    #[serde(default)]
    pub data: Value,
}

impl ResponseEnvelope {
    /// Decode one output line.
    ///
    /// Only malformed JSON is an error. Well-formed JSON without an unsigned
    /// integer `id` answers no command and yields `None`.
    pub fn decode(line: &str) -> serde_json::Result<Option<Self>> {
        let mut value: Value = serde_json::from_str(line)?;
        let Some(id) = value.get("id").and_then(Value::as_u64) else {
            return Ok(None);
        };
        let data = value.get_mut("data").map(Value::take).unwrap_or_default();
        Ok(Some(Self { id, data }))
    }

    /// Encode as a single newline-terminated line.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
