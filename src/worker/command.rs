//! A single request/response unit and its terminal-state machine.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tokio::task::AbortHandle;

use super::protocol::{CommandId, RequestEnvelope, Signal};

/// One-shot receiver of a command's outcome.
pub type Responder = Box<dyn FnOnce(CommandOutcome) + Send + 'static>;

/// How a command ended. Exactly one is produced per started command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// The worker answered; carries its `data`.
    Completed(Value),
    /// No answer arrived within the command's timeout.
    TimedOut,
    /// The worker went away (or was shut down) while the command ran.
    Terminated,
}

impl CommandOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Response data, present only for completed commands.
    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Completed(data) => Some(data),
            _ => None,
        }
    }

    pub fn into_data(self) -> Option<Value> {
        match self {
            Self::Completed(data) => Some(data),
            _ => None,
        }
    }
}

/// Per-command options. Unset fields fall back to pool defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOptions {
    /// Time allowed between writing the command and its response.
    pub timeout: Option<Duration>,
}

impl CommandOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fractional seconds, e.g. `0.5`. Non-finite or negative values are ignored.
    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        self.timeout = Duration::try_from_secs_f64(secs).ok();
        self
    }
}

/// Lifecycle of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Created,
    Queued,
    Running,
    Completed,
    TimedOut,
    Terminated,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Terminated)
    }
}

/// A command tracked by the pool.
pub struct Command {
    id: CommandId,
    /// Unique for the pool's lifetime, unlike `id` which wraps.
    serial: u64,
    payload: Value,
    signal: Signal,
    timeout: Duration,
    state: CommandState,
    responder: Option<Responder>,
    timer: Option<AbortHandle>,
}

impl Command {
    pub(crate) fn new(
        id: CommandId,
        serial: u64,
        payload: Value,
        signal: Signal,
        responder: Option<Responder>,
    ) -> Self {
        Self {
            id,
            serial,
            payload,
            signal,
            timeout: Duration::ZERO,
            state: CommandState::Created,
            responder,
            timer: None,
        }
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Merge options over the pool default.
    pub(crate) fn set_options(&mut self, default_timeout: Duration, options: &CommandOptions) {
        self.timeout = options.timeout.unwrap_or(default_timeout);
    }

    pub(crate) fn mark_queued(&mut self) {
        if self.state == CommandState::Created {
            self.state = CommandState::Queued;
        }
    }

    /// Created/Queued -> Running. Returns the frame to write, or `None` if the
    /// command was already started or resolved.
    pub(crate) fn begin(&mut self) -> Option<RequestEnvelope> {
        match self.state {
            CommandState::Created | CommandState::Queued => {
                self.state = CommandState::Running;
                Some(RequestEnvelope {
                    id: self.id,
                    cmd: self.payload.clone(),
                    signal: self.signal,
                })
            }
            _ => None,
        }
    }

    /// Whether a timeout timer should guard this command.
    pub(crate) fn wants_timer(&self) -> bool {
        self.signal == Signal::None
    }

    pub(crate) fn arm_timer(&mut self, timer: AbortHandle) {
        self.timer = Some(timer);
    }

    /// Running -> terminal. Returns the responder together with the outcome it
    /// must receive; `None` when the command is not running (already resolved).
    pub(crate) fn resolve(
        &mut self,
        outcome: CommandOutcome,
    ) -> Option<(Responder, CommandOutcome)> {
        if self.state != CommandState::Running {
            return None;
        }

        self.state = match outcome {
            CommandOutcome::Completed(_) => CommandState::Completed,
            CommandOutcome::TimedOut => CommandState::TimedOut,
            CommandOutcome::Terminated => CommandState::Terminated,
        };

        // A fired timer has nothing left to cancel.
        if let Some(timer) = self.timer.take() {
            if !outcome.is_timeout() {
                timer.abort();
            }
        }

        self.responder.take().map(|responder| (responder, outcome))
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("serial", &self.serial)
            .field("signal", &self.signal)
            .field("timeout", &self.timeout)
            .field("state", &self.state)
            .field("has_responder", &self.responder.is_some())
            .finish()
    }
}
