//! Worker-specific error types.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::config::SettingsError;

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors that can occur during worker communication.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The worker program could not be found; nothing was spawned.
    #[error("worker program not found: {}", .0.display())]
    ProgramNotFound(PathBuf),

    /// The settings do not describe a usable worker.
    #[error("invalid worker configuration: {0}")]
    Config(#[from] SettingsError),

    /// Failed to spawn the worker process.
    #[error("failed to spawn worker process: {0}")]
    SpawnFailed(#[source] io::Error),

    /// A stdio pipe of the worker was not captured at spawn time.
    #[error("worker {0} was not captured")]
    MissingPipe(&'static str),

    /// Failed to write to worker stdin.
    #[error("failed to write to worker: {0}")]
    WriteFailed(#[source] io::Error),

    /// Failed to wait for the worker process to exit.
    #[error("failed to wait for worker: {0}")]
    WaitFailed(#[source] io::Error),

    /// Failed to deliver a kill signal to the worker process.
    #[error("failed to kill worker: {0}")]
    KillFailed(#[source] io::Error),

    /// Failed to serialize a command frame.
    #[error("failed to serialize command: {0}")]
    SerializeFailed(#[source] serde_json::Error),

    /// The dispatcher has not been initialized.
    #[error("dispatcher is not initialized")]
    NotInitialized,

    /// The dispatcher was initialized while a worker is still attached.
    #[error("dispatcher is already initialized")]
    AlreadyInitialized,

    /// The dispatcher is closing or closed and accepts no more commands.
    #[error("dispatcher is closed")]
    Closed,

    /// The command was dropped before it started (queue cleared on termination).
    #[error("command was discarded before it started")]
    Discarded,
}

impl WorkerError {
    /// Check if this error indicates the worker has gone away.
    pub fn is_worker_exited(&self) -> bool {
        matches!(self, Self::Closed | Self::Discarded)
    }

    /// Check if this error was raised while initializing the dispatcher.
    pub fn is_initialization(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::ProgramNotFound(_)
                | Self::SpawnFailed(_)
                | Self::MissingPipe(_)
        )
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for WorkerError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::Discarded
    }
}
