//! # workerlink
//!
//! Drive a long-lived worker process as a request/response engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              Host code (execute / close)                 │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [worker::Dispatcher]
//! ┌─────────────────────────────────────────────────────────┐
//! │        CommandPool (admission, queue, timeouts)          │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [worker::protocol]
//! ┌─────────────────────────────────────────────────────────┐
//! │          NDJSON frames over the worker's stdio           │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [serve]
//! ┌─────────────────────────────────────────────────────────┐
//! │               Worker program (any language)              │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Settings for the worker launch and the pool limits live in [`config`].

pub mod config;
pub mod serve;
pub mod worker;

pub use config::{Settings, SettingsError};
pub use worker::{
    CommandOptions, CommandOutcome, Diagnostic, DiagnosticSource, Dispatcher, PoolConfig,
    WorkerError, WorkerEvent, WorkerLauncher, WorkerResult,
};
