//! Worker communication module.
//!
//! This module drives a long-lived worker process as a request/response
//! engine. The worker is an external program; commands and responses travel
//! as newline-delimited JSON over its stdin/stdout while stderr carries
//! free-form diagnostics.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Host (Rust + Tokio)                     │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                  Dispatcher (host facade)                 │  │
//! │  │  - execute / execute_with / execute_on_idle / close       │  │
//! │  │  - broadcasts diagnostics and the close notification     │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │ events                           │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │            Event loop (sole owner of CommandPool)          │  │
//! │  │  - admission control, FIFO queue, id correlation          │  │
//! │  │  - per-command timeouts, bulk termination                 │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                   │
//! │               stdin (NDJSON) │ stdout (NDJSON)   stderr (text)  │
//! │                              ▼                                   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                Worker (long-running child process)              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use workerlink::worker::{CommandOptions, Dispatcher, WorkerLauncher};
//!
//! let mut dispatcher = Dispatcher::new(WorkerLauncher::new("./echo-worker"));
//! dispatcher.init().await?;
//!
//! let outcome = dispatcher.execute(json!({"n": 1}), CommandOptions::new()).await?;
//! assert_eq!(outcome.data(), Some(&json!({"n": 1})));
//!
//! // Graceful: the worker receives the termination signal in-band.
//! dispatcher.close();
//! dispatcher.wait_closed().await;
//! ```

mod command;
mod dispatcher;
mod error;
mod notification;
mod pool;
mod process;
pub mod protocol;
mod queue;

pub use command::{CommandOptions, CommandOutcome, CommandState};
pub use dispatcher::Dispatcher;
pub use error::{WorkerError, WorkerResult};
pub use notification::{Diagnostic, DiagnosticSource, WorkerEvent};
pub use pool::{PoolConfig, DEFAULT_COMMAND_TIMEOUT, DEFAULT_MAX_COMMANDS_RUNNING, ID_WRAP_BOUND};
pub use process::{ChildProcess, WorkerLauncher, WorkerProcess, WorkerStdio};
pub use protocol::{CommandId, Signal};
pub use queue::Queue;
