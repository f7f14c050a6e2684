//! Reference worker: answers every command with its own payload.
//!
//! Object payloads may steer it:
//!
//! - `"delay_ms": n` waits `n` milliseconds before answering
//! - `"log": "text"` writes `text` to stdout as a raw line first
//! - `"crash": "message"` writes `message` to stderr and exits with status 3
//!
//! Logs go to stderr and are filtered through `RUST_LOG` (default `warn`).

use std::io::{self, IsTerminal, Write};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

const CRASH_EXIT_CODE: i32 = 3;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .init();
}

async fn handle(cmd: Value) -> Value {
    if let Some(ms) = cmd.get("delay_ms").and_then(Value::as_u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    if let Some(text) = cmd.get("log").and_then(Value::as_str) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{text}");
        let _ = stdout.flush();
    }

    if let Some(message) = cmd.get("crash") {
        let message = message.as_str().map_or_else(|| message.to_string(), str::to_string);
        eprintln!("{message}");
        std::process::exit(CRASH_EXIT_CODE);
    }

    cmd
}

#[tokio::main]
async fn main() {
    init_tracing();
    debug!("echo worker started");

    if let Err(err) = workerlink::serve::serve_stdio(handle).await {
        error!(error = %err, "serve loop failed");
        std::process::exit(1);
    }

    debug!("echo worker stopping");
    // The runtime cannot cancel its blocking stdin read, so leave directly
    // rather than wait for the host to close our stdin.
    std::process::exit(0);
}
