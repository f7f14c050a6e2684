//! Worker-side counterpart of the dispatcher.
//!
//! A worker program hands [`serve_stdio`] a handler and lets it run: every
//! command read from stdin is handled on its own task and answered on stdout
//! with the command's id. Reading stops at the termination signal, which
//! abandons handlers still in flight, or at end of input, after which the
//! outstanding commands are still answered.
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     workerlink::serve::serve_stdio(|cmd| async move { cmd }).await
//! }
//! ```

use std::future::Future;
use std::io;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::worker::protocol::{RequestEnvelope, ResponseEnvelope, Signal};

/// Tracing target for the serve loop.
const SERVE_TARGET: &str = "workerlink::serve";

/// Serve commands from the process's stdin, answering on stdout.
pub async fn serve_stdio<H, Fut>(handler: H) -> io::Result<()>
where
    H: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Value> + Send + 'static,
{
    serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout(), handler).await
}

/// Serve commands read from `input`, writing one response line per command
/// to `output`.
///
/// Empty lines are skipped. A line that is not a command frame is echoed to
/// `output` as plain text so the host reports it as a diagnostic.
pub async fn serve<R, W, H, Fut>(input: R, output: W, handler: H) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
    H: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Value> + Send + 'static,
{
    let handler = Arc::new(handler);
    let (lines_tx, lines_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(write_lines(output, lines_rx));
    let mut handlers = JoinSet::new();

    let stop = read_commands(input, &lines_tx, &handler, &mut handlers).await;
    match stop {
        Ok(Stop::EndOfInput) => while handlers.join_next().await.is_some() {},
        Ok(Stop::Terminated) | Err(_) => handlers.shutdown().await,
    }
    drop(lines_tx);
    let write_result = match writer.await {
        Ok(result) => result,
        Err(err) => Err(io::Error::other(err)),
    };

    stop.and(write_result)
}

/// Why reading stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Terminated,
    EndOfInput,
}

async fn read_commands<R, H, Fut>(
    mut input: R,
    lines: &mpsc::UnboundedSender<String>,
    handler: &Arc<H>,
    handlers: &mut JoinSet<()>,
) -> io::Result<Stop>
where
    R: AsyncBufRead + Unpin,
    H: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Value> + Send + 'static,
{
    let mut line = String::new();
    loop {
        line.clear();
        match input.read_line(&mut line).await {
            Ok(0) => {
                debug!(target: SERVE_TARGET, "input closed");
                return Ok(Stop::EndOfInput);
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                // Surfaces on the host as a diagnostic.
                let _ = lines.send(format!("{err}\n"));
                continue;
            }
            Err(err) => return Err(err),
        }

        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        let request: RequestEnvelope = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(err) => {
                warn!(target: SERVE_TARGET, error = %err, "ignoring malformed command");
                let _ = lines.send(format!("malformed command ({err}): {text}\n"));
                continue;
            }
        };

        match request.signal {
            Signal::Termination => {
                debug!(target: SERVE_TARGET, id = request.id, "termination signal received");
                return Ok(Stop::Terminated);
            }
            Signal::None => {
                trace!(target: SERVE_TARGET, id = request.id, "handling command");
                let handler = Arc::clone(handler);
                let lines = lines.clone();
                handlers.spawn(async move {
                    let response = ResponseEnvelope {
                        id: request.id,
                        data: handler(request.cmd).await,
                    };
                    match response.to_line() {
                        Ok(line) => {
                            let _ = lines.send(line);
                        }
                        Err(err) => {
                            warn!(
                                target: SERVE_TARGET,
                                id = response.id,
                                error = %err,
                                "failed to encode response"
                            );
                        }
                    }
                });
            }
        }

        // Reap finished handlers so the set does not grow without bound.
        while handlers.try_join_next().is_some() {}
    }
}

async fn write_lines<W>(
    mut output: W,
    mut lines: mpsc::UnboundedReceiver<String>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        output.write_all(line.as_bytes()).await?;
        output.flush().await?;
    }
    output.shutdown().await
}
