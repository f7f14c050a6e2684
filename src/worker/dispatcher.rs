//! Host-facing dispatcher for the worker process.

use std::any::Any;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::command::{CommandOptions, CommandOutcome, Responder};
use super::error::{WorkerError, WorkerResult};
use super::notification::{Diagnostic, WorkerEvent};
use super::pool::{CommandPool, Event, PoolConfig, PoolFault, PoolLink};
use super::process::{WorkerLauncher, WorkerProcess};
use super::protocol::{ResponseEnvelope, Signal};
use crate::config::Settings;

/// Tracing target for dispatcher operations.
const DISPATCH_TARGET: &str = "workerlink::dispatcher";

/// Bytes requested per read from the worker's stderr.
const READ_CHUNK: usize = 8 * 1024;

/// Buffered notifications per observer before the oldest are dropped.
const NOTIFICATION_CAPACITY: usize = 256;

/// Events the host and the process layer feed into the loop.
pub(crate) enum HostEvent {
    Submit {
        payload: Value,
        options: CommandOptions,
        responder: Responder,
        on_idle: bool,
    },
    Close,
    Kill,
    ShutdownGraceElapsed,
    Line(String),
    Exited(Option<i32>),
}

/// Drives a long-lived worker as a request/response engine.
///
/// Commands are written to the worker as NDJSON on stdin and answered on
/// stdout; stderr is surfaced as [`Diagnostic`]s. At most
/// `max_commands_running` commands are in flight; the rest wait in FIFO order.
///
/// # Example
///
/// ```ignore
/// use workerlink::{CommandOptions, Dispatcher, WorkerLauncher};
///
/// let mut dispatcher = Dispatcher::new(WorkerLauncher::new("./my-worker"));
/// dispatcher.init().await?;
///
/// let outcome = dispatcher
///     .execute(json!({"text": "hello"}), CommandOptions::new().with_timeout_secs(0.5))
///     .await?;
/// if let Some(data) = outcome.data() {
///     println!("worker said {data}");
/// }
///
/// dispatcher.close();
/// ```
pub struct Dispatcher {
    launcher: WorkerLauncher,
    config: PoolConfig,
    shutdown_grace: Option<Duration>,
    notifications: broadcast::Sender<WorkerEvent>,
    session: Option<Session>,
}

/// One attached worker and the loop serving it.
struct Session {
    events: mpsc::UnboundedSender<Event>,
    state: Arc<SessionState>,
}

struct SessionState {
    closing: AtomicBool,
    exited: watch::Sender<bool>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            closing: AtomicBool::new(false),
            exited: watch::channel(false).0,
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Returns `true` for the first caller only.
    fn begin_closing(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    fn mark_exited(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.exited.send_replace(true);
    }
}

impl Dispatcher {
    /// Create an uninitialized dispatcher with default pool limits.
    pub fn new(launcher: WorkerLauncher) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            launcher,
            config: PoolConfig::default(),
            shutdown_grace: None,
            notifications,
            session: None,
        }
    }

    /// Build a dispatcher from loaded settings.
    pub fn from_settings(settings: &Settings) -> WorkerResult<Self> {
        let launcher = settings.launcher()?;
        let config = settings.pool_config()?;
        Ok(Self::new(launcher)
            .with_pool_config(config)
            .with_shutdown_grace(settings.shutdown_grace()?))
    }

    /// Build a dispatcher from settings and initialize it right away.
    pub async fn spawn(settings: &Settings) -> WorkerResult<Self> {
        let mut dispatcher = Self::from_settings(settings)?;
        dispatcher.init().await?;
        Ok(dispatcher)
    }

    pub fn with_pool_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Kill the worker if it is still running this long after [`close`](Self::close).
    pub fn with_shutdown_grace(mut self, grace: Option<Duration>) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn pool_config(&self) -> &PoolConfig {
        &self.config
    }

    /// Launch the worker and start serving commands.
    ///
    /// Fails without spawning anything when the worker program cannot be
    /// found. A dispatcher whose worker has exited may be initialized again;
    /// the new session starts with an empty pool.
    pub async fn init(&mut self) -> WorkerResult<()> {
        if self.is_attached() {
            return Err(WorkerError::AlreadyInitialized);
        }
        let process = self.launcher.spawn()?;
        self.attach(process)
    }

    /// Start serving commands over an already running worker.
    pub fn attach<P: WorkerProcess>(&mut self, mut process: P) -> WorkerResult<()> {
        if self.is_attached() {
            return Err(WorkerError::AlreadyInitialized);
        }
        let stdio = process.take_stdio()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let state = Arc::new(SessionState::new());

        tokio::spawn(write_input(stdio.stdin, input_rx));
        let mut readers = vec![tokio::spawn(read_output(stdio.stdout, events_tx.clone()))];
        if let Some(stderr) = stdio.stderr {
            readers.push(tokio::spawn(read_errors(stderr, self.notifications.clone())));
        }
        tokio::spawn(supervise(
            process,
            kill_rx,
            readers,
            events_tx.clone(),
            state.clone(),
        ));

        let pool = CommandPool::new(
            self.config.clone(),
            PoolLink {
                events: events_tx.clone(),
                input: input_tx,
            },
        );
        let event_loop = EventLoop {
            pool,
            events: events_tx.clone(),
            kill: kill_tx,
            notifications: self.notifications.clone(),
            state: state.clone(),
            shutdown_grace: self.shutdown_grace,
            panic: None,
        };
        tokio::spawn(event_loop.run(events_rx));

        debug!(target: DISPATCH_TARGET, "worker attached");
        self.session = Some(Session {
            events: events_tx,
            state,
        });
        Ok(())
    }

    /// Submit a command and wait for its outcome.
    ///
    /// Returns [`WorkerError::Discarded`] when the command was still queued
    /// at the moment the pool was terminated, since it never started.
    pub async fn execute(
        &self,
        payload: Value,
        options: CommandOptions,
    ) -> WorkerResult<CommandOutcome> {
        let (tx, rx) = oneshot::channel();
        self.execute_with(payload, options, move |outcome| {
            let _ = tx.send(outcome);
        })?;
        Ok(rx.await?)
    }

    /// Submit a command; `callback` runs once with its outcome.
    ///
    /// The callback runs on the dispatcher's loop and must not block. If it
    /// panics, the dispatcher is force-closed; the panic is resumed on the
    /// loop task once the close notification has gone out.
    /// Callbacks of commands dropped from the queue are never called.
    pub fn execute_with<F>(
        &self,
        payload: Value,
        options: CommandOptions,
        callback: F,
    ) -> WorkerResult<()>
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        self.submit(payload, options, Box::new(callback), false)
    }

    /// Run a command the next time no command is running.
    ///
    /// Only one command waits for idle at a time; a later call replaces an
    /// earlier one, whose callback is then never called.
    pub fn execute_on_idle<F>(
        &self,
        payload: Value,
        options: CommandOptions,
        callback: F,
    ) -> WorkerResult<()>
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        self.submit(payload, options, Box::new(callback), true)
    }

    /// Ask the worker to exit gracefully.
    ///
    /// Sends the termination signal in-band, ahead of any queued commands.
    /// No-op when not initialized or already closing.
    pub fn close(&self) {
        let Some(session) = &self.session else {
            return;
        };
        if session.state.begin_closing() {
            debug!(target: DISPATCH_TARGET, "closing worker");
            let _ = session.events.send(Event::Host(HostEvent::Close));
        }
    }

    /// Terminate every running command and kill the worker.
    pub fn kill(&self) {
        if let Some(session) = &self.session {
            session.state.closing.store(true, Ordering::SeqCst);
            let _ = session.events.send(Event::Host(HostEvent::Kill));
        }
    }

    /// Observe diagnostics and the close notification.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.notifications.subscribe()
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    /// Whether the dispatcher refuses new commands.
    pub fn is_closed(&self) -> bool {
        self.session
            .as_ref()
            .map_or(true, |session| session.state.is_closing())
    }

    /// Wait until the worker process has exited. Returns at once if no
    /// worker is attached.
    pub async fn wait_closed(&self) {
        let Some(session) = &self.session else {
            return;
        };
        let mut exited = session.state.exited.subscribe();
        let _ = exited.wait_for(|exited| *exited).await;
    }

    fn is_attached(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| !session.state.has_exited())
    }

    fn submit(
        &self,
        payload: Value,
        options: CommandOptions,
        responder: Responder,
        on_idle: bool,
    ) -> WorkerResult<()> {
        let session = self.session.as_ref().ok_or(WorkerError::NotInitialized)?;
        if session.state.is_closing() {
            return Err(WorkerError::Closed);
        }
        session
            .events
            .send(Event::Host(HostEvent::Submit {
                payload,
                options,
                responder,
                on_idle,
            }))
            .map_err(|_| WorkerError::Closed)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Owns the pool; every pool mutation happens here.
struct EventLoop {
    pool: CommandPool,
    events: mpsc::UnboundedSender<Event>,
    kill: mpsc::UnboundedSender<()>,
    notifications: broadcast::Sender<WorkerEvent>,
    state: Arc<SessionState>,
    shutdown_grace: Option<Duration>,
    /// First callback panic, held until the worker has exited.
    panic: Option<Box<dyn Any + Send>>,
}

impl EventLoop {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            let exited = match event {
                Event::Tick(tick) => {
                    self.pool.handle_tick(tick);
                    false
                }
                Event::Host(host) => self.handle_host(host),
            };

            match self.pool.take_fault() {
                Some(PoolFault::Write(err)) => {
                    error!(target: DISPATCH_TARGET, error = %err, "worker input failed, force-closing");
                    self.force_close();
                }
                Some(PoolFault::ResponderPanic(payload)) => {
                    error!(target: DISPATCH_TARGET, "command callback panicked, force-closing");
                    self.force_close();
                    self.panic.get_or_insert(payload);
                }
                None => {}
            }

            if exited {
                break;
            }
        }
        trace!(target: DISPATCH_TARGET, "event loop finished");

        if let Some(payload) = self.panic.take() {
            panic::resume_unwind(payload);
        }
    }

    /// Returns `true` once the worker has exited.
    fn handle_host(&mut self, event: HostEvent) -> bool {
        match event {
            HostEvent::Submit {
                payload,
                options,
                responder,
                on_idle,
            } => {
                let cmd = self.pool.create_command(payload, Signal::None, Some(responder));
                if on_idle {
                    self.pool.plan_on_idle(cmd, false, options);
                } else {
                    self.pool.plan_execution(cmd, false, &options);
                }
            }
            HostEvent::Close => {
                if !self.pool.is_terminated() {
                    debug!(
                        target: DISPATCH_TARGET,
                        busy = self.pool.has_commands_running(),
                        "sending termination signal"
                    );
                    let signal = self.pool.create_command(Value::Null, Signal::Termination, None);
                    self.pool.plan_execution(signal, true, &CommandOptions::new());
                    self.arm_shutdown_grace();
                }
            }
            HostEvent::Kill => self.force_close(),
            HostEvent::ShutdownGraceElapsed => {
                if !self.state.has_exited() {
                    warn!(target: DISPATCH_TARGET, "worker ignored termination signal, killing");
                    self.force_close();
                }
            }
            HostEvent::Line(line) => self.route_line(line),
            HostEvent::Exited(exit_code) => {
                debug!(
                    target: DISPATCH_TARGET,
                    ?exit_code,
                    running = self.pool.running_count(),
                    queued = self.pool.queued_count(),
                    "worker exited"
                );
                self.pool.terminate();
                self.state.mark_exited();
                self.notify(WorkerEvent::Closed { exit_code });
                return true;
            }
        }
        false
    }

    fn route_line(&mut self, line: String) {
        match ResponseEnvelope::decode(&line) {
            Ok(Some(response)) => self.pool.handle_response(response.id, response.data),
            Ok(None) => trace!(target: DISPATCH_TARGET, "output line carries no command id"),
            Err(err) => {
                // Most likely the worker's own logging, not a broken response.
                trace!(target: DISPATCH_TARGET, error = %err, "undecodable output line");
                self.notify(WorkerEvent::Diagnostic(Diagnostic::parser(line, &err)));
            }
        }
    }

    fn arm_shutdown_grace(&self) {
        let Some(grace) = self.shutdown_grace else {
            return;
        };
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = events.send(Event::Host(HostEvent::ShutdownGraceElapsed));
        });
    }

    fn force_close(&mut self) {
        self.state.closing.store(true, Ordering::SeqCst);
        self.pool.terminate();
        let _ = self.kill.send(());
    }

    fn notify(&self, event: WorkerEvent) {
        // No observers is not an error.
        let _ = self.notifications.send(event);
    }
}

async fn write_input(
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    mut lines: mpsc::UnboundedReceiver<String>,
) {
    let mut stdin = BufWriter::new(stdin);
    while let Some(line) = lines.recv().await {
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(err) = written {
            warn!(target: DISPATCH_TARGET, error = %err, "failed to write to worker stdin");
            break;
        }
    }
}

async fn read_output(
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\n', '\r']);
                if line.trim().is_empty() {
                    continue;
                }
                if events.send(Event::Host(HostEvent::Line(line.to_string()))).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(target: DISPATCH_TARGET, error = %err, "failed to read worker stdout");
                break;
            }
        }
    }
}

async fn read_errors(
    mut stderr: Box<dyn AsyncRead + Send + Unpin>,
    notifications: broadcast::Sender<WorkerEvent>,
) {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                trace!(target: DISPATCH_TARGET, bytes = n, "worker stderr");
                let _ = notifications.send(WorkerEvent::Diagnostic(Diagnostic::stderr(&chunk[..n])));
            }
            Err(err) => {
                warn!(target: DISPATCH_TARGET, error = %err, "failed to read worker stderr");
                break;
            }
        }
    }
}

/// Wait for the worker to exit, honouring kill requests meanwhile.
///
/// The exit is reported only after stdout and stderr are drained, so every
/// response and diagnostic the worker wrote is seen before `Closed`.
async fn supervise<P: WorkerProcess>(
    mut process: P,
    mut kill: mpsc::UnboundedReceiver<()>,
    readers: Vec<JoinHandle<()>>,
    events: mpsc::UnboundedSender<Event>,
    state: Arc<SessionState>,
) {
    let exit_code = loop {
        tokio::select! {
            status = process.wait() => {
                break match status {
                    Ok(code) => code,
                    Err(err) => {
                        warn!(target: DISPATCH_TARGET, error = %err, "failed to wait for worker");
                        None
                    }
                };
            }
            Some(()) = kill.recv() => {
                if let Err(err) = process.start_kill() {
                    warn!(target: DISPATCH_TARGET, error = %err, "failed to kill worker");
                }
            }
        }
    };

    for reader in readers {
        let _ = reader.await;
    }

    if events.send(Event::Host(HostEvent::Exited(exit_code))).is_err() {
        // The loop is gone; nobody else will record the exit.
        state.mark_exited();
    }
}
