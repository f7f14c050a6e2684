//! Admission control, id correlation and queueing for worker commands.
//!
//! The pool lives inside the dispatcher's event loop and is only ever touched
//! from that task. Work that must happen "on the next tick" is posted back to
//! the loop's own channel as a [`PoolTick`], so it runs after whatever events
//! are already waiting (for instance, output lines read from the worker).

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::command::{Command, CommandOptions, CommandOutcome, Responder};
use super::dispatcher::HostEvent;
use super::error::WorkerError;
use super::protocol::{CommandId, Signal};
use super::queue::Queue;

/// Tracing target for pool operations.
const POOL_TARGET: &str = "workerlink::pool";

/// Ids wrap here. Ids still tracked are skipped on reuse.
pub const ID_WRAP_BOUND: CommandId = 1 << 31;

/// Default number of commands allowed to run concurrently.
pub const DEFAULT_MAX_COMMANDS_RUNNING: usize = 10;

/// Default command timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the dispatcher loop processes, in arrival order.
pub(crate) enum Event {
    Tick(PoolTick),
    Host(HostEvent),
}

/// Deferred pool work.
pub(crate) enum PoolTick {
    /// A dequeued command whose start was deferred.
    StartQueued(Command),
    /// A command's timer fired.
    Timeout { id: CommandId, serial: u64 },
    /// The idle-waiting entry became runnable.
    RunIdle(IdleEntry),
}

/// The single "run when idle" slot.
pub(crate) struct IdleEntry {
    command: Command,
    prioritized: bool,
    options: CommandOptions,
}

/// Something that went wrong inside a pool method and must close the dispatcher.
pub(crate) enum PoolFault {
    /// The worker's input is gone or a frame could not be encoded.
    Write(WorkerError),
    /// A host responder panicked.
    ResponderPanic(Box<dyn Any + Send + 'static>),
}

/// Pool-level limits.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub max_commands_running: usize,
    pub default_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_commands_running: DEFAULT_MAX_COMMANDS_RUNNING,
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// Channels the pool writes to.
pub(crate) struct PoolLink {
    /// The owning loop's channel, used for deferrals and timers.
    pub events: mpsc::UnboundedSender<Event>,
    /// Framed lines for the worker's stdin writer.
    pub input: mpsc::UnboundedSender<String>,
}

/// Ring allocator for wire ids.
#[derive(Debug)]
struct IdAllocator {
    next: CommandId,
    bound: CommandId,
}

impl IdAllocator {
    fn new(bound: CommandId) -> Self {
        Self { next: 0, bound }
    }

    fn allocate(&mut self, in_use: impl Fn(CommandId) -> bool) -> CommandId {
        loop {
            let id = self.next;
            self.next = (self.next + 1) % self.bound;
            if !in_use(id) {
                return id;
            }
        }
    }
}

pub(crate) struct CommandPool {
    config: PoolConfig,
    link: PoolLink,
    running: HashMap<CommandId, Command>,
    queue: Queue<Command>,
    /// Dequeued commands whose start is still pending on the loop.
    starting: usize,
    /// Every id that is queued, starting, running or parked in the idle slot.
    tracked: HashSet<CommandId>,
    ids: IdAllocator,
    next_serial: u64,
    idle_waiting: Option<IdleEntry>,
    has_commands_running: bool,
    terminated: bool,
    fault: Option<PoolFault>,
}

impl CommandPool {
    pub(crate) fn new(config: PoolConfig, link: PoolLink) -> Self {
        Self {
            config,
            link,
            running: HashMap::new(),
            queue: Queue::new(),
            starting: 0,
            tracked: HashSet::new(),
            ids: IdAllocator::new(ID_WRAP_BOUND),
            next_serial: 0,
            idle_waiting: None,
            has_commands_running: false,
            terminated: false,
            fault: None,
        }
    }

    pub(crate) fn running_count(&self) -> usize {
        self.running.len()
    }

    pub(crate) fn queued_count(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn has_commands_running(&self) -> bool {
        self.has_commands_running
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub(crate) fn take_fault(&mut self) -> Option<PoolFault> {
        self.fault.take()
    }

    /// Build a command with a fresh id. The command is not admitted yet.
    pub(crate) fn create_command(
        &mut self,
        payload: Value,
        signal: Signal,
        responder: Option<Responder>,
    ) -> Command {
        let tracked = &self.tracked;
        let id = self.ids.allocate(|id| tracked.contains(&id));
        self.tracked.insert(id);

        let serial = self.next_serial;
        self.next_serial += 1;

        Command::new(id, serial, payload, signal, responder)
    }

    /// Start the command now, or queue it when the pool is saturated.
    ///
    /// Prioritized commands bypass the concurrency limit.
    pub(crate) fn plan_execution(
        &mut self,
        mut cmd: Command,
        prioritized: bool,
        options: &CommandOptions,
    ) {
        cmd.set_options(self.config.default_timeout, options);

        if self.terminated {
            self.discard(cmd);
            return;
        }

        if prioritized || (self.has_capacity() && self.queue.is_empty()) {
            self.execute(cmd);
        } else {
            trace!(
                target: POOL_TARGET,
                id = cmd.id(),
                queued = self.queue.len() + 1,
                "pool saturated, queueing command"
            );
            cmd.mark_queued();
            self.queue.enqueue(cmd);
        }
    }

    /// Park a command until the pool is idle, replacing any earlier one.
    pub(crate) fn plan_on_idle(
        &mut self,
        cmd: Command,
        prioritized: bool,
        options: CommandOptions,
    ) {
        if let Some(previous) = self.idle_waiting.take() {
            debug!(target: POOL_TARGET, id = previous.command.id(), "replacing idle-waiting command");
            self.discard(previous.command);
        }

        if self.is_idle() {
            self.plan_execution(cmd, prioritized, &options);
        } else {
            self.idle_waiting = Some(IdleEntry {
                command: cmd,
                prioritized,
                options,
            });
        }
    }

    /// Route a decoded response to its command.
    pub(crate) fn handle_response(&mut self, id: CommandId, data: Value) {
        if self.running.contains_key(&id) {
            self.finish(id, CommandOutcome::Completed(data));
        } else {
            // Timed out, terminated, or from an earlier worker session.
            trace!(target: POOL_TARGET, id, "discarding response for untracked command");
        }
    }

    pub(crate) fn handle_tick(&mut self, tick: PoolTick) {
        match tick {
            PoolTick::StartQueued(cmd) => {
                self.starting = self.starting.saturating_sub(1);
                if self.terminated {
                    self.discard(cmd);
                } else {
                    self.execute(cmd);
                }
            }
            PoolTick::Timeout { id, serial } => {
                let current = self.running.get(&id).map(Command::serial);
                if current == Some(serial) {
                    debug!(target: POOL_TARGET, id, "command timed out");
                    self.finish(id, CommandOutcome::TimedOut);
                }
            }
            PoolTick::RunIdle(entry) => {
                self.plan_execution(entry.command, entry.prioritized, &entry.options);
            }
        }
    }

    /// Start queued commands while there is room, each on its own tick.
    pub(crate) fn work_queue(&mut self) {
        while !self.terminated && self.has_capacity() {
            let Some(cmd) = self.queue.dequeue() else {
                break;
            };
            self.starting += 1;
            self.defer(PoolTick::StartQueued(cmd));
        }
    }

    /// Called whenever the last running command resolves.
    pub(crate) fn entered_idle(&mut self) {
        self.has_commands_running = false;
        if let Some(entry) = self.idle_waiting.take() {
            self.defer(PoolTick::RunIdle(entry));
        }
    }

    /// Give up on the worker: drop queued work, terminate running work.
    ///
    /// Queued commands never started, so their responders are dropped
    /// without being called. Nothing is started after this.
    pub(crate) fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        let dropped = self.queue.clear();
        self.idle_waiting = None;
        self.starting = 0;

        let mut ids: Vec<CommandId> = self.running.keys().copied().collect();
        ids.sort_unstable();
        debug!(
            target: POOL_TARGET,
            running = ids.len(),
            dropped,
            "terminating command pool"
        );

        for id in ids {
            if let Some(mut cmd) = self.running.remove(&id) {
                if let Some((responder, outcome)) = cmd.resolve(CommandOutcome::Terminated) {
                    self.deliver(responder, outcome);
                }
            }
        }

        self.tracked.clear();
        self.has_commands_running = false;
    }

    fn is_idle(&self) -> bool {
        self.running.is_empty() && self.starting == 0
    }

    fn has_capacity(&self) -> bool {
        self.running.len() + self.starting < self.config.max_commands_running
    }

    fn defer(&self, tick: PoolTick) {
        // The loop holds a sender of its own, so this only fails once the
        // loop is gone, and then there is nobody left to run the tick.
        let _ = self.link.events.send(Event::Tick(tick));
    }

    fn discard(&mut self, cmd: Command) {
        trace!(target: POOL_TARGET, id = cmd.id(), "discarding command that never started");
        self.tracked.remove(&cmd.id());
    }

    fn execute(&mut self, mut cmd: Command) {
        let Some(frame) = cmd.begin() else {
            return;
        };
        let id = cmd.id();

        if cmd.wants_timer() {
            let events = self.link.events.clone();
            let serial = cmd.serial();
            let timeout = cmd.timeout();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = events.send(Event::Tick(PoolTick::Timeout { id, serial }));
            });
            cmd.arm_timer(timer.abort_handle());
        }

        trace!(
            target: POOL_TARGET,
            id,
            signal = ?cmd.signal(),
            running = self.running.len() + 1,
            "executing command"
        );
        self.running.insert(id, cmd);
        self.has_commands_running = true;

        let written = frame
            .to_line()
            .map_err(WorkerError::SerializeFailed)
            .and_then(|line| {
                self.link
                    .input
                    .send(line)
                    .map_err(|_| WorkerError::WriteFailed(std::io::ErrorKind::BrokenPipe.into()))
            });
        if let Err(err) = written {
            warn!(target: POOL_TARGET, id, error = %err, "failed to write command to worker");
            self.fault.get_or_insert(PoolFault::Write(err));
        }
    }

    fn finish(&mut self, id: CommandId, outcome: CommandOutcome) {
        let Some(mut cmd) = self.running.remove(&id) else {
            return;
        };
        self.tracked.remove(&id);

        if let Some((responder, outcome)) = cmd.resolve(outcome) {
            self.deliver(responder, outcome);
        }

        if self.running.is_empty() {
            self.entered_idle();
        }
        self.work_queue();
    }

    fn deliver(&mut self, responder: Responder, outcome: CommandOutcome) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || responder(outcome))) {
            self.fault.get_or_insert(PoolFault::ResponderPanic(payload));
        }
    }
}
