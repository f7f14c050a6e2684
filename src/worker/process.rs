//! Process layer: locating, spawning and supervising the worker.
//!
//! The dispatcher only needs byte pipes, an exit notification and a way to
//! force the worker down. [`WorkerProcess`] captures that contract so the
//! dispatcher can drive a real child process or any other transport.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::debug;

use super::error::{WorkerError, WorkerResult};

/// Tracing target for process operations.
const PROCESS_TARGET: &str = "workerlink::process";

/// Byte pipes of a worker.
pub struct WorkerStdio {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Absent when the worker's stderr is not captured.
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

/// What the dispatcher requires from the process layer.
#[async_trait]
pub trait WorkerProcess: Send + 'static {
    /// Hand over the pipes. Called once, right after attaching.
    fn take_stdio(&mut self) -> WorkerResult<WorkerStdio>;

    /// Resolve when the worker has exited, with its exit code when known.
    ///
    /// Must be cancel-safe: the supervisor polls it alongside kill requests.
    async fn wait(&mut self) -> WorkerResult<Option<i32>>;

    /// Begin forcing the worker down without waiting for it.
    fn start_kill(&mut self) -> WorkerResult<()>;
}

/// A worker running as a child process.
pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn take_stdio(&mut self) -> WorkerResult<WorkerStdio> {
        let stdin = self.child.stdin.take().ok_or(WorkerError::MissingPipe("stdin"))?;
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or(WorkerError::MissingPipe("stdout"))?;
        let stderr = self.child.stderr.take();

        Ok(WorkerStdio {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
        })
    }

    async fn wait(&mut self) -> WorkerResult<Option<i32>> {
        let status = self.child.wait().await.map_err(WorkerError::WaitFailed)?;
        Ok(status.code())
    }

    fn start_kill(&mut self) -> WorkerResult<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(WorkerError::KillFailed(err)),
        }
    }
}

/// How to start the worker program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLauncher {
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
}

impl WorkerLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Working directory of the worker. Defaults to the host's.
    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Extra environment on top of the inherited one.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Resolve the program to an existing file.
    ///
    /// Bare names are searched on `PATH`; anything with a directory part is
    /// checked as given (relative to the worker's working directory if set).
    pub fn locate(&self) -> WorkerResult<PathBuf> {
        let has_dir = self.program.components().count() > 1 || self.program.is_absolute();

        if has_dir {
            let candidate = match &self.cwd {
                Some(cwd) if self.program.is_relative() => cwd.join(&self.program),
                _ => self.program.clone(),
            };
            return if candidate.is_file() {
                Ok(candidate)
            } else {
                Err(WorkerError::ProgramNotFound(self.program.clone()))
            };
        }

        env::var_os("PATH")
            .and_then(|paths| {
                env::split_paths(&paths)
                    .map(|dir| dir.join(&self.program))
                    .find(|candidate| candidate.is_file())
            })
            .ok_or_else(|| WorkerError::ProgramNotFound(self.program.clone()))
    }

    /// Locate and spawn the worker with all three pipes captured.
    pub fn spawn(&self) -> WorkerResult<ChildProcess> {
        let program = self.locate()?;

        debug!(
            target: PROCESS_TARGET,
            program = %program.display(),
            args = ?self.args,
            "spawning worker process"
        );

        let mut command = Command::new(&program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let child = command.spawn().map_err(WorkerError::SpawnFailed)?;
        Ok(ChildProcess::new(child))
    }
}
