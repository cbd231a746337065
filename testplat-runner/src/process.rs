// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Starting and supervising test host processes.
//!
//! The retry orchestrator is generic over [`ProcessHandler`] so it can be driven by scripted
//! processes in tests. [`TokioProcessHandler`] is the real implementation.

use camino::Utf8PathBuf;
use std::{fmt, io, process::Stdio};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The program, arguments and environment for a test host process.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProcessStartInfo {
    /// The program to run.
    pub program: String,
    /// The arguments to pass to the program.
    pub args: Vec<String>,
    /// Additional environment variables.
    pub env: Vec<(String, String)>,
    /// The working directory, or the current one if `None`.
    pub current_dir: Option<Utf8PathBuf>,
}

impl ProcessStartInfo {
    /// Creates a new `ProcessStartInfo` for `program` and `args`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            current_dir: None,
        }
    }
}

/// How a process exited.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessExit {
    /// The process exited with an exit code.
    Code(i32),

    /// The process was terminated by a signal.
    Signal(i32),

    /// The exit status couldn't be determined.
    Unknown,
}

impl ProcessExit {
    /// Returns the exit code, if the process exited normally.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Code(code) => Some(*code),
            Self::Signal(_) | Self::Unknown => None,
        }
    }
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signal(signal);
            }
        }
        Self::Unknown
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal(signal) => write!(f, "signal {signal}"),
            Self::Unknown => write!(f, "unknown exit status"),
        }
    }
}

/// The sending half of an [`ExitSignal`].
#[derive(Debug)]
pub struct ExitNotifier(watch::Sender<Option<ProcessExit>>);

impl ExitNotifier {
    /// Records the exit and wakes up every waiter.
    pub fn notify(&self, exit: ProcessExit) {
        self.0.send_replace(Some(exit));
    }
}

/// A one-shot notification that a process has exited. Can be cloned and awaited by several
/// waiters.
#[derive(Clone, Debug)]
pub struct ExitSignal(watch::Receiver<Option<ProcessExit>>);

impl ExitSignal {
    /// Creates a new signal and its notifier.
    pub fn channel() -> (ExitNotifier, Self) {
        let (tx, rx) = watch::channel(None);
        (ExitNotifier(tx), Self(rx))
    }

    /// Returns the exit status if the process has already exited.
    pub fn get(&self) -> Option<ProcessExit> {
        *self.0.borrow()
    }

    /// Waits for the process to exit.
    ///
    /// If the notifier is dropped without notifying, returns [`ProcessExit::Unknown`].
    pub async fn wait(&mut self) -> ProcessExit {
        // An error means the notifier is gone, in which case nothing more will be recorded.
        let _ = self.0.wait_for(Option::is_some).await;
        self.get().unwrap_or(ProcessExit::Unknown)
    }
}

/// A running test host process.
pub trait TestHostProcess: Send {
    /// The OS process id, if known.
    fn id(&self) -> Option<u32>;

    /// Returns a signal that fires when the process exits.
    fn exited(&self) -> ExitSignal;

    /// Requests that the process be killed. The exit is still reported through
    /// [`exited`](Self::exited).
    fn kill(&self);
}

/// Starts test host processes.
pub trait ProcessHandler: Send + Sync {
    /// The type of process this handler starts.
    type Process: TestHostProcess;

    /// Starts a process.
    fn start(&self, info: &ProcessStartInfo) -> io::Result<Self::Process>;
}

/// A [`ProcessHandler`] that starts real processes with inherited stdout and stderr.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioProcessHandler;

impl ProcessHandler for TokioProcessHandler {
    type Process = TokioProcess;

    fn start(&self, info: &ProcessStartInfo) -> io::Result<TokioProcess> {
        let mut cmd = tokio::process::Command::new(&info.program);
        cmd.args(&info.args)
            .envs(info.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &info.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let id = child.id();
        debug!(program = %info.program, ?id, "started test host");

        let (notifier, exited) = ExitSignal::channel();
        let kill = CancellationToken::new();
        let kill_requested = kill.clone();
        tokio::spawn(async move {
            let res = tokio::select! {
                res = child.wait() => Some(res),
                () = kill_requested.cancelled() => None,
            };
            let res = match res {
                Some(res) => res,
                None => {
                    if let Err(err) = child.start_kill() {
                        debug!(?id, "failed to kill test host: {err}");
                    }
                    child.wait().await
                }
            };
            let exit = match res {
                Ok(status) => ProcessExit::from(status),
                Err(err) => {
                    debug!(?id, "failed to wait for test host: {err}");
                    ProcessExit::Unknown
                }
            };
            debug!(?id, %exit, "test host exited");
            notifier.notify(exit);
        });

        Ok(TokioProcess { id, exited, kill })
    }
}

/// A process started by [`TokioProcessHandler`].
#[derive(Debug)]
pub struct TokioProcess {
    id: Option<u32>,
    exited: ExitSignal,
    kill: CancellationToken,
}

impl TestHostProcess for TokioProcess {
    fn id(&self) -> Option<u32> {
        self.id
    }

    fn exited(&self) -> ExitSignal {
        self.exited.clone()
    }

    fn kill(&self) {
        self.kill.cancel();
    }
}
