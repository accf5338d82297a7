use crate::prelude::*;
use crate::process::Pid;
use nix::sys::signal::Signal;
use std::fmt::Display;
use std::time::Duration;

/// How a process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    /// Killed by the given signal number
    Signaled(i32),
}

impl ExitStatus {
    /// Decode a raw `wait(2)` status word.
    pub fn from_wait_status(raw: i32) -> Self {
        if libc::WIFSIGNALED(raw) {
            ExitStatus::Signaled(libc::WTERMSIG(raw))
        } else {
            ExitStatus::Exited(libc::WEXITSTATUS(raw))
        }
    }
}

impl Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "status={code}"),
            ExitStatus::Signaled(signo) => match Signal::try_from(*signo) {
                Ok(signal) => write!(f, "signal={}", signal.as_str()),
                Err(_) => write!(f, "signal={signo}"),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// A child of the tracer changed state (`SIGCHLD`)
    Child,
    /// The user asked the tracer to stop (`SIGINT`, `SIGTERM`)
    Interrupt,
}

impl SignalKind {
    pub fn signals(&self) -> &'static [Signal] {
        match self {
            SignalKind::Child => &[Signal::SIGCHLD],
            SignalKind::Interrupt => &[Signal::SIGINT, Signal::SIGTERM],
        }
    }

    pub fn from_signal(signal: Signal) -> Option<Self> {
        [SignalKind::Child, SignalKind::Interrupt]
            .into_iter()
            .find(|kind| kind.signals().contains(&signal))
    }
}

/// One entry of the ordered stream the dispatch loop consumes.
///
/// Timestamps are `CLOCK_MONOTONIC` durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Exec {
        pid: Pid,
        timestamp: Duration,
    },
    Exit {
        pid: Pid,
        status: ExitStatus,
        timestamp: Duration,
    },
    Signal(SignalKind),
}

#[derive(Debug)]
pub enum SubscribeError {
    /// The process exited before the subscription could be armed
    NoSuchProcess(Pid),
    Failed { pid: Pid, source: std::io::Error },
}

impl Display for SubscribeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscribeError::NoSuchProcess(pid) => write!(f, "No such process: {pid}"),
            SubscribeError::Failed { pid, source } => {
                write!(f, "Failed to watch process {pid}: {source}")
            }
        }
    }
}

impl std::error::Error for SubscribeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SubscribeError::NoSuchProcess(_) => None,
            SubscribeError::Failed { source, .. } => Some(source),
        }
    }
}

/// Delivers process lifecycle and signal events.
///
/// Exec and exit events are only delivered for subscribed processes and, once
/// a process is subscribed, for every descendant it forks afterwards.
pub trait EventSource {
    /// Block until at least one event is available and return everything that
    /// is ready, in delivery order.
    fn next_batch(&mut self) -> Result<Vec<Event>>;

    fn subscribe(&mut self, pid: Pid) -> Result<(), SubscribeError>;

    fn unsubscribe(&mut self, pid: Pid);
}
