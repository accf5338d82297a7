use super::{Pid, monotonic_now};
use crate::events::ExitStatus;
use crate::prelude::*;
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use std::time::Duration;

/// Outcome of one non-blocking reap attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reap {
    Exited {
        pid: Pid,
        status: ExitStatus,
        timestamp: Duration,
    },
    /// Children exist but none of them has terminated yet
    StillRunning,
    NoChildren,
}

/// Collects terminated children of the tracer.
pub trait Reaper {
    fn reap(&mut self) -> Result<Reap>;
}

/// [`Reaper`] built on `waitpid(-1, WNOHANG)`.
#[derive(Debug, Default)]
pub struct WaitReaper;

impl Reaper for WaitReaper {
    fn reap(&mut self) -> Result<Reap> {
        loop {
            let (pid, status) = match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => (pid, ExitStatus::Exited(code)),
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    (pid, ExitStatus::Signaled(signal as i32))
                }
                Ok(WaitStatus::StillAlive) => return Ok(Reap::StillRunning),
                Ok(other) => {
                    trace!("Ignoring wait status {other:?}");
                    continue;
                }
                Err(Errno::ECHILD) => return Ok(Reap::NoChildren),
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("Failed to reap child processes"),
            };

            return Ok(Reap::Exited {
                pid: pid.as_raw(),
                status,
                timestamp: monotonic_now()?,
            });
        }
    }
}
