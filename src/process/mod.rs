use crate::prelude::*;
use std::time::Duration;

mod linux;
mod reaper;

pub use linux::ProcFs;
pub use reaper::{Reap, Reaper, WaitReaper};

pub type Pid = i32;

/// Snapshot of the kernel's view of a process, valid only while the event
/// that triggered the lookup is being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: Pid,
    pub parent_pid: Pid,
    /// Start time of the process in clock ticks since boot. Two processes that
    /// share a PID never share a start time, so this doubles as a generation
    /// tag for recycled PIDs.
    pub start_time: u64,
    pub is_zombie: bool,
}

/// Read-only queries against live process state.
///
/// Every query can fail because the process exited in the meantime; callers
/// treat that as a normal outcome.
pub trait ProcessTable {
    /// `None` when the process does not exist (anymore).
    fn process(&self, pid: Pid) -> Option<ProcessRecord>;

    fn argv(&self, pid: Pid) -> Result<Vec<Vec<u8>>>;

    /// Environment entries, in order, usually `KEY=value`.
    fn envp(&self, pid: Pid) -> Result<Vec<Vec<u8>>>;

    fn cwd(&self, pid: Pid) -> Result<Vec<u8>>;

    fn exe_path(&self, pid: Pid) -> Result<Vec<u8>>;

    fn list_all(&self) -> Result<Vec<ProcessRecord>>;
}

/// Current `CLOCK_MONOTONIC` time, the clock process connector timestamps use.
pub fn monotonic_now() -> Result<Duration> {
    let now = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .context("Failed to read the monotonic clock")?;
    Ok(Duration::new(now.tv_sec() as u64, now.tv_nsec() as u32))
}
