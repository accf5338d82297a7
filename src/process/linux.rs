use super::{Pid, ProcessRecord, ProcessTable};
use crate::prelude::*;
use procfs::process::Process;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

const DEFAULT_PROC_ROOT: &str = "/proc";

/// [`ProcessTable`] backed by procfs.
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    pub fn new() -> Self {
        Self::with_root(DEFAULT_PROC_ROOT)
    }

    /// Use a procfs mounted somewhere else than `/proc`
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn process_dir(&self, pid: Pid) -> PathBuf {
        self.root.join(pid.to_string())
    }

    fn open(&self, pid: Pid) -> Result<Process> {
        Process::new_with_root(self.process_dir(pid))
            .with_context(|| format!("Process {pid} not found"))
    }

    fn read_nul_separated(&self, pid: Pid, file: &str) -> Result<Vec<Vec<u8>>> {
        let path = self.process_dir(pid).join(file);
        let raw = std::fs::read(&path).with_context(|| format!("Failed to read {path:?}"))?;
        Ok(split_nul_separated(&raw))
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for ProcFs {
    fn process(&self, pid: Pid) -> Option<ProcessRecord> {
        let stat = self.open(pid).ok()?.stat().ok()?;
        Some(ProcessRecord {
            pid: stat.pid,
            parent_pid: stat.ppid,
            start_time: stat.starttime,
            is_zombie: stat.state == 'Z',
        })
    }

    fn argv(&self, pid: Pid) -> Result<Vec<Vec<u8>>> {
        self.read_nul_separated(pid, "cmdline")
    }

    fn envp(&self, pid: Pid) -> Result<Vec<Vec<u8>>> {
        self.read_nul_separated(pid, "environ")
    }

    fn cwd(&self, pid: Pid) -> Result<Vec<u8>> {
        let cwd = self.open(pid)?.cwd()?;
        Ok(cwd.into_os_string().into_vec())
    }

    fn exe_path(&self, pid: Pid) -> Result<Vec<u8>> {
        let exe = self.open(pid)?.exe()?;
        Ok(exe.into_os_string().into_vec())
    }

    fn list_all(&self) -> Result<Vec<ProcessRecord>> {
        let processes = procfs::process::all_processes_with_root(&self.root)
            .with_context(|| format!("Failed to list processes in {:?}", self.root))?;

        // Processes exiting while we iterate are simply skipped
        Ok(processes
            .filter_map(|process| process.ok()?.stat().ok())
            .map(|stat| ProcessRecord {
                pid: stat.pid,
                parent_pid: stat.ppid,
                start_time: stat.starttime,
                is_zombie: stat.state == 'Z',
            })
            .collect())
    }
}

/// Split a `cmdline`/`environ` style buffer into its entries.
///
/// Only one trailing NUL is dropped, so trailing empty arguments survive. A
/// process that rewrote its argument area without separators ends up as a
/// single entry.
fn split_nul_separated(raw: &[u8]) -> Vec<Vec<u8>> {
    let raw = raw.strip_suffix(b"\0").unwrap_or(raw);
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(|&b| b == 0).map(<[u8]>::to_vec).collect()
}
