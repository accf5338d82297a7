use crate::events::{EventSource, SubscribeError};
use crate::prelude::*;
use crate::process::{Pid, ProcessTable};

/// PID of init, the root of the whole process tree.
pub const INIT_PID: Pid = 1;

/// Full enumerations attempted before giving up on a clean snapshot.
pub const MAX_ENUMERATION_ATTEMPTS: usize = 64;

/// Subscribe to init, the root of a system-wide trace, then to every other
/// live process through [`arm_all`].
pub fn arm_system(source: &mut impl EventSource, procs: &impl ProcessTable) -> Result<usize> {
    source.subscribe(INIT_PID).context("Failed to trace init")?;
    Ok(arm_all(source, procs)? + 1)
}

/// Subscribe to every live process on the host, except kernel threads and
/// the processes without a parent.
///
/// A process that exits between being listed and being subscribed makes the
/// whole enumeration start over, so that its children (reparented in the
/// meantime) are not missed. Returns the number of processes subscribed by the
/// enumeration that completed, 0 if none did.
pub fn arm_all(source: &mut impl EventSource, procs: &impl ProcessTable) -> Result<usize> {
    for attempt in 1..=MAX_ENUMERATION_ATTEMPTS {
        let processes = procs
            .list_all()
            .context("Failed to enumerate running processes")?;

        let mut armed = 0;
        let mut vanished = None;
        for process in processes
            .iter()
            .filter(|p| p.pid != 0 && p.parent_pid != 0 && !p.is_zombie)
        {
            match source.subscribe(process.pid) {
                Ok(()) => armed += 1,
                Err(SubscribeError::NoSuchProcess(pid)) => {
                    vanished = Some(pid);
                    break;
                }
                Err(err) => warn!("{err}"),
            }
        }

        match vanished {
            None => {
                debug!("Subscribed to {armed} processes after {attempt} enumeration(s)");
                return Ok(armed);
            }
            Some(pid) => debug!("Process {pid} vanished during enumeration, starting over"),
        }
    }

    warn!(
        "Processes kept exiting during {MAX_ENUMERATION_ATTEMPTS} enumerations, some of them may not be traced"
    );
    Ok(0)
}
