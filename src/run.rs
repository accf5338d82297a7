use crate::config::{Config, Scope};
use crate::events::{EventSource, SignalKind};
use crate::prelude::*;
use crate::process::{Pid, ProcFs, WaitReaper};
use crate::source::ConnectorSource;
use crate::tracer::bootstrap::{self, INIT_PID};
use crate::tracer::{TraceSettings, Tracer};
use nix::sys::signal::SigSet;
use std::os::unix::process::CommandExt;
use std::process::Command;

/// Set everything up for the configured scope and trace until done.
pub fn run(config: Config) -> Result<()> {
    let output = config.output.open()?;

    let signals: &[SignalKind] = match config.scope {
        Scope::Command(_) => &[SignalKind::Interrupt, SignalKind::Child],
        _ => &[SignalKind::Interrupt],
    };
    let mut source = ConnectorSource::open(signals).context("Failed to listen to process events")?;
    let procs = ProcFs::new();

    let (root, adopter, spawned) = match &config.scope {
        Scope::System => {
            let armed = bootstrap::arm_system(&mut source, &procs)?;
            info!("Tracing {armed} running processes and their descendants");
            (INIT_PID, None, None)
        }
        Scope::Pid(pid) => {
            source
                .subscribe(*pid)
                .with_context(|| format!("Failed to trace process {pid}"))?;
            (*pid, None, None)
        }
        Scope::Command(command) => {
            let child = spawn_traced(&mut source, command)?;
            (child, Some(std::process::id() as Pid), Some(child))
        }
    };

    let settings = TraceSettings {
        display: config.display,
        root,
        adopter,
        spawned,
        ledger_capacity: config.ledger_capacity,
    };
    let mut tracer = Tracer::new(source, procs, WaitReaper, output, settings);
    tracer.run()
}

/// Start `command` with the tracer as subreaper of its whole subtree.
///
/// The tracer watches itself before spawning, so the command is already
/// watched when it execs.
fn spawn_traced(source: &mut ConnectorSource, command: &[String]) -> Result<Pid> {
    let Some((program, args)) = command.split_first() else {
        bail!("No command to run");
    };

    if let Err(err) = nix::sys::prctl::set_child_subreaper(true) {
        warn!("Failed to become subreaper, orphaned processes will not be traced: {err}");
    }
    source
        .subscribe(std::process::id() as Pid)
        .context("Failed to watch the tracer itself")?;

    let mut cmd = Command::new(program);
    cmd.args(args);
    // Blocked signals stay blocked across exec, the command starts with none
    unsafe {
        cmd.pre_exec(|| {
            SigSet::empty().thread_set_mask()?;
            Ok(())
        });
    }
    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to run {program}"))?;
    let pid = child.id() as Pid;
    debug!("Started {program} as process {pid}");

    Ok(pid)
}
