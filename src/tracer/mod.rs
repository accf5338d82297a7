//! The event dispatch loop and the state it owns.

pub mod ancestry;
pub mod bootstrap;
pub mod format;
pub mod ledger;

#[cfg(test)]
mod tests;

use crate::config::DisplayOptions;
use crate::events::{Event, EventSource, ExitStatus, SignalKind};
use crate::prelude::*;
use crate::process::{Pid, ProcessTable, Reap, Reaper};
use ancestry::{Ancestry, AncestryResolver};
use ledger::{Claim, Ledger, LedgerEntry};
use std::io::{ErrorKind, Write};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TraceSettings {
    pub display: DisplayOptions,
    /// Depth 0 of the traced tree, init when tracing the whole system
    pub root: Pid,
    /// Process that inherits orphans of the traced tree, when it is not `root`
    pub adopter: Option<Pid>,
    /// The command spawned by the tracer, whose end terminates the trace
    pub spawned: Option<Pid>,
    pub ledger_capacity: usize,
}

pub struct Tracer<S, P, R, W> {
    source: S,
    procs: P,
    reaper: R,
    output: W,
    display: DisplayOptions,
    resolver: AncestryResolver,
    ledger: Ledger,
    spawned: Option<Pid>,
    spawned_reaped: bool,
    running: bool,
}

impl<S: EventSource, P: ProcessTable, R: Reaper, W: Write> Tracer<S, P, R, W> {
    pub fn new(
        source: S,
        procs: P,
        reaper: R,
        output: W,
        settings: TraceSettings,
    ) -> Self {
        Self {
            source,
            procs,
            reaper,
            output,
            display: settings.display,
            resolver: AncestryResolver::new(settings.root, settings.adopter),
            ledger: Ledger::with_capacity(settings.ledger_capacity),
            spawned: settings.spawned,
            spawned_reaped: false,
            running: true,
        }
    }

    /// Handle events until interrupted, or until the spawned command and all
    /// of its descendants are gone.
    pub fn run(&mut self) -> Result<()> {
        while self.running {
            let batch = self.source.next_batch()?;
            for event in batch {
                if !self.running {
                    break;
                }
                self.handle(event)?;
            }
        }

        match self.output.flush() {
            Err(err) if err.kind() != ErrorKind::BrokenPipe => {
                Err(err).context("Failed to flush the trace output")
            }
            _ => Ok(()),
        }
    }

    pub fn into_output(self) -> W {
        self.output
    }

    fn handle(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Exec { pid, timestamp } => self.handle_exec(pid, timestamp),
            Event::Exit {
                pid,
                status,
                timestamp,
            } => self.handle_exit(pid, status, timestamp),
            Event::Signal(SignalKind::Child) => self.reap_children(),
            Event::Signal(SignalKind::Interrupt) => {
                debug!("Interrupted, stopping");
                self.running = false;
                Ok(())
            }
        }
    }

    fn handle_exec(&mut self, pid: Pid, timestamp: Duration) -> Result<()> {
        let Some(record) = self.procs.process(pid) else {
            trace!("Process {pid} exited before its exec could be handled");
            return Ok(());
        };
        let depth = match self.resolver.resolve_record(record, &self.ledger, &self.procs) {
            Ancestry::Within(depth) => depth,
            Ancestry::OutOfScope => return Ok(()),
        };

        let reexec_line = match self.ledger.get(pid) {
            Some(previous) if previous.generation == record.start_time => self
                .display
                .show_exit
                .then(|| format::render_reexec(pid, previous, timestamp, &self.display)),
            Some(_) => {
                debug!("Pid {pid} was reused, dropping the entry of its previous owner");
                None
            }
            None => None,
        };
        if let Some(line) = reexec_line {
            self.emit(&line)?;
        }

        let rendered = format::render_exec(pid, depth, &self.display, &self.procs);
        let entry = LedgerEntry::new(depth, timestamp, record.start_time, &rendered.label);
        if let Claim::Evicted(evicted) = self.ledger.claim(pid, entry) {
            trace!("Process {evicted} will not get an exit line");
        }
        self.resolver.forget(pid);

        self.emit(&rendered.line)
    }

    fn handle_exit(&mut self, pid: Pid, status: ExitStatus, timestamp: Duration) -> Result<()> {
        self.resolver.forget(pid);
        self.source.unsubscribe(pid);

        let Some(entry) = self.ledger.release(pid) else {
            return Ok(());
        };
        if !self.display.show_exit {
            return Ok(());
        }

        let line = format::render_exit(pid, &entry, status, timestamp, &self.display);
        self.emit(&line)
    }

    fn reap_children(&mut self) -> Result<()> {
        loop {
            match self.reaper.reap()? {
                Reap::Exited {
                    pid,
                    status,
                    timestamp,
                } => {
                    if Some(pid) == self.spawned {
                        debug!("Command {pid} terminated with {status}");
                        self.spawned_reaped = true;
                    }
                    self.handle_exit(pid, status, timestamp)?;
                }
                Reap::StillRunning => return Ok(()),
                Reap::NoChildren => {
                    if self.spawned_reaped {
                        debug!("The command and all of its descendants are done");
                        self.running = false;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Write one complete line. A closed pipe ends the trace quietly.
    fn emit(&mut self, line: &[u8]) -> Result<()> {
        let written = self
            .output
            .write_all(line)
            .and_then(|_| self.output.flush());
        match written {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                debug!("Output closed, stopping");
                self.running = false;
                Ok(())
            }
            Err(err) => Err(err).context("Failed to write the trace output"),
        }
    }
}
