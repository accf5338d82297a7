//! Linux [`EventSource`]: the kernel process connector for exec and exit
//! events, and a signalfd for signals.

use crate::events::{Event, EventSource, ExitStatus, SignalKind, SubscribeError};
use crate::prelude::*;
use crate::process::Pid;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SigSet, Signal, kill};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use proc_connector::{ProcConnector, ProcEvent};
use std::collections::HashSet;
use std::io;
use std::os::fd::AsFd;
use std::time::Duration;

/// Datagrams read from the connector per batch.
const MAX_DATAGRAMS_PER_BATCH: usize = 64;

/// Set of watched thread group ids, which follows forks of its members.
#[derive(Debug, Default)]
pub struct WatchSet {
    watched: HashSet<Pid>,
}

impl WatchSet {
    pub fn insert(&mut self, pid: Pid) {
        self.watched.insert(pid);
    }

    pub fn remove(&mut self, pid: Pid) {
        self.watched.remove(&pid);
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.watched.contains(&pid)
    }

    pub fn len(&self) -> usize {
        self.watched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }

    /// Update the set with a raw connector event and return the event to
    /// deliver, if any.
    ///
    /// Only new processes (not threads) forked by a watched process join the
    /// set. Exec and exit events are reported for thread group leaders only.
    pub fn track(&mut self, event: ProcEvent) -> Option<Event> {
        match event {
            ProcEvent::Fork {
                parent_tgid,
                child_pid,
                child_tgid,
                ..
            } => {
                if child_pid == child_tgid && self.contains(parent_tgid) {
                    self.insert(child_tgid);
                }
                None
            }
            ProcEvent::Exec {
                tgid, timestamp_ns, ..
            } => self.contains(tgid).then(|| Event::Exec {
                pid: tgid,
                timestamp: Duration::from_nanos(timestamp_ns),
            }),
            ProcEvent::Exit {
                pid,
                tgid,
                exit_code,
                timestamp_ns,
                ..
            } => {
                if pid != tgid || !self.watched.remove(&tgid) {
                    return None;
                }
                Some(Event::Exit {
                    pid: tgid,
                    status: ExitStatus::from_wait_status(exit_code as i32),
                    timestamp: Duration::from_nanos(timestamp_ns),
                })
            }
            ProcEvent::Other { .. } => None,
        }
    }
}

/// Kernel queue of raw process events.
pub trait EventQueue {
    /// Next datagram worth of events, `None` once the queue is empty.
    fn recv(&mut self) -> io::Result<Option<Vec<ProcEvent>>>;
}

impl EventQueue for ProcConnector {
    fn recv(&mut self) -> io::Result<Option<Vec<ProcEvent>>> {
        ProcConnector::recv(self)
    }
}

/// Read queued process events into a batch, followed by the pending signals
/// once the queue is empty.
///
/// Signals are read before the queue, so every event that led to a signal is
/// delivered ahead of it. When the queue is not drained within one batch the
/// signals stay pending for the next one.
pub fn assemble_batch(
    queue: &mut impl EventQueue,
    watch_set: &mut WatchSet,
    pending_signals: &mut Vec<SignalKind>,
) -> Result<Vec<Event>> {
    let mut batch = Vec::new();
    let mut drained = false;
    for _ in 0..MAX_DATAGRAMS_PER_BATCH {
        match queue.recv() {
            Ok(Some(events)) => {
                batch.extend(events.into_iter().filter_map(|e| watch_set.track(e)));
            }
            Ok(None) => {
                drained = true;
                break;
            }
            Err(err) if err.raw_os_error() == Some(libc::ENOBUFS) => {
                warn!("The kernel dropped process events, some processes may be missing");
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).context("Failed to read process events"),
        }
    }

    if drained {
        batch.extend(pending_signals.drain(..).map(Event::Signal));
    }
    Ok(batch)
}

pub struct ConnectorSource {
    connector: ProcConnector,
    signals: SignalFd,
    watch_set: WatchSet,
    pending_signals: Vec<SignalKind>,
}

impl ConnectorSource {
    /// Connect to the kernel and start receiving the given signals as events.
    ///
    /// The signals are blocked for the calling thread, so this has to run
    /// before any other thread is started. Processes spawned afterwards
    /// inherit the blocked mask and have to clear it.
    pub fn open(kinds: &[SignalKind]) -> Result<Self> {
        let mut mask = SigSet::empty();
        for signal in kinds.iter().flat_map(|kind| kind.signals()) {
            mask.add(*signal);
        }
        mask.thread_block().context("Failed to block signals")?;
        let signals = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .context("Failed to create the signal file descriptor")?;

        let connector = ProcConnector::open()?;

        Ok(Self {
            connector,
            signals,
            watch_set: WatchSet::default(),
            pending_signals: Vec::new(),
        })
    }

    fn read_signals(&mut self) -> Result<()> {
        loop {
            match self.signals.read_signal() {
                Ok(Some(info)) => {
                    let kind = Signal::try_from(info.ssi_signo as i32)
                        .ok()
                        .and_then(SignalKind::from_signal);
                    match kind {
                        Some(kind) => self.pending_signals.push(kind),
                        None => debug!("Ignoring signal {}", info.ssi_signo),
                    }
                }
                Ok(None) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("Failed to read pending signals"),
            }
        }
    }
}

impl EventSource for ConnectorSource {
    fn next_batch(&mut self) -> Result<Vec<Event>> {
        loop {
            // Pending signals only wait for the connector queue to drain
            let timeout = if self.pending_signals.is_empty() {
                PollTimeout::NONE
            } else {
                PollTimeout::ZERO
            };
            let signals_ready = {
                let mut fds = [
                    PollFd::new(self.connector.as_fd(), PollFlags::POLLIN),
                    PollFd::new(self.signals.as_fd(), PollFlags::POLLIN),
                ];
                match poll(&mut fds, timeout) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(err) => return Err(err).context("Failed to wait for events"),
                }
                fds[1].revents().is_some_and(|r| !r.is_empty())
            };

            if signals_ready {
                self.read_signals()?;
            }
            let batch = assemble_batch(
                &mut self.connector,
                &mut self.watch_set,
                &mut self.pending_signals,
            )?;
            if !batch.is_empty() {
                return Ok(batch);
            }
        }
    }

    fn subscribe(&mut self, pid: Pid) -> Result<(), SubscribeError> {
        // Signal 0 only checks that the process exists
        match kill(nix::unistd::Pid::from_raw(pid), None) {
            Ok(()) | Err(Errno::EPERM) => {
                self.watch_set.insert(pid);
                Ok(())
            }
            Err(Errno::ESRCH) => Err(SubscribeError::NoSuchProcess(pid)),
            Err(err) => Err(SubscribeError::Failed {
                pid,
                source: err.into(),
            }),
        }
    }

    fn unsubscribe(&mut self, pid: Pid) {
        self.watch_set.remove(pid);
    }
}
