use crate::prelude::*;
use crate::process::Pid;
use std::collections::HashMap;
use std::time::Duration;

/// Longest command label kept for exit and re-exec lines.
pub const MAX_LABEL_LEN: usize = 32;

/// What the tracer remembers about a process it printed an exec line for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub depth: u32,
    /// Timestamp of the exec that created or last updated the entry
    pub start: Duration,
    /// Kernel start time of the process, see [`crate::process::ProcessRecord::start_time`]
    pub generation: u64,
    pub label: Vec<u8>,
}

impl LedgerEntry {
    pub fn new(depth: u32, start: Duration, generation: u64, label: &[u8]) -> Self {
        let label = &label[..label.len().min(MAX_LABEL_LEN)];
        Self {
            depth,
            start,
            generation,
            label: label.to_vec(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Claim {
    Inserted,
    /// The pid was already tracked, the previous entry is returned
    Replaced(LedgerEntry),
    /// The ledger was full, the entry of the given pid was dropped to make room
    Evicted(Pid),
}

/// Active pids and their ledger entries, bounded by a fixed capacity.
pub struct Ledger {
    entries: HashMap<Pid, LedgerEntry>,
    capacity: usize,
    /// Times the "ledger full" warning was logged, at most once
    full_warnings: u32,
}

impl Ledger {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
            full_warnings: 0,
        }
    }

    pub fn get(&self, pid: Pid) -> Option<&LedgerEntry> {
        self.entries.get(&pid)
    }

    /// Store `entry` for `pid`, overwriting an existing entry in place.
    ///
    /// When a new pid does not fit anymore, the entry with the oldest start is
    /// evicted first. That process will simply not get an exit line.
    pub fn claim(&mut self, pid: Pid, entry: LedgerEntry) -> Claim {
        if let Some(existing) = self.entries.get_mut(&pid) {
            return Claim::Replaced(std::mem::replace(existing, entry));
        }

        let mut claim = Claim::Inserted;
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.oldest() {
                self.entries.remove(&oldest);
                if self.full_warnings == 0 {
                    warn!(
                        "More than {} processes are being tracked, the oldest ones will not get an exit line",
                        self.capacity
                    );
                    self.full_warnings += 1;
                }
                debug!("Evicted pid {oldest} from the ledger");
                claim = Claim::Evicted(oldest);
            }
        }

        self.entries.insert(pid, entry);
        claim
    }

    pub fn release(&mut self, pid: Pid) -> Option<LedgerEntry> {
        self.entries.remove(&pid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn oldest(&self) -> Option<Pid> {
        self.entries
            .iter()
            .min_by_key(|(pid, entry)| (entry.start, **pid))
            .map(|(pid, _)| *pid)
    }
}
