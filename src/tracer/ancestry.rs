use super::ledger::Ledger;
use crate::process::{Pid, ProcessRecord, ProcessTable};
use std::collections::{HashMap, HashSet, VecDeque};

pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Position of a process relative to the scope root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ancestry {
    /// Number of parent hops from the root, the root itself being 0
    Within(u32),
    OutOfScope,
}

#[derive(Debug, Clone, Copy)]
struct CachedDepth {
    depth: u32,
    start_time: u64,
}

/// Depths of intermediate ancestors that never exec'd while being traced,
/// evicted in insertion order.
struct DepthCache {
    depths: HashMap<Pid, CachedDepth>,
    order: VecDeque<Pid>,
    capacity: usize,
}

impl DepthCache {
    fn new(capacity: usize) -> Self {
        Self {
            depths: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, pid: Pid) -> Option<CachedDepth> {
        self.depths.get(&pid).copied()
    }

    fn insert(&mut self, pid: Pid, entry: CachedDepth) {
        if self.depths.insert(pid, entry).is_some() {
            return;
        }
        self.order.push_back(pid);
        while self.depths.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.depths.remove(&oldest);
        }
    }

    fn remove(&mut self, pid: Pid) {
        if self.depths.remove(&pid).is_some() {
            self.order.retain(|&p| p != pid);
        }
    }
}

/// Computes how deep below the scope root a process sits.
pub struct AncestryResolver {
    root: Pid,
    /// Process that inherits orphans of the traced subtree, if it is not the root
    adopter: Option<Pid>,
    cache: DepthCache,
}

impl AncestryResolver {
    pub fn new(root: Pid, adopter: Option<Pid>) -> Self {
        Self::with_cache_capacity(root, adopter, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(root: Pid, adopter: Option<Pid>, capacity: usize) -> Self {
        Self {
            root,
            adopter,
            cache: DepthCache::new(capacity),
        }
    }

    pub fn root(&self) -> Pid {
        self.root
    }

    pub fn resolve(&mut self, pid: Pid, ledger: &Ledger, procs: &impl ProcessTable) -> Ancestry {
        if pid == self.root {
            return Ancestry::Within(0);
        }
        match procs.process(pid) {
            Some(record) => self.resolve_record(record, ledger, procs),
            None => Ancestry::OutOfScope,
        }
    }

    /// Resolve the depth of an already fetched process.
    ///
    /// Walks up the parent chain until it reaches the root, the adopter, or an
    /// ancestor whose depth is already known. Every ancestor visited on the way
    /// is cached.
    pub fn resolve_record(
        &mut self,
        record: ProcessRecord,
        ledger: &Ledger,
        procs: &impl ProcessTable,
    ) -> Ancestry {
        if record.pid == self.root {
            return Ancestry::Within(0);
        }

        let mut chain = vec![record];
        let mut visited = HashSet::from([record.pid]);
        let mut current = record;

        let base = loop {
            let parent = current.parent_pid;
            if parent == self.root || Some(parent) == self.adopter {
                break 0;
            }
            if parent == 0 || !visited.insert(parent) {
                return Ancestry::OutOfScope;
            }

            let Some(parent_record) = procs.process(parent) else {
                return Ancestry::OutOfScope;
            };
            if let Some(depth) = self.known_depth(&parent_record, ledger) {
                break depth;
            }

            chain.push(parent_record);
            current = parent_record;
        };

        // chain[0] is the queried process, the last element sits right below `base`
        let depth_of = |index: usize| base + (chain.len() - index) as u32;
        for (index, ancestor) in chain.iter().enumerate().skip(1) {
            self.cache.insert(
                ancestor.pid,
                CachedDepth {
                    depth: depth_of(index),
                    start_time: ancestor.start_time,
                },
            );
        }
        Ancestry::Within(depth_of(0))
    }

    /// Drop whatever is cached for `pid`, typically because it exited or is
    /// now tracked in the ledger.
    pub fn forget(&mut self, pid: Pid) {
        self.cache.remove(pid);
    }

    fn known_depth(&mut self, record: &ProcessRecord, ledger: &Ledger) -> Option<u32> {
        if let Some(entry) = ledger.get(record.pid) {
            if entry.generation == record.start_time {
                return Some(entry.depth);
            }
        }
        match self.cache.get(record.pid) {
            Some(cached) if cached.start_time == record.start_time => Some(cached.depth),
            Some(_) => {
                self.cache.remove(record.pid);
                None
            }
            None => None,
        }
    }
}
