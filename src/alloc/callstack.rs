//! Allocation-site identity. Captured traces are interned once and never
//! freed; records point at their interned stack and can be grouped by it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    alloc::{
        registry::AllocRecord,
        slab::{Handle, Slab},
        table::{Chained, ChainedTable},
    },
    error::Result,
    sync::Mutex,
};

pub const MAX_CALLSTACK_DEPTH: usize = 32;

/// Up to [`MAX_CALLSTACK_DEPTH`] return addresses, innermost first. Unused
/// frames are always zero, so two traces are equal iff they have the same
/// depth and the same frames.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Trace {
    depth: usize,
    frames: [usize; MAX_CALLSTACK_DEPTH],
}

impl Trace {
    pub const fn empty() -> Self {
        Self {
            depth: 0,
            frames: [0; MAX_CALLSTACK_DEPTH],
        }
    }

    /// Walk the calling thread's stack. This may allocate inside the unwinder,
    /// so callers on the allocation path must be inside a bypass.
    pub fn capture() -> Self {
        let mut trace = Self::empty();
        backtrace::trace(|frame| {
            trace.frames[trace.depth] = frame.ip() as usize;
            trace.depth += 1;
            trace.depth < MAX_CALLSTACK_DEPTH
        });
        trace
    }

    /// Build a trace from known frames, keeping at most
    /// [`MAX_CALLSTACK_DEPTH`] of them
    pub fn from_frames(frames: &[usize]) -> Self {
        let mut trace = Self::empty();
        trace.depth = frames.len().min(MAX_CALLSTACK_DEPTH);
        trace.frames[..trace.depth].copy_from_slice(&frames[..trace.depth]);
        trace
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.depth]
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    fn bucket(&self, nr_buckets: usize) -> usize {
        let sum = self.frames().iter().fold(0usize, |acc, &f| acc.wrapping_add(f));
        sum % nr_buckets
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct Frame(usize);

        impl fmt::Debug for Frame {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        f.debug_list()
            .entries(self.frames().iter().map(|&frame| Frame(frame)))
            .finish()
    }
}

/// An interned call stack
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackId(Handle);

/// Which of the two groupings a record is linked into
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Generation {
    Snapshot = 0,
    Current = 1,
}

/// A record's membership of its call stack's group. A record is in at most
/// one generation's group at a time.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct GroupLink {
    pub generation: Option<Generation>,
    pub prev: Option<Handle>,
    pub next: Option<Handle>,
}

#[derive(Clone, Copy)]
pub struct CallStackEntry {
    trace: Trace,
    usage: u64,
    heads: [Option<Handle>; 2],
    /// Scratch space for per-stack byte totals while reporting
    total_size: i64,
    chain_next: Option<Handle>,
}

impl CallStackEntry {
    fn new(trace: Trace) -> Self {
        Self {
            trace,
            usage: 1,
            heads: [None; 2],
            total_size: 0,
            chain_next: None,
        }
    }
}

impl Chained for CallStackEntry {
    type Key = Trace;

    fn key(&self) -> &Trace {
        &self.trace
    }

    fn bucket(key: &Trace, nr_buckets: usize) -> usize {
        key.bucket(nr_buckets)
    }

    fn chain_next(&self) -> Option<Handle> {
        self.chain_next
    }

    fn set_chain_next(&mut self, next: Option<Handle>) {
        self.chain_next = next;
    }
}

/// The table of distinct call stacks. Group links live in the records, which
/// belong to whoever owns the table they are in (the diagnostic worker); the
/// group heads live here, under the call-stack lock.
pub struct CallStacks {
    slab: Slab<CallStackEntry>,
    table: Mutex<ChainedTable<CallStackEntry>>,
}

impl CallStacks {
    pub fn new(nr_buckets: usize, batch_pages: usize) -> Result<Self> {
        Ok(Self {
            slab: Slab::new("callstack", batch_pages)?,
            table: Mutex::new(ChainedTable::new(nr_buckets)?),
        })
    }

    /// Find or create the entry for `trace`, counting one more use of it
    pub fn intern(&self, trace: &Trace) -> Result<StackId> {
        let table = self.table.lock();
        // SAFETY (for this function): we hold the table lock, which owns the
        // entries
        if let Some(handle) = unsafe { table.find(&self.slab, trace) } {
            unsafe { self.slab.update(handle, |entry| entry.usage += 1) };
            return Ok(StackId(handle));
        }
        let handle = self.slab.alloc(CallStackEntry::new(*trace))?;
        unsafe { table.insert(&self.slab, handle) };
        Ok(StackId(handle))
    }

    fn entry(&self, id: StackId) -> CallStackEntry {
        let _table = self.table.lock();
        // SAFETY: entries are never freed, and we hold the lock
        unsafe { self.slab.read(id.0) }
    }

    pub fn trace(&self, id: StackId) -> Trace {
        self.entry(id).trace
    }

    /// How many events were attributed to `id`
    pub fn usage(&self, id: StackId) -> u64 {
        self.entry(id).usage
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn group_head(&self, id: StackId, generation: Generation) -> Option<Handle> {
        self.entry(id).heads[generation as usize]
    }

    /// Put `record` at the head of its stack's `generation` group. Linking a
    /// record that is already in that group does nothing.
    ///
    /// # Safety
    /// - The caller must own `record` and every record in the group (they are
    ///   in tables only the caller touches)
    pub unsafe fn link(&self, records: &Slab<AllocRecord>, record: Handle, generation: Generation) {
        let _table = self.table.lock();
        let rec = unsafe { records.read(record) };
        let Some(stack) = rec.stack else {
            return;
        };
        if rec.group.generation == Some(generation) {
            return;
        }
        debug_assert!(rec.group.generation.is_none(), "record is in the other generation");
        let head = unsafe { self.slab.read(stack.0) }.heads[generation as usize];
        unsafe {
            records.update(record, |r| {
                r.group = GroupLink {
                    generation: Some(generation),
                    prev: None,
                    next: head,
                }
            });
            if let Some(head) = head {
                records.update(head, |r| r.group.prev = Some(record));
            }
            self.slab
                .update(stack.0, |entry| entry.heads[generation as usize] = Some(record));
        }
    }

    /// Take `record` out of its `generation` group, if it is in it
    ///
    /// # Safety
    /// - As for [`CallStacks::link`]
    pub unsafe fn unlink(&self, records: &Slab<AllocRecord>, record: Handle, generation: Generation) {
        let _table = self.table.lock();
        let rec = unsafe { records.read(record) };
        let Some(stack) = rec.stack else {
            return;
        };
        if rec.group.generation != Some(generation) {
            return;
        }
        let GroupLink { prev, next, .. } = rec.group;
        unsafe {
            match prev {
                Some(prev) => records.update(prev, |r| r.group.next = next),
                None => self
                    .slab
                    .update(stack.0, |entry| entry.heads[generation as usize] = next),
            }
            if let Some(next) = next {
                records.update(next, |r| r.group.prev = prev);
            }
            records.update(record, |r| r.group = GroupLink::default());
        }
    }

    /// First record of `id`'s `generation` group, in group order, for which
    /// `pred` holds
    ///
    /// # Safety
    /// - As for [`CallStacks::link`]
    pub unsafe fn find_in_group(
        &self,
        records: &Slab<AllocRecord>,
        id: StackId,
        generation: Generation,
        mut pred: impl FnMut(&AllocRecord) -> bool,
    ) -> Option<Handle> {
        let mut cursor = self.group_head(id, generation);
        while let Some(handle) = cursor {
            let rec = unsafe { records.read(handle) };
            if pred(&rec) {
                return Some(handle);
            }
            cursor = rec.group.next;
        }
        None
    }

    /// Visit the members of `id`'s `generation` group
    ///
    /// # Safety
    /// - As for [`CallStacks::link`]
    pub unsafe fn for_each_in_group(
        &self,
        records: &Slab<AllocRecord>,
        id: StackId,
        generation: Generation,
        mut f: impl FnMut(Handle, &AllocRecord),
    ) {
        let mut cursor = self.group_head(id, generation);
        while let Some(handle) = cursor {
            let rec = unsafe { records.read(handle) };
            f(handle, &rec);
            cursor = rec.group.next;
        }
    }

    /// Stacks whose group in any of `generations` is non-empty, in table order
    pub fn grouped_stacks(&self, generations: &[Generation]) -> Vec<StackId> {
        let table = self.table.lock();
        // SAFETY: locked
        unsafe { table.iter(&self.slab) }
            .filter(|&handle| {
                let entry = unsafe { self.slab.read(handle) };
                generations.iter().any(|&g| entry.heads[g as usize].is_some())
            })
            .map(StackId)
            .collect()
    }

    pub fn set_total(&self, id: StackId, total: i64) {
        let _table = self.table.lock();
        // SAFETY: locked
        unsafe { self.slab.update(id.0, |entry| entry.total_size = total) };
    }

    pub fn total(&self, id: StackId) -> i64 {
        self.entry(id).total_size
    }

    /// Empty every `generation` group and zero the totals. Records are not
    /// touched; they are expected to be discarded or unlinked already.
    pub fn reset_groups(&self, generation: Generation) {
        let table = self.table.lock();
        // SAFETY: locked
        for handle in unsafe { table.iter(&self.slab) } {
            unsafe {
                self.slab.update(handle, |entry| {
                    entry.heads[generation as usize] = None;
                    entry.total_size = 0;
                })
            };
        }
    }
}
