//! Copies of the live table, and what changed between two of them.
//!
//! A diff pairs every current record with a snapshot record, first by exact
//! identity (address, size, call stack) and then by any snapshot record of the
//! same size from the same call stack. Whatever is left unpaired on either
//! side has appeared or disappeared since the snapshot.

use log::Level;
use serde::{Deserialize, Serialize};

use crate::{
    alloc::{
        callstack::{Generation, StackId},
        registry::AllocRecord,
        slab::Handle,
        table::PtrTable,
    },
    engine::Engine,
    error::{Error, Result},
    report::Report,
    serialize::serde_hex,
};

/// One block in a listing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    #[serde(with = "serde_hex")]
    pub ptr: usize,
    pub size: usize,
    pub stack: Option<StackId>,
}

impl From<&AllocRecord> for BlockInfo {
    fn from(record: &AllocRecord) -> Self {
        Self {
            ptr: record.block.user_ptr,
            size: record.block.user_size,
            stack: record.stack,
        }
    }
}

/// Blocks sharing a call stack. `decreased` is empty outside of diffs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackGroup {
    pub stack: StackId,
    pub increased: Vec<usize>,
    pub decreased: Vec<usize>,
    /// Bytes in `increased` minus bytes in `decreased`
    pub total: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffMode {
    Flat,
    ByCallStack,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffReport {
    /// Blocks live now that have no counterpart in the snapshot
    pub increased: Vec<BlockInfo>,
    /// Snapshot blocks that have no counterpart now
    pub decreased: Vec<BlockInfo>,
    /// Only filled in by [`DiffMode::ByCallStack`]
    pub groups: Vec<StackGroup>,
}

impl DiffReport {
    pub fn is_unchanged(&self) -> bool {
        self.increased.is_empty() && self.decreased.is_empty()
    }
}

impl Engine {
    /// Deep-copy every record of `src` into `dst`
    pub(crate) fn duplicate(
        &self,
        src: &PtrTable<AllocRecord>,
        dst: &PtrTable<AllocRecord>,
    ) -> Result<usize> {
        let guard = src.lock();
        let mut copied = 0;
        for handle in src.iter(&self.records, &guard) {
            // SAFETY: `src` is locked
            let record = unsafe { self.records.read(handle) };
            let copy = self
                .records
                .alloc(AllocRecord::new(record.block, record.stack))?;
            dst.insert(&self.records, copy);
            copied += 1;
        }
        Ok(copied)
    }

    /// Replace the snapshot with a copy of the live table
    pub fn create_snapshot(&self) -> Result<usize> {
        let _bypass = self.hooks.bypass();
        let _diag = self.diag.lock();
        self.snapshot.destroy(&self.records);
        match self.duplicate(&self.live, &self.snapshot) {
            Ok(copied) => {
                self.with_report(Level::Info, |r| {
                    r.line(format_args!("snapshot created ({copied} blocks)"))
                });
                Ok(copied)
            }
            Err(e) => {
                self.snapshot.destroy(&self.records);
                Err(e)
            }
        }
    }

    pub fn destroy_snapshot(&self) -> usize {
        let _bypass = self.hooks.bypass();
        let _diag = self.diag.lock();
        let destroyed = self.snapshot.destroy(&self.records);
        self.with_report(Level::Info, |r| {
            r.line(format_args!("snapshot destroyed ({destroyed} blocks)"))
        });
        destroyed
    }

    pub fn has_snapshot(&self) -> bool {
        !self.snapshot.is_empty()
    }

    fn require_callstack(&self, operation: &'static str) -> Result<()> {
        if self.config.features.callstack {
            Ok(())
        } else {
            Err(Error::FeatureDisabled { operation })
        }
    }

    fn link_all(&self, table: &PtrTable<AllocRecord>, generation: Generation) {
        let guard = table.lock();
        for handle in table.iter(&self.records, &guard) {
            // SAFETY: copy tables are only touched under the diag lock
            unsafe { self.stacks.link(&self.records, handle, generation) };
        }
    }

    fn collect(&self, table: &PtrTable<AllocRecord>) -> Vec<BlockInfo> {
        let guard = table.lock();
        let mut blocks: Vec<BlockInfo> = table
            .iter(&self.records, &guard)
            // SAFETY: locked
            .map(|handle| BlockInfo::from(&unsafe { self.records.read(handle) }))
            .collect();
        self.config.sort.sort_by_key(&mut blocks, |b| b.size);
        blocks
    }

    /// Sizes in every non-empty group of `generations`, with per-stack totals
    fn collect_groups(&self, generations: &[Generation]) -> Vec<StackGroup> {
        let mut groups: Vec<StackGroup> = self
            .stacks
            .grouped_stacks(generations)
            .into_iter()
            .map(|stack| {
                let mut sizes = [Vec::new(), Vec::new()];
                for &generation in generations {
                    // SAFETY: grouped records live in copy tables, which are
                    // only touched under the diag lock
                    unsafe {
                        self.stacks
                            .for_each_in_group(&self.records, stack, generation, |_, r| {
                                sizes[generation as usize].push(r.block.user_size)
                            })
                    };
                }
                let [mut decreased, mut increased] = sizes;
                self.config.sort.sort_by_key(&mut increased, |&s| s);
                self.config.sort.sort_by_key(&mut decreased, |&s| s);
                let total = increased.iter().sum::<usize>() as i64
                    - decreased.iter().sum::<usize>() as i64;
                self.stacks.set_total(stack, total);
                StackGroup {
                    stack,
                    increased,
                    decreased,
                    total,
                }
            })
            .collect();
        self.config.sort.sort_by_key(&mut groups, |g| g.total);
        groups
    }

    fn print_blocks(&self, r: &mut Report<'_>, blocks: &[BlockInfo]) {
        for (i, block) in blocks.iter().enumerate() {
            r.line(format_args!("block {i}: {:#x} ({} bytes)", block.ptr, block.size));
            if self.config.features.callstack {
                self.print_stack(r, block.stack);
            }
            r.separator();
        }
    }

    fn print_groups(&self, r: &mut Report<'_>, groups: &[StackGroup]) {
        for (i, group) in groups.iter().enumerate() {
            let sizes = group
                .increased
                .iter()
                .map(|s| s.to_string())
                .chain(group.decreased.iter().map(|s| format!("-{s}")))
                .collect::<Vec<_>>()
                .join(" ");
            r.line(format_args!(
                "group {i}: {sizes} (total {} bytes)",
                self.stacks.total(group.stack)
            ));
            self.print_stack(r, Some(group.stack));
            r.separator();
        }
    }

    /// Every live block, largest first by default
    pub fn list_all(&self) -> Vec<BlockInfo> {
        let _bypass = self.hooks.bypass();
        let _diag = self.diag.lock();
        let blocks = self.collect(&self.live);
        self.with_report(Level::Info, |r| {
            self.print_blocks(r, &blocks);
            r.line(format_args!("{} blocks", blocks.len()));
        });
        blocks
    }

    /// Every live block, grouped by the call stack that allocated it
    pub fn list_by_callstack(&self) -> Result<Vec<StackGroup>> {
        self.require_callstack("listing by call stack")?;
        let _bypass = self.hooks.bypass();
        let _diag = self.diag.lock();
        self.current_copy.destroy(&self.records);
        let groups = self
            .duplicate(&self.live, &self.current_copy)
            .map(|_| {
                self.link_all(&self.current_copy, Generation::Current);
                self.collect_groups(&[Generation::Current])
            });
        if let Ok(groups) = &groups {
            self.with_report(Level::Info, |r| self.print_groups(r, groups));
        }
        self.stacks.reset_groups(Generation::Current);
        self.current_copy.destroy(&self.records);
        groups
    }

    /// Compare the live table against the snapshot. Without a snapshot every
    /// live block counts as increased.
    pub fn compare(&self, mode: DiffMode) -> Result<DiffReport> {
        if mode == DiffMode::ByCallStack {
            self.require_callstack("comparing by call stack")?;
        }
        let _bypass = self.hooks.bypass();
        let _diag = self.diag.lock();
        self.current_copy.destroy(&self.records);
        self.snapshot_copy.destroy(&self.records);
        let diff = self.diff(mode);
        // group totals live in the stack table until the reset below
        if let Ok(diff) = &diff {
            self.with_report(Level::Info, |r| match mode {
                DiffMode::Flat => {
                    if diff.increased.is_empty() {
                        r.line(format_args!("no block increased"));
                    } else {
                        r.line(format_args!("{} blocks increased:", diff.increased.len()));
                        self.print_blocks(r, &diff.increased);
                    }
                    if diff.decreased.is_empty() {
                        r.line(format_args!("no block decreased"));
                    } else {
                        r.line(format_args!("{} blocks decreased:", diff.decreased.len()));
                        self.print_blocks(r, &diff.decreased);
                    }
                    if diff.is_unchanged() {
                        r.line(format_args!("no block changed"));
                    }
                }
                DiffMode::ByCallStack => {
                    if diff.is_unchanged() {
                        r.line(format_args!("no block changed"));
                    }
                    self.print_groups(r, &diff.groups);
                }
            });
        }
        if self.config.features.callstack {
            self.stacks.reset_groups(Generation::Current);
            self.stacks.reset_groups(Generation::Snapshot);
        }
        self.current_copy.destroy(&self.records);
        self.snapshot_copy.destroy(&self.records);
        diff
    }

    /// The matching pass. Leaves the unmatched records in the copy tables
    /// and, with call stacks on, in their groups.
    fn diff(&self, mode: DiffMode) -> Result<DiffReport> {
        self.duplicate(&self.live, &self.current_copy)?;
        self.duplicate(&self.snapshot, &self.snapshot_copy)?;
        let grouped = self.config.features.callstack;
        if grouped {
            self.link_all(&self.current_copy, Generation::Current);
            self.link_all(&self.snapshot_copy, Generation::Snapshot);
        }

        let guard = self.current_copy.lock();
        for handle in self.current_copy.iter(&self.records, &guard) {
            // SAFETY: copy tables are only touched under the diag lock
            let record = unsafe { self.records.read(handle) };
            let Some(partner) = self.find_partner(&record, grouped) else {
                continue;
            };
            // SAFETY: as above
            let partner_ptr = unsafe { self.records.read(partner) }.block.user_ptr;
            if grouped {
                // SAFETY: as above
                unsafe {
                    self.stacks.unlink(&self.records, handle, Generation::Current);
                    self.stacks.unlink(&self.records, partner, Generation::Snapshot);
                }
            }
            self.current_copy
                .remove_exact(&self.records, record.block.user_ptr, handle);
            self.snapshot_copy
                .remove_exact(&self.records, partner_ptr, partner);
            // SAFETY: both were just unlinked from everything; the iterator
            // has already moved past `handle`
            unsafe {
                self.records.free(handle);
                self.records.free(partner);
            }
        }
        drop(guard);

        let groups = match mode {
            DiffMode::Flat => Vec::new(),
            DiffMode::ByCallStack => {
                self.collect_groups(&[Generation::Current, Generation::Snapshot])
            }
        };
        Ok(DiffReport {
            increased: self.collect(&self.current_copy),
            decreased: self.collect(&self.snapshot_copy),
            groups,
        })
    }

    /// The snapshot record `record` pairs with: the same block if it is still
    /// there, or else the first same-sized block from the same call stack
    fn find_partner(&self, record: &AllocRecord, grouped: bool) -> Option<Handle> {
        let exact = self
            .snapshot_copy
            .find(&self.records, record.block.user_ptr)
            .filter(|&h| {
                // SAFETY: copy tables are only touched under the diag lock
                let candidate = unsafe { self.records.read(h) };
                candidate.block.user_size == record.block.user_size
                    && candidate.stack == record.stack
            });
        if exact.is_some() || !grouped {
            return exact;
        }
        let stack = record.stack?;
        let size = record.block.user_size;
        // SAFETY: as above
        unsafe {
            self.stacks
                .find_in_group(&self.records, stack, Generation::Snapshot, |candidate| {
                    candidate.block.user_size == size
                })
        }
    }
}
