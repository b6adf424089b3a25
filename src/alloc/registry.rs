//! Registering and unregistering user blocks. This is the allocation hot
//! path: nothing here may allocate or log outside a bypass, and no report is
//! written while a table lock is held.

use std::sync::atomic::{AtomicU64, Ordering};

use log::Level;
use serde::{Deserialize, Serialize};

use crate::{
    alloc::{
        callstack::{GroupLink, StackId, Trace},
        real,
        redzone::{MemoryBlock, RedzoneCheck},
        ring::FreeRing,
        slab::Handle,
        table::Chained,
    },
    arch::mem::copy_maybe_garbage,
    engine::Engine,
    error::{Error, Result},
    report::{format_timestamp, Report},
    util::num::{log4ceil, scale_bytes},
};

pub const HISTOGRAM_BINS: usize = 10;

/// A live block, keyed by its user pointer
#[derive(Clone, Copy, Debug)]
pub struct AllocRecord {
    pub block: MemoryBlock,
    pub stack: Option<StackId>,
    pub group: GroupLink,
    chain_next: Option<Handle>,
}

impl AllocRecord {
    pub fn new(block: MemoryBlock, stack: Option<StackId>) -> Self {
        Self {
            block,
            stack,
            group: GroupLink::default(),
            chain_next: None,
        }
    }
}

impl Chained for AllocRecord {
    type Key = usize;

    fn key(&self) -> &usize {
        &self.block.user_ptr
    }

    fn bucket(key: &usize, nr_buckets: usize) -> usize {
        key % nr_buckets
    }

    fn chain_next(&self) -> Option<Handle> {
        self.chain_next
    }

    fn set_chain_next(&mut self, next: Option<Handle>) {
        self.chain_next = next;
    }
}

/// A freed block whose buffer is still held by the delayed-free ring
#[derive(Clone, Copy, Debug)]
pub struct FreedRecord {
    pub block: MemoryBlock,
    pub alloc_stack: Option<StackId>,
    pub free_stack: Option<StackId>,
    chain_next: Option<Handle>,
}

impl Chained for FreedRecord {
    type Key = usize;

    fn key(&self) -> &usize {
        &self.block.user_ptr
    }

    fn bucket(key: &usize, nr_buckets: usize) -> usize {
        key % nr_buckets
    }

    fn chain_next(&self) -> Option<Handle> {
        self.chain_next
    }

    fn set_chain_next(&mut self, next: Option<Handle>) {
        self.chain_next = next;
    }
}

/// Live blocks by size, in power-of-4 bins: `1 - 4`, `5 - 16`, ...,
/// `262145 - `
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Histogram {
    pub bins: [usize; HISTOGRAM_BINS],
}

impl Histogram {
    pub fn bin_of(size: usize) -> usize {
        (log4ceil(size).saturating_sub(1) as usize).min(HISTOGRAM_BINS - 1)
    }

    /// Inclusive size range of `bin`; the last bin is open
    pub fn bounds(bin: usize) -> (usize, Option<usize>) {
        let upper = 4usize.pow(bin as u32 + 1);
        let lower = if bin == 0 { 1 } else { upper / 4 + 1 };
        if bin + 1 == HISTOGRAM_BINS {
            (lower, None)
        } else {
            (lower, Some(upper))
        }
    }

    fn add(&mut self, size: usize) {
        self.bins[Self::bin_of(size)] += 1;
    }

    fn remove(&mut self, size: usize) {
        let bin = &mut self.bins[Self::bin_of(size)];
        *bin = bin.saturating_sub(1);
    }

    pub fn total(&self) -> usize {
        self.bins.iter().sum()
    }
}

/// Aggregate counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub live_blocks: usize,
    pub allocated_bytes: usize,
    pub total_allocs: u64,
    pub total_frees: u64,
}

/// Everything behind the manage lock: the counters and the delayed-free ring
pub(crate) struct Manage {
    pub status: Status,
    pub histogram: Histogram,
    pub ring: Option<FreeRing>,
}

impl Manage {
    pub fn new(ring: Option<FreeRing>) -> Self {
        Self {
            status: Status::default(),
            histogram: Histogram::default(),
            ring,
        }
    }

    fn on_alloc(&mut self, size: usize) {
        self.status.live_blocks += 1;
        self.status.allocated_bytes += size;
        self.status.total_allocs += 1;
        self.histogram.add(size);
    }

    fn on_free(&mut self, size: usize) {
        self.status.live_blocks -= 1;
        self.status.allocated_bytes -= size;
        self.status.total_frees += 1;
        self.histogram.remove(size);
    }
}

/// A detected heap violation. These are reported, never returned as errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Violation {
    Underrun,
    Overrun,
    WriteAfterFree,
    DoubleFree,
    UnknownAddress,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationCounts {
    pub underrun: u64,
    pub overrun: u64,
    pub write_after_free: u64,
    pub double_free: u64,
    pub unknown_address: u64,
    /// Tracking operations abandoned because metadata could not be allocated
    pub exhaustion: u64,
}

impl ViolationCounts {
    pub fn total(&self) -> u64 {
        self.underrun + self.overrun + self.write_after_free + self.double_free + self.unknown_address
    }
}

#[derive(Default)]
pub(crate) struct ViolationCounters {
    counts: [AtomicU64; 6],
}

impl ViolationCounters {
    pub fn record(&self, violation: Violation) {
        self.counts[violation as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exhaustion(&self) {
        self.counts[5].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ViolationCounts {
        let c = |i: usize| self.counts[i].load(Ordering::Relaxed);
        ViolationCounts {
            underrun: c(Violation::Underrun as usize),
            overrun: c(Violation::Overrun as usize),
            write_after_free: c(Violation::WriteAfterFree as usize),
            double_free: c(Violation::DoubleFree as usize),
            unknown_address: c(Violation::UnknownAddress as usize),
            exhaustion: c(5),
        }
    }
}

/// When a live block's redzones were found broken
#[derive(Clone, Copy, Debug)]
pub(crate) enum CheckedAt<'a> {
    /// During a check-all sweep
    Sweep,
    /// While being freed by the holder of this stack (`None`: the current
    /// one)
    Free(Option<&'a Trace>),
}

/// What became of a pointer handed to [`Engine::unregister`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unregistered {
    /// The buffer went straight back to the real allocator
    Released,
    /// The buffer is parked in the delayed-free ring
    Deferred,
    /// The pointer was already freed and is still remembered
    DoubleFree,
    /// The pointer was never handed out, or was freed too long ago
    UnknownAddress,
    /// The pointer was handed out inside a bypass and went straight back
    Untracked,
}

impl Engine {
    /// Track `block`, whose buffer the engine now owns until it is
    /// unregistered. Fails only if metadata could not be allocated, in which
    /// case the block stays untracked.
    ///
    /// # Safety
    /// - The whole buffer of `block` must be writable and must have come from
    ///   [`real::alloc`]
    pub unsafe fn register(&self, block: MemoryBlock, trace: Option<&Trace>) -> Result<()> {
        let stack = match trace {
            Some(trace) => Some(self.stacks.intern(trace)?),
            None => None,
        };
        let handle = self.records.alloc(AllocRecord::new(block, stack))?;
        if self.buffer_check() {
            // SAFETY: guaranteed by the caller
            unsafe { self.guard.arm_allocated(&block, true) };
        }
        self.live.insert(&self.records, handle);
        self.manage.lock().on_alloc(block.user_size);
        Ok(())
    }

    /// Stop tracking `ptr`. Its redzones are checked, then its buffer is
    /// either released or parked in the ring, evicting (and checking) the
    /// oldest parked buffer. Buffers handed out inside a bypass are released
    /// as they are; frees of unknown pointers are reported.
    ///
    /// # Safety
    /// - The caller must not use `ptr` afterwards
    pub unsafe fn unregister(&self, ptr: usize, freer: Option<&Trace>) -> Unregistered {
        let Some(handle) = self.live.remove(&self.records, ptr) else {
            if self.forget_untracked(ptr) {
                // SAFETY: untracked pointers came from the real allocator
                unsafe { real::free(ptr as *mut u8) };
                return Unregistered::Untracked;
            }
            return self.invalid_free(ptr, freer);
        };
        // SAFETY: unlinked above, so this thread owns the record
        let record = unsafe { self.records.read(handle) };
        let block = record.block;

        if self.buffer_check() {
            // SAFETY: the buffer is still ours until released below
            let check = unsafe { self.guard.check_allocated(&block) };
            if !check.is_clean() {
                self.report_corruption(&record, &check, CheckedAt::Free(freer));
            }
        }

        let parked = self.manage.lock().ring.is_some();
        let freed = if parked {
            match self.park(&record, freer) {
                Ok(freed) => Some(freed),
                Err(e) => {
                    self.report_exhaustion("freed record", &e);
                    None
                }
            }
        } else {
            None
        };

        // SAFETY: unlinked above and never reachable again
        unsafe { self.records.free(handle) };

        let evicted = {
            let mut manage = self.manage.lock();
            manage.on_free(block.user_size);
            match (freed, manage.ring.as_mut()) {
                (Some(freed), Some(ring)) => ring.push(freed),
                _ => None,
            }
        };

        let Some(freed) = freed else {
            // SAFETY: the buffer came from `real::alloc` and nothing refers
            // to it any more
            unsafe { real::free(block.buf as *mut u8) };
            return Unregistered::Released;
        };
        debug_assert!(self.freed_records.is_live(freed));
        if let Some(evicted) = evicted {
            // SAFETY: evicted handles are only ever released here
            unsafe { self.retire(evicted) };
        }
        Unregistered::Deferred
    }

    /// Turn `record` into a freed record, fill its buffer with the freed
    /// pattern and make it findable for double-free reports
    fn park(&self, record: &AllocRecord, freer: Option<&Trace>) -> Result<Handle> {
        let free_stack = match freer {
            Some(trace) => Some(self.stacks.intern(trace)?),
            None => None,
        };
        let freed = self.freed_records.alloc(FreedRecord {
            block: record.block,
            alloc_stack: record.stack,
            free_stack,
            chain_next: None,
        })?;
        if self.buffer_check() {
            // SAFETY: the buffer is ours, freshly unregistered
            unsafe { self.guard.arm_freed(&record.block) };
        }
        self.freed.insert(&self.freed_records, freed);
        Ok(freed)
    }

    /// Check a record that fell out of the ring, forget it and release its
    /// buffer
    ///
    /// # Safety
    /// - `freed` must have just been evicted from the ring
    pub(crate) unsafe fn retire(&self, freed: Handle) {
        // SAFETY: evicted records are only read by lookups, never written
        let record = unsafe { self.freed_records.read(freed) };
        if self.buffer_check() {
            // SAFETY: the buffer is held until released below
            if let Some(offset) = unsafe { self.guard.check_freed(&record.block) } {
                self.report_write_after_free(&record, offset);
            }
        }
        let removed = self
            .freed
            .remove_exact(&self.freed_records, record.block.user_ptr, freed);
        debug_assert!(removed);
        // SAFETY: unlinked above
        unsafe {
            self.freed_records.free(freed);
            real::free(record.block.buf as *mut u8);
        }
    }

    fn invalid_free(&self, ptr: usize, freer: Option<&Trace>) -> Unregistered {
        let previous = {
            let _guard = self.freed.lock();
            self.freed
                .find(&self.freed_records, ptr)
                // SAFETY: the freed lock keeps the record from being retired
                .map(|handle| unsafe { self.freed_records.read(handle) })
        };
        match previous {
            Some(record) => {
                self.violations.record(Violation::DoubleFree);
                self.with_report(Level::Warn, |r| {
                    r.separator();
                    r.line(format_args!(
                        "Double delete or free {ptr:#x} (at {})",
                        format_timestamp(&self.now())
                    ));
                    r.blank();
                    if self.config.features.callstack {
                        r.line(format_args!("This memory block was allocated from:"));
                        self.print_stack(r, record.alloc_stack);
                        r.blank();
                        r.line(format_args!("freed from:"));
                        self.print_stack(r, record.free_stack);
                        r.blank();
                        r.line(format_args!("and then is being freed from:"));
                        print_freer(r, freer);
                    }
                });
                Unregistered::DoubleFree
            }
            None => {
                self.violations.record(Violation::UnknownAddress);
                self.with_report(Level::Warn, |r| {
                    r.separator();
                    r.line(format_args!(
                        "ILLEGAL delete or free {ptr:#x} (at {})",
                        format_timestamp(&self.now())
                    ));
                    r.blank();
                    if self.config.features.callstack {
                        r.line(format_args!("This memory block is being freed from:"));
                        print_freer(r, freer);
                    }
                });
                Unregistered::UnknownAddress
            }
        }
    }

    pub(crate) fn report_corruption(
        &self,
        record: &AllocRecord,
        check: &RedzoneCheck,
        at: CheckedAt<'_>,
    ) {
        let block = &record.block;
        if check.underrun.is_some() {
            self.violations.record(Violation::Underrun);
        }
        if check.overrun.is_some() {
            self.violations.record(Violation::Overrun);
        }
        self.with_report(Level::Warn, |r| {
            r.separator();
            let regions = [
                ("underrun", check.underrun, block.buf, block.leading()),
                ("overrun", check.overrun, block.user_end(), block.trailing()),
            ];
            for (what, breach, start, len) in regions {
                let Some(breach) = breach else {
                    continue;
                };
                r.line(format_args!(
                    "buffer {what} ({breach}) {:#x}:{} (at {})",
                    block.user_ptr,
                    block.user_size,
                    format_timestamp(&self.now())
                ));
                r.line(format_args!("buffer contents:"));
                // SAFETY: the buffer is owned by the record being checked
                r.hex_dump(&unsafe { copy_maybe_garbage(start as *const u8, len) });
                r.blank();
            }
            if self.config.features.callstack {
                r.line(format_args!("This memory block was allocated from:"));
                self.print_stack(r, record.stack);
                if let CheckedAt::Free(freer) = at {
                    r.blank();
                    r.line(format_args!("and is being freed from:"));
                    print_freer(r, freer);
                }
            }
        });
    }

    pub(crate) fn report_write_after_free(&self, record: &FreedRecord, offset: usize) {
        self.violations.record(Violation::WriteAfterFree);
        let block = &record.block;
        self.with_report(Level::Warn, |r| {
            r.separator();
            r.line(format_args!(
                "FREED area ({:#x}:{}) was write-accessed!!",
                block.user_ptr, block.user_size
            ));
            r.line(format_args!(" current time = {}", format_timestamp(&self.now())));
            r.line(format_args!(
                " checked area = {} + {} + {} bytes (leading red zone + user buffer + trailing red zone)",
                block.leading(),
                block.user_size,
                block.trailing()
            ));
            r.line(format_args!(
                " write-access was detected at offset {offset} from the top of the leading red zone"
            ));
            r.line(format_args!("buffer contents:"));
            // SAFETY: the ring still holds the buffer
            r.hex_dump(&unsafe { copy_maybe_garbage(block.buf as *const u8, block.buf_size) });
            if self.config.features.callstack {
                r.blank();
                r.line(format_args!("This memory block was allocated from:"));
                self.print_stack(r, record.alloc_stack);
                r.blank();
                r.line(format_args!("and freed from:"));
                self.print_stack(r, record.free_stack);
            }
        });
    }

    pub(crate) fn report_exhaustion(&self, what: &str, error: &Error) {
        self.violations.record_exhaustion();
        self.with_report(Level::Error, |r| {
            r.line(format_args!("allocating {what} failed: {error}"));
        });
    }

    pub(crate) fn print_stack(&self, r: &mut Report<'_>, stack: Option<StackId>) {
        match stack {
            Some(id) => r.call_stack(&self.stacks.trace(id)),
            None => r.line(format_args!("(no call stack)")),
        }
    }

    /// User size of the live block at `ptr`
    pub fn size_of(&self, ptr: usize) -> Option<usize> {
        let _guard = self.live.lock();
        self.live
            .find(&self.records, ptr)
            // SAFETY: the live lock keeps the record alive
            .map(|handle| unsafe { self.records.read(handle) }.block.user_size)
    }

    pub fn status(&self) -> Status {
        self.manage.lock().status
    }

    pub fn histogram(&self) -> Histogram {
        self.manage.lock().histogram
    }

    pub fn violations(&self) -> ViolationCounts {
        self.violations.snapshot()
    }

    /// Freed blocks currently parked in the ring
    pub fn parked(&self) -> usize {
        self.manage.lock().ring.as_ref().map_or(0, FreeRing::len)
    }

    /// Write the counters to the sink
    pub fn print_status(&self) -> Status {
        let status = self.status();
        let (scaled, unit) = scale_bytes(status.allocated_bytes);
        self.with_report(Level::Info, |r| {
            r.line(format_args!("num allocated blocks: {}", status.live_blocks));
            r.line(format_args!(
                "allocated size: {} bytes ({scaled:.2} {unit})",
                status.allocated_bytes
            ));
        });
        status
    }

    pub fn print_histogram(&self) -> Histogram {
        let histogram = self.histogram();
        self.with_report(Level::Info, |r| {
            for (bin, count) in histogram.bins.iter().enumerate() {
                match Histogram::bounds(bin) {
                    (lower, Some(upper)) => {
                        r.line(format_args!("block size ({lower} - {upper}): {count}"))
                    }
                    (lower, None) => r.line(format_args!("block size ({lower} - ): {count}")),
                }
            }
            r.blank();
        });
        histogram
    }
}

fn print_freer(r: &mut Report<'_>, freer: Option<&Trace>) {
    match freer {
        Some(trace) => r.call_stack(trace),
        None => r.current_call_stack(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_bins_are_powers_of_four() {
        assert_eq!(Histogram::bin_of(0), 0);
        assert_eq!(Histogram::bin_of(1), 0);
        assert_eq!(Histogram::bin_of(4), 0);
        assert_eq!(Histogram::bin_of(5), 1);
        assert_eq!(Histogram::bin_of(16), 1);
        assert_eq!(Histogram::bin_of(17), 2);
        assert_eq!(Histogram::bin_of(262144), 8);
        assert_eq!(Histogram::bin_of(262145), 9);
        assert_eq!(Histogram::bin_of(usize::MAX), 9);
        assert_eq!(Histogram::bounds(0), (1, Some(4)));
        assert_eq!(Histogram::bounds(1), (5, Some(16)));
        assert_eq!(Histogram::bounds(8), (65537, Some(262144)));
        assert_eq!(Histogram::bounds(9), (262145, None));
    }

    #[test]
    fn manage_counts_live_blocks() {
        let mut manage = Manage::new(None);
        manage.on_alloc(100);
        manage.on_alloc(3);
        manage.on_free(100);
        assert_eq!(
            manage.status,
            Status {
                live_blocks: 1,
                allocated_bytes: 3,
                total_allocs: 2,
                total_frees: 1,
            }
        );
        assert_eq!(manage.histogram.bins[0], 1);
        assert_eq!(manage.histogram.total(), 1);
    }

    #[test]
    fn violation_counters_work() {
        let counters = ViolationCounters::default();
        counters.record(Violation::Overrun);
        counters.record(Violation::Overrun);
        counters.record(Violation::DoubleFree);
        counters.record_exhaustion();
        let counts = counters.snapshot();
        assert_eq!(counts.overrun, 2);
        assert_eq!(counts.double_free, 1);
        assert_eq!(counts.exhaustion, 1);
        assert_eq!(counts.total(), 3);
    }
}
