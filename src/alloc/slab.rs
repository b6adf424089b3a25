//! Page-backed pools of fixed-size objects. Every piece of metadata the engine
//! keeps lives in one of these, so tracking never goes through the allocator
//! it is tracking.
//!
//! A [`Slab`] is a chain of page-sized pools, mapped [`Slab::batch_pages`] at a
//! time:
//!
//! ```plaintext
//! +------------+-------+-------+-----+-------+
//! | PoolHeader | slot0 | slot1 | ... | slotN |  one page, N < 192
//! +------------+-------+-------+-----+-------+
//! ```
//!
//! Objects are named by a [`Handle`] (pool id, slot index) rather than by
//! address. Pool ids index a directory of pool base addresses, so getting from
//! an object to its pool never involves pointer arithmetic on the object.

use std::{
    fmt,
    marker::PhantomData,
    mem,
    num::NonZeroU64,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    os::mem::{MmapRegion, PAGE_SIZE},
    sync::Mutex,
    util::{hint::cold, num::round_up},
};

pub const POOL_BITMAP_WORDS: usize = 3;

/// Capacity is bounded by the free bitmap
pub const MAX_OBJECTS_PER_POOL: usize = POOL_BITMAP_WORDS * u64::BITS as usize;

pub const MMAP_BATCH_PAGE_NUM: usize = 4;

/// Minimum alignment of every slot
pub const ALIGNMENT_SIZE: usize = 8;

/// Size of the pool directory. 2^20 pools of one page each is 4GiB of
/// metadata per object size on 4KiB pages.
pub const MAX_POOLS: usize = 1 << 20;

const SLOT_BITS: u32 = 8;

/// The identity of an object in a [`Slab`]. `Option<Handle>` is a single
/// word, and all-zero memory is `None`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Handle(NonZeroU64);

impl Handle {
    fn new(pool: u32, slot: u32) -> Self {
        debug_assert!((slot as usize) < MAX_OBJECTS_PER_POOL);
        Self(NonZeroU64::MIN.saturating_add(((pool as u64) << SLOT_BITS) | slot as u64))
    }

    pub fn pool(self) -> u32 {
        ((self.0.get() - 1) >> SLOT_BITS) as u32
    }

    pub fn slot(self) -> u32 {
        ((self.0.get() - 1) & ((1 << SLOT_BITS) - 1)) as u32
    }

    pub fn to_raw(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}:{})", self.pool(), self.slot())
    }
}

/// Sits at the start of every pool page
#[repr(C)]
struct PoolHeader {
    obj_size: usize,
    capacity: usize,
    nr_free: usize,
    /// Order in which the pool was created, equal to its pool id
    seqno: u64,
    /// A set bit is a free slot
    bitmap: [u64; POOL_BITMAP_WORDS],
    prev: Option<u32>,
    next: Option<u32>,
}

impl PoolHeader {
    fn new(layout: &PoolLayout, seqno: u32, prev: Option<u32>, next: Option<u32>) -> Self {
        let mut bitmap = [0; POOL_BITMAP_WORDS];
        for (w, word) in bitmap.iter_mut().enumerate() {
            let bits = layout.capacity.saturating_sub(w * 64).min(64);
            *word = if bits == 64 { u64::MAX } else { (1 << bits) - 1 };
        }
        Self {
            obj_size: layout.obj_size,
            capacity: layout.capacity,
            nr_free: layout.capacity,
            seqno: seqno as u64,
            bitmap,
            prev,
            next,
        }
    }

    /// Lowest-indexed free slot, scanning the bitmap words in order
    fn lowest_free(&self) -> Option<usize> {
        self.bitmap
            .iter()
            .enumerate()
            .find(|(_, word)| **word != 0)
            .map(|(w, word)| w * 64 + word.trailing_zeros() as usize)
    }

    fn is_free(&self, slot: usize) -> bool {
        self.bitmap[slot / 64] & (1 << (slot % 64)) != 0
    }

    fn take(&mut self, slot: usize) {
        debug_assert!(self.is_free(slot));
        self.bitmap[slot / 64] &= !(1 << (slot % 64));
        self.nr_free -= 1;
    }

    fn put(&mut self, slot: usize) {
        debug_assert!(!self.is_free(slot), "slot {slot} freed twice");
        self.bitmap[slot / 64] |= 1 << (slot % 64);
        self.nr_free += 1;
    }
}

#[derive(Clone, Copy, Debug)]
struct PoolLayout {
    obj_size: usize,
    capacity: usize,
    /// Byte offset of slot 0 from the pool base
    slot_offset: usize,
}

impl PoolLayout {
    fn of<T>(kind: &str) -> Result<Self> {
        let align = mem::align_of::<T>().max(ALIGNMENT_SIZE);
        let slot_offset = round_up(mem::size_of::<PoolHeader>(), align);
        let obj_size = round_up(mem::size_of::<T>().max(1), align);
        let capacity = (PAGE_SIZE.saturating_sub(slot_offset) / obj_size).min(MAX_OBJECTS_PER_POOL);
        if capacity == 0 || align > *PAGE_SIZE {
            return Err(Error::Config(format!(
                "{kind} objects ({obj_size} bytes) do not fit in a {} byte pool",
                *PAGE_SIZE
            )));
        }
        Ok(Self {
            obj_size,
            capacity,
            slot_offset,
        })
    }
}

struct SlabState {
    nr_pools: u32,
    nr_live: usize,
    /// The pool we try first, see [`Slab::free`] for when it changes
    next_available: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlabStats {
    pub pools: usize,
    pub live: usize,
    pub obj_size: usize,
    pub capacity_per_pool: usize,
}

/// A size class: a growable chain of pools holding `T`s. Objects are `Copy`
/// since the pool never runs destructors.
pub struct Slab<T> {
    kind: &'static str,
    layout: PoolLayout,
    batch_pages: usize,
    /// `[AtomicUsize; MAX_POOLS]` of pool base addresses. Entries are written
    /// once, before any handle into that pool exists.
    directory: MmapRegion,
    state: Mutex<SlabState>,
    _marker: PhantomData<T>,
}

// SAFETY: the slab only moves `T`s between threads by value
unsafe impl<T> Send for Slab<T> where T: Send {}
unsafe impl<T> Sync for Slab<T> where T: Send {}

impl<T> Slab<T>
where
    T: Copy,
{
    /// Create an empty size class. No pool is mapped until the first
    /// [`Slab::alloc`].
    pub fn new(kind: &'static str, batch_pages: usize) -> Result<Self> {
        if batch_pages == 0 {
            return Err(Error::Config(format!("{kind} pool batch must be at least one page")));
        }
        if batch_pages > MAX_POOLS {
            return Err(Error::Config(format!(
                "{kind} pool batch of {batch_pages} pages exceeds {MAX_POOLS}"
            )));
        }
        Ok(Self {
            kind,
            layout: PoolLayout::of::<T>(kind)?,
            batch_pages,
            directory: MmapRegion::map_noreserve(MAX_POOLS * mem::size_of::<AtomicUsize>())?,
            state: Mutex::new(SlabState {
                nr_pools: 0,
                nr_live: 0,
                next_available: None,
            }),
            _marker: PhantomData,
        })
    }

    pub fn batch_pages(&self) -> usize {
        self.batch_pages
    }

    pub fn capacity_per_pool(&self) -> usize {
        self.layout.capacity
    }

    fn directory_entry(&self, pool: u32) -> &AtomicUsize {
        debug_assert!((pool as usize) < MAX_POOLS);
        // SAFETY: the directory is zero-initialised, suitably aligned memory
        // that lives as long as `self`, and all accesses are atomic
        unsafe { &*(self.directory.as_ptr() as *const AtomicUsize).add(pool as usize) }
    }

    fn pool_base(&self, pool: u32) -> usize {
        self.directory_entry(pool).load(Ordering::Acquire)
    }

    /// # Safety
    /// - `pool` must have been created, and `self.state` must be locked
    #[allow(clippy::mut_from_ref)]
    unsafe fn header(&self, pool: u32) -> &mut PoolHeader {
        unsafe { &mut *(self.pool_base(pool) as *mut PoolHeader) }
    }

    /// Where the object named by `handle` lives. Dereferencing it is up to
    /// the caller, who must own the object (e.g. by holding the lock of the
    /// table it is linked into).
    pub fn get(&self, handle: Handle) -> NonNull<T> {
        let base = self.pool_base(handle.pool());
        debug_assert_ne!(base, 0, "{handle:?} names a pool that does not exist");
        let addr = base + self.layout.slot_offset + handle.slot() as usize * self.layout.obj_size;
        // SAFETY: pool bases are never null
        unsafe { NonNull::new_unchecked(addr as *mut T) }
    }

    /// Copy the object out
    ///
    /// # Safety
    /// - `handle` must be live and nobody may be writing to it
    pub unsafe fn read(&self, handle: Handle) -> T {
        unsafe { self.get(handle).as_ptr().read() }
    }

    /// Mutate the object in place
    ///
    /// # Safety
    /// - `handle` must be live and the caller must have exclusive access to it
    pub unsafe fn update<R>(&self, handle: Handle, f: impl FnOnce(&mut T) -> R) -> R {
        f(unsafe { &mut *self.get(handle).as_ptr() })
    }

    /// Store `value` in a free slot
    pub fn alloc(&self, value: T) -> Result<Handle> {
        let handle = {
            let mut state = self.state.lock();
            self.take_slot(&mut state)?
        };
        // SAFETY: the slot was free, so nobody else refers to it
        unsafe { self.get(handle).as_ptr().write(value) };
        Ok(handle)
    }

    fn take_slot(&self, state: &mut SlabState) -> Result<Handle> {
        // SAFETY (for all `header()` calls): we hold the state lock and only
        // ask about pools below `nr_pools`
        let cached = state
            .next_available
            .filter(|&pool| unsafe { self.header(pool) }.nr_free > 0);
        let pool = match cached {
            Some(pool) => pool,
            None => match self.find_pool_with_space(state) {
                Some(pool) => pool,
                None => cold(|| self.grow(state))?,
            },
        };
        state.next_available = Some(pool);
        let header = unsafe { self.header(pool) };
        let slot = header
            .lowest_free()
            .ok_or(Error::PoolExhausted { kind: self.kind })?;
        header.take(slot);
        state.nr_live += 1;
        Ok(Handle::new(pool, slot as u32))
    }

    /// Walk the chain from the cached pool onwards, then from the head up to
    /// the cached pool
    fn find_pool_with_space(&self, state: &SlabState) -> Option<u32> {
        if state.nr_pools == 0 {
            return None;
        }
        let start = state.next_available.unwrap_or(0);
        let has_space = |pool: u32| unsafe { self.header(pool) }.nr_free > 0;
        let mut cursor = Some(start);
        while let Some(pool) = cursor {
            if has_space(pool) {
                return Some(pool);
            }
            cursor = unsafe { self.header(pool) }.next;
        }
        let mut cursor = Some(0).filter(|&head| head != start);
        while let Some(pool) = cursor {
            if has_space(pool) {
                return Some(pool);
            }
            cursor = unsafe { self.header(pool) }.next.filter(|&next| next != start);
        }
        None
    }

    /// Map a new batch of pools, chain them at the tail and return the first
    fn grow(&self, state: &mut SlabState) -> Result<u32> {
        let first = state.nr_pools;
        let exhausted = || Error::PoolExhausted { kind: self.kind };
        let end = (first as usize).checked_add(self.batch_pages).ok_or_else(exhausted)?;
        if end > MAX_POOLS {
            return Err(exhausted());
        }
        let page = *PAGE_SIZE;
        let len = self.batch_pages.checked_mul(page).ok_or_else(exhausted)?;
        let base = MmapRegion::map(len)?.leak().as_ptr() as usize;
        for i in 0..self.batch_pages {
            let pool = first + i as u32;
            let prev = pool.checked_sub(1);
            let next = (i + 1 < self.batch_pages).then_some(pool + 1);
            let addr = base + i * page;
            // SAFETY: `addr` is the start of a fresh, page-aligned, writable
            // page that nothing else refers to
            unsafe {
                (addr as *mut PoolHeader).write(PoolHeader::new(&self.layout, pool, prev, next));
            }
            self.directory_entry(pool).store(addr, Ordering::Release);
        }
        if let Some(tail) = first.checked_sub(1) {
            // SAFETY: the old tail exists and we hold the state lock
            unsafe { self.header(tail) }.next = Some(first);
        }
        state.nr_pools += self.batch_pages as u32;
        Ok(first)
    }

    /// Give the slot back and return the object that was in it
    ///
    /// # Safety
    /// - `handle` must be live, and nothing may use it afterwards
    pub unsafe fn free(&self, handle: Handle) -> T {
        let value = unsafe { self.read(handle) };
        let mut state = self.state.lock();
        let pool = handle.pool();
        // SAFETY: handles only name created pools, and we hold the lock
        let header = unsafe { self.header(pool) };
        header.put(handle.slot() as usize);
        state.nr_live -= 1;
        let nr_free = header.nr_free;
        // Prefer the emptiest pool we have seen recently
        match state.next_available {
            Some(cached) if cached != pool => {
                if nr_free > unsafe { self.header(cached) }.nr_free {
                    state.next_available = Some(pool);
                }
            }
            Some(_) => {}
            None => state.next_available = Some(pool),
        }
        value
    }

    /// Whether `handle` currently names an allocated object
    pub fn is_live(&self, handle: Handle) -> bool {
        let _state = self.state.lock();
        if self.pool_base(handle.pool()) == 0 {
            return false;
        }
        // SAFETY: the pool exists and we hold the lock
        let header = unsafe { self.header(handle.pool()) };
        (handle.slot() as usize) < header.capacity && !header.is_free(handle.slot() as usize)
    }

    pub fn stats(&self) -> SlabStats {
        let state = self.state.lock();
        SlabStats {
            pools: state.nr_pools as usize,
            live: state.nr_live,
            obj_size: self.layout.obj_size,
            capacity_per_pool: self.layout.capacity,
        }
    }
}

impl<T> Drop for Slab<T> {
    fn drop(&mut self) {
        let nr_pools = self.state.get_mut().nr_pools as usize;
        let batch_size = self.batch_pages * *PAGE_SIZE;
        for first in (0..nr_pools).step_by(self.batch_pages) {
            let base = self.directory_entry_raw(first);
            if let Some(base) = NonNull::new(base as *mut u8) {
                // SAFETY: every `batch_pages`-th pool starts a batch that
                // `grow()` leaked with exactly this size
                drop(unsafe { MmapRegion::from_raw(base, batch_size) });
            }
        }
    }
}

impl<T> Slab<T> {
    fn directory_entry_raw(&self, pool: usize) -> usize {
        // SAFETY: see `directory_entry()`
        unsafe { &*(self.directory.as_ptr() as *const AtomicUsize).add(pool) }
            .load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use hashbrown::HashSet;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Obj {
        id: u64,
        pad: [u64; 3],
    }

    fn obj(id: u64) -> Obj {
        Obj { id, pad: [id; 3] }
    }

    #[test]
    fn handle_packs_pool_and_slot() {
        let h = Handle::new(12345, 191);
        assert_eq!(h.pool(), 12345);
        assert_eq!(h.slot(), 191);
        assert_eq!(mem::size_of::<Option<Handle>>(), 8);
        let zero: Option<Handle> = unsafe { mem::zeroed() };
        assert_eq!(zero, None);
    }

    #[test]
    fn small_objects_are_capped_by_the_bitmap() {
        let slab = Slab::<u8>::new("byte", 1).unwrap();
        assert_eq!(slab.capacity_per_pool(), MAX_OBJECTS_PER_POOL);
    }

    #[test]
    fn oversized_objects_are_rejected() {
        assert!(matches!(Slab::<[u8; 1 << 16]>::new("huge", 1), Err(Error::Config(_))));
        assert!(matches!(Slab::<u64>::new("none", 0), Err(Error::Config(_))));
        assert!(matches!(
            Slab::<u64>::new("endless", usize::MAX / 2),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn alloc_hands_out_lowest_slot_first() {
        let slab = Slab::<Obj>::new("obj", 2).unwrap();
        let a = slab.alloc(obj(1)).unwrap();
        let b = slab.alloc(obj(2)).unwrap();
        assert_eq!((a.pool(), a.slot()), (0, 0));
        assert_eq!((b.pool(), b.slot()), (0, 1));
        assert_eq!(unsafe { slab.free(a) }, obj(1));
        let c = slab.alloc(obj(3)).unwrap();
        assert_eq!(c, a);
        assert_eq!(unsafe { slab.read(c) }, obj(3));
        assert_eq!(unsafe { slab.read(b) }, obj(2));
    }

    #[test]
    fn slab_grows_a_batch_at_a_time() {
        let slab = Slab::<Obj>::new("obj", 2).unwrap();
        let per_pool = slab.capacity_per_pool();
        let handles: Vec<_> = (0..(2 * per_pool + 1) as u64)
            .map(|i| slab.alloc(obj(i)).unwrap())
            .collect();
        let stats = slab.stats();
        assert_eq!(stats.pools, 4);
        assert_eq!(stats.live, 2 * per_pool + 1);
        assert_eq!(handles.last().unwrap().pool(), 2);
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(unsafe { slab.read(*h) }.id, i as u64);
        }
    }

    #[test]
    fn free_recaches_the_emptier_pool() {
        let slab = Slab::<Obj>::new("obj", 2).unwrap();
        let per_pool = slab.capacity_per_pool();
        let handles: Vec<_> = (0..(per_pool + 2) as u64)
            .map(|i| slab.alloc(obj(i)).unwrap())
            .collect();
        // pool 1 is cached and has `per_pool - 2` free slots
        assert_eq!(slab.state.lock().next_available, Some(1));
        for h in &handles[..per_pool - 1] {
            unsafe { slab.free(*h) };
        }
        assert_eq!(slab.state.lock().next_available, Some(0));
        assert_eq!(slab.alloc(obj(0)).unwrap().pool(), 0);
    }

    #[test]
    fn live_handles_never_share_an_address() {
        let slab = Slab::<Obj>::new("obj", 1).unwrap();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut live: Vec<(Handle, u64)> = Vec::new();
        for step in 0..20_000u64 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let h = slab.alloc(obj(step)).unwrap();
                live.push((h, step));
            } else {
                let (h, id) = live.swap_remove(rng.gen_range(0..live.len()));
                assert_eq!(unsafe { slab.free(h) }.id, id);
                assert!(!slab.is_live(h));
            }
            if step % 1000 == 0 {
                let addrs: HashSet<_> = live.iter().map(|(h, _)| slab.get(*h)).collect();
                assert_eq!(addrs.len(), live.len());
                for (h, id) in &live {
                    assert!(slab.is_live(*h));
                    assert_eq!(unsafe { slab.read(*h) }.id, *id);
                }
                assert_eq!(slab.stats().live, live.len());
            }
        }
    }

    #[test]
    fn concurrent_allocs_are_unique() {
        let slab = Slab::<Obj>::new("obj", 4).unwrap();
        let handles: Vec<Handle> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..4u64)
                .map(|t| {
                    let slab = &slab;
                    s.spawn(move || {
                        let mut mine = Vec::new();
                        for i in 0..2000 {
                            let h = slab.alloc(obj(t * 10_000 + i)).unwrap();
                            if i % 3 == 0 {
                                unsafe { slab.free(h) };
                            } else {
                                mine.push(h);
                            }
                        }
                        mine
                    })
                })
                .collect();
            workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
        });
        let unique: HashSet<_> = handles.iter().copied().collect();
        assert_eq!(unique.len(), handles.len());
        assert_eq!(slab.stats().live, handles.len());
    }
}
