//! Chained hash tables over objects living in a [`Slab`]. The chain links are
//! stored in the objects themselves as handles, and bucket heads live in a
//! zero-initialised mapping (so an empty table costs no committed memory).
//!
//! Iteration walks non-empty buckets in bucket order, then each chain from its
//! head. Inserts prepend, so that is neither address nor insertion order.

use std::{
    marker::PhantomData,
    mem,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    alloc::slab::{Handle, Slab},
    error::{Error, Result},
    os::mem::MmapRegion,
    sync::{ReentrantGuard, ReentrantLock},
};

pub const ALLOC_TABLE_SIZE: usize = 416963;
pub const FREE_TABLE_SIZE: usize = 521;
pub const CALLSTACK_TABLE_SIZE: usize = 104729;
pub const UNTRACKED_TABLE_SIZE: usize = 4099;

/// An object that can be chained into a [`ChainedTable`]
pub trait Chained: Copy {
    type Key: PartialEq + ?Sized;

    fn key(&self) -> &Self::Key;

    fn bucket(key: &Self::Key, nr_buckets: usize) -> usize;

    fn chain_next(&self) -> Option<Handle>;

    fn set_chain_next(&mut self, next: Option<Handle>);
}

/// The unsynchronised table. Every method requires the caller to hold
/// whatever lock guards the table, which is why they are `unsafe`.
pub struct ChainedTable<T> {
    /// `[Option<Handle>; nr_buckets]`
    buckets: MmapRegion,
    nr_buckets: usize,
    len: AtomicUsize,
    _marker: PhantomData<T>,
}

impl<T> ChainedTable<T>
where
    T: Chained,
{
    pub fn new(nr_buckets: usize) -> Result<Self> {
        if nr_buckets == 0 {
            return Err(Error::Config("hash tables need at least one bucket".into()));
        }
        Ok(Self {
            buckets: MmapRegion::map_noreserve(nr_buckets * mem::size_of::<Option<Handle>>())?,
            nr_buckets,
            len: AtomicUsize::new(0),
            _marker: PhantomData,
        })
    }

    pub fn nr_buckets(&self) -> usize {
        self.nr_buckets
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn head(&self, bucket: usize) -> *mut Option<Handle> {
        debug_assert!(bucket < self.nr_buckets);
        // SAFETY: in bounds of the mapping, which is zeroed (all `None`)
        unsafe { (self.buckets.as_ptr() as *mut Option<Handle>).add(bucket) }
    }

    /// Prepend `handle` to its bucket
    ///
    /// # Safety
    /// - The table lock must be held, and `handle` must be live in `slab` and
    ///   not already linked into any table
    pub unsafe fn insert(&self, slab: &Slab<T>, handle: Handle) {
        unsafe {
            let head = self.head(T::bucket(slab.read(handle).key(), self.nr_buckets));
            slab.update(handle, |node| node.set_chain_next(*head));
            *head = Some(handle);
        }
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// First handle in `key`'s chain whose key matches
    ///
    /// # Safety
    /// - The table lock must be held
    pub unsafe fn find(&self, slab: &Slab<T>, key: &T::Key) -> Option<Handle> {
        let mut cursor = unsafe { *self.head(T::bucket(key, self.nr_buckets)) };
        while let Some(handle) = cursor {
            // SAFETY: linked nodes are live and owned by the lock holder
            let node = unsafe { &*slab.get(handle).as_ptr() };
            if node.key() == key {
                return Some(handle);
            }
            cursor = node.chain_next();
        }
        None
    }

    /// Unlink the first node matching `key` and, if given, being exactly
    /// `which`. The node itself stays allocated.
    ///
    /// # Safety
    /// - The table lock must be held
    pub unsafe fn unlink(
        &self,
        slab: &Slab<T>,
        key: &T::Key,
        which: Option<Handle>,
    ) -> Option<Handle> {
        let head = self.head(T::bucket(key, self.nr_buckets));
        let mut prev: Option<Handle> = None;
        let mut cursor = unsafe { *head };
        while let Some(handle) = cursor {
            // SAFETY: linked nodes are live and owned by the lock holder
            let node = unsafe { slab.read(handle) };
            if node.key() == key && which.map_or(true, |w| w == handle) {
                match prev {
                    None => unsafe { *head = node.chain_next() },
                    Some(prev) => unsafe {
                        slab.update(prev, |p| p.set_chain_next(node.chain_next()))
                    },
                }
                self.len.fetch_sub(1, Ordering::Relaxed);
                return Some(handle);
            }
            prev = Some(handle);
            cursor = node.chain_next();
        }
        None
    }

    /// # Safety
    /// - The table lock must be held for as long as the iterator is used
    pub unsafe fn iter<'a>(&'a self, slab: &'a Slab<T>) -> Iter<'a, T> {
        Iter {
            table: self,
            slab,
            bucket: 0,
            next: None,
        }
    }

    /// Forget every node without freeing any of them
    ///
    /// # Safety
    /// - The table lock must be held
    pub unsafe fn clear(&self) {
        unsafe { self.buckets.zero() };
        self.len.store(0, Ordering::Relaxed);
    }
}

/// Yields handles in bucket order, then chain order. The successor is read
/// before a handle is yielded, so the yielded node may be unlinked (and
/// freed) before the next call.
pub struct Iter<'a, T> {
    table: &'a ChainedTable<T>,
    slab: &'a Slab<T>,
    bucket: usize,
    next: Option<Handle>,
}

impl<T> Iterator for Iter<'_, T>
where
    T: Chained,
{
    type Item = Handle;

    fn next(&mut self) -> Option<Handle> {
        loop {
            if let Some(handle) = self.next {
                // SAFETY: the table lock is held, so linked nodes are live
                self.next = unsafe { self.slab.read(handle) }.chain_next();
                return Some(handle);
            }
            if self.bucket >= self.table.nr_buckets {
                return None;
            }
            // SAFETY: in bounds
            self.next = unsafe { *self.table.head(self.bucket) };
            self.bucket += 1;
        }
    }
}

/// A chained table of allocation records keyed by user pointer, behind its own
/// reentrant lock. Every method locks internally; hold [`PtrTable::lock`]
/// across a walk to keep the table still.
pub struct PtrTable<T> {
    lock: ReentrantLock,
    chains: ChainedTable<T>,
}

impl<T> PtrTable<T>
where
    T: Chained<Key = usize>,
{
    pub fn new(nr_buckets: usize) -> Result<Self> {
        Ok(Self {
            lock: ReentrantLock::new(),
            chains: ChainedTable::new(nr_buckets)?,
        })
    }

    pub fn lock(&self) -> ReentrantGuard<'_> {
        self.lock.lock()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn insert(&self, slab: &Slab<T>, handle: Handle) {
        let _guard = self.lock();
        // SAFETY: locked; the caller just allocated `handle`
        unsafe { self.chains.insert(slab, handle) }
    }

    pub fn find(&self, slab: &Slab<T>, ptr: usize) -> Option<Handle> {
        let _guard = self.lock();
        // SAFETY: locked
        unsafe { self.chains.find(slab, &ptr) }
    }

    /// Unlink the record for `ptr` and hand it to the caller
    pub fn remove(&self, slab: &Slab<T>, ptr: usize) -> Option<Handle> {
        let _guard = self.lock();
        // SAFETY: locked
        unsafe { self.chains.unlink(slab, &ptr, None) }
    }

    /// Unlink exactly `handle`, which is keyed by `ptr`
    pub fn remove_exact(&self, slab: &Slab<T>, ptr: usize, handle: Handle) -> bool {
        let _guard = self.lock();
        // SAFETY: locked
        unsafe { self.chains.unlink(slab, &ptr, Some(handle)) }.is_some()
    }

    /// Walk the table. The guard proves the lock is held for the walk.
    pub fn iter<'a>(&'a self, slab: &'a Slab<T>, _guard: &'a ReentrantGuard<'_>) -> Iter<'a, T> {
        debug_assert!(self.lock.is_held());
        // SAFETY: locked for the lifetime of the iterator
        unsafe { self.chains.iter(slab) }
    }

    /// Free every record and empty the table
    pub fn destroy(&self, slab: &Slab<T>) -> usize {
        let guard = self.lock();
        let mut freed = 0;
        for handle in self.iter(slab, &guard) {
            // SAFETY: the iterator has already read the successor, and the
            // table is cleared below so nothing reaches the slot again
            unsafe { slab.free(handle) };
            freed += 1;
        }
        // SAFETY: locked
        unsafe { self.chains.clear() };
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug)]
    struct Node {
        ptr: usize,
        size: usize,
        next: Option<Handle>,
    }

    impl Chained for Node {
        type Key = usize;

        fn key(&self) -> &usize {
            &self.ptr
        }

        fn bucket(key: &usize, nr_buckets: usize) -> usize {
            key % nr_buckets
        }

        fn chain_next(&self) -> Option<Handle> {
            self.next
        }

        fn set_chain_next(&mut self, next: Option<Handle>) {
            self.next = next;
        }
    }

    fn node(ptr: usize) -> Node {
        Node {
            ptr,
            size: ptr * 2,
            next: None,
        }
    }

    #[test]
    fn insert_find_remove_works() {
        let slab = Slab::new("node", 1).unwrap();
        let table = PtrTable::new(7).unwrap();
        for ptr in [3, 10, 17, 4] {
            let h = slab.alloc(node(ptr)).unwrap();
            table.insert(&slab, h);
        }
        assert_eq!(table.len(), 4);
        let h = table.find(&slab, 10).unwrap();
        assert_eq!(unsafe { slab.read(h) }.size, 20);
        assert!(table.find(&slab, 24).is_none());

        let removed = table.remove(&slab, 10).unwrap();
        assert_eq!(removed, h);
        assert!(table.find(&slab, 10).is_none());
        assert!(table.find(&slab, 3).is_some());
        assert!(table.find(&slab, 17).is_some());
        assert_eq!(table.len(), 3);
        assert!(!table.remove_exact(&slab, 3, h));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn iteration_is_bucket_then_chain_order() {
        let slab = Slab::new("node", 1).unwrap();
        let table = PtrTable::new(7).unwrap();
        for ptr in [3, 10, 1, 17] {
            let h = slab.alloc(node(ptr)).unwrap();
            table.insert(&slab, h);
        }
        let guard = table.lock();
        let order: Vec<usize> = table
            .iter(&slab, &guard)
            .map(|h| unsafe { slab.read(h) }.ptr)
            .collect();
        // bucket 1, then bucket 3 with the latest insert first
        assert_eq!(order, vec![1, 17, 10, 3]);
    }

    #[test]
    fn removing_while_iterating_is_fine() {
        let slab = Slab::new("node", 1).unwrap();
        let table = PtrTable::new(5).unwrap();
        for ptr in 0..50 {
            let h = slab.alloc(node(ptr)).unwrap();
            table.insert(&slab, h);
        }
        let guard = table.lock();
        let mut seen = 0;
        for h in table.iter(&slab, &guard) {
            let n = unsafe { slab.read(h) };
            seen += 1;
            if n.ptr % 2 == 0 {
                assert!(table.remove_exact(&slab, n.ptr, h));
                unsafe { slab.free(h) };
            }
        }
        drop(guard);
        assert_eq!(seen, 50);
        assert_eq!(table.len(), 25);
        assert_eq!(table.destroy(&slab), 25);
        assert!(table.is_empty());
        assert_eq!(slab.stats().live, 0);
    }
}
