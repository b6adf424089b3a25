use std::mem;

use crate::{alloc::slab::Handle, error::Result, os::mem::MmapRegion};

pub const FREE_FIFO_SIZE: usize = 128;

/// A fixed ring of freed-record handles. Pushing into an occupied slot evicts
/// the handle that was there, oldest first.
pub struct FreeRing {
    /// `[Option<Handle>; capacity]`
    slots: MmapRegion,
    capacity: usize,
    cursor: usize,
    len: usize,
}

impl FreeRing {
    pub fn new(capacity: usize) -> Result<Self> {
        debug_assert!(capacity > 0);
        Ok(Self {
            slots: MmapRegion::map(capacity * mem::size_of::<Option<Handle>>())?,
            capacity,
            cursor: 0,
            len: 0,
        })
    }

    fn slot(&mut self, i: usize) -> &mut Option<Handle> {
        debug_assert!(i < self.capacity);
        // SAFETY: in bounds of a zeroed (all `None`) mapping we own, and
        // `&mut self` makes the reference unique
        unsafe { &mut *(self.slots.as_ptr() as *mut Option<Handle>).add(i) }
    }

    /// Store `handle` at the write position and advance it, returning the
    /// evicted handle if the slot was occupied
    pub fn push(&mut self, handle: Handle) -> Option<Handle> {
        let cursor = self.cursor;
        let evicted = self.slot(cursor).replace(handle);
        self.cursor = (cursor + 1) % self.capacity;
        if evicted.is_none() {
            self.len += 1;
        }
        evicted
    }

    /// Empty the ring, oldest first
    pub fn drain(&mut self) -> Vec<Handle> {
        let mut drained = Vec::with_capacity(self.len);
        for i in 0..self.capacity {
            let idx = (self.cursor + i) % self.capacity;
            if let Some(handle) = self.slot(idx).take() {
                drained.push(handle);
            }
        }
        self.len = 0;
        drained
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
