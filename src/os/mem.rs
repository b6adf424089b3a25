use std::ptr::{self, NonNull};

use libc::{
    __errno_location, mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE,
    PROT_READ, PROT_WRITE,
};
use once_cell::sync::Lazy;

use crate::{
    error::{Error, Result},
    util::{hint::cold, num::round_up},
};

pub static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

/// An anonymous, private, read/write mapping. The memory is zero-filled by the
/// kernel and is unmapped when the region is dropped.
pub struct MmapRegion {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: the region is plain memory owned by this value; synchronising
// access to its contents is up to whoever hands out pointers into it.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// `mmap()` a page-aligned region of at least `size` bytes (and at least
    /// one page), with swap reserved up front.
    pub fn map(size: usize) -> Result<Self> {
        Self::map_with_flags(size, MAP_ANONYMOUS | MAP_PRIVATE)
    }

    /// Like [`MmapRegion::map`], but without reserving swap. Use this for big
    /// tables that are only ever sparsely touched.
    pub fn map_noreserve(size: usize) -> Result<Self> {
        Self::map_with_flags(size, MAP_NORESERVE | MAP_ANONYMOUS | MAP_PRIVATE)
    }

    fn map_with_flags(size: usize, flags: i32) -> Result<Self> {
        let size = round_up(size.max(1), *PAGE_SIZE);
        // SAFETY: an anonymous mapping at a kernel-chosen address cannot alias
        // any existing Rust object
        let ptr = unsafe { mmap(ptr::null_mut(), size, PROT_READ | PROT_WRITE, flags, -1, 0) };
        if ptr == MAP_FAILED {
            return cold(|| {
                // SAFETY: `__errno_location()` always returns a valid
                // thread-local pointer
                let errno = unsafe { *__errno_location() };
                Err(Error::Mmap { size, errno })
            });
        }
        Ok(Self {
            // SAFETY: `mmap()` never returns NULL on success for a
            // kernel-chosen address
            ptr: unsafe { NonNull::new_unchecked(ptr as *mut u8) },
            size,
        })
    }

    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The size of the mapping, always a multiple of [`PAGE_SIZE`]
    pub const fn len(&self) -> usize {
        self.size
    }

    /// Give up ownership without unmapping. Used for memory that lives as
    /// long as its owner tracks it by address.
    pub fn leak(self) -> NonNull<u8> {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }

    /// Take back ownership of a region given up with [`MmapRegion::leak`]
    ///
    /// # Safety
    /// - `ptr` and `size` must be exactly those of a leaked region, and it
    ///   must not have been reclaimed already
    pub unsafe fn from_raw(ptr: NonNull<u8>, size: usize) -> Self {
        Self { ptr, size }
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Zero the whole region again
    ///
    /// # Safety
    /// - Nobody may hold references into the region
    pub unsafe fn zero(&self) {
        unsafe { self.as_ptr().write_bytes(0, self.size) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY:
        // - `self.ptr` is page aligned, since it came from `mmap()`
        // - We unmap exactly the range we mapped and nobody else owns it
        unsafe {
            munmap(self.ptr.as_ptr() as _, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_zeroed_and_writable() {
        let region = MmapRegion::map(100).unwrap();
        assert_eq!(region.len(), *PAGE_SIZE);
        assert_eq!(region.as_ptr() as usize % *PAGE_SIZE, 0);
        let bytes = unsafe { std::slice::from_raw_parts(region.as_ptr(), region.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe {
            region.as_ptr().add(42).write(7);
            assert_eq!(region.as_ptr().add(42).read(), 7);
            region.zero();
            assert_eq!(region.as_ptr().add(42).read(), 0);
        }
    }

    #[test]
    fn noreserve_mapping_can_be_large() {
        let region = MmapRegion::map_noreserve(1 << 30).unwrap();
        assert_eq!(region.len(), 1 << 30);
        unsafe { region.as_ptr().add((1 << 30) - 1).write(1) };
    }
}
