//! The allocator underneath: libc's. Every tracked buffer comes from here and
//! goes back here.

use std::{mem, ptr};

use libc::c_void;

use crate::alloc::redzone::MALLOC_ALIGNMENT;

/// `size` bytes aligned to `align`, which must be a power of two. Null on
/// failure.
///
/// # Safety
/// - The result must be released with [`free`]
pub unsafe fn alloc(size: usize, align: usize) -> *mut u8 {
    if align <= MALLOC_ALIGNMENT {
        return unsafe { libc::malloc(size) as *mut u8 };
    }
    let mut out: *mut c_void = ptr::null_mut();
    // SAFETY: `posix_memalign` only writes `out`, and only on success
    match unsafe { libc::posix_memalign(&mut out, align.max(mem::size_of::<usize>()), size) } {
        0 => out as *mut u8,
        _ => ptr::null_mut(),
    }
}

/// # Safety
/// - `ptr` must be null or have come from [`alloc`] or [`realloc`]
pub unsafe fn free(ptr: *mut u8) {
    unsafe { libc::free(ptr as *mut c_void) }
}

/// # Safety
/// - As for [`free`]
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    unsafe { libc::realloc(ptr as *mut c_void, size) as *mut u8 }
}

/// [`realloc`] that keeps an alignment above what `malloc()` guarantees.
/// On failure `ptr` is untouched and null is returned.
///
/// # Safety
/// - As for [`free`], and `ptr` must not be null
pub unsafe fn realloc_aligned(ptr: *mut u8, size: usize, align: usize) -> *mut u8 {
    if align <= MALLOC_ALIGNMENT {
        return unsafe { realloc(ptr, size) };
    }
    let new = unsafe { alloc(size, align) };
    if !new.is_null() {
        unsafe {
            ptr::copy_nonoverlapping(ptr, new, usable_size(ptr).min(size));
            free(ptr);
        }
    }
    new
}

/// # Safety
/// - `ptr` must be live and have come from [`alloc`] or [`realloc`]
pub unsafe fn usable_size(ptr: *mut u8) -> usize {
    unsafe { libc::malloc_usable_size(ptr as *mut c_void) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn over_aligned_allocations_work() {
        for align in [1, 8, 16, 64, 4096] {
            unsafe {
                let p = alloc(100, align);
                assert!(!p.is_null());
                assert_eq!(p as usize % align, 0);
                assert!(usable_size(p) >= 100);
                p.write_bytes(0x11, 100);
                let p = realloc(p, 200);
                assert_eq!(*p.add(99), 0x11);
                free(p);
            }
        }
    }

    #[test]
    fn aligned_realloc_keeps_alignment_and_contents() {
        unsafe {
            let p = alloc(48, 256);
            p.write_bytes(0x5a, 48);
            let q = realloc_aligned(p, 4096, 256);
            assert!(!q.is_null());
            assert_eq!(q as usize % 256, 0);
            assert_eq!(*q.add(47), 0x5a);
            free(q);
        }
    }
}
