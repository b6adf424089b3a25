//! Byte loads from memory the host program owns and may be writing to
//! concurrently. These carry no provenance and don't create references.

/// Read a single byte from `src`
///
/// # Safety
/// - `src` must be mapped and readable
#[inline(always)]
pub unsafe fn load_byte(src: *const u8) -> u8 {
    debug_assert!(!src.is_null());

    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::asm;

        let out: u8;
        unsafe {
            asm! {
                "mov {out}, byte ptr [{src}]",
                src = in(reg) src,
                out = out(reg_byte) out,
                options(nostack, preserves_flags, readonly),
            }
        }
        out
    }

    #[cfg(not(target_arch = "x86_64"))]
    unsafe {
        src.read_volatile()
    }
}

/// Copy `count` bytes out of a buffer the host owns
///
/// # Safety
/// - `src..src + count` must be mapped and readable
pub unsafe fn copy_maybe_garbage(src: *const u8, count: usize) -> Vec<u8> {
    (0..count).map(|i| unsafe { load_byte(src.add(i)) }).collect()
}

/// Index of the first byte in `src..src + count` (scanning forwards) that is
/// not `pattern`
///
/// # Safety
/// - `src..src + count` must be mapped and readable
pub unsafe fn find_mismatch(src: *const u8, count: usize, pattern: u8) -> Option<usize> {
    (0..count).find(|&i| unsafe { load_byte(src.add(i)) } != pattern)
}

/// Index of the last byte in `src..src + count` that is not `pattern`, found
/// by scanning backwards from the end
///
/// # Safety
/// - `src..src + count` must be mapped and readable
pub unsafe fn rfind_mismatch(src: *const u8, count: usize, pattern: u8) -> Option<usize> {
    (0..count).rev().find(|&i| unsafe { load_byte(src.add(i)) } != pattern)
}
