//! Guard bytes around user buffers and fill patterns inside them.
//!
//! ```plaintext
//! buf                user_ptr            user_ptr + user_size     buf + buf_size
//! | leading (0x5a..) | user (0xa5.. at first) | trailing (0x5a..) |
//! ```
//!
//! Once freed, the whole buffer is filled with `0xcc`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    arch::mem::{find_mismatch, rfind_mismatch},
    serialize::serde_hex,
    util::num::align_up,
};

pub const REDZONE_SIZE: usize = 16;
pub const REDZONE_PATTERN: u8 = 0x5a;
pub const INITBUF_PATTERN: u8 = 0xa5;
pub const FREEDBUF_PATTERN: u8 = 0xcc;

/// Alignment every `malloc()` result already has
pub const MALLOC_ALIGNMENT: usize = 2 * std::mem::size_of::<usize>();

/// An underlying buffer and the user region carved out of it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBlock {
    #[serde(with = "serde_hex")]
    pub buf: usize,
    pub buf_size: usize,
    #[serde(with = "serde_hex")]
    pub user_ptr: usize,
    pub user_size: usize,
}

impl MemoryBlock {
    pub const fn new(buf: usize, buf_size: usize, user_ptr: usize, user_size: usize) -> Self {
        Self {
            buf,
            buf_size,
            user_ptr,
            user_size,
        }
    }

    /// How big the underlying buffer must be to hold `user_size` bytes aligned
    /// to `align` between two `redzone` byte guards. Alignment beyond what the
    /// real allocator gives us costs `align - 1` bytes of padding.
    pub fn buffer_size(user_size: usize, align: usize, redzone: usize) -> Option<usize> {
        let padding = if align <= MALLOC_ALIGNMENT && redzone % align == 0 {
            0
        } else {
            align - 1
        };
        user_size
            .checked_add(2 * redzone)?
            .checked_add(padding)
    }

    /// Place the user region in a buffer sized by [`MemoryBlock::buffer_size`]
    pub fn place(buf: usize, buf_size: usize, user_size: usize, align: usize, redzone: usize) -> Self {
        let user_ptr = align_up(buf + redzone, align);
        debug_assert!(user_ptr + user_size + redzone <= buf + buf_size);
        Self::new(buf, buf_size, user_ptr, user_size)
    }

    /// Bytes before the user region. May exceed the redzone size when the
    /// block was padded for alignment.
    pub const fn leading(&self) -> usize {
        self.user_ptr - self.buf
    }

    pub const fn trailing(&self) -> usize {
        self.buf_size - self.leading() - self.user_size
    }

    pub const fn user_end(&self) -> usize {
        self.user_ptr + self.user_size
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.buf <= addr && addr < self.buf + self.buf_size
    }
}

/// The extent of a corrupted redzone. Corruption reaching the outer edge has
/// unknown extent, so it is only a lower bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breach {
    pub bytes: usize,
    pub at_least: bool,
}

impl Breach {
    pub const fn exactly(bytes: usize) -> Self {
        Self {
            bytes,
            at_least: false,
        }
    }

    pub const fn at_least(bytes: usize) -> Self {
        Self {
            bytes,
            at_least: true,
        }
    }
}

impl fmt::Display for Breach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.at_least {
            write!(f, "at least {} bytes", self.bytes)
        } else {
            write!(f, "{} bytes", self.bytes)
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RedzoneCheck {
    pub underrun: Option<Breach>,
    pub overrun: Option<Breach>,
}

impl RedzoneCheck {
    pub fn is_clean(&self) -> bool {
        self.underrun.is_none() && self.overrun.is_none()
    }
}

/// Writes and validates the patterns. It holds no state beyond the pattern
/// bytes; blocks are always passed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedzoneGuard {
    pub guard: u8,
    pub init: u8,
    pub freed: u8,
}

impl Default for RedzoneGuard {
    fn default() -> Self {
        Self::new(REDZONE_PATTERN, INITBUF_PATTERN, FREEDBUF_PATTERN)
    }
}

impl RedzoneGuard {
    pub const fn new(guard: u8, init: u8, freed: u8) -> Self {
        Self { guard, init, freed }
    }

    /// Fill both redzones, and the user region too if `init_user`. Re-arming
    /// after a violation passes `false` so the user's data survives.
    ///
    /// # Safety
    /// - The whole underlying buffer must be writable and owned by the block
    pub unsafe fn arm_allocated(&self, block: &MemoryBlock, init_user: bool) {
        unsafe {
            (block.buf as *mut u8).write_bytes(self.guard, block.leading());
            if init_user {
                (block.user_ptr as *mut u8).write_bytes(self.init, block.user_size);
            }
            (block.user_end() as *mut u8).write_bytes(self.guard, block.trailing());
        }
    }

    /// Scan the leading redzone forwards and the trailing one backwards. The
    /// first mismatch found is the one farthest from the user region.
    ///
    /// # Safety
    /// - The whole underlying buffer must be readable
    pub unsafe fn check_allocated(&self, block: &MemoryBlock) -> RedzoneCheck {
        let leading = block.leading();
        let trailing = block.trailing();
        let underrun = unsafe { find_mismatch(block.buf as *const u8, leading, self.guard) }.map(
            |i| match i {
                0 => Breach::at_least(leading),
                i => Breach::exactly(leading - i),
            },
        );
        let overrun =
            unsafe { rfind_mismatch(block.user_end() as *const u8, trailing, self.guard) }.map(
                |i| {
                    if i == trailing - 1 {
                        Breach::at_least(trailing)
                    } else {
                        Breach::exactly(i + 1)
                    }
                },
            );
        RedzoneCheck { underrun, overrun }
    }

    /// # Safety
    /// - The whole underlying buffer must be writable and owned by the block
    pub unsafe fn arm_freed(&self, block: &MemoryBlock) {
        unsafe { (block.buf as *mut u8).write_bytes(self.freed, block.buf_size) }
    }

    /// Offset from the buffer start of the first byte that was written after
    /// the block was freed
    ///
    /// # Safety
    /// - The whole underlying buffer must be readable
    pub unsafe fn check_freed(&self, block: &MemoryBlock) -> Option<usize> {
        unsafe { find_mismatch(block.buf as *const u8, block.buf_size, self.freed) }
    }
}
