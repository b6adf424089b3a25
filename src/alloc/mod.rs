//! The heap-checking machinery: record pools, hash tables, stack interning,
//! redzones, delayed frees, and the diagnostics built on them.

pub mod callstack;
pub mod hook;
pub mod real;
pub mod redzone;
pub mod registry;
pub mod ring;
pub mod slab;
pub mod snapshot;
pub mod table;
pub mod vm;
