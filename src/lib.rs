//! An in-process heap checker. Every tracked allocation is wrapped in
//! redzones and registered with its call stack; frees are parked in a
//! delayed-free ring filled with a pattern. On top of that the engine can
//! list and check the live blocks, diff them against a snapshot, and account
//! them against the process's mappings.
//!
//! Install [`DebugAlloc`] as the global allocator, or drive an [`Engine`]
//! directly.

pub mod alloc;
pub mod arch;
pub mod config;
pub mod engine;
pub mod error;
pub mod externc;
mod lazy_lock;
pub mod os;
pub mod report;
pub mod serialize;
pub mod sync;
pub mod util;

pub use crate::{
    alloc::{
        callstack::{StackId, Trace},
        hook::{global, Bypass, DebugAlloc},
        registry::{Histogram, Status, Unregistered, Violation, ViolationCounts},
        snapshot::{BlockInfo, DiffMode, DiffReport, StackGroup},
        vm::VmUsage,
    },
    config::{Config, Features, SortOrder},
    engine::{CheckSummary, Command, Engine, EngineBuilder, Outcome, Worker},
    error::{Error, Result},
    report::{LogSink, MemorySink, ReportSink},
};

/// Send `log` output to stderr, filtered by `RUST_LOG` (`info` by default).
/// Does nothing if a logger is already installed.
pub fn init_logging() {
    _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
