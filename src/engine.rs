//! The process-scoped engine and the worker that runs diagnostics on it.

use std::{ops::Deref, thread::JoinHandle};

use chrono::{DateTime, FixedOffset, Local, Offset, Utc};
use crossbeam::channel::{self, Sender};
use log::Level;
use serde::{Deserialize, Serialize};

use crate::{
    alloc::{
        callstack::{CallStacks, StackId, Trace},
        hook::{Bypass, Suppression, UntrackedRecord},
        real,
        redzone::RedzoneGuard,
        registry::{
            AllocRecord, CheckedAt, FreedRecord, Histogram, Manage, Status, ViolationCounters,
        },
        ring::FreeRing,
        slab::Slab,
        snapshot::{BlockInfo, DiffMode, DiffReport, StackGroup},
        table::PtrTable,
        vm::{PageRegion, VmUsage},
    },
    config::Config,
    error::{Error, Result},
    os::maps::{MappingSource, ProcSelfMaps},
    report::{BacktraceResolver, LogSink, Report, ReportSink, SymbolResolver},
    sync::Mutex,
};

/// Every table, pool and counter of one heap checker. Dropping it unmaps all
/// of them and releases the buffers parked in the delayed-free ring; blocks
/// still live stay with their owners.
pub struct Engine {
    pub(crate) config: Config,
    pub(crate) guard: RedzoneGuard,
    /// Redzone actually in use, `0` without buffer checks
    pub(crate) redzone: usize,
    pub(crate) hooks: Suppression,
    pub(crate) records: Slab<AllocRecord>,
    pub(crate) freed_records: Slab<FreedRecord>,
    pub(crate) regions: Slab<PageRegion>,
    pub(crate) stacks: CallStacks,
    pub(crate) live: PtrTable<AllocRecord>,
    pub(crate) freed: PtrTable<FreedRecord>,
    pub(crate) snapshot: PtrTable<AllocRecord>,
    /// Scratch copies for diffs, listings and vm usage
    pub(crate) current_copy: PtrTable<AllocRecord>,
    pub(crate) snapshot_copy: PtrTable<AllocRecord>,
    /// Buffers handed out inside a bypass
    pub(crate) untracked_records: Slab<UntrackedRecord>,
    pub(crate) untracked: PtrTable<UntrackedRecord>,
    pub(crate) manage: Mutex<Manage>,
    pub(crate) violations: ViolationCounters,
    /// Serialises diagnostics, which share the scratch tables and the group
    /// links
    pub(crate) diag: Mutex<()>,
    pub(crate) sink: Box<dyn ReportSink>,
    pub(crate) resolver: Box<dyn SymbolResolver>,
    pub(crate) maps: Box<dyn MappingSource>,
    /// Local offset, fixed at build so reports never touch the time zone
    /// cache
    utc_offset: FixedOffset,
}

pub struct EngineBuilder {
    config: Config,
    sink: Box<dyn ReportSink>,
    resolver: Box<dyn SymbolResolver>,
    maps: Box<dyn MappingSource>,
}

impl EngineBuilder {
    /// Where reports go; [`LogSink`] by default
    pub fn sink(mut self, sink: impl ReportSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// How frames are named; [`BacktraceResolver`] by default
    pub fn resolver(mut self, resolver: impl SymbolResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Where mappings come from; [`ProcSelfMaps`] by default
    pub fn maps(mut self, maps: impl MappingSource + 'static) -> Self {
        self.maps = Box::new(maps);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;
        let batch = config.pool_batch_pages;
        let ring = match config.free_ring_capacity {
            0 => None,
            capacity => Some(FreeRing::new(capacity)?),
        };
        Ok(Engine {
            guard: config.guard(),
            redzone: config.effective_redzone(),
            hooks: Suppression::new(),
            records: Slab::new("alloc record", batch)?,
            freed_records: Slab::new("freed record", batch)?,
            regions: Slab::new("page region", batch)?,
            stacks: CallStacks::new(config.stack_table_buckets, batch)?,
            live: PtrTable::new(config.live_table_buckets)?,
            freed: PtrTable::new(config.freed_table_buckets)?,
            snapshot: PtrTable::new(config.live_table_buckets)?,
            current_copy: PtrTable::new(config.live_table_buckets)?,
            snapshot_copy: PtrTable::new(config.live_table_buckets)?,
            untracked_records: Slab::new("untracked record", batch)?,
            untracked: PtrTable::new(config.untracked_table_buckets)?,
            manage: Mutex::new(Manage::new(ring)),
            violations: ViolationCounters::default(),
            diag: Mutex::new(()),
            sink: self.sink,
            resolver: self.resolver,
            maps: self.maps,
            utc_offset: Local::now().offset().fix(),
            config,
        })
    }
}

/// Result of a check-all sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSummary {
    pub live_checked: usize,
    pub freed_checked: usize,
    pub violations: usize,
}

impl CheckSummary {
    pub fn passed(&self) -> bool {
        self.violations == 0
    }
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder {
            config,
            sink: Box::new(LogSink),
            resolver: Box::new(BacktraceResolver),
            maps: Box::new(ProcSelfMaps),
        }
    }

    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop tracking this thread's allocations for as long as the token
    /// lives. Anything allocated meanwhile goes straight back to the real
    /// allocator when freed, inside a bypass or not.
    pub fn bypass(&self) -> Bypass<'_> {
        self.hooks.bypass()
    }

    pub(crate) fn buffer_check(&self) -> bool {
        self.config.features.buffer_check
    }

    /// The frames of an interned call stack
    pub fn call_stack(&self, id: StackId) -> Trace {
        self.stacks.trace(id)
    }

    /// Wall-clock time for reports
    pub(crate) fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.utc_offset)
    }

    /// Format one report into the sink, inside a bypass
    pub(crate) fn with_report<R>(&self, level: Level, f: impl FnOnce(&mut Report<'_>) -> R) -> R {
        let _bypass = self.hooks.bypass();
        let maps = match self.maps.mappings() {
            Ok(maps) => maps,
            Err(e) => {
                log::warn!(target: "heapcheck", "cannot read mappings, frames stay unnamed: {e}");
                Vec::new()
            }
        };
        let mut report = Report::new(
            &*self.sink,
            &*self.resolver,
            &maps,
            self.config.report_skip_frames,
        );
        report.set_level(level);
        f(&mut report)
    }

    /// Check the redzones of every live block and the fill of every parked
    /// one. Broken patterns are reported once and then re-armed.
    pub fn check_all(&self) -> CheckSummary {
        let _bypass = self.hooks.bypass();
        let _diag = self.diag.lock();
        self.with_report(Level::Info, |r| {
            r.line(format_args!("checking all allocated blocks..."))
        });
        let mut summary = CheckSummary::default();
        if self.buffer_check() {
            let guard = self.live.lock();
            for handle in self.live.iter(&self.records, &guard) {
                // SAFETY: the live lock keeps the record and its buffer alive
                let record = unsafe { self.records.read(handle) };
                let check = unsafe { self.guard.check_allocated(&record.block) };
                summary.live_checked += 1;
                if !check.is_clean() {
                    summary.violations += 1;
                    self.report_corruption(&record, &check, CheckedAt::Sweep);
                    // SAFETY: as above; the user region is left alone
                    unsafe { self.guard.arm_allocated(&record.block, false) };
                }
            }
            drop(guard);

            let guard = self.freed.lock();
            for handle in self.freed.iter(&self.freed_records, &guard) {
                // SAFETY: the freed lock keeps parked records from retiring
                let record = unsafe { self.freed_records.read(handle) };
                summary.freed_checked += 1;
                if let Some(offset) = unsafe { self.guard.check_freed(&record.block) } {
                    summary.violations += 1;
                    self.report_write_after_free(&record, offset);
                    unsafe { self.guard.arm_freed(&record.block) };
                }
            }
        }
        self.with_report(Level::Info, |r| match summary.violations {
            0 => r.line(format_args!("no violation found")),
            n => r.line(format_args!("{n} violation(s) found")),
        });
        summary
    }

    /// Run one diagnostic command
    pub fn execute(&self, command: Command) -> Result<Outcome> {
        let _bypass = self.hooks.bypass();
        Ok(match command {
            Command::Status => Outcome::Status(self.print_status()),
            Command::ListAll => Outcome::Blocks(self.list_all()),
            Command::ListAllByCallStack => Outcome::Groups(self.list_by_callstack()?),
            Command::CheckAll => Outcome::Check(self.check_all()),
            Command::CreateSnapshot => Outcome::SnapshotCreated {
                blocks: self.create_snapshot()?,
            },
            Command::DestroySnapshot => Outcome::SnapshotDestroyed {
                blocks: self.destroy_snapshot(),
            },
            Command::Compare => Outcome::Diff(self.compare(DiffMode::Flat)?),
            Command::CompareByCallStack => Outcome::Diff(self.compare(DiffMode::ByCallStack)?),
            Command::Histogram => Outcome::Histogram(self.print_histogram()),
            Command::VmUsage => Outcome::VmUsage(self.vm_usage()?),
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let parked = match self.manage.get_mut().ring.as_mut() {
            Some(ring) => ring.drain(),
            None => return,
        };
        for handle in parked {
            // SAFETY: we are the last user of the engine, and parked records
            // own their buffers
            unsafe {
                let record = self.freed_records.read(handle);
                real::free(record.block.buf as *mut u8);
            }
        }
    }
}

/// The diagnostics the worker can run, in `hc_command` code order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Status,
    ListAll,
    ListAllByCallStack,
    CheckAll,
    CreateSnapshot,
    DestroySnapshot,
    Compare,
    CompareByCallStack,
    Histogram,
    VmUsage,
}

impl Command {
    pub const ALL: [Command; 10] = [
        Command::Status,
        Command::ListAll,
        Command::ListAllByCallStack,
        Command::CheckAll,
        Command::CreateSnapshot,
        Command::DestroySnapshot,
        Command::Compare,
        Command::CompareByCallStack,
        Command::Histogram,
        Command::VmUsage,
    ];

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Status(Status),
    Blocks(Vec<BlockInfo>),
    Groups(Vec<StackGroup>),
    Check(CheckSummary),
    SnapshotCreated { blocks: usize },
    SnapshotDestroyed { blocks: usize },
    Diff(DiffReport),
    Histogram(Histogram),
    VmUsage(VmUsage),
}

impl Outcome {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

const WORKER_QUEUE: usize = 16;

enum Message {
    Run(Command, Option<Sender<Result<Outcome>>>),
    Shutdown,
}

/// A background thread running diagnostics, one at a time, each inside a
/// bypass
pub struct Worker {
    tx: Sender<Message>,
    thread: Option<JoinHandle<()>>,
    /// Whether the calling thread holds the engine's bypass
    bypassed: Box<dyn Fn() -> bool + Send + Sync>,
}

impl Worker {
    pub fn spawn<E>(engine: E) -> Result<Self>
    where
        E: Deref<Target = Engine> + Clone + Send + Sync + 'static,
    {
        let caller = engine.clone();
        let bypassed = Box::new(move || caller.hooks.held_here());
        let (tx, rx) = channel::bounded::<Message>(WORKER_QUEUE);
        let thread = std::thread::Builder::new()
            .name("heapcheck-worker".into())
            .spawn(move || {
                for message in rx.iter() {
                    let (command, reply) = match message {
                        Message::Run(command, reply) => (command, reply),
                        Message::Shutdown => break,
                    };
                    let _bypass = engine.bypass();
                    let outcome = engine.execute(command);
                    if let Err(e) = &outcome {
                        log::error!(target: "heapcheck", "{command:?} failed: {e}");
                    }
                    if let Some(reply) = reply {
                        _ = reply.send(outcome);
                    }
                }
            })?;
        Ok(Self {
            tx,
            thread: Some(thread),
            bypassed,
        })
    }

    /// Queue `command` and don't wait for it
    pub fn submit(&self, command: Command) -> Result<()> {
        self.tx
            .send(Message::Run(command, None))
            .map_err(|_| Error::WorkerStopped)
    }

    /// Run `command` and wait for its outcome. The outcome was built inside
    /// the worker's bypass; see [`Engine::bypass`].
    ///
    /// Fails with [`Error::InsideBypass`] if the calling thread holds the
    /// engine's bypass: the worker needs one too and would wait forever.
    pub fn call(&self, command: Command) -> Result<Outcome> {
        if (self.bypassed)() {
            return Err(Error::InsideBypass);
        }
        let (reply, outcome) = channel::bounded(1);
        self.tx
            .send(Message::Run(command, Some(reply)))
            .map_err(|_| Error::WorkerStopped)?;
        outcome.recv().map_err(|_| Error::WorkerStopped)?
    }

    /// Finish queued commands and join the thread
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            _ = self.tx.send(Message::Shutdown);
            _ = thread.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}
