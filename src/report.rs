//! Where diagnostics go, and how call stacks are turned into text.

use std::{ffi::c_void, fmt, sync::Arc};

use chrono::{DateTime, FixedOffset};
use log::Level;
use serde::{Deserialize, Serialize};

use crate::{
    alloc::callstack::Trace,
    os::maps::{find_mapping, MapEntry},
    sync::Mutex,
};

pub const SEPARATOR: &str = "-------------------------------------------------";

/// A line-oriented text sink for every report the engine writes
pub trait ReportSink: Send + Sync {
    fn line(&self, level: Level, line: &str);
}

impl<S> ReportSink for Arc<S>
where
    S: ReportSink + ?Sized,
{
    fn line(&self, level: Level, line: &str) {
        (**self).line(level, line)
    }
}

/// Forwards every line to the `log` facade, on target `heapcheck`
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn line(&self, level: Level, line: &str) {
        log::log!(target: "heapcheck", level, "{line}");
    }
}

/// Keeps every line, mostly for tests
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(Level, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything written so far
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock())
            .into_iter()
            .map(|(_, line)| line)
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|(_, line)| line.contains(needle))
    }

    /// Number of lines written at `level`
    pub fn count(&self, level: Level) -> usize {
        self.lines.lock().iter().filter(|(l, _)| *l == level).count()
    }

    pub fn text(&self) -> String {
        let lines = self.lines.lock();
        let mut text = String::new();
        for (_, line) in lines.iter() {
            text.push_str(line);
            text.push('\n');
        }
        text
    }
}

impl ReportSink for MemorySink {
    fn line(&self, level: Level, line: &str) {
        self.lines.lock().push((level, line.to_owned()));
    }
}

/// One (possibly inlined) function at an address
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSymbol {
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// Turns a code address into functions, outermost first when frames were
/// inlined. `None` means nothing is known about the address.
pub trait SymbolResolver: Send + Sync {
    fn resolve(&self, addr: usize) -> Option<Vec<FrameSymbol>>;
}

/// Resolves through the debug info of the running binary
#[derive(Clone, Copy, Debug, Default)]
pub struct BacktraceResolver;

impl SymbolResolver for BacktraceResolver {
    fn resolve(&self, addr: usize) -> Option<Vec<FrameSymbol>> {
        let mut symbols = Vec::new();
        // Return addresses point after the call; look up the call itself
        backtrace::resolve(addr.saturating_sub(1) as *mut c_void, |symbol| {
            symbols.push(FrameSymbol {
                function: symbol
                    .name()
                    .map(|name| name.to_string())
                    .unwrap_or_else(|| "??".to_owned()),
                file: symbol.filename().map(|path| path.display().to_string()),
                line: symbol.lineno(),
            });
        });
        if symbols.is_empty() {
            return None;
        }
        // innermost first from the unwinder
        symbols.reverse();
        Some(symbols)
    }
}

/// Never resolves anything. Reports still show mappings and offsets.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSymbols;

impl SymbolResolver for NoSymbols {
    fn resolve(&self, _addr: usize) -> Option<Vec<FrameSymbol>> {
        None
    }
}

/// `2024/05/01/13:37:00.000042`
pub fn format_timestamp(at: &DateTime<FixedOffset>) -> String {
    at.format("%Y/%m/%d/%H:%M:%S%.6f").to_string()
}

/// Formats one report. Must only be used inside a bypass, since every line
/// allocates.
pub(crate) struct Report<'a> {
    sink: &'a dyn ReportSink,
    resolver: &'a dyn SymbolResolver,
    maps: &'a [MapEntry],
    skip_frames: usize,
    level: Level,
}

impl<'a> Report<'a> {
    pub fn new(
        sink: &'a dyn ReportSink,
        resolver: &'a dyn SymbolResolver,
        maps: &'a [MapEntry],
        skip_frames: usize,
    ) -> Self {
        Self {
            sink,
            resolver,
            maps,
            skip_frames,
            level: Level::Info,
        }
    }

    pub fn set_level(&mut self, level: Level) {
        self.level = level;
    }

    pub fn line(&mut self, args: fmt::Arguments<'_>) {
        match args.as_str() {
            Some(s) => self.sink.line(self.level, s),
            None => self.sink.line(self.level, &args.to_string()),
        }
    }

    pub fn blank(&mut self) {
        self.sink.line(self.level, "");
    }

    pub fn separator(&mut self) {
        self.sink.line(self.level, SEPARATOR);
    }

    /// Print `trace`, hiding the innermost frames that belong to the engine
    pub fn call_stack(&mut self, trace: &Trace) {
        self.frames(trace.frames().iter().skip(self.skip_frames).copied());
    }

    /// Print where we are now, hiding this function's own frame as well
    pub fn current_call_stack(&mut self) {
        let trace = Trace::capture();
        self.frames(trace.frames().iter().skip(self.skip_frames + 1).copied());
    }

    fn frames(&mut self, frames: impl Iterator<Item = usize>) {
        for addr in frames {
            let Some(mapping) = find_mapping(self.maps, addr) else {
                self.line(format_args!("UNKNOWN FILE [{addr:#x}]"));
                continue;
            };
            let offset = (addr - mapping.start) as u64 + mapping.offset;
            match self.resolver.resolve(addr) {
                None => self.line(format_args!("UNKNOWN SYMBOL [{addr:#x} ({offset:#x})]")),
                Some(symbols) => {
                    let outer = symbols.first().map_or("??", |s| s.function.as_str());
                    self.line(format_args!(
                        "{outer} @ {} [{addr:#x} ({offset:#x})]",
                        mapping.name()
                    ));
                    for symbol in &symbols {
                        if let (Some(file), Some(line)) = (&symbol.file, symbol.line) {
                            self.line(format_args!("  |- {} in {file}:{line}", symbol.function));
                        }
                    }
                }
            }
        }
    }

    /// `0x5a 0x5a ...`, sixteen bytes to a line
    pub fn hex_dump(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks(16) {
            let line = chunk
                .iter()
                .map(|b| format!("{b:#04x}"))
                .collect::<Vec<_>>()
                .join(" ");
            self.line(format_args!("{line}"));
        }
    }
}
