//! Reading the process's own address-space layout.

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    serialize::serde_hex,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    /// `p` (copy-on-write) rather than `s` (shared)
    pub private: bool,
}

impl Perms {
    fn parse(field: &str) -> Option<Self> {
        let b = field.as_bytes();
        if b.len() < 4 {
            return None;
        }
        Some(Self {
            read: b[0] == b'r',
            write: b[1] == b'w',
            exec: b[2] == b'x',
            private: b[3] == b'p',
        })
    }

    pub fn is_inaccessible(&self) -> bool {
        !self.read && !self.write && !self.exec
    }
}

/// One line of `/proc/<pid>/maps`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapEntry {
    #[serde(with = "serde_hex")]
    pub start: usize,
    #[serde(with = "serde_hex")]
    pub end: usize,
    pub perms: Perms,
    pub offset: u64,
    pub path: Option<String>,
}

impl MapEntry {
    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Areas the heap could live in: private and not a `---p` guard
    pub fn is_accountable(&self) -> bool {
        self.perms.private && !self.perms.is_inaccessible()
    }

    /// Name used in reports, e.g. `/usr/lib/libc.so.6` or `[heap]`
    pub fn name(&self) -> &str {
        self.path.as_deref().unwrap_or("[anon]")
    }
}

/// Parse the text of a `maps` file, keeping the kernel's (address) order
pub fn parse_maps(text: &str) -> Result<Vec<MapEntry>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_line(line).ok_or_else(|| Error::MapsParse { line: line.to_owned() }))
        .collect()
}

fn parse_line(line: &str) -> Option<MapEntry> {
    let mut fields = line.split_ascii_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let perms = Perms::parse(fields.next()?)?;
    let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.collect::<Vec<_>>().join(" ");
    Some(MapEntry {
        start: usize::from_str_radix(start, 16).ok()?,
        end: usize::from_str_radix(end, 16).ok()?,
        perms,
        offset,
        path: (!path.is_empty()).then_some(path),
    })
}

/// Something that can list the mappings of the current process
pub trait MappingSource: Send + Sync {
    fn mappings(&self) -> Result<Vec<MapEntry>>;
}

/// Reads `/proc/self/maps`
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcSelfMaps;

impl MappingSource for ProcSelfMaps {
    fn mappings(&self) -> Result<Vec<MapEntry>> {
        let text = std::fs::read_to_string("/proc/self/maps")?;
        parse_maps(&text)
    }
}

/// A fixed list of mappings, for tests and offline analysis
#[derive(Clone, Debug, Default)]
pub struct StaticMaps(pub Vec<MapEntry>);

impl MappingSource for StaticMaps {
    fn mappings(&self) -> Result<Vec<MapEntry>> {
        Ok(self.0.clone())
    }
}

/// Find the mapping containing `addr` in an address-ordered list
pub fn find_mapping(maps: &[MapEntry], addr: usize) -> Option<&MapEntry> {
    let i = maps.partition_point(|m| m.end <= addr);
    maps.get(i).filter(|m| m.contains(addr))
}
