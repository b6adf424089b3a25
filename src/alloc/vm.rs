//! How much of the address space the tracked buffers actually occupy, by
//! mapping.
//!
//! Every live buffer is rounded out to whole pages and merged into a sorted
//! list of disjoint regions, which is then matched against the accountable
//! mappings of the process.

use log::Level;
use serde::{Deserialize, Serialize};

use crate::{
    alloc::slab::{Handle, Slab},
    engine::Engine,
    error::Result,
    os::{
        maps::MapEntry,
        mem::PAGE_SIZE,
    },
    serialize::serde_hex,
    util::num::{round_down_pow2, round_up},
};

/// A page-aligned `[start, end)` interval
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRegion {
    pub start: usize,
    pub end: usize,
    next: Option<Handle>,
}

/// A sorted, singly-linked list of disjoint [`PageRegion`]s. Adjacent and
/// overlapping inserts are merged. Regions go back to the slab on drop.
pub struct RegionList<'a> {
    slab: &'a Slab<PageRegion>,
    head: Option<Handle>,
    /// The region touched by the last insert; sequential inserts start
    /// their search here
    cursor: Option<Handle>,
}

impl<'a> RegionList<'a> {
    pub fn new(slab: &'a Slab<PageRegion>) -> Self {
        Self {
            slab,
            head: None,
            cursor: None,
        }
    }

    fn read(&self, handle: Handle) -> PageRegion {
        // SAFETY: every handle reachable from the list is live and owned by it
        unsafe { self.slab.read(handle) }
    }

    fn update<R>(&self, handle: Handle, f: impl FnOnce(&mut PageRegion) -> R) -> R {
        // SAFETY: as for `read`
        unsafe { self.slab.update(handle, f) }
    }

    /// Add the pages covering `[addr, addr + size)`
    pub fn insert_block(&mut self, addr: usize, size: usize) -> Result<()> {
        let page = *PAGE_SIZE;
        let start = round_down_pow2(addr, page);
        let end = round_up(addr + size, page);
        self.insert(start, end)
    }

    /// Add `[start, end)`, which must be page-aligned
    pub fn insert(&mut self, start: usize, end: usize) -> Result<()> {
        let mut prev = None;
        let mut cursor = match self.cursor {
            Some(c) if self.read(c).end < start => Some(c),
            _ => self.head,
        };
        while let Some(handle) = cursor {
            let region = self.read(handle);
            if region.end >= start {
                break;
            }
            prev = Some(handle);
            cursor = region.next;
        }

        match cursor {
            Some(handle) if self.read(handle).start <= end => {
                self.merge(handle, start, end);
                self.cursor = Some(handle);
            }
            next => {
                let new = self.slab.alloc(PageRegion { start, end, next })?;
                match prev {
                    Some(prev) => self.update(prev, |r| r.next = Some(new)),
                    None => self.head = Some(new),
                }
                self.cursor = Some(new);
            }
        }
        Ok(())
    }

    /// Widen `handle` to cover `[start, end)` and swallow every following
    /// region it now reaches
    fn merge(&mut self, handle: Handle, start: usize, end: usize) {
        let mut region = self.read(handle);
        region.start = region.start.min(start);
        region.end = region.end.max(end);
        while let Some(next) = region.next {
            let swallowed = self.read(next);
            if swallowed.start > region.end {
                break;
            }
            region.end = region.end.max(swallowed.end);
            region.next = swallowed.next;
            // SAFETY: unlinked above
            unsafe { self.slab.free(next) };
        }
        self.update(handle, |r| *r = region);
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let region = self.read(cursor?);
            cursor = region.next;
            Some((region.start, region.end))
        })
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Sum of the region lengths
    pub fn total(&self) -> usize {
        self.iter().map(|(start, end)| end - start).sum()
    }
}

impl Drop for RegionList<'_> {
    fn drop(&mut self) {
        let mut cursor = self.head.take();
        while let Some(handle) = cursor {
            // SAFETY: owned by the list, and never reached again
            cursor = unsafe { self.slab.free(handle) }.next;
        }
    }
}

/// Tracked bytes inside one mapping
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaUsage {
    #[serde(with = "serde_hex")]
    pub start: usize,
    #[serde(with = "serde_hex")]
    pub end: usize,
    pub path: Option<String>,
    pub used: usize,
}

impl AreaUsage {
    pub fn mapped(&self) -> usize {
        self.end - self.start
    }

    pub fn ratio(&self) -> f64 {
        self.used as f64 / self.mapped() as f64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    #[serde(with = "serde_hex")]
    pub start: usize,
    #[serde(with = "serde_hex")]
    pub end: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmUsage {
    /// Bytes covered by the merged page regions
    pub tracked: usize,
    /// Mappings that hold tracked pages, in address order
    pub areas: Vec<AreaUsage>,
    /// Regions no accountable mapping contains
    pub unmatched: Vec<Span>,
}

impl VmUsage {
    /// Size of every mapping in [`VmUsage::areas`]
    pub fn total_mapped(&self) -> usize {
        self.areas.iter().map(AreaUsage::mapped).sum()
    }

    pub fn total_used(&self) -> usize {
        self.areas.iter().map(|a| a.used).sum()
    }

    pub fn ratio(&self) -> f64 {
        match self.total_mapped() {
            0 => 0.0,
            mapped => self.total_used() as f64 / mapped as f64,
        }
    }
}

/// Attribute each region to the accountable mappings it falls in. A region
/// straddling mappings is split at their boundaries; whatever is left past
/// the last one it reaches is unmatched.
pub fn reconcile(regions: impl IntoIterator<Item = (usize, usize)>, maps: &[MapEntry]) -> VmUsage {
    let areas: Vec<&MapEntry> = maps.iter().filter(|m| m.is_accountable()).collect();
    let mut used = vec![0usize; areas.len()];
    let mut usage = VmUsage::default();
    for (start, end) in regions {
        usage.tracked += end - start;
        let mut from = start;
        for (i, area) in areas.iter().enumerate() {
            if from == end {
                break;
            }
            if area.start <= from && from < area.end {
                let upto = end.min(area.end);
                used[i] += upto - from;
                from = upto;
            }
        }
        if from < end {
            usage.unmatched.push(Span { start: from, end });
        }
    }
    usage.areas = areas
        .iter()
        .zip(used)
        .filter(|(_, used)| *used > 0)
        .map(|(area, used)| AreaUsage {
            start: area.start,
            end: area.end,
            path: area.path.clone(),
            used,
        })
        .collect();
    usage
}

impl Engine {
    /// Merge the pages of every live buffer and match them against the
    /// process's mappings
    pub fn vm_usage(&self) -> Result<VmUsage> {
        let _bypass = self.hooks.bypass();
        let _diag = self.diag.lock();
        self.current_copy.destroy(&self.records);
        let copied = self.duplicate(&self.live, &self.current_copy);
        let regions = copied.and_then(|_| {
            let mut regions = RegionList::new(&self.regions);
            let guard = self.current_copy.lock();
            for handle in self.current_copy.iter(&self.records, &guard) {
                // SAFETY: the copy table is only touched under the diag lock
                let block = unsafe { self.records.read(handle) }.block;
                regions.insert_block(block.buf, block.buf_size)?;
            }
            Ok(regions.iter().collect::<Vec<_>>())
        });
        self.current_copy.destroy(&self.records);
        let maps = self.maps.mappings()?;
        let usage = reconcile(regions?, &maps);

        self.with_report(Level::Info, |r| {
            for span in &usage.unmatched {
                r.line(format_args!("{:#x}-{:#x} does not match", span.start, span.end));
            }
            for area in &usage.areas {
                r.line(format_args!(
                    "{:#x}-{:#x} {}: {} / {} bytes ({:.2}%)",
                    area.start,
                    area.end,
                    area.path.as_deref().unwrap_or("[anon]"),
                    area.used,
                    area.mapped(),
                    area.ratio() * 100.0
                ));
            }
            r.line(format_args!("total_arena_size: {} bytes", usage.total_mapped()));
            r.line(format_args!(
                "total_memblk_usage: {} bytes ({:.2}%)",
                usage.total_used(),
                usage.ratio() * 100.0
            ));
            r.blank();
        });
        Ok(usage)
    }
}
