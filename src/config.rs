//! Runtime configuration. Everything that used to be a compile-time switch is
//! a field here; see [`Features`] for what each toggle turns off.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    alloc::{
        redzone::{RedzoneGuard, FREEDBUF_PATTERN, INITBUF_PATTERN, REDZONE_PATTERN, REDZONE_SIZE},
        ring::FREE_FIFO_SIZE,
        slab::{ALIGNMENT_SIZE, MAX_POOLS, MMAP_BATCH_PAGE_NUM},
        table::{ALLOC_TABLE_SIZE, CALLSTACK_TABLE_SIZE, FREE_TABLE_SIZE, UNTRACKED_TABLE_SIZE},
    },
    error::{Error, Result},
};

/// Order of block and group listings, by size (or group total)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Descending,
    Ascending,
}

impl SortOrder {
    /// Stable sort of `items` by `key` in this order
    pub fn sort_by_key<T, K>(self, items: &mut [T], mut key: impl FnMut(&T) -> K)
    where
        K: Ord,
    {
        match self {
            Self::Ascending => items.sort_by_key(key),
            Self::Descending => items.sort_by(|a, b| key(b).cmp(&key(a))),
        }
    }
}

impl FromStr for SortOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(Self::Ascending),
            "desc" | "descending" => Ok(Self::Descending),
            _ => Err(Error::Config(format!("unknown sort order {s:?}"))),
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ascending => "asc",
            Self::Descending => "desc",
        })
    }
}

/// | callstack | buffer_check | effect |
/// |-----------|--------------|--------|
/// | on  | on  | everything |
/// | off | on  | no stack capture; by-call-stack operations fail; diffs match on address and size only |
/// | on  | off | no redzones, no patterns, nothing to check |
/// | off | off | counters, histogram, flat listings and diffs, vm usage |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    pub callstack: bool,
    pub buffer_check: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            callstack: true,
            buffer_check: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub redzone_size: usize,
    pub guard_pattern: u8,
    pub init_pattern: u8,
    pub freed_pattern: u8,
    /// `0` releases buffers as soon as they are freed
    pub free_ring_capacity: usize,
    pub live_table_buckets: usize,
    pub freed_table_buckets: usize,
    pub stack_table_buckets: usize,
    /// Buckets for the engine's own untracked allocations
    pub untracked_table_buckets: usize,
    pub pool_batch_pages: usize,
    /// Innermost frames of every captured stack that belong to the engine
    /// itself and are hidden from reports
    pub report_skip_frames: usize,
    pub sort: SortOrder,
    pub features: Features,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redzone_size: REDZONE_SIZE,
            guard_pattern: REDZONE_PATTERN,
            init_pattern: INITBUF_PATTERN,
            freed_pattern: FREEDBUF_PATTERN,
            free_ring_capacity: FREE_FIFO_SIZE,
            live_table_buckets: ALLOC_TABLE_SIZE,
            freed_table_buckets: FREE_TABLE_SIZE,
            stack_table_buckets: CALLSTACK_TABLE_SIZE,
            untracked_table_buckets: UNTRACKED_TABLE_SIZE,
            pool_batch_pages: MMAP_BATCH_PAGE_NUM,
            report_skip_frames: 2,
            sort: SortOrder::default(),
            features: Features::default(),
        }
    }
}

impl Config {
    /// The defaults, overlaid with `HEAPCHECK_CONFIG` (JSON) and then the
    /// individual `HEAPCHECK_*` variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Like [`Config::from_env`], reading variables through `var`
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match var("HEAPCHECK_CONFIG") {
            Some(json) => serde_json::from_str(&json)?,
            None => Self::default(),
        };
        if let Some(v) = var("HEAPCHECK_REDZONE") {
            config.redzone_size = parse_var("HEAPCHECK_REDZONE", &v)?;
        }
        if let Some(v) = var("HEAPCHECK_FREE_RING") {
            config.free_ring_capacity = parse_var("HEAPCHECK_FREE_RING", &v)?;
        }
        if let Some(v) = var("HEAPCHECK_CALLSTACK") {
            config.features.callstack = parse_flag("HEAPCHECK_CALLSTACK", &v)?;
        }
        if let Some(v) = var("HEAPCHECK_BUFFER_CHECK") {
            config.features.buffer_check = parse_flag("HEAPCHECK_BUFFER_CHECK", &v)?;
        }
        if let Some(v) = var("HEAPCHECK_SORT") {
            config.sort = v.parse()?;
        }
        if let Some(v) = var("HEAPCHECK_SKIP_FRAMES") {
            config.report_skip_frames = parse_var("HEAPCHECK_SKIP_FRAMES", &v)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.redzone_size % ALIGNMENT_SIZE != 0 {
            return Err(Error::Config(format!(
                "redzone size {} is not a multiple of {ALIGNMENT_SIZE}",
                self.redzone_size
            )));
        }
        for (name, buckets) in [
            ("live_table_buckets", self.live_table_buckets),
            ("freed_table_buckets", self.freed_table_buckets),
            ("stack_table_buckets", self.stack_table_buckets),
            ("untracked_table_buckets", self.untracked_table_buckets),
        ] {
            if buckets == 0 {
                return Err(Error::Config(format!("{name} must be nonzero")));
            }
        }
        if self.pool_batch_pages == 0 {
            return Err(Error::Config("pool_batch_pages must be nonzero".into()));
        }
        if self.pool_batch_pages > MAX_POOLS {
            return Err(Error::Config(format!(
                "pool_batch_pages {} exceeds {MAX_POOLS}",
                self.pool_batch_pages
            )));
        }
        if self.guard_pattern == self.freed_pattern {
            return Err(Error::Config(
                "guard and freed patterns must differ".into(),
            ));
        }
        Ok(())
    }

    /// Redzone actually placed around blocks
    pub fn effective_redzone(&self) -> usize {
        if self.features.buffer_check {
            self.redzone_size
        } else {
            0
        }
    }

    pub fn guard(&self) -> RedzoneGuard {
        RedzoneGuard::new(self.guard_pattern, self.init_pattern, self.freed_pattern)
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
{
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name}={value:?} is not valid")))
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(Error::Config(format!("{name}={value:?} is not a flag"))),
    }
}

#[cfg(test)]
mod tests {
    use hashbrown::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.effective_redzone(), REDZONE_SIZE);
        assert_eq!(config.free_ring_capacity, FREE_FIFO_SIZE);
    }

    #[test]
    fn env_overlays_json_correctly() {
        let config = Config::from_vars(vars(&[
            ("HEAPCHECK_CONFIG", r#"{"redzone_size": 32, "sort": "ascending"}"#),
            ("HEAPCHECK_FREE_RING", "4"),
            ("HEAPCHECK_CALLSTACK", "off"),
            ("HEAPCHECK_SORT", "desc"),
        ]))
        .unwrap();
        assert_eq!(config.redzone_size, 32);
        assert_eq!(config.free_ring_capacity, 4);
        assert!(!config.features.callstack);
        assert!(config.features.buffer_check);
        assert_eq!(config.sort, SortOrder::Descending);
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(matches!(
            Config::from_vars(vars(&[("HEAPCHECK_REDZONE", "12")])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::from_vars(vars(&[("HEAPCHECK_BUFFER_CHECK", "maybe")])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::from_json(r#"{"live_table_buckets": 0}"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::from_json(r#"{"pool_batch_pages": 18446744073709551615}"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(Config::from_json("{"), Err(Error::Json(_))));
    }

    #[test]
    fn disabling_buffer_check_drops_redzones() {
        let mut config = Config::default();
        config.features.buffer_check = false;
        assert_eq!(config.effective_redzone(), 0);
        let json = config.to_json().unwrap();
        assert_eq!(Config::from_json(&json).unwrap(), config);
    }

    #[test]
    fn sort_order_sorts_correctly() {
        let mut sizes = [3, 1, 2];
        SortOrder::Descending.sort_by_key(&mut sizes, |&s| s);
        assert_eq!(sizes, [3, 2, 1]);
        SortOrder::Ascending.sort_by_key(&mut sizes, |&s| s);
        assert_eq!(sizes, [1, 2, 3]);
        assert_eq!("ASC".parse::<SortOrder>().unwrap(), SortOrder::Ascending);
    }
}
