use std::sync::Arc;

use hashbrown::HashMap;
use heapcheck::{
    os::maps::{ProcSelfMaps, StaticMaps},
    report::NoSymbols,
    Config, DiffMode, Engine, Error, Features, MemorySink, Trace, Unregistered,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn small_config() -> Config {
    Config {
        live_table_buckets: 251,
        freed_table_buckets: 13,
        stack_table_buckets: 61,
        pool_batch_pages: 1,
        ..Config::default()
    }
}

fn engine_with(config: Config) -> (Engine, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::builder(config)
        .sink(Arc::clone(&sink))
        .resolver(NoSymbols)
        .maps(StaticMaps::default())
        .build()
        .unwrap();
    (engine, sink)
}

fn engine() -> (Engine, Arc<MemorySink>) {
    engine_with(small_config())
}

#[test]
fn one_byte_overrun_is_reported_at_free() {
    let (engine, sink) = engine();
    unsafe {
        let p = engine.track_alloc(10, 8);
        p.add(10).write(b'x');
        engine.track_free(p);
    }
    assert!(sink.contains("buffer overrun (1 bytes)"));
    assert!(sink.contains("buffer contents:"));
    assert!(sink.contains("This memory block was allocated from:"));
    assert!(sink.contains("and is being freed from:"));
    assert!(!sink.contains("underrun"));
    let violations = engine.violations();
    assert_eq!(violations.overrun, 1);
    assert_eq!(violations.total(), 1);
}

#[test]
fn underrun_is_reported_at_free() {
    let (engine, sink) = engine();
    unsafe {
        let p = engine.track_alloc(32, 8);
        p.sub(1).write(0);
        engine.track_free(p);
    }
    assert!(sink.contains("buffer underrun (1 bytes)"));
    assert_eq!(engine.violations().underrun, 1);
}

#[test]
fn clean_blocks_report_nothing() {
    let (engine, sink) = engine();
    unsafe {
        let p = engine.track_alloc(64, 16);
        assert_eq!(p as usize % 16, 0);
        p.write_bytes(0xee, 64);
        engine.track_free(p);
    }
    assert_eq!(engine.violations().total(), 0);
    assert!(!sink.contains("buffer"));
}

#[test]
fn use_after_free_is_caught_on_eviction() {
    let (engine, sink) = engine_with(Config {
        free_ring_capacity: 1,
        ..small_config()
    });
    unsafe {
        let a = engine.track_alloc(32, 8);
        engine.track_free(a);
        assert_eq!(engine.parked(), 1);
        // the ring still holds the buffer, so this write lands in it
        a.add(3).write(0);
        let b = engine.track_alloc(32, 8);
        engine.track_free(b);
    }
    assert_eq!(engine.parked(), 1);
    assert!(sink.contains("FREED area"));
    assert!(sink.contains("was write-accessed!!"));
    let leading = engine.config().redzone_size;
    assert!(sink.contains(&format!(
        "write-access was detected at offset {} from the top of the leading red zone",
        leading + 3
    )));
    assert_eq!(engine.violations().write_after_free, 1);
}

#[test]
fn double_free_and_unknown_address_are_told_apart() {
    let (engine, sink) = engine();
    let p = unsafe { engine.track_alloc(48, 8) };
    let first = unsafe { engine.unregister(p as usize, None) };
    assert_eq!(first, Unregistered::Deferred);
    let second = unsafe { engine.unregister(p as usize, None) };
    assert_eq!(second, Unregistered::DoubleFree);
    assert!(sink.contains(&format!("Double delete or free {:#x}", p as usize)));
    assert!(sink.contains("and then is being freed from:"));

    let bogus = 0xdead_bee0usize;
    let third = unsafe { engine.unregister(bogus, None) };
    assert_eq!(third, Unregistered::UnknownAddress);
    assert!(sink.contains(&format!("ILLEGAL delete or free {bogus:#x}")));

    let violations = engine.violations();
    assert_eq!(violations.double_free, 1);
    assert_eq!(violations.unknown_address, 1);
    // neither bad free touched the counters
    assert_eq!(engine.status().total_frees, 1);
}

#[test]
fn ringless_frees_release_immediately() {
    let (engine, _sink) = engine_with(Config {
        free_ring_capacity: 0,
        ..small_config()
    });
    let p = unsafe { engine.track_alloc(16, 8) };
    assert_eq!(unsafe { engine.unregister(p as usize, None) }, Unregistered::Released);
    assert_eq!(engine.parked(), 0);
    // nothing remembers it, so a second free is just unknown
    assert_eq!(
        unsafe { engine.unregister(p as usize, None) },
        Unregistered::UnknownAddress
    );
}

#[test]
fn snapshot_of_unchanged_heap_diffs_to_nothing() {
    let (engine, sink) = engine();
    let ptrs: Vec<_> = [8, 100, 4000]
        .into_iter()
        .map(|size| unsafe { engine.track_alloc(size, 8) })
        .collect();
    assert_eq!(engine.create_snapshot().unwrap(), 3);
    assert_eq!(engine.create_snapshot().unwrap(), 3);
    let diff = engine.compare(DiffMode::Flat).unwrap();
    assert!(diff.is_unchanged());
    assert!(sink.contains("no block increased"));
    assert!(sink.contains("no block decreased"));
    assert!(sink.contains("no block changed"));
    assert!(engine.compare(DiffMode::ByCallStack).unwrap().is_unchanged());

    assert_eq!(engine.destroy_snapshot(), 3);
    assert!(!engine.has_snapshot());
    for p in ptrs {
        unsafe { engine.track_free(p) };
    }
}

#[test]
fn diff_matches_same_stack_and_reports_the_rest() {
    let (engine, sink) = engine();
    let here = Trace::from_frames(&[0x1000, 0x2000, 0x3000]);
    let elsewhere = Trace::from_frames(&[0x4000, 0x5000]);

    let old = unsafe { engine.alloc_traced(100, 8, Some(&here)) };
    let kept = unsafe { engine.alloc_traced(60, 8, Some(&elsewhere)) };
    engine.create_snapshot().unwrap();

    unsafe { engine.track_free(old) };
    let a = unsafe { engine.alloc_traced(50, 8, Some(&here)) };
    let b = unsafe { engine.alloc_traced(60, 8, Some(&here)) };

    let flat = engine.compare(DiffMode::Flat).unwrap();
    let mut increased: Vec<_> = flat.increased.iter().map(|b| b.size).collect();
    increased.sort_unstable();
    assert_eq!(increased, vec![50, 60]);
    assert_eq!(flat.decreased.len(), 1);
    assert_eq!(flat.decreased[0].size, 100);
    assert_eq!(flat.decreased[0].ptr, old as usize);
    assert!(sink.contains("2 blocks increased:"));
    assert!(sink.contains("1 blocks decreased:"));

    let grouped = engine.compare(DiffMode::ByCallStack).unwrap();
    assert_eq!(grouped.groups.len(), 1);
    let group = &grouped.groups[0];
    assert_eq!(group.increased, vec![60, 50]);
    assert_eq!(group.decreased, vec![100]);
    assert_eq!(group.total, 10);
    assert_eq!(engine.call_stack(group.stack), here);
    assert!(sink.contains("group 0: 60 50 -100 (total 10 bytes)"));

    unsafe {
        engine.track_free(a);
        engine.track_free(b);
        engine.track_free(kept);
    }
}

#[test]
fn same_stack_reallocation_is_not_a_leak() {
    let (engine, _sink) = engine();
    let here = Trace::from_frames(&[0xabc0, 0xdef0]);
    let old = unsafe { engine.alloc_traced(24, 8, Some(&here)) };
    engine.create_snapshot().unwrap();
    unsafe { engine.track_free(old) };
    let new = unsafe { engine.alloc_traced(24, 8, Some(&here)) };
    // different address, same size and stack
    assert!(engine.compare(DiffMode::Flat).unwrap().is_unchanged());
    unsafe { engine.track_free(new) };
}

#[test]
fn listing_by_callstack_groups_correctly() {
    let (engine, sink) = engine();
    let one = Trace::from_frames(&[0x10, 0x20]);
    let two = Trace::from_frames(&[0x30]);
    let ptrs = unsafe {
        [
            engine.alloc_traced(5, 8, Some(&one)),
            engine.alloc_traced(7, 8, Some(&one)),
            engine.alloc_traced(300, 8, Some(&two)),
        ]
    };
    let groups = engine.list_by_callstack().unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].increased, vec![300]);
    assert_eq!(groups[1].increased, vec![7, 5]);
    assert_eq!(groups[1].total, 12);
    assert!(sink.contains("group 1: 7 5 (total 12 bytes)"));

    let blocks = engine.list_all();
    let sizes: Vec<_> = blocks.iter().map(|b| b.size).collect();
    assert_eq!(sizes, vec![300, 7, 5]);
    assert!(sink.contains("block 0: "));
    for p in ptrs {
        unsafe { engine.track_free(p) };
    }
}

#[test]
fn callstack_operations_fail_when_disabled() {
    let (engine, _sink) = engine_with(Config {
        features: Features {
            callstack: false,
            buffer_check: true,
        },
        ..small_config()
    });
    let p = unsafe { engine.track_alloc(12, 8) };
    assert!(matches!(
        engine.list_by_callstack(),
        Err(Error::FeatureDisabled { .. })
    ));
    assert!(matches!(
        engine.compare(DiffMode::ByCallStack),
        Err(Error::FeatureDisabled { .. })
    ));
    engine.create_snapshot().unwrap();
    let diff = engine.compare(DiffMode::Flat).unwrap();
    assert!(diff.is_unchanged());
    assert_eq!(engine.list_all()[0].stack, None);
    unsafe { engine.track_free(p) };
}

#[test]
fn buffer_check_off_skips_redzones() {
    let (engine, sink) = engine_with(Config {
        features: Features {
            callstack: true,
            buffer_check: false,
        },
        ..small_config()
    });
    let p = unsafe { engine.track_alloc(40, 8) };
    assert_eq!(engine.track_usable_size(p), 40);
    let summary = engine.check_all();
    assert!(summary.passed());
    assert_eq!(summary.live_checked, 0);
    assert!(sink.contains("no violation found"));
    unsafe { engine.track_free(p) };
}

#[test]
fn check_all_finds_freed_writes() {
    let (engine, sink) = engine();
    let p = unsafe { engine.track_alloc(20, 8) };
    let q = unsafe { engine.track_alloc(20, 8) };
    unsafe {
        engine.track_free(q);
        q.write(1);
    }
    let summary = engine.check_all();
    assert_eq!(summary.live_checked, 1);
    assert_eq!(summary.freed_checked, 1);
    assert_eq!(summary.violations, 1);
    assert!(sink.contains("1 violation(s) found"));
    // re-armed, so the next sweep is clean
    assert!(engine.check_all().passed());
    unsafe { engine.track_free(p) };
}

#[test]
fn calloc_and_realloc_work() {
    let (engine, _sink) = engine();
    unsafe {
        assert!(engine.track_calloc(usize::MAX, 2).is_null());
        assert!(engine.track_calloc(0, 8).is_null());
        let p = engine.track_calloc(4, 8);
        assert!(std::slice::from_raw_parts(p, 32).iter().all(|&b| b == 0));
        p.write_bytes(7, 32);

        let q = engine.track_realloc(p, 64);
        assert_eq!(engine.track_usable_size(q), 64);
        assert!(std::slice::from_raw_parts(q, 32).iter().all(|&b| b == 7));
        assert_eq!(engine.track_usable_size(p), 0);

        assert!(engine.track_realloc(q, 0).is_null());
        assert_eq!(engine.status().live_blocks, 0);

        let v = engine.track_valloc(10);
        assert_eq!(v as usize % page_size::get(), 0);
        let pv = engine.track_pvalloc(10);
        assert_eq!(engine.track_usable_size(pv), page_size::get());
        engine.track_free(v);
        engine.track_free(pv);
    }
    assert_eq!(engine.violations().total(), 0);
}

#[test]
fn bypassed_allocations_are_not_tracked() {
    let (engine, _sink) = engine();
    let p = {
        let _bypass = engine.bypass();
        unsafe { engine.track_alloc(100, 8) }
    };
    assert_eq!(engine.status().live_blocks, 0);
    assert!(engine.is_untracked(p));
    assert!(engine.track_usable_size(p) >= 100);
    {
        let _bypass = engine.bypass();
        unsafe { engine.track_free(p) };
    }
    assert!(!engine.is_untracked(p));
    assert_eq!(engine.violations().total(), 0);
}

#[test]
fn bypassed_allocations_free_silently_outside_bypass() {
    let (engine, sink) = engine();
    let (p, q) = {
        let _bypass = engine.bypass();
        unsafe { (engine.track_alloc(64, 8), engine.track_alloc(32, 256)) }
    };
    unsafe {
        p.write_bytes(3, 64);
        let p = engine.track_realloc(p, 4000);
        assert!(engine.is_untracked(p));
        assert_eq!(*p.add(63), 3);
        assert_eq!(engine.unregister(p as usize, None), Unregistered::Untracked);
        let q = engine.track_realloc_aligned(q, 8000, 256);
        assert_eq!(q as usize % 256, 0);
        engine.track_free(q);
        assert!(!engine.is_untracked(q));
    }
    assert_eq!(engine.violations().total(), 0);
    assert!(!sink.contains("ILLEGAL"));
}

#[test]
fn concurrent_threads_leave_nothing_live() {
    let (engine, _sink) = engine();
    let engine = Arc::new(engine);
    let threads: Vec<_> = (0..6)
        .map(|t| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t);
                let mut mine = Vec::new();
                for i in 0..300 {
                    let p = unsafe { engine.track_alloc(rng.gen_range(1..600), 8) };
                    mine.push(p as usize);
                    if rng.gen_bool(0.4) {
                        let victim = mine.swap_remove(rng.gen_range(0..mine.len()));
                        unsafe { engine.track_free(victim as *mut u8) };
                    }
                    if t == 0 && i % 100 == 0 {
                        engine.create_snapshot().unwrap();
                        engine.compare(DiffMode::Flat).unwrap();
                    }
                }
                for p in mine {
                    unsafe { engine.track_free(p as *mut u8) };
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    let status = engine.status();
    assert_eq!(status.live_blocks, 0);
    assert_eq!(status.allocated_bytes, 0);
    assert_eq!(status.total_allocs, status.total_frees);
    assert_eq!(engine.violations().total(), 0);
    assert!(engine.check_all().passed());
}

#[test]
fn vm_usage_accounts_live_pages() {
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::builder(small_config())
        .sink(Arc::clone(&sink))
        .resolver(NoSymbols)
        .maps(ProcSelfMaps)
        .build()
        .unwrap();
    let ptrs: Vec<_> = (0..16)
        .map(|_| unsafe { engine.track_alloc(200, 8) })
        .collect();
    let usage = engine.vm_usage().unwrap();
    assert!(usage.tracked >= page_size::get());
    assert!(!usage.areas.is_empty());
    assert!(usage.total_used() <= usage.tracked);
    assert!(usage.total_used() <= usage.total_mapped());
    assert!(sink.contains("total_arena_size: "));
    assert!(sink.contains("total_memblk_usage: "));
    for p in ptrs {
        unsafe { engine.track_free(p) };
    }
}

#[test]
fn random_sequences_keep_counters_consistent() {
    let (engine, _sink) = engine();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut live: HashMap<usize, usize> = HashMap::new();
    for _ in 0..2000 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let size = rng.gen_range(1..5000);
            let align = 1 << rng.gen_range(0..7);
            let p = unsafe { engine.track_alloc(size, align) };
            assert_eq!(p as usize % align, 0);
            live.insert(p as usize, size);
        } else {
            let &p = live.keys().next().unwrap();
            live.remove(&p);
            unsafe { engine.track_free(p as *mut u8) };
        }
    }
    let status = engine.status();
    assert_eq!(status.live_blocks, live.len());
    assert_eq!(status.allocated_bytes, live.values().sum::<usize>());
    assert_eq!(engine.histogram().total(), live.len());
    let listed: HashMap<usize, usize> = engine
        .list_all()
        .into_iter()
        .map(|b| (b.ptr, b.size))
        .collect();
    assert_eq!(listed, live);
    assert!(engine.check_all().passed());
    for (&p, _) in live.iter() {
        unsafe { engine.track_free(p as *mut u8) };
    }
    assert_eq!(engine.status().live_blocks, 0);
    assert_eq!(engine.violations().total(), 0);
}
