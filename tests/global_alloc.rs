//! The engine installed as this test binary's global allocator. Everything
//! the harness and the tests allocate goes through it.

use std::{collections::HashMap, sync::Barrier, thread};

use heapcheck::{global, Command, DebugAlloc, Engine, Outcome};

#[global_allocator]
static GLOBAL: DebugAlloc = DebugAlloc;

#[repr(align(4096))]
struct Page([u8; 4096]);

fn engine() -> &'static Engine {
    global().expect("global engine")
}

fn assert_no_bad_frees(engine: &Engine) {
    let violations = engine.violations();
    assert_eq!(violations.unknown_address, 0);
    assert_eq!(violations.double_free, 0);
}

#[test]
fn ordinary_collections_are_tracked_correctly() {
    let engine = engine();
    let mut v: Vec<u64> = Vec::with_capacity(1);
    for i in 0..1000 {
        v.push(i);
    }
    assert_eq!(engine.size_of(v.as_ptr() as usize), Some(v.capacity() * 8));
    let page = Box::new(Page([7; 4096]));
    assert_eq!(&*page as *const Page as usize % 4096, 0);
    assert_eq!(page.0[4095], 7);
    let words: HashMap<String, usize> = (0..64).map(|i| (format!("word {i}"), i)).collect();
    assert_eq!(words["word 63"], 63);
    drop((v, page, words));
    assert_no_bad_frees(engine);
}

#[test]
fn bypass_allocations_are_released_later() {
    let engine = engine();
    let (kept, mut grown) = {
        let _bypass = engine.bypass();
        (vec![1u8; 100], String::with_capacity(4))
    };
    assert!(engine.is_untracked(kept.as_ptr() as *mut u8));
    assert_eq!(engine.size_of(kept.as_ptr() as usize), None);
    // grows outside the bypass and stays untracked
    grown.push_str("longer than four bytes, and then some");
    assert!(engine.is_untracked(grown.as_ptr() as *mut u8));
    let ptr = kept.as_ptr() as *mut u8;
    drop(kept);
    drop(grown);
    assert!(!engine.is_untracked(ptr));
    assert_no_bad_frees(engine);
}

#[test]
fn diagnostic_outcomes_drop_outside_bypass() {
    let engine = engine();
    let _live: Vec<Box<[u8; 48]>> = (0..8).map(|_| Box::new([0; 48])).collect();
    for command in [
        Command::Status,
        Command::ListAll,
        Command::CheckAll,
        Command::Histogram,
        Command::VmUsage,
    ] {
        let outcome = engine.execute(command).expect("diagnostic");
        let text = format!("{outcome:?}");
        assert!(!text.is_empty());
        assert!(outcome.to_json().is_ok());
        if let Outcome::Blocks(blocks) = &outcome {
            assert!(blocks.len() >= 8);
        }
    }
    assert_no_bad_frees(engine);
}

#[test]
fn threads_allocate_and_exit_cleanly() {
    let engine = engine();
    let barrier = Barrier::new(8);
    thread::scope(|s| {
        for t in 0..8 {
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                let mut owned = Vec::new();
                for i in 0..200 {
                    owned.push(vec![t as u8; 16 + i]);
                    if i % 3 == 0 {
                        owned.swap_remove(0);
                    }
                }
                owned.len()
            });
        }
    });
    let worker = std::thread::spawn(|| engine.execute(Command::CheckAll).map(|_| ()));
    assert!(worker.join().expect("worker").is_ok());
    assert_no_bad_frees(engine);
}
