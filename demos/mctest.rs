//! Runs a small program under the heap checker and provokes each kind of
//! violation. Reports go to the log:
//!
//! ```sh
//! RUST_LOG=heapcheck=info cargo run --example mctest
//! ```

use std::hint::black_box;

use heapcheck::{
    externc::{hc_free, hc_malloc},
    global, Command, DebugAlloc, Engine,
};

#[global_allocator]
static GLOBAL: DebugAlloc = DebugAlloc;

fn diagnose(engine: &Engine, command: Command) {
    if let Err(e) = engine.execute(command) {
        log::error!("{command:?}: {e}");
    }
}

fn main() {
    heapcheck::init_logging();
    let Some(engine) = global() else {
        eprintln!("heap checker unavailable");
        return;
    };

    let kept: Vec<Box<[u8; 64]>> = (0..4).map(|_| Box::new([0; 64])).collect();
    diagnose(engine, Command::CreateSnapshot);

    // leaks relative to the snapshot
    let leaked: Vec<String> = (0..3).map(|i| format!("leak number {i}")).collect();
    std::mem::forget(black_box(leaked));

    unsafe {
        // one byte past the end
        let p = hc_malloc(10) as *mut u8;
        p.add(10).write(b'!');
        hc_free(p as _);

        // written after free, found by the sweep below
        let q = hc_malloc(32) as *mut u8;
        hc_free(q as _);
        q.add(5).write(0);

        // freed twice, then a pointer we never handed out
        let r = hc_malloc(16);
        hc_free(r);
        hc_free(r);
        hc_free(0x1234_5670 as _);
    }

    for command in [
        Command::Status,
        Command::CheckAll,
        Command::Compare,
        Command::CompareByCallStack,
        Command::Histogram,
        Command::VmUsage,
    ] {
        diagnose(engine, command);
    }

    let violations = engine.violations();
    println!(
        "{} violations: {} overrun, {} write-after-free, {} double free, {} unknown",
        violations.total(),
        violations.overrun,
        violations.write_after_free,
        violations.double_free,
        violations.unknown_address
    );
    drop(kept);
}
