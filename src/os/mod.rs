use std::cell::Cell;

pub mod maps;
pub mod mem;

thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// The kernel thread id of the calling thread. Never `0`, so `0` can be used
/// as a "no owner" marker by locks.
pub fn thread_id() -> u64 {
    THREAD_ID.with(|id| {
        if id.get() == 0 {
            // SAFETY: `gettid()` takes no arguments and cannot fail
            let tid = unsafe { libc::syscall(libc::SYS_gettid) };
            id.set(tid as u64);
        }
        id.get()
    })
}
