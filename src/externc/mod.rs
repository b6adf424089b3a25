//! C entry points over the global engine, for preloading or linking into C
//! programs. Every function falls back to the real allocator while the
//! engine is unavailable.

use std::{mem, ptr};

use libc::{c_int, c_uint, c_void, size_t, EINVAL, ENOMEM};
use once_cell::sync::OnceCell;

use crate::{
    alloc::{hook::global, real, redzone::MALLOC_ALIGNMENT},
    engine::{Command, Engine, Worker},
    os::mem::PAGE_SIZE,
    util::num::round_up,
};

#[no_mangle]
pub unsafe extern "C" fn hc_malloc(size: size_t) -> *mut c_void {
    unsafe { aligned(size, MALLOC_ALIGNMENT) as _ }
}

#[no_mangle]
pub unsafe extern "C" fn hc_free(ptr: *mut c_void) {
    match global() {
        Some(engine) => unsafe { engine.track_free(ptr as _) },
        None => unsafe { real::free(ptr as _) },
    }
}

#[no_mangle]
pub unsafe extern "C" fn hc_calloc(count: size_t, size: size_t) -> *mut c_void {
    match global() {
        Some(engine) => unsafe { engine.track_calloc(count, size) as _ },
        None => unsafe { libc::calloc(count, size) },
    }
}

#[no_mangle]
pub unsafe extern "C" fn hc_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    match global() {
        Some(engine) => unsafe { engine.track_realloc(ptr as _, size) as _ },
        None => unsafe { real::realloc(ptr as _, size) as _ },
    }
}

#[no_mangle]
pub unsafe extern "C" fn hc_memalign(align: size_t, size: size_t) -> *mut c_void {
    if !align.is_power_of_two() {
        set_errno(EINVAL);
        return ptr::null_mut();
    }
    unsafe { aligned(size, align) as _ }
}

#[no_mangle]
pub unsafe extern "C" fn hc_aligned_alloc(align: size_t, size: size_t) -> *mut c_void {
    unsafe { hc_memalign(align, size) }
}

#[no_mangle]
pub unsafe extern "C" fn hc_posix_memalign(
    out: *mut *mut c_void,
    align: size_t,
    size: size_t,
) -> c_int {
    if !align.is_power_of_two() || align % mem::size_of::<*mut c_void>() != 0 {
        return EINVAL;
    }
    let p = unsafe { aligned(size, align) };
    if p.is_null() {
        return ENOMEM;
    }
    // SAFETY: the caller passes a valid out pointer
    unsafe { out.write(p as _) };
    0
}

#[no_mangle]
pub unsafe extern "C" fn hc_valloc(size: size_t) -> *mut c_void {
    match global() {
        Some(engine) => unsafe { engine.track_valloc(size) as _ },
        None => unsafe { real::alloc(size, *PAGE_SIZE) as _ },
    }
}

#[no_mangle]
pub unsafe extern "C" fn hc_pvalloc(size: size_t) -> *mut c_void {
    match global() {
        Some(engine) => unsafe { engine.track_pvalloc(size) as _ },
        None => {
            let page = *PAGE_SIZE;
            unsafe { real::alloc(round_up(size.max(1), page), page) as _ }
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn hc_malloc_usable_size(ptr: *mut c_void) -> size_t {
    match global() {
        Some(engine) => engine.track_usable_size(ptr as _),
        None if ptr.is_null() => 0,
        None => unsafe { real::usable_size(ptr as _) },
    }
}

/// Queue diagnostic `code` (see [`Command::from_code`]) on the global worker.
/// Returns `0` if it was queued, and `-1` for an unknown code, no engine or a
/// worker that has stopped.
#[no_mangle]
pub extern "C" fn hc_command(code: c_uint) -> c_int {
    let (Some(command), Some(engine)) = (Command::from_code(code), global()) else {
        return -1;
    };
    let Some(worker) = worker(engine) else {
        return -1;
    };
    match worker.submit(command) {
        Ok(()) => 0,
        Err(e) => {
            log::error!(target: "heapcheck", "cannot queue {command:?}: {e}");
            -1
        }
    }
}

static WORKER: OnceCell<Option<Worker>> = OnceCell::new();

/// The worker is built inside a bypass and lives for the rest of the process
fn worker(engine: &'static Engine) -> Option<&'static Worker> {
    WORKER
        .get_or_init(|| {
            let _bypass = engine.bypass();
            Worker::spawn(engine)
                .map_err(|e| log::error!(target: "heapcheck", "cannot start worker: {e}"))
                .ok()
        })
        .as_ref()
}

unsafe fn aligned(size: usize, align: usize) -> *mut u8 {
    match global() {
        Some(engine) => unsafe { engine.track_alloc(size, align) },
        None => unsafe { real::alloc(size, align) },
    }
}

fn set_errno(errno: c_int) {
    // SAFETY: the calling thread's errno location is always valid
    unsafe { *libc::__errno_location() = errno };
}
