//! Interception: the tracked versions of `malloc()` and friends, hook
//! suppression, and a [`GlobalAlloc`] over a lazily-built global engine.
//!
//! Tracking allocates (capturing stacks, formatting reports), so the engine
//! runs that work inside a [`Bypass`]. While a thread holds one, every entry
//! point it calls goes straight to the real allocator. The suppression lock is
//! process-wide: a thread inside a bypass stalls every other thread's next
//! allocation until it leaves. Lock order is always suppression first, then a
//! table, never the other way round.

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    alloc::{
        callstack::Trace,
        real,
        redzone::{MemoryBlock, MALLOC_ALIGNMENT},
        slab::Handle,
        table::Chained,
    },
    config::Config,
    engine::Engine,
    lazy_lock::{LazyLock, LazyLockState},
    os::mem::PAGE_SIZE,
    sync::{ReentrantGuard, ReentrantLock},
    util::{hint::cold, num::round_up},
};

pub struct Suppression {
    lock: ReentrantLock,
    depth: AtomicUsize,
}

impl Suppression {
    pub const fn new() -> Self {
        Self {
            lock: ReentrantLock::new(),
            depth: AtomicUsize::new(0),
        }
    }

    pub fn bypass(&self) -> Bypass<'_> {
        let guard = self.lock.lock();
        self.depth.fetch_add(1, Ordering::Relaxed);
        Bypass {
            suppression: self,
            _guard: guard,
        }
    }

    /// Whether the calling thread holds a bypass. Never blocks.
    pub fn held_here(&self) -> bool {
        self.lock.is_held()
    }

    /// Whether the calling thread is inside a bypass. Blocks while another
    /// thread is.
    pub fn is_suppressed(&self) -> bool {
        let _guard = self.lock.lock();
        self.depth.load(Ordering::Relaxed) > 0
    }
}

impl Default for Suppression {
    fn default() -> Self {
        Self::new()
    }
}

/// While alive, the holding thread's allocations are not tracked
pub struct Bypass<'a> {
    suppression: &'a Suppression,
    _guard: ReentrantGuard<'a>,
}

impl Drop for Bypass<'_> {
    fn drop(&mut self) {
        self.suppression.depth.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A buffer handed out from inside a bypass. It came straight from the real
/// allocator and goes straight back, wherever it is freed.
#[derive(Clone, Copy, Debug)]
pub struct UntrackedRecord {
    ptr: usize,
    chain_next: Option<Handle>,
}

impl Chained for UntrackedRecord {
    type Key = usize;

    fn key(&self) -> &usize {
        &self.ptr
    }

    fn bucket(key: &usize, nr_buckets: usize) -> usize {
        key % nr_buckets
    }

    fn chain_next(&self) -> Option<Handle> {
        self.chain_next
    }

    fn set_chain_next(&mut self, next: Option<Handle>) {
        self.chain_next = next;
    }
}

impl Engine {
    fn capture(&self) -> Option<Trace> {
        self.config.features.callstack.then(|| {
            let _bypass = self.hooks.bypass();
            Trace::capture()
        })
    }

    /// Tracked `malloc()`/`memalign()`. `align` must be a power of two.
    ///
    /// # Safety
    /// - The result must be released through this engine
    pub unsafe fn track_alloc(&self, size: usize, align: usize) -> *mut u8 {
        if self.hooks.is_suppressed() {
            let p = unsafe { real::alloc(size, align) };
            self.note_untracked(p);
            return p;
        }
        let trace = self.capture();
        unsafe { self.alloc_traced(size, align, trace.as_ref()) }
    }

    /// Remember `ptr` as the real allocator's, so freeing it later outside a
    /// bypass is not mistaken for a bad free
    pub(crate) fn note_untracked(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        match self.untracked_records.alloc(UntrackedRecord {
            ptr: ptr as usize,
            chain_next: None,
        }) {
            Ok(handle) => self.untracked.insert(&self.untracked_records, handle),
            // no report: this runs inside the allocator
            Err(_) => self.violations.record_exhaustion(),
        }
    }

    /// Forget `ptr` if it was handed out inside a bypass
    pub(crate) fn forget_untracked(&self, ptr: usize) -> bool {
        match self.untracked.remove(&self.untracked_records, ptr) {
            Some(handle) => {
                // SAFETY: unlinked above
                unsafe { self.untracked_records.free(handle) };
                true
            }
            None => false,
        }
    }

    /// Whether `ptr` was handed out inside a bypass and is still live
    pub fn is_untracked(&self, ptr: *mut u8) -> bool {
        self.untracked
            .find(&self.untracked_records, ptr as usize)
            .is_some()
    }

    /// [`Engine::track_alloc`] attributed to `trace` rather than the caller
    ///
    /// # Safety
    /// - As for [`Engine::track_alloc`]
    pub unsafe fn alloc_traced(&self, size: usize, align: usize, trace: Option<&Trace>) -> *mut u8 {
        let align = align.max(1);
        let Some(buf_size) = MemoryBlock::buffer_size(size, align, self.redzone) else {
            return ptr::null_mut();
        };
        // SAFETY: released in `unregister`
        let buf = unsafe { real::alloc(buf_size, MALLOC_ALIGNMENT) };
        if buf.is_null() {
            return buf;
        }
        let block = MemoryBlock::place(buf as usize, buf_size, size, align, self.redzone);
        // SAFETY: fresh from the real allocator
        if let Err(e) = unsafe { self.register(block, trace) } {
            // the caller still gets its memory, just untracked
            cold(|| self.report_exhaustion("allocation record", &e));
        }
        block.user_ptr as *mut u8
    }

    /// Tracked `calloc()`. Null if `count * size` overflows or is zero.
    ///
    /// # Safety
    /// - As for [`Engine::track_alloc`]
    pub unsafe fn track_calloc(&self, count: usize, size: usize) -> *mut u8 {
        let total = match count.checked_mul(size) {
            Some(0) | None => return ptr::null_mut(),
            Some(total) => total,
        };
        let p = unsafe { self.track_alloc(total, MALLOC_ALIGNMENT) };
        if !p.is_null() {
            unsafe { p.write_bytes(0, total) };
        }
        p
    }

    /// `valloc()`: page aligned
    ///
    /// # Safety
    /// - As for [`Engine::track_alloc`]
    pub unsafe fn track_valloc(&self, size: usize) -> *mut u8 {
        unsafe { self.track_alloc(size, *PAGE_SIZE) }
    }

    /// `pvalloc()`: page aligned, size rounded up to whole pages
    ///
    /// # Safety
    /// - As for [`Engine::track_alloc`]
    pub unsafe fn track_pvalloc(&self, size: usize) -> *mut u8 {
        let page = *PAGE_SIZE;
        unsafe { self.track_alloc(round_up(size.max(1), page), page) }
    }

    /// Tracked `free()`. Null is ignored.
    ///
    /// # Safety
    /// - `ptr` must not be used afterwards
    pub unsafe fn track_free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        if self.hooks.is_suppressed() {
            return unsafe { self.free_suppressed(ptr) };
        }
        let trace = self.capture();
        unsafe { self.unregister(ptr as usize, trace.as_ref()) };
    }

    /// A free from inside a bypass. Blocks that were tracked are still
    /// unregistered, just without a stack; anything else goes back to the
    /// real allocator unchecked.
    unsafe fn free_suppressed(&self, ptr: *mut u8) {
        if self.live.find(&self.records, ptr as usize).is_some() {
            unsafe { self.unregister(ptr as usize, None) };
        } else {
            self.forget_untracked(ptr as usize);
            unsafe { real::free(ptr) };
        }
    }

    /// Tracked `realloc()`
    ///
    /// # Safety
    /// - As for [`Engine::track_free`], and the result must be released
    ///   through this engine
    pub unsafe fn track_realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        unsafe { self.track_realloc_aligned(ptr, size, MALLOC_ALIGNMENT) }
    }

    /// # Safety
    /// - As for [`Engine::track_realloc`]
    pub unsafe fn track_realloc_aligned(&self, ptr: *mut u8, size: usize, align: usize) -> *mut u8 {
        if ptr.is_null() {
            return unsafe { self.track_alloc(size, align) };
        }
        if self.hooks.is_suppressed() {
            return unsafe { self.realloc_suppressed(ptr, size, align) };
        }
        if size == 0 {
            unsafe { self.track_free(ptr) };
            return ptr::null_mut();
        }
        if self.is_untracked(ptr) {
            return unsafe { self.realloc_untracked(ptr, size, align) };
        }
        let trace = self.capture();
        let Some(old_size) = self.size_of(ptr as usize) else {
            // not live, so this only reports the bad pointer
            unsafe { self.unregister(ptr as usize, trace.as_ref()) };
            return ptr::null_mut();
        };
        let new = unsafe { self.alloc_traced(size, align, trace.as_ref()) };
        if new.is_null() {
            return new;
        }
        unsafe {
            ptr::copy_nonoverlapping(ptr, new, old_size.min(size));
            self.unregister(ptr as usize, trace.as_ref());
        }
        new
    }

    /// A realloc from inside a bypass. A tracked block is moved out of
    /// tracking; the result is untracked either way.
    unsafe fn realloc_suppressed(&self, ptr: *mut u8, size: usize, align: usize) -> *mut u8 {
        if size == 0 {
            unsafe { self.free_suppressed(ptr) };
            return ptr::null_mut();
        }
        let Some(old_size) = self.size_of(ptr as usize) else {
            return unsafe { self.realloc_untracked(ptr, size, align) };
        };
        let new = unsafe { real::alloc(size, align) };
        if !new.is_null() {
            unsafe {
                ptr::copy_nonoverlapping(ptr, new, old_size.min(size));
                self.unregister(ptr as usize, None);
            }
            self.note_untracked(new);
        }
        new
    }

    /// Resize a buffer the engine does not track. It stays untracked.
    unsafe fn realloc_untracked(&self, ptr: *mut u8, size: usize, align: usize) -> *mut u8 {
        self.forget_untracked(ptr as usize);
        // SAFETY: `ptr` came from the real allocator
        let new = unsafe { real::realloc_aligned(ptr, size, align) };
        // on failure the old buffer is still live
        self.note_untracked(if new.is_null() { ptr } else { new });
        new
    }

    /// `malloc_usable_size()`: the user size of a tracked block, the real
    /// allocator's answer for one handed out inside a bypass, `0` for anything
    /// else
    pub fn track_usable_size(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        match self.size_of(ptr as usize) {
            Some(size) => size,
            // SAFETY: untracked pointers are live real allocations
            None if self.is_untracked(ptr) => unsafe { real::usable_size(ptr) },
            None => 0,
        }
    }
}

/// The engine behind [`DebugAlloc`] and the C entry points. `None` if it
/// could not be built.
static ENGINE: LazyLock<Option<Engine>, fn() -> Option<Engine>> = LazyLock::new(build_global);

fn build_global() -> Option<Engine> {
    let config = Config::from_env().unwrap_or_default();
    Engine::builder(config).build().ok()
}

/// The global engine, building it on first use. `None` to the building
/// thread while it builds, so its own allocations go straight through; other
/// threads wait for the engine.
pub fn global() -> Option<&'static Engine> {
    match LazyLock::state(&ENGINE) {
        LazyLockState::Init => ENGINE.get().and_then(Option::as_ref),
        LazyLockState::Initializing if ENGINE.is_initializing_here() => None,
        LazyLockState::Initializing | LazyLockState::Uninit => {
            cold(|| ENGINE.initialize().as_ref())
        }
    }
}

/// Installs the engine as the Rust global allocator:
///
/// ```no_run
/// #[global_allocator]
/// static ALLOC: heapcheck::DebugAlloc = heapcheck::DebugAlloc;
/// ```
pub struct DebugAlloc;

unsafe impl GlobalAlloc for DebugAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match global() {
            Some(engine) => unsafe { engine.track_alloc(layout.size(), layout.align()) },
            None => unsafe { real::alloc(layout.size(), layout.align()) },
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let p = unsafe { self.alloc(layout) };
        if !p.is_null() {
            unsafe { p.write_bytes(0, layout.size()) };
        }
        p
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        match global() {
            Some(engine) => unsafe { engine.track_free(ptr) },
            None => unsafe { real::free(ptr) },
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        match global() {
            Some(engine) => unsafe { engine.track_realloc_aligned(ptr, new_size, layout.align()) },
            None => unsafe { real::realloc_aligned(ptr, new_size, layout.align()) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypass_suppresses_only_while_held() {
        let hooks = Suppression::new();
        assert!(!hooks.is_suppressed());
        {
            let _outer = hooks.bypass();
            let _inner = hooks.bypass();
            assert!(hooks.is_suppressed());
        }
        assert!(!hooks.is_suppressed());
    }

    #[test]
    fn held_here_sees_only_own_bypass() {
        let hooks = std::sync::Arc::new(Suppression::new());
        let bypass = hooks.bypass();
        assert!(hooks.held_here());
        let other = std::sync::Arc::clone(&hooks);
        assert!(!std::thread::spawn(move || other.held_here()).join().unwrap());
        drop(bypass);
        assert!(!hooks.held_here());
    }

    #[test]
    fn bypass_serialises_other_threads() {
        let hooks = std::sync::Arc::new(Suppression::new());
        let bypass = hooks.bypass();
        let other = std::sync::Arc::clone(&hooks);
        let t = std::thread::spawn(move || other.is_suppressed());
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(bypass);
        // the other thread waited for us and then saw no bypass of its own
        assert!(!t.join().unwrap());
    }
}
