use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    ops::Deref,
    sync::atomic::{AtomicU64, AtomicU8, Ordering},
};

use crate::{os::thread_id, sync::RawLock, util::hint::cold};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum LazyLockState {
    /// Signifies this lock is uninitialized
    Uninit,
    /// Signifies this lock is initialized
    Init,
    /// Signifies this lock is mid initialization. Allocations made by the
    /// initializer itself see this state.
    Initializing,
}

impl LazyLockState {
    const fn from_u8(state: u8) -> Self {
        match state {
            0 => Self::Uninit,
            1 => Self::Init,
            _ => Self::Initializing,
        }
    }
}

/// A LazyLock that lets you poll its initialization state (including mid-init)
pub struct LazyLock<T, F> {
    cell: UnsafeCell<MaybeUninit<T>>,
    lock: RawLock,
    state: AtomicU8,
    /// Thread running `init`, `0` outside initialization
    initializer: AtomicU64,
    init: F,
}

// SAFETY: `cell` is written once, under `lock`, before `state` is published as
// `Init` with release ordering; afterwards it is only read.
unsafe impl<T, F> Sync for LazyLock<T, F>
where
    T: Send + Sync,
    F: Sync,
{
}

impl<T, F> LazyLock<T, F>
where
    F: FnOnce() -> T + Copy,
{
    pub const fn new(init: F) -> Self {
        Self {
            cell: UnsafeCell::new(MaybeUninit::uninit()),
            lock: RawLock::new(),
            state: AtomicU8::new(LazyLockState::Uninit as u8),
            initializer: AtomicU64::new(0),
            init,
        }
    }

    pub fn state(lock: &Self) -> LazyLockState {
        LazyLockState::from_u8(lock.state.load(Ordering::Acquire))
    }

    /// Whether the calling thread is the one running the initializer
    pub fn is_initializing_here(&self) -> bool {
        self.initializer.load(Ordering::Acquire) == thread_id()
    }

    /// # Safety
    /// - The state must be [`LazyLockState::Init`]
    pub unsafe fn assume_init(&self) -> &T {
        // This borrow is not needless
        #[allow(clippy::needless_borrow)]
        unsafe {
            (&*self.cell.get()).assume_init_ref()
        }
    }

    /// The value, if it has been initialized already
    pub fn get(&self) -> Option<&T> {
        // SAFETY: checked the state
        (LazyLock::state(self) == LazyLockState::Init).then(|| unsafe { self.assume_init() })
    }

    /// Initialize the value if nobody has yet, waiting for another thread
    /// that already is. The initializer must not call this on the same lock
    /// (it would deadlock); it can check [`LazyLock::is_initializing_here`]
    /// instead.
    pub fn initialize(&self) -> &T {
        if LazyLock::state(self) != LazyLockState::Init {
            cold(|| {
                self.lock.lock();
                if LazyLock::state(self) == LazyLockState::Uninit {
                    self.initializer.store(thread_id(), Ordering::Release);
                    self.state
                        .store(LazyLockState::Initializing as u8, Ordering::Release);
                    let value = (self.init)();
                    // SAFETY: we hold `lock` and nobody reads `cell` before
                    // `Init` is published
                    unsafe { *self.cell.get() = MaybeUninit::new(value) };
                    self.state.store(LazyLockState::Init as u8, Ordering::Release);
                    self.initializer.store(0, Ordering::Release);
                }
                // SAFETY: locked above
                unsafe { self.lock.unlock() };
            })
        }
        // SAFETY: either we or another thread published `Init` above
        unsafe { self.assume_init() }
    }
}

impl<T, F> Deref for LazyLock<T, F>
where
    F: FnOnce() -> T + Copy,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.initialize()
    }
}
