//! Futex locks that never allocate, so they can be taken from inside the
//! allocation path itself.

use std::{
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use linux_futex::{Futex, Private};

use crate::{os::thread_id, util::hint::cold};

/// This futex represents a lock and is unlocked
const FUTEX_UNLOCKED: u32 = 0;

/// This futex represents a lock and is locked, with nobody waiting
const FUTEX_LOCKED: u32 = 1;

/// This futex represents a lock and is locked, and somebody may be asleep on it
const FUTEX_CONTENDED: u32 = 2;

/// A bare mutual-exclusion lock with no data and no guard
pub struct RawLock {
    futex: Futex<Private>,
}

impl RawLock {
    pub const fn new() -> Self {
        Self {
            futex: Futex::new(FUTEX_UNLOCKED),
        }
    }

    pub fn lock(&self) {
        // Fast path should stay in userspace!
        if self
            .futex
            .value
            .compare_exchange(FUTEX_UNLOCKED, FUTEX_LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            cold(|| self.lock_contended());
        }
    }

    fn lock_contended(&self) {
        // Once we have slept we can't know whether others are sleeping too, so
        // we keep the lock marked as contended when we do get it.
        while self.futex.value.swap(FUTEX_CONTENDED, Ordering::Acquire) != FUTEX_UNLOCKED {
            _ = self.futex.wait(FUTEX_CONTENDED);
        }
    }

    pub fn try_lock(&self) -> bool {
        self.futex
            .value
            .compare_exchange(FUTEX_UNLOCKED, FUTEX_LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// # Safety
    /// - The calling thread must hold the lock
    pub unsafe fn unlock(&self) {
        if self.futex.value.swap(FUTEX_UNLOCKED, Ordering::Release) == FUTEX_CONTENDED {
            self.futex.wake(1);
        }
    }
}

impl Default for RawLock {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`RawLock`] protecting a `T`
pub struct Mutex<T> {
    raw: RawLock,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialised by `raw`
unsafe impl<T> Sync for Mutex<T> where T: Send {}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.lock();
        MutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T> Default for Mutex<T>
where
    T: Default,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").finish_non_exhaustive()
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the lock
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the lock, and `&mut self` makes this unique
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: a guard only exists while its lock is held
        unsafe { self.mutex.raw.unlock() }
    }
}

/// A lock that the owning thread may take again without deadlocking. It
/// carries no data: a reentrant guard can't hand out `&mut`, so structures
/// behind it do their writes through raw pointers while a guard is alive.
pub struct ReentrantLock {
    raw: RawLock,
    /// Kernel tid of the holder, `0` when free
    owner: AtomicU64,
    depth: AtomicUsize,
}

impl ReentrantLock {
    pub const fn new() -> Self {
        Self {
            raw: RawLock::new(),
            owner: AtomicU64::new(0),
            depth: AtomicUsize::new(0),
        }
    }

    pub fn lock(&self) -> ReentrantGuard<'_> {
        let tid = thread_id();
        // Only this thread can ever store its own tid, so a relaxed load is
        // enough to tell whether we already hold the lock.
        if self.owner.load(Ordering::Relaxed) != tid {
            self.raw.lock();
            self.owner.store(tid, Ordering::Relaxed);
        }
        self.depth.fetch_add(1, Ordering::Relaxed);
        ReentrantGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Whether the calling thread currently holds this lock
    pub fn is_held(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == thread_id()
    }

    /// How many guards the holder currently has alive
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ReentrantGuard<'a> {
    lock: &'a ReentrantLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ReentrantGuard<'_> {
    fn drop(&mut self) {
        if self.lock.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.lock.owner.store(0, Ordering::Relaxed);
            // SAFETY: the outermost guard of the holding thread is being
            // dropped
            unsafe { self.lock.raw.unlock() }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn mutex_serialises_increments() {
        let counter = Arc::new(Mutex::new(0usize));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*counter.lock(), 80_000);
    }

    #[test]
    fn reentrant_lock_nests_on_one_thread() {
        let lock = ReentrantLock::new();
        let outer = lock.lock();
        let inner = lock.lock();
        assert!(lock.is_held());
        assert_eq!(lock.depth(), 2);
        drop(inner);
        assert!(lock.is_held());
        drop(outer);
        assert!(!lock.is_held());
        assert!(lock.raw.try_lock());
    }

    #[test]
    fn reentrant_lock_excludes_other_threads() {
        let lock = Arc::new(ReentrantLock::new());
        let guard = lock.lock();
        let other = Arc::clone(&lock);
        let t = std::thread::spawn(move || {
            let _g = other.lock();
            other.depth()
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(lock.depth(), 1);
        drop(guard);
        assert_eq!(t.join().unwrap(), 1);
    }
}
