use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// Default retry budget for [`SpinLock::try_lock_for`].
///
/// On the single-CPU machine this targets, a held lock can only be released
/// after the holder is scheduled again, so a huge budget buys nothing; the
/// allocators treat an expired budget as resource exhaustion and fail the
/// operation instead.
pub const DEFAULT_LOCK_RETRIES: u32 = 10_000;

/// A TATAS spin lock.
///
/// Two acquisition modes:
/// * [`lock`](SpinLock::lock) spins unboundedly, for bootstrap paths that
///   run before the scheduler exists and are uncontended by construction.
/// * [`try_lock_for`](SpinLock::try_lock_for) gives up after a bounded
///   number of acquisition attempts. All steady-state allocator paths use
///   this and surface the timeout as an ordinary failure.
pub struct SpinLock<T> {
    /// `true` while held.
    locked: AtomicBool,
    inner: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Try once; returns immediately.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Attempt acquisition up to `retries` times, with a short read-only
    /// backoff between attempts, then give up.
    #[inline]
    pub fn try_lock_for(&self, retries: u32) -> Option<SpinLockGuard<'_, T>> {
        for _ in 0..retries {
            if let Some(guard) = self.try_lock() {
                return Some(guard);
            }
            // Read-only wait keeps the cache line shared; bounded so the
            // whole call stays bounded even against a wedged holder.
            for _ in 0..32 {
                if !self.locked.load(Ordering::Relaxed) {
                    break;
                }
                spin_loop();
            }
        }
        self.try_lock()
    }

    /// Spin until acquired.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    /// Closure convenience, built on the guard.
    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release publishes the critical section.
        self.lock.locked.store(false, Ordering::Release);
    }
}
