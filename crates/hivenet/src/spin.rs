use crate::Backoff;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

// =============================================================================
// MEMORY ORDERING
// =============================================================================
//
// Acquisition is a CAS false -> true with Acquire on success: everything the
// previous owner wrote before unlocking happens-before the new owner's
// critical section. Release is a Release store of false, publishing the
// section's writes to the next Acquire. The inner spin reads the flag with
// Relaxed only: it carries no data, it just keeps the CAS off the bus while
// the lock is visibly held.
//
// =============================================================================

/// A test-and-set spinlock protecting `T`.
///
/// Held only for short, syscall-free critical sections: linked-list splices
/// on the run queue, mailbox ring index updates, service slot state flips.
/// The lock word is cache-padded so waiters do not drag the protected
/// data's line.
pub struct SpinLock<T: ?Sized> {
    locked: CachePadded<AtomicBool>,
    value: UnsafeCell<T>,
}

// Safety: the lock serializes all access to `value`; T only needs Send for
// the protected value to move between threads via the guard.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates an unlocked spinlock around `value`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: CachePadded::new(AtomicBool::new(false)),
            value: UnsafeCell::new(value),
        }
    }

    /// Consumes the lock and returns the protected value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the lock, spinning with backoff while contended.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        let mut backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Spin on a plain load to avoid hammering the line with CAS traffic.
            while self.locked.load(Ordering::Relaxed) {
                backoff.spin();
            }
        }
        SpinGuard { lock: self }
    }

    /// Attempts a single acquisition; returns `None` if the lock is held.
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }

    /// Returns a mutable reference without locking.
    ///
    /// Safe because `&mut self` proves exclusive access.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

impl<T: ?Sized + std::fmt::Debug> std::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("SpinLock").field("value", &&*guard).finish(),
            None => f.write_str("SpinLock { <locked> }"),
        }
    }
}

/// RAII guard; unlocks on drop.
pub struct SpinGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard witnesses exclusive ownership of the lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard witnesses exclusive ownership of the lock.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_unlock() {
        let lock = SpinLock::new(0u32);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn test_try_lock_contended() {
        let lock = SpinLock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_counter_under_contention() {
        let lock = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }
}
