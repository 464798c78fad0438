use crate::Backoff;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// A writer-preferring reader/writer spinlock.
///
/// Readers increment a counter; a writer raises a flag, then waits for the
/// reader count to drain. Arriving readers that observe the flag back off
/// before incrementing, so a waiting writer cannot be starved by a steady
/// reader stream. Used where reads vastly outnumber writes (module registry
/// lookups, service slot resolution).
///
/// Protocol per reader acquisition:
/// 1. Wait until no writer flag is visible.
/// 2. Increment the reader count (Acquire on the subsequent re-check).
/// 3. Re-check the writer flag; if a writer slipped in between steps 1 and
///    2, undo the increment and retry. Otherwise the read section is open.
///
/// The writer CASes the flag, then spins until `readers == 0`. Its critical
/// section is ordered after all read sections by the Acquire load of the
/// count reaching zero; its writes are published by the Release store that
/// clears the flag.
pub struct RwLock<T: ?Sized> {
    readers: AtomicU32,
    writer: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: the reader/writer protocol serializes mutation; shared reads
// require T: Sync semantics which Send + the guard borrows provide.
unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates an unlocked lock around `value`.
    pub const fn new(value: T) -> Self {
        Self {
            readers: AtomicU32::new(0),
            writer: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Acquires a shared read guard.
    pub fn read(&self) -> ReadGuard<'_, T> {
        let mut backoff = Backoff::new();
        loop {
            // Writer preference: do not even bump the count while a writer
            // holds or wants the lock.
            while self.writer.load(Ordering::Relaxed) {
                backoff.snooze();
            }
            self.readers.fetch_add(1, Ordering::Acquire);
            if self.writer.load(Ordering::Acquire) {
                // Lost the race to a writer; undo and retry.
                self.readers.fetch_sub(1, Ordering::Release);
            } else {
                return ReadGuard { lock: self };
            }
        }
    }

    /// Acquires the exclusive write guard.
    pub fn write(&self) -> WriteGuard<'_, T> {
        let mut backoff = Backoff::new();
        while self
            .writer
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        // Flag is up: no new readers will enter. Drain the ones in flight.
        let mut backoff = Backoff::new();
        while self.readers.load(Ordering::Acquire) != 0 {
            backoff.snooze();
        }
        WriteGuard { lock: self }
    }

    /// Returns a mutable reference without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

/// Shared read guard; decrements the reader count on drop.
pub struct ReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: reader count > 0 excludes writers.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.readers.fetch_sub(1, Ordering::Release);
    }
}

/// Exclusive write guard; clears the writer flag on drop.
pub struct WriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the writer flag excludes all readers and other writers.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the writer flag excludes all readers and other writers.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.writer.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_concurrent_readers() {
        let lock = RwLock::new(7u32);
        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!(*r1 + *r2, 14);
    }

    #[test]
    fn test_writer_excludes() {
        let lock = Arc::new(RwLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..5_000 {
                    *lock.write() += 1;
                }
            }));
        }
        // Readers in parallel must only ever observe a consistent counter.
        for _ in 0..1_000 {
            let v = *lock.read();
            assert!(v <= 20_000);
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.read(), 20_000);
    }
}
