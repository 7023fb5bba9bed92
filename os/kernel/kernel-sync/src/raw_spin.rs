use crate::{RawLock, RawUnlock};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

/// A test-and-test-and-set spinlock over a single machine word.
///
/// Non-zero means held. Acquisition spins with `pause` between attempts,
/// re-checking with plain loads so the line stays shared while contended.
/// Callers are expected to be at or above dispatch level; the lock does not
/// touch the interrupt flag (pair with [`crate::IrqGuard`] where needed).
///
/// Releasing a lock that is not held is a caller bug; [`RawSpin::unlock`]
/// asserts it in debug builds.
pub struct RawSpin {
    held: AtomicBool,
}

impl Default for RawSpin {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpin {
    /// A new, unheld lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Spins until the lock is acquired.
    #[inline]
    pub fn lock(&self) {
        // Fast path: one swap; contended path: spin on loads.
        while self.held.swap(true, Ordering::Acquire) {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    /// Acquires the lock if it is free; returns whether it was acquired.
    #[inline]
    pub fn try_lock(&self) -> bool {
        !self.held.swap(true, Ordering::Acquire)
    }

    /// Releases the lock.
    ///
    /// # Safety
    /// The caller must hold the lock.
    #[inline]
    pub unsafe fn unlock(&self) {
        debug_assert!(self.held.load(Ordering::Relaxed), "release of unheld lock");
        self.held.store(false, Ordering::Release);
    }
}

impl RawLock for RawSpin {
    #[inline]
    fn raw_lock(&self) {
        self.lock();
    }

    #[inline]
    fn raw_try_lock(&self) -> bool {
        self.try_lock()
    }
}

impl RawUnlock for RawSpin {
    #[inline]
    unsafe fn raw_unlock(&self) {
        unsafe { self.unlock() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusion_and_release() {
        let lock = RawSpin::new();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        unsafe { lock.unlock() };
        assert!(lock.try_lock());
        unsafe { lock.unlock() };
    }

    #[test]
    fn contended_threads_serialize() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU32, Ordering};

        let lock = Arc::new(RawSpin::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    lock.lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    unsafe { lock.unlock() };
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }
}
