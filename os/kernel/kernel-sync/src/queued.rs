//! # Queued Spinlocks
//!
//! A queued spinlock hands the lock to waiters in FIFO order and keeps each
//! waiter spinning on its *own* cache line instead of the shared lock word.
//! Each CPU contributes a [`LockQueueEntry`] per lock level; the lock itself
//! is just the tail pointer of the waiter queue.
//!
//! Acquisition swaps the tail to the caller's entry: if the prior tail was
//! null the caller owns the lock outright, otherwise it links itself behind
//! the predecessor and spins on its own `busy` word until the predecessor's
//! release clears it. Release either retires an empty queue with a single
//! compare-exchange or hands off to the successor — which is exactly the
//! order in which acquirers swapped the tail.

use core::hint::spin_loop;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// A per-CPU, per-lock-level queue slot.
///
/// The slot must stay at a stable address from acquisition through release
/// (processor blocks embed an array of these, one per lock level).
#[repr(C)]
pub struct LockQueueEntry {
    /// Successor in the waiter queue, linked by the successor itself.
    next: AtomicPtr<LockQueueEntry>,
    /// True while this slot is waiting for the lock; cleared by the
    /// predecessor's hand-off.
    busy: AtomicBool,
}

impl LockQueueEntry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            busy: AtomicBool::new(false),
        }
    }
}

impl Default for LockQueueEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// The lock word: tail pointer of the FIFO waiter queue.
pub struct QueuedSpinLock {
    tail: AtomicPtr<LockQueueEntry>,
}

impl QueuedSpinLock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Acquires the lock with the caller's queue entry, spinning behind any
    /// predecessors.
    ///
    /// # Safety
    /// `entry` must be this CPU's slot for this lock, unused by any other
    /// in-flight acquisition, and must stay valid until the matching
    /// [`QueuedSpinLock::release`].
    pub unsafe fn acquire(&self, entry: *mut LockQueueEntry) {
        if unsafe { self.try_enqueue(entry) } {
            return;
        }
        // SAFETY: entry is valid per the caller's contract.
        let entry = unsafe { &*entry };
        while entry.busy.load(Ordering::Acquire) {
            spin_loop();
        }
    }

    /// Swaps the caller onto the queue tail. Returns true if the caller owns
    /// the lock immediately (no predecessor).
    ///
    /// Split out of [`QueuedSpinLock::acquire`] so the queue mechanics stay
    /// observable without spinning.
    ///
    /// # Safety
    /// Same contract as [`QueuedSpinLock::acquire`].
    pub unsafe fn try_enqueue(&self, entry: *mut LockQueueEntry) -> bool {
        // SAFETY: entry is valid per the caller's contract.
        unsafe {
            (*entry).next.store(ptr::null_mut(), Ordering::Relaxed);
            (*entry).busy.store(true, Ordering::Relaxed);
        }

        let predecessor = self.tail.swap(entry, Ordering::AcqRel);
        if predecessor.is_null() {
            // No queue: the caller owns the lock.
            unsafe { (*entry).busy.store(false, Ordering::Relaxed) };
            return true;
        }

        // SAFETY: a predecessor stays valid until it releases, which it
        // cannot do before observing our link.
        unsafe { (*predecessor).next.store(entry, Ordering::Release) };
        false
    }

    /// Releases the lock held through `entry`, handing it to the successor
    /// if one is queued.
    ///
    /// # Safety
    /// `entry` must be the slot that currently owns the lock.
    ///
    /// # Panics
    /// If `entry` does not own the lock.
    pub unsafe fn release(&self, entry: *mut LockQueueEntry) {
        // SAFETY: entry is valid per the caller's contract.
        let entry_ref = unsafe { &*entry };
        assert!(
            !entry_ref.busy.load(Ordering::Relaxed),
            "queued spinlock released by a non-owner"
        );

        let mut successor = entry_ref.next.load(Ordering::Acquire);
        if successor.is_null() {
            // Nobody visibly queued; try to retire the queue.
            if self
                .tail
                .compare_exchange(entry, ptr::null_mut(), Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            // An acquirer swapped the tail but has not linked yet; wait for
            // the link to appear.
            loop {
                successor = entry_ref.next.load(Ordering::Acquire);
                if !successor.is_null() {
                    break;
                }
                spin_loop();
            }
        }

        // Hand off: the successor's spin ends here.
        unsafe { (*successor).busy.store(false, Ordering::Release) };
    }
}

impl Default for QueuedSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_acquire_release() {
        let lock = QueuedSpinLock::new();
        let mut slot = LockQueueEntry::new();
        unsafe {
            lock.acquire(&raw mut slot);
            lock.release(&raw mut slot);
            // Reusable after release.
            lock.acquire(&raw mut slot);
            lock.release(&raw mut slot);
        }
    }

    #[test]
    fn handoff_follows_enqueue_order() {
        let lock = QueuedSpinLock::new();
        let mut a = LockQueueEntry::new();
        let mut b = LockQueueEntry::new();
        let mut c = LockQueueEntry::new();

        unsafe {
            assert!(lock.try_enqueue(&raw mut a)); // owner
            assert!(!lock.try_enqueue(&raw mut b)); // first waiter
            assert!(!lock.try_enqueue(&raw mut c)); // second waiter

            assert!(b.busy.load(Ordering::Relaxed));
            assert!(c.busy.load(Ordering::Relaxed));

            // a -> b hand-off.
            lock.release(&raw mut a);
            assert!(!b.busy.load(Ordering::Relaxed));
            assert!(c.busy.load(Ordering::Relaxed));

            // b -> c hand-off.
            lock.release(&raw mut b);
            assert!(!c.busy.load(Ordering::Relaxed));

            lock.release(&raw mut c);
        }

        // Queue fully retired.
        assert!(lock.tail.load(Ordering::Relaxed).is_null());
    }

    #[test]
    #[should_panic(expected = "non-owner")]
    fn release_by_waiter_panics() {
        let lock = QueuedSpinLock::new();
        let mut a = LockQueueEntry::new();
        let mut b = LockQueueEntry::new();
        unsafe {
            assert!(lock.try_enqueue(&raw mut a));
            assert!(!lock.try_enqueue(&raw mut b));
            // b is still spinning; releasing through it is a bug.
            lock.release(&raw mut b);
        }
    }

    #[test]
    fn contended_threads_stay_exclusive() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicU32;

        let lock = Arc::new(QueuedSpinLock::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                let mut slot = LockQueueEntry::new();
                for _ in 0..500 {
                    unsafe {
                        lock.acquire(&raw mut slot);
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                        lock.release(&raw mut slot);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2000);
    }
}
