//! # Rundown Protection
//!
//! Guards an object that is about to be torn down: accessors take short-term
//! references; the teardown path waits for all of them to drain and then
//! flips the object into a state where no new reference can be taken.
//!
//! Everything lives in one pointer-sized word. The low bit set means the
//! rundown is active (or a waiter is parked); the remaining bits hold either
//! the usage count (each reference adds 2) or, while a waiter is parked, the
//! address of its [`RundownWaitBlock`].

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Low bit of the rundown word: rundown in progress.
const RUNDOWN_ACTIVE: usize = 1;

/// Step per protection reference.
const REFERENCE_INCREMENT: usize = 2;

/// Parked state of a thread waiting for in-flight references to drain.
///
/// `remaining` counts the references still outstanding when the wait was
/// staged; each release decrements it and the one that reaches zero sets
/// `wake`. The waiter busy-waits on `wake` — this runs at or above dispatch
/// level where scheduler waits are unavailable.
#[repr(C)]
pub struct RundownWaitBlock {
    remaining: AtomicUsize,
    wake: AtomicBool,
}

impl RundownWaitBlock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            remaining: AtomicUsize::new(0),
            wake: AtomicBool::new(false),
        }
    }
}

impl Default for RundownWaitBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// The rundown reference word.
pub struct RundownProtection {
    count: AtomicUsize,
}

impl RundownProtection {
    /// A fresh descriptor: no references, rundown not active.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
        }
    }

    /// Takes a protection reference.
    ///
    /// Returns false once the rundown has begun; the object must no longer
    /// be entered.
    pub fn acquire(&self) -> bool {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current & RUNDOWN_ACTIVE != 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current + REFERENCE_INCREMENT,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Drops a protection reference taken with [`RundownProtection::acquire`].
    pub fn release(&self) {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current & RUNDOWN_ACTIVE != 0 {
                // A waiter is parked; the word holds its wait block.
                let block = (current & !RUNDOWN_ACTIVE) as *const RundownWaitBlock;
                // SAFETY: the waiter keeps the block alive until `wake` is
                // observed set, which only the final release does.
                let block = unsafe { &*block };
                if block.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    block.wake.store(true, Ordering::Release);
                }
                return;
            }

            match self.count.compare_exchange_weak(
                current,
                current - REFERENCE_INCREMENT,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Waits until every in-flight reference is released, then leaves the
    /// rundown active.
    ///
    /// After this returns, every subsequent [`RundownProtection::acquire`]
    /// fails until [`RundownProtection::reinitialize`].
    pub fn wait_for_release(&self, wait_block: &RundownWaitBlock) {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current & RUNDOWN_ACTIVE != 0 {
                // Rundown already active (complete() ran or another waiter
                // finished); nothing outstanding.
                return;
            }
            if current == 0 {
                // No references: just mark active.
                match self.count.compare_exchange_weak(
                    current,
                    RUNDOWN_ACTIVE,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(observed) => {
                        current = observed;
                        continue;
                    }
                }
            }

            // Park: publish the wait block in the word, low bit set.
            wait_block
                .remaining
                .store(current / REFERENCE_INCREMENT, Ordering::Relaxed);
            wait_block.wake.store(false, Ordering::Relaxed);
            let parked = core::ptr::from_ref(wait_block) as usize | RUNDOWN_ACTIVE;
            match self.count.compare_exchange_weak(
                current,
                parked,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    while !wait_block.wake.load(Ordering::Acquire) {
                        spin_loop();
                    }
                    // Collapse the word to the plain active sentinel.
                    self.count.store(RUNDOWN_ACTIVE, Ordering::Release);
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Marks the rundown complete without waiting.
    ///
    /// Any reference still in flight is the caller's bug; subsequent
    /// acquires fail.
    pub fn complete(&self) {
        self.count.swap(RUNDOWN_ACTIVE, Ordering::AcqRel);
    }

    /// Resets a completed descriptor for reuse: count zero, active bit clear.
    pub fn reinitialize(&self) {
        self.count.swap(0, Ordering::AcqRel);
    }
}

impl Default for RundownProtection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn acquire_release_balance() {
        let rundown = RundownProtection::new();
        assert!(rundown.acquire());
        assert!(rundown.acquire());
        rundown.release();
        rundown.release();
        assert_eq!(rundown.count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn complete_blocks_new_references() {
        let rundown = RundownProtection::new();
        rundown.complete();
        assert!(!rundown.acquire());
        rundown.reinitialize();
        assert!(rundown.acquire());
        rundown.release();
    }

    #[test]
    fn wait_with_no_references_is_immediate() {
        let rundown = RundownProtection::new();
        let block = RundownWaitBlock::new();
        rundown.wait_for_release(&block);
        assert!(!rundown.acquire());
    }

    #[test]
    fn wait_drains_in_flight_references() {
        let rundown = Arc::new(RundownProtection::new());
        assert!(rundown.acquire());
        assert!(rundown.acquire());

        let releaser = {
            let rundown = Arc::clone(&rundown);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                rundown.release();
                std::thread::sleep(std::time::Duration::from_millis(20));
                rundown.release();
            })
        };

        let block = RundownWaitBlock::new();
        rundown.wait_for_release(&block);
        assert!(!rundown.acquire());
        releaser.join().unwrap();
    }
}
