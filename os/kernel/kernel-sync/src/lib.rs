//! # Kernel Synchronization Primitives
//!
//! The busy-waiting layer everything above dispatch level builds on:
//! plain spinlocks, FIFO queued spinlocks, rundown protection, and the
//! interrupt-state guards that pair with them. None of these suspend the
//! caller — at or above dispatch level there is nothing to suspend into.
//!
//! Memory-ordering contract: every acquire operation has acquire semantics,
//! every release has release semantics; interrupt-state changes are
//! sequentially consistent with respect to the lock word.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod mutex;
mod queued;
mod raw_spin;
mod rundown;
mod sync_once_cell;

pub use irq::IrqGuard;
pub use mutex::{Mutex, MutexGuard};
pub use queued::{LockQueueEntry, QueuedSpinLock};
pub use raw_spin::RawSpin;
pub use rundown::{RundownProtection, RundownWaitBlock};
pub use sync_once_cell::SyncOnceCell;

/// A mutex over the plain test-and-test-and-set spinlock.
pub type SpinMutex<T> = Mutex<T, RawSpin>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

/// Low-level lock acquisition, implemented by the raw lock primitives.
pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
}

/// Low-level lock release.
pub trait RawUnlock {
    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn raw_unlock(&self);
}
