//! # Semaphores
//!
//! The dispatcher header's signal state *is* the semaphore count. Release
//! adds an adjustment (bounded by the limit), waking parked waiters FIFO;
//! each woken waiter consumes one unit of the count.

use crate::object::{DispatcherHeader, ObjectType, WaitBlock};
use kernel_status::Status;

/// A counted semaphore with a fixed upper limit.
#[derive(Debug)]
pub struct Semaphore {
    header: DispatcherHeader,
    limit: i32,
}

impl Semaphore {
    /// A semaphore with an initial `count` and a maximum `limit`.
    #[must_use]
    pub fn new(count: i32, limit: i32) -> Self {
        Self {
            header: DispatcherHeader::new(ObjectType::Semaphore, count),
            limit,
        }
    }

    /// Current count.
    #[must_use]
    pub fn count(&self) -> i32 {
        self.header.signal_state()
    }

    /// Maximum count.
    #[must_use]
    pub const fn limit(&self) -> i32 {
        self.limit
    }

    /// The underlying dispatcher header.
    #[must_use]
    pub const fn header(&self) -> &DispatcherHeader {
        &self.header
    }

    /// Releases the semaphore, raising the count by `adjustment` and waking
    /// as many waiters as the new count covers.
    ///
    /// Returns the count before the release.
    ///
    /// # Errors
    /// [`Status::SemaphoreLimitExceeded`] if the adjusted count would pass
    /// the limit; the count is unchanged in that case.
    pub fn release(&self, adjustment: i32) -> Result<i32, Status> {
        let previous = self.header.signal_state();
        if adjustment <= 0 || previous > self.limit - adjustment {
            return Err(Status::SemaphoreLimitExceeded);
        }
        self.header.adjust_signal_state(adjustment);

        // Hand units to parked waiters, oldest first.
        while self.header.signal_state() > 0 && self.header.has_waiters() {
            if self.header.wake_one_waiter() {
                self.header.adjust_signal_state(-1);
            }
        }

        Ok(previous)
    }

    /// Consumes one unit if the semaphore is signaled.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let mut count = self.header.signal_state();
        while count > 0 {
            // The header's counter is shared; re-check on contention.
            let previous = self.header.adjust_signal_state(-1);
            if previous > 0 {
                return true;
            }
            self.header.adjust_signal_state(1);
            count = self.header.signal_state();
        }
        false
    }

    /// Takes a unit or parks `block` on the wait list.
    ///
    /// Returns whether the wait was satisfied immediately.
    ///
    /// # Safety
    /// Same pinning contract as [`DispatcherHeader::push_waiter`].
    pub unsafe fn wait(&self, block: &WaitBlock) -> bool {
        if self.try_acquire() {
            return true;
        }
        unsafe { self.header.push_waiter(block) };
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_respects_the_limit() {
        let semaphore = Semaphore::new(1, 2);
        assert_eq!(semaphore.release(1), Ok(1));
        assert_eq!(semaphore.count(), 2);
        assert_eq!(
            semaphore.release(1),
            Err(Status::SemaphoreLimitExceeded),
            "count may not pass the limit"
        );
        assert_eq!(semaphore.count(), 2);
        assert_eq!(
            semaphore.release(0),
            Err(Status::SemaphoreLimitExceeded),
            "adjustment must be positive"
        );
    }

    #[test]
    fn waiters_consume_released_units_fifo() {
        let semaphore = Semaphore::new(0, 10);
        let first = WaitBlock::new();
        let second = WaitBlock::new();

        unsafe {
            assert!(!semaphore.wait(&first));
            assert!(!semaphore.wait(&second));
        }

        // One unit: only the oldest waiter is satisfied.
        semaphore.release(1).unwrap();
        assert!(first.is_satisfied());
        assert!(!second.is_satisfied());
        assert_eq!(semaphore.count(), 0);

        semaphore.release(1).unwrap();
        assert!(second.is_satisfied());
        assert_eq!(semaphore.count(), 0);
    }

    #[test]
    fn immediate_acquisition_when_signaled() {
        let semaphore = Semaphore::new(2, 4);
        let block = WaitBlock::new();
        unsafe {
            assert!(semaphore.wait(&block));
        }
        assert_eq!(semaphore.count(), 1);
        assert!(semaphore.try_acquire());
        assert!(!semaphore.try_acquire());
    }
}
