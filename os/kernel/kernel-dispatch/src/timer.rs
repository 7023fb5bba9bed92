//! # Timers
//!
//! A timer is a dispatcher object staged on a time-ordered list keyed by
//! absolute expiration (in 100 ns units). Expiration signals the header,
//! wakes waiters, and optionally hands a DPC to the owning CPU's queue.
//!
//! Two flavors: a *notification* timer stays signaled until reset, a
//! *synchronization* timer auto-resets when it wakes a waiter. Periodic
//! timers re-stage themselves at `period` milliseconds after expiry.
//!
//! This layer owns the list and the state rules; whoever owns the clock
//! source calls [`TimerList::expire_timers`] at dispatch level.

use crate::dpc::{Dpc, DpcQueue};
use crate::object::{DispatcherHeader, ObjectType};
use core::sync::atomic::{AtomicU64, Ordering};
use intrusive_collections::{LinkedList, LinkedListLink, UnsafeRef, intrusive_adapter};
use kernel_sync::SpinMutex;

/// 100 ns units per millisecond.
const TICKS_PER_MILLISECOND: u64 = 10_000;

/// Signal behavior of a timer.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TimerType {
    /// Stays signaled until explicitly reset.
    Notification = 0,
    /// Auto-resets after waking one waiter.
    Synchronization,
}

/// A timer object.
pub struct Timer {
    header: DispatcherHeader,
    timer_type: TimerType,
    /// Absolute due time in 100 ns units.
    due_time: AtomicU64,
    /// Re-arm period in milliseconds; zero for one-shot timers.
    period_ms: AtomicU64,
    /// DPC enqueued on expiry, if any.
    dpc: SpinMutex<Option<UnsafeRef<Dpc>>>,
    link: LinkedListLink,
}

intrusive_adapter!(pub TimerAdapter = UnsafeRef<Timer>: Timer { link: LinkedListLink });

// SAFETY: the link is only touched under the timer list's lock; everything
// else is atomic or behind the DPC mutex.
unsafe impl Send for Timer {}
unsafe impl Sync for Timer {}

impl Timer {
    /// A timer of the given flavor, unset and unsignaled.
    #[must_use]
    pub fn new(timer_type: TimerType) -> Self {
        Self {
            header: DispatcherHeader::new(ObjectType::Timer, 0),
            timer_type,
            due_time: AtomicU64::new(0),
            period_ms: AtomicU64::new(0),
            dpc: SpinMutex::new(None),
            link: LinkedListLink::new(),
        }
    }

    #[must_use]
    pub const fn header(&self) -> &DispatcherHeader {
        &self.header
    }

    #[must_use]
    pub const fn timer_type(&self) -> TimerType {
        self.timer_type
    }

    /// Absolute due time in 100 ns units (meaningful while set).
    #[must_use]
    pub fn due_time(&self) -> u64 {
        self.due_time.load(Ordering::Acquire)
    }

    /// Whether the timer has expired at least once since the last reset.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.header.signal_state() > 0
    }

    /// Clears the signal state (notification timers).
    pub fn reset(&self) {
        self.header.set_signal_state(0);
    }
}

/// The time-ordered pending-timer list.
pub struct TimerList {
    list: SpinMutex<LinkedList<TimerAdapter>>,
}

// SAFETY: the list is only reachable through its lock.
unsafe impl Send for TimerList {}
unsafe impl Sync for TimerList {}

impl TimerList {
    #[must_use]
    pub fn new() -> Self {
        Self {
            list: SpinMutex::new(LinkedList::new(TimerAdapter::NEW)),
        }
    }

    /// Stages `timer` to expire at the absolute `due_time` (100 ns units),
    /// optionally re-arming every `period_ms` and queuing `dpc` on expiry.
    ///
    /// Returns whether the timer was already set (in which case it is
    /// re-staged at the new time).
    ///
    /// # Safety
    /// `timer` (and `dpc` if given) must stay valid and pinned while set.
    pub unsafe fn set_timer(
        &self,
        timer: &Timer,
        due_time: u64,
        period_ms: u64,
        dpc: Option<&Dpc>,
    ) -> bool {
        let was_set = self.cancel_timer(timer);

        timer.header.set_signal_state(0);
        timer.due_time.store(due_time, Ordering::Release);
        timer.period_ms.store(period_ms, Ordering::Release);
        *timer.dpc.lock() =
            dpc.map(|dpc| unsafe { UnsafeRef::from_raw(core::ptr::from_ref(dpc)) });

        unsafe { self.insert_sorted(timer) };
        timer.header.set_inserted(true);
        was_set
    }

    /// Removes `timer` from the pending list; returns whether it was set.
    pub fn cancel_timer(&self, timer: &Timer) -> bool {
        if !timer.header.inserted() {
            return false;
        }
        let mut list = self.list.lock();
        // SAFETY: the inserted flag says the timer is on this list, and the
        // lock keeps it there.
        let mut cursor = unsafe { list.cursor_mut_from_ptr(core::ptr::from_ref(timer)) };
        let removed = cursor.remove().is_some();
        if removed {
            timer.header.set_inserted(false);
        }
        removed
    }

    /// Expires every timer due at or before `now`, signaling it, waking
    /// waiters, queuing its DPC, and re-staging periodic timers.
    ///
    /// Runs at dispatch level. Returns the number of timers that fired.
    ///
    /// # Safety
    /// The DPC queue must be the current CPU's; staged timers and DPCs must
    /// still be pinned per [`TimerList::set_timer`].
    pub unsafe fn expire_timers(&self, now: u64, dpc_queue: &DpcQueue) -> usize {
        let mut fired = 0usize;

        loop {
            let timer = {
                let mut list = self.list.lock();
                let front_due = list.front().get().map(|t| t.due_time());
                match front_due {
                    Some(due) if due <= now => list.pop_front(),
                    _ => None,
                }
            };
            let Some(timer) = timer else {
                break;
            };

            timer.header.set_inserted(false);
            fired += 1;

            // Signal and wake. A synchronization timer consumes its signal
            // with the first waiter it wakes.
            timer.header.set_signal_state(1);
            if timer.header.wake_one_waiter() && timer.timer_type == TimerType::Synchronization {
                timer.header.set_signal_state(0);
            }

            if let Some(dpc) = timer.dpc.lock().as_ref() {
                // SAFETY: pinned per the staging contract.
                unsafe { dpc_queue.insert(dpc) };
            }

            let period = timer.period_ms.load(Ordering::Acquire);
            if period != 0 {
                timer
                    .due_time
                    .store(now + period * TICKS_PER_MILLISECOND, Ordering::Release);
                // SAFETY: still pinned; going right back on the list.
                unsafe { self.insert_sorted(&timer) };
                timer.header.set_inserted(true);
            }
        }

        fired
    }

    /// Splices `timer` into the list before the first entry with a later
    /// due time.
    unsafe fn insert_sorted(&self, timer: &Timer) {
        let due = timer.due_time();
        let reference = unsafe { UnsafeRef::from_raw(core::ptr::from_ref(timer)) };
        let mut list = self.list.lock();
        let mut cursor = list.front_mut();
        loop {
            match cursor.get() {
                None => {
                    cursor.insert_before(reference);
                    return;
                }
                Some(entry) if entry.due_time() > due => {
                    cursor.insert_before(reference);
                    return;
                }
                Some(_) => cursor.move_next(),
            }
        }
    }
}

impl Default for TimerList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::WaitBlock;

    fn noop(_dpc: &Dpc, _context: *mut ()) {}

    #[test]
    fn expiry_is_time_ordered() {
        let list = TimerList::new();
        let queue = DpcQueue::new();
        let early = Timer::new(TimerType::Notification);
        let late = Timer::new(TimerType::Notification);

        unsafe {
            // Stage out of order; the list sorts by due time.
            list.set_timer(&late, 2_000, 0, None);
            list.set_timer(&early, 1_000, 0, None);

            assert_eq!(list.expire_timers(500, &queue), 0);
            assert_eq!(list.expire_timers(1_000, &queue), 1);
            assert!(early.is_signaled());
            assert!(!late.is_signaled());

            assert_eq!(list.expire_timers(5_000, &queue), 1);
            assert!(late.is_signaled());
        }
    }

    #[test]
    fn cancel_reports_whether_set() {
        let list = TimerList::new();
        let timer = Timer::new(TimerType::Notification);
        assert!(!list.cancel_timer(&timer));
        unsafe {
            list.set_timer(&timer, 1_000, 0, None);
        }
        assert!(list.cancel_timer(&timer));
        assert!(!list.cancel_timer(&timer));
        assert!(!timer.is_signaled(), "cancelled timers never fire");
    }

    #[test]
    fn set_returns_previous_state_and_restages() {
        let list = TimerList::new();
        let queue = DpcQueue::new();
        let timer = Timer::new(TimerType::Notification);
        unsafe {
            assert!(!list.set_timer(&timer, 1_000, 0, None));
            assert!(list.set_timer(&timer, 9_000, 0, None));
            assert_eq!(list.expire_timers(2_000, &queue), 0, "restaged later");
            assert_eq!(list.expire_timers(9_000, &queue), 1);
        }
    }

    #[test]
    fn periodic_timers_restage_and_queue_dpcs() {
        let list = TimerList::new();
        let queue = DpcQueue::new();
        let dpc = Dpc::new(noop, core::ptr::null_mut());
        let timer = Timer::new(TimerType::Notification);

        unsafe {
            list.set_timer(&timer, 1_000, 5, Some(&dpc));
            assert_eq!(list.expire_timers(1_000, &queue), 1);
        }
        assert_eq!(queue.depth(), 1);
        // Re-staged 5 ms past expiry.
        assert_eq!(timer.due_time(), 1_000 + 5 * TICKS_PER_MILLISECOND);
        assert!(timer.header().inserted());

        queue.retire_dpc_list();
        unsafe {
            assert_eq!(list.expire_timers(timer.due_time(), &queue), 1);
        }
        assert_eq!(queue.depth(), 1, "periodic timers requeue their DPC");
    }

    #[test]
    fn synchronization_timers_auto_reset_on_wake() {
        let list = TimerList::new();
        let queue = DpcQueue::new();
        let timer = Timer::new(TimerType::Synchronization);
        let waiter = WaitBlock::new();

        unsafe {
            timer.header().push_waiter(&waiter);
            list.set_timer(&timer, 100, 0, None);
            list.expire_timers(100, &queue);
        }
        assert!(waiter.is_satisfied());
        assert!(!timer.is_signaled(), "signal consumed by the waiter");

        // Without a waiter the signal sticks until consumed.
        unsafe {
            list.set_timer(&timer, 200, 0, None);
            list.expire_timers(200, &queue);
        }
        assert!(timer.is_signaled());
    }
}
