//! # Dispatcher Headers and Wait Blocks
//!
//! Every waitable object starts with a [`DispatcherHeader`]: a type tag, a
//! signal-state counter, an inserted flag, and a FIFO list of parked
//! [`WaitBlock`]s. The concrete object (semaphore, timer, thread, …) extends
//! the header and decides what its signal state means.

use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use intrusive_collections::{LinkedList, LinkedListLink, UnsafeRef, intrusive_adapter};
use kernel_sync::SpinMutex;

/// Discriminator for the object a [`DispatcherHeader`] fronts.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ObjectType {
    Event = 0,
    Semaphore,
    Timer,
    Mutant,
    Thread,
    Dpc,
    ThreadedDpc,
}

/// One parked waiter, embedded in its thread's wait-block array.
///
/// `satisfied` is the hand-off flag: the signaling side sets it after
/// unlinking the block, and the would-be scheduler readies the owning
/// thread when it observes the flip.
#[derive(Debug)]
pub struct WaitBlock {
    link: LinkedListLink,
    satisfied: AtomicBool,
}

intrusive_adapter!(pub WaitBlockAdapter = UnsafeRef<WaitBlock>: WaitBlock { link: LinkedListLink });

// SAFETY: the link is only touched while the owning wait list holds its
// lock; the satisfied flag is atomic.
unsafe impl Send for WaitBlock {}
unsafe impl Sync for WaitBlock {}

impl WaitBlock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            link: LinkedListLink::new(),
            satisfied: AtomicBool::new(false),
        }
    }

    /// Whether the wait this block represents has been satisfied.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.satisfied.load(Ordering::Acquire)
    }

    /// Re-arms the block for a new wait.
    pub fn reset(&self) {
        self.satisfied.store(false, Ordering::Relaxed);
    }
}

impl Default for WaitBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// The shared base of all waitable objects.
pub struct DispatcherHeader {
    object_type: ObjectType,
    signal_state: AtomicI32,
    inserted: AtomicBool,
    wait_list: SpinMutex<LinkedList<WaitBlockAdapter>>,
}

// SAFETY: every mutable part is an atomic or sits behind the wait-list
// lock.
unsafe impl Send for DispatcherHeader {}
unsafe impl Sync for DispatcherHeader {}

impl DispatcherHeader {
    /// A header with the given type tag and initial signal state.
    #[must_use]
    pub fn new(object_type: ObjectType, signal_state: i32) -> Self {
        Self {
            object_type,
            signal_state: AtomicI32::new(signal_state),
            inserted: AtomicBool::new(false),
            wait_list: SpinMutex::new(LinkedList::new(WaitBlockAdapter::NEW)),
        }
    }

    #[must_use]
    pub const fn object_type(&self) -> ObjectType {
        self.object_type
    }

    /// Current signal state. Positive means signaled.
    #[must_use]
    pub fn signal_state(&self) -> i32 {
        self.signal_state.load(Ordering::Acquire)
    }

    /// Replaces the signal state, returning the previous value.
    pub fn set_signal_state(&self, state: i32) -> i32 {
        self.signal_state.swap(state, Ordering::AcqRel)
    }

    /// Adds `adjustment` to the signal state, returning the previous value.
    pub fn adjust_signal_state(&self, adjustment: i32) -> i32 {
        self.signal_state.fetch_add(adjustment, Ordering::AcqRel)
    }

    /// The inserted flag (timers use it to track list membership).
    #[must_use]
    pub fn inserted(&self) -> bool {
        self.inserted.load(Ordering::Acquire)
    }

    /// Sets the inserted flag, returning the previous value.
    pub fn set_inserted(&self, inserted: bool) -> bool {
        self.inserted.swap(inserted, Ordering::AcqRel)
    }

    /// Parks a wait block at the tail of the wait list.
    ///
    /// # Safety
    /// `block` must stay valid and pinned until it is satisfied or
    /// explicitly unlinked; it must not currently be on any list.
    pub unsafe fn push_waiter(&self, block: &WaitBlock) {
        block.reset();
        self.wait_list
            .lock()
            .push_back(unsafe { UnsafeRef::from_raw(core::ptr::from_ref(block)) });
    }

    /// Unparks the oldest waiter, if any, marking its block satisfied.
    ///
    /// Returns whether a waiter was woken.
    pub fn wake_one_waiter(&self) -> bool {
        let block = self.wait_list.lock().pop_front();
        block.map_or(false, |block| {
            block.satisfied.store(true, Ordering::Release);
            true
        })
    }

    /// Whether any waiter is parked.
    #[must_use]
    pub fn has_waiters(&self) -> bool {
        !self.wait_list.lock().is_empty()
    }
}

impl core::fmt::Debug for DispatcherHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DispatcherHeader")
            .field("object_type", &self.object_type)
            .field("signal_state", &self.signal_state())
            .field("inserted", &self.inserted())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiters_wake_fifo() {
        let header = DispatcherHeader::new(ObjectType::Event, 0);
        let first = WaitBlock::new();
        let second = WaitBlock::new();

        unsafe {
            header.push_waiter(&first);
            header.push_waiter(&second);
        }
        assert!(header.has_waiters());

        assert!(header.wake_one_waiter());
        assert!(first.is_satisfied());
        assert!(!second.is_satisfied());

        assert!(header.wake_one_waiter());
        assert!(second.is_satisfied());
        assert!(!header.wake_one_waiter());
        assert!(!header.has_waiters());
    }

    #[test]
    fn signal_state_accounting() {
        let header = DispatcherHeader::new(ObjectType::Semaphore, 1);
        assert_eq!(header.signal_state(), 1);
        assert_eq!(header.adjust_signal_state(2), 1);
        assert_eq!(header.signal_state(), 3);
        assert_eq!(header.set_signal_state(0), 3);
    }
}
