//! # Deferred Procedure Calls
//!
//! A DPC is a callback queued at dispatch level onto a per-CPU queue and
//! retired when the processor drains that queue. High-importance DPCs jump
//! the line; everything else queues at the tail.

use crate::object::ObjectType;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use intrusive_collections::{LinkedList, LinkedListLink, UnsafeRef, intrusive_adapter};
use kernel_sync::SpinMutex;

/// Queue placement of a DPC.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DpcImportance {
    Low = 0,
    Medium,
    High,
}

/// The deferred routine: receives the DPC and its context pointer.
pub type DpcRoutine = fn(dpc: &Dpc, context: *mut ());

/// A deferred procedure call object.
pub struct Dpc {
    object_type: ObjectType,
    importance: DpcImportance,
    target_cpu: AtomicU32,
    routine: DpcRoutine,
    context: *mut (),
    inserted: AtomicBool,
    link: LinkedListLink,
}

// SAFETY: the context pointer is owned by whoever queues the DPC; the queue
// itself serializes access through its lock.
unsafe impl Send for Dpc {}
unsafe impl Sync for Dpc {}

intrusive_adapter!(pub DpcAdapter = UnsafeRef<Dpc>: Dpc { link: LinkedListLink });

impl Dpc {
    /// An ordinary DPC with the given routine and context.
    #[must_use]
    pub const fn new(routine: DpcRoutine, context: *mut ()) -> Self {
        Self {
            object_type: ObjectType::Dpc,
            importance: DpcImportance::Medium,
            target_cpu: AtomicU32::new(0),
            routine,
            context,
            inserted: AtomicBool::new(false),
            link: LinkedListLink::new(),
        }
    }

    /// A threaded DPC (runs from a dedicated thread rather than the
    /// dispatch-level drain).
    #[must_use]
    pub const fn new_threaded(routine: DpcRoutine, context: *mut ()) -> Self {
        Self {
            object_type: ObjectType::ThreadedDpc,
            importance: DpcImportance::Medium,
            target_cpu: AtomicU32::new(0),
            routine,
            context,
            inserted: AtomicBool::new(false),
            link: LinkedListLink::new(),
        }
    }

    #[must_use]
    pub const fn object_type(&self) -> ObjectType {
        self.object_type
    }

    #[must_use]
    pub const fn importance(&self) -> DpcImportance {
        self.importance
    }

    /// Changes queue placement; takes effect on the next insert.
    pub fn set_importance(&mut self, importance: DpcImportance) {
        self.importance = importance;
    }

    /// CPU this DPC is targeted at.
    #[must_use]
    pub fn target_cpu(&self) -> u32 {
        self.target_cpu.load(Ordering::Relaxed)
    }

    pub fn set_target_cpu(&self, cpu: u32) {
        self.target_cpu.store(cpu, Ordering::Relaxed);
    }

    /// Whether the DPC is currently queued.
    #[must_use]
    pub fn inserted(&self) -> bool {
        self.inserted.load(Ordering::Acquire)
    }
}

/// The per-CPU DPC queue.
pub struct DpcQueue {
    list: SpinMutex<LinkedList<DpcAdapter>>,
    depth: AtomicU32,
}

// SAFETY: the list is only reachable through its lock; the depth is
// atomic.
unsafe impl Send for DpcQueue {}
unsafe impl Sync for DpcQueue {}

impl DpcQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            list: SpinMutex::new(LinkedList::new(DpcAdapter::NEW)),
            depth: AtomicU32::new(0),
        }
    }

    /// Number of queued DPCs.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }

    /// Queues `dpc`; high-importance DPCs go to the head.
    ///
    /// Returns false (without queuing) if the DPC is already inserted.
    ///
    /// # Safety
    /// `dpc` must stay valid and pinned until it has been retired.
    pub unsafe fn insert(&self, dpc: &Dpc) -> bool {
        if dpc.inserted.swap(true, Ordering::AcqRel) {
            return false;
        }
        let reference = unsafe { UnsafeRef::from_raw(core::ptr::from_ref(dpc)) };
        let mut list = self.list.lock();
        if dpc.importance == DpcImportance::High {
            list.push_front(reference);
        } else {
            list.push_back(reference);
        }
        self.depth.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Unqueues `dpc` if it is queued; returns whether it was.
    pub fn remove(&self, dpc: &Dpc) -> bool {
        if !dpc.inserted.load(Ordering::Acquire) {
            return false;
        }
        let mut list = self.list.lock();
        // SAFETY: the link is either on this list or nowhere; the inserted
        // flag said it is queued, and the lock keeps it that way.
        let mut cursor = unsafe { list.cursor_mut_from_ptr(core::ptr::from_ref(dpc)) };
        if cursor.remove().is_some() {
            dpc.inserted.store(false, Ordering::Release);
            self.depth.fetch_sub(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Drains the queue, invoking every deferred routine in queue order.
    ///
    /// Runs at dispatch level on the owning CPU.
    pub fn retire_dpc_list(&self) {
        loop {
            let Some(dpc) = self.list.lock().pop_front() else {
                return;
            };
            self.depth.fetch_sub(1, Ordering::Relaxed);
            dpc.inserted.store(false, Ordering::Release);
            (dpc.routine)(&dpc, dpc.context);
        }
    }
}

impl Default for DpcQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static ORDER: SpinMutex<[usize; 8]> = SpinMutex::new([0; 8]);
    static SLOT: AtomicUsize = AtomicUsize::new(0);

    fn record(_dpc: &Dpc, context: *mut ()) {
        let tag = context as usize;
        let slot = SLOT.fetch_add(1, Ordering::Relaxed);
        ORDER.lock()[slot] = tag;
    }

    #[test]
    fn retire_runs_in_queue_order_with_high_first() {
        SLOT.store(0, Ordering::Relaxed);
        let queue = DpcQueue::new();
        let a = Dpc::new(record, 1 as *mut ());
        let b = Dpc::new(record, 2 as *mut ());
        let mut c = Dpc::new(record, 3 as *mut ());
        c.set_importance(DpcImportance::High);

        unsafe {
            assert!(queue.insert(&a));
            assert!(queue.insert(&b));
            assert!(queue.insert(&c)); // jumps the line
            assert!(!queue.insert(&a), "double insert is refused");
        }
        assert_eq!(queue.depth(), 3);

        queue.retire_dpc_list();
        assert_eq!(queue.depth(), 0);
        assert!(!a.inserted() && !b.inserted() && !c.inserted());

        let order = ORDER.lock();
        assert_eq!(&order[..3], &[3, 1, 2]);
    }

    #[test]
    fn remove_unqueues() {
        let queue = DpcQueue::new();
        let dpc = Dpc::new(record, core::ptr::null_mut());
        unsafe {
            assert!(queue.insert(&dpc));
        }
        assert!(queue.remove(&dpc));
        assert!(!queue.remove(&dpc));
        assert_eq!(queue.depth(), 0);
    }
}
