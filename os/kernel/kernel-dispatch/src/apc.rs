//! # Asynchronous Procedure Calls
//!
//! An APC is a callback delivered to a specific thread when that thread is
//! about to return to the APC's mode. Each thread carries an [`ApcState`]
//! with one queue per mode and a pending flag the return path checks.
//!
//! Kernel APCs carry a kernel routine that always runs, and optionally a
//! normal routine run at the target level; user APCs queue until the thread
//! crosses back into user mode. The rundown routine runs instead of the
//! kernel routine when a queue is flushed at thread teardown.

use core::sync::atomic::{AtomicBool, Ordering};
use intrusive_collections::{LinkedList, LinkedListLink, UnsafeRef, intrusive_adapter};
use kernel_sync::SpinMutex;

/// Delivery mode of an APC.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ApcMode {
    Kernel = 0,
    User,
}

/// Which APC state the object inserts into when queued.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ApcEnvironment {
    /// The thread's original state.
    Original = 0,
    /// The state of the process the thread is attached to.
    Attached,
    /// Whichever state is current at queue time.
    Current,
    /// The state explicitly named at insert time.
    Insert,
}

/// Runs at APC level in the target thread; may repoint the normal routine.
pub type KernelApcRoutine = fn(apc: &Apc, system_argument1: *mut (), system_argument2: *mut ());

/// Runs when a queued APC is dropped during thread rundown.
pub type RundownApcRoutine = fn(apc: &Apc);

/// Runs at the delivery mode's level with the normal context.
pub type NormalApcRoutine = fn(context: *mut (), system_argument1: *mut (), system_argument2: *mut ());

/// An asynchronous procedure call object.
pub struct Apc {
    kernel_routine: KernelApcRoutine,
    rundown_routine: Option<RundownApcRoutine>,
    normal_routine: Option<NormalApcRoutine>,
    normal_context: *mut (),
    system_argument1: core::cell::Cell<*mut ()>,
    system_argument2: core::cell::Cell<*mut ()>,
    environment: ApcEnvironment,
    mode: ApcMode,
    inserted: AtomicBool,
    link: LinkedListLink,
}

// SAFETY: context pointers are owned by the queuing party; queues serialize
// through their lock.
unsafe impl Send for Apc {}
unsafe impl Sync for Apc {}

intrusive_adapter!(pub ApcAdapter = UnsafeRef<Apc>: Apc { link: LinkedListLink });

impl Apc {
    /// An APC targeting `mode`, with optional rundown and normal routines.
    #[must_use]
    pub const fn new(
        mode: ApcMode,
        environment: ApcEnvironment,
        kernel_routine: KernelApcRoutine,
        rundown_routine: Option<RundownApcRoutine>,
        normal_routine: Option<NormalApcRoutine>,
        normal_context: *mut (),
    ) -> Self {
        Self {
            kernel_routine,
            rundown_routine,
            normal_routine,
            normal_context,
            system_argument1: core::cell::Cell::new(core::ptr::null_mut()),
            system_argument2: core::cell::Cell::new(core::ptr::null_mut()),
            environment,
            mode,
            inserted: AtomicBool::new(false),
            link: LinkedListLink::new(),
        }
    }

    #[must_use]
    pub const fn mode(&self) -> ApcMode {
        self.mode
    }

    #[must_use]
    pub const fn environment(&self) -> ApcEnvironment {
        self.environment
    }

    #[must_use]
    pub fn inserted(&self) -> bool {
        self.inserted.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn normal_context(&self) -> *mut () {
        self.normal_context
    }
}

/// The per-thread APC machinery: one queue per mode plus pending flags.
pub struct ApcState {
    kernel_queue: SpinMutex<LinkedList<ApcAdapter>>,
    user_queue: SpinMutex<LinkedList<ApcAdapter>>,
    kernel_pending: AtomicBool,
    user_pending: AtomicBool,
}

// SAFETY: the queues are only reachable through their locks; the flags are
// atomic.
unsafe impl Send for ApcState {}
unsafe impl Sync for ApcState {}

impl ApcState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            kernel_queue: SpinMutex::new(LinkedList::new(ApcAdapter::NEW)),
            user_queue: SpinMutex::new(LinkedList::new(ApcAdapter::NEW)),
            kernel_pending: AtomicBool::new(false),
            user_pending: AtomicBool::new(false),
        }
    }

    /// Whether delivery is pending for `mode`.
    #[must_use]
    pub fn pending(&self, mode: ApcMode) -> bool {
        match mode {
            ApcMode::Kernel => self.kernel_pending.load(Ordering::Acquire),
            ApcMode::User => self.user_pending.load(Ordering::Acquire),
        }
    }

    /// Queues `apc` with the given system arguments; refuses double inserts.
    ///
    /// # Safety
    /// `apc` must stay valid and pinned until delivered or rundown.
    pub unsafe fn insert(
        &self,
        apc: &Apc,
        system_argument1: *mut (),
        system_argument2: *mut (),
    ) -> bool {
        if apc.inserted.swap(true, Ordering::AcqRel) {
            return false;
        }

        // The arguments travel with the object; the inserted flag grants
        // this path exclusive access to them.
        apc.system_argument1.set(system_argument1);
        apc.system_argument2.set(system_argument2);

        let reference = unsafe { UnsafeRef::from_raw(core::ptr::from_ref(apc)) };
        match apc.mode {
            ApcMode::Kernel => {
                self.kernel_queue.lock().push_back(reference);
                self.kernel_pending.store(true, Ordering::Release);
            }
            ApcMode::User => {
                self.user_queue.lock().push_back(reference);
                self.user_pending.store(true, Ordering::Release);
            }
        }
        true
    }

    /// Delivers every queued APC for `mode` in FIFO order: kernel routine
    /// first, then the normal routine if the kernel routine left one.
    ///
    /// Called on the thread's own path back into `mode`.
    pub fn deliver(&self, mode: ApcMode) -> usize {
        let queue = match mode {
            ApcMode::Kernel => &self.kernel_queue,
            ApcMode::User => &self.user_queue,
        };

        let mut delivered = 0usize;
        loop {
            let Some(apc) = queue.lock().pop_front() else {
                break;
            };
            apc.inserted.store(false, Ordering::Release);
            delivered += 1;

            (apc.kernel_routine)(&apc, apc.system_argument1.get(), apc.system_argument2.get());
            if let Some(normal) = apc.normal_routine {
                normal(
                    apc.normal_context,
                    apc.system_argument1.get(),
                    apc.system_argument2.get(),
                );
            }
        }

        match mode {
            ApcMode::Kernel => self.kernel_pending.store(false, Ordering::Release),
            ApcMode::User => self.user_pending.store(false, Ordering::Release),
        }
        delivered
    }

    /// Flushes both queues without delivery, invoking rundown routines.
    ///
    /// Used at thread teardown.
    pub fn flush(&self) {
        for queue in [&self.kernel_queue, &self.user_queue] {
            loop {
                let Some(apc) = queue.lock().pop_front() else {
                    break;
                };
                apc.inserted.store(false, Ordering::Release);
                if let Some(rundown) = apc.rundown_routine {
                    rundown(&apc);
                }
            }
        }
        self.kernel_pending.store(false, Ordering::Release);
        self.user_pending.store(false, Ordering::Release);
    }
}

impl Default for ApcState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static KERNEL_RUNS: AtomicUsize = AtomicUsize::new(0);
    static NORMAL_RUNS: AtomicUsize = AtomicUsize::new(0);
    static RUNDOWN_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn kernel_routine(_apc: &Apc, _a1: *mut (), _a2: *mut ()) {
        KERNEL_RUNS.fetch_add(1, Ordering::Relaxed);
    }

    fn normal_routine(_context: *mut (), _a1: *mut (), _a2: *mut ()) {
        NORMAL_RUNS.fetch_add(1, Ordering::Relaxed);
    }

    fn rundown_routine(_apc: &Apc) {
        RUNDOWN_RUNS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn delivery_runs_kernel_then_normal() {
        KERNEL_RUNS.store(0, Ordering::Relaxed);
        NORMAL_RUNS.store(0, Ordering::Relaxed);

        let state = ApcState::new();
        let apc = Apc::new(
            ApcMode::Kernel,
            ApcEnvironment::Original,
            kernel_routine,
            None,
            Some(normal_routine),
            core::ptr::null_mut(),
        );

        unsafe {
            assert!(state.insert(&apc, core::ptr::null_mut(), core::ptr::null_mut()));
            assert!(!state.insert(&apc, core::ptr::null_mut(), core::ptr::null_mut()));
        }
        assert!(state.pending(ApcMode::Kernel));
        assert!(!state.pending(ApcMode::User));

        assert_eq!(state.deliver(ApcMode::Kernel), 1);
        assert_eq!(KERNEL_RUNS.load(Ordering::Relaxed), 1);
        assert_eq!(NORMAL_RUNS.load(Ordering::Relaxed), 1);
        assert!(!state.pending(ApcMode::Kernel));
        assert!(!apc.inserted());
    }

    #[test]
    fn modes_are_segregated() {
        let state = ApcState::new();
        let kernel_apc = Apc::new(
            ApcMode::Kernel,
            ApcEnvironment::Original,
            kernel_routine,
            None,
            None,
            core::ptr::null_mut(),
        );
        let user_apc = Apc::new(
            ApcMode::User,
            ApcEnvironment::Original,
            kernel_routine,
            None,
            None,
            core::ptr::null_mut(),
        );

        unsafe {
            state.insert(&kernel_apc, core::ptr::null_mut(), core::ptr::null_mut());
            state.insert(&user_apc, core::ptr::null_mut(), core::ptr::null_mut());
        }

        assert_eq!(state.deliver(ApcMode::User), 1);
        assert!(kernel_apc.inserted(), "kernel APC untouched by user delivery");
        assert_eq!(state.deliver(ApcMode::Kernel), 1);
    }

    #[test]
    fn flush_runs_rundown_routines() {
        RUNDOWN_RUNS.store(0, Ordering::Relaxed);
        let state = ApcState::new();
        let apc = Apc::new(
            ApcMode::User,
            ApcEnvironment::Original,
            kernel_routine,
            Some(rundown_routine),
            None,
            core::ptr::null_mut(),
        );
        unsafe {
            state.insert(&apc, core::ptr::null_mut(), core::ptr::null_mut());
        }
        state.flush();
        assert_eq!(RUNDOWN_RUNS.load(Ordering::Relaxed), 1);
        assert!(!state.pending(ApcMode::User));
    }
}
