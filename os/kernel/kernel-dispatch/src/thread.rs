//! # Thread Control Blocks
//!
//! The kernel-side thread object as far as the platform core takes it:
//! dispatcher header, stack extents, APC state, wait blocks, the suspension
//! machinery (APC + semaphore + count) and the built-in timer for timed
//! waits. Scheduling above thread initialization is out of scope; a thread
//! built here is ready for a scheduler to adopt.

use crate::apc::{Apc, ApcEnvironment, ApcMode, ApcState};
use crate::object::{DispatcherHeader, ObjectType, WaitBlock};
use crate::semaphore::Semaphore;
use crate::timer::{Timer, TimerType};
use core::sync::atomic::{AtomicU8, Ordering};
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::RawSpin;

/// Number of built-in wait blocks besides the timer block.
pub const THREAD_WAIT_BLOCKS: usize = 3;

/// Lifecycle of a thread.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ThreadState {
    Initialized = 0,
    Ready,
    Running,
    Terminated,
}

/// Mode the thread was running in before the current kernel entry.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PreviousMode {
    Kernel = 0,
    User,
}

/// The kernel thread object.
pub struct KThread {
    header: DispatcherHeader,
    state: AtomicU8,

    /// Top of the stack as handed to the first dispatch.
    initial_stack: VirtualAddress,
    /// Current kernel stack pointer while the thread is not running.
    kernel_stack: VirtualAddress,
    /// Stack extent: highest address.
    stack_base: VirtualAddress,
    /// Stack extent: lowest usable address.
    stack_limit: VirtualAddress,

    /// APC queues and pending flags.
    pub apc_state: ApcState,
    /// General-purpose wait blocks.
    pub wait_blocks: [WaitBlock; THREAD_WAIT_BLOCKS],
    /// Dedicated wait block for timed waits.
    pub timer_wait_block: WaitBlock,
    /// Built-in timer backing timed waits.
    pub timer: Timer,

    /// Suspension: the APC that parks the thread...
    pub suspend_apc: Apc,
    /// ...and the semaphore it waits on.
    pub suspend_semaphore: Semaphore,
    suspend_count: AtomicU8,

    previous_mode: PreviousMode,
    priority: AtomicU8,
    affinity: u64,

    /// Guards thread-structure mutations.
    pub thread_lock: RawSpin,
}

// SAFETY: shared state inside the thread object is atomic, lock-guarded,
// or owned by the thread itself.
unsafe impl Send for KThread {}
unsafe impl Sync for KThread {}

/// Maximum nested suspensions.
pub const MAXIMUM_SUSPEND_COUNT: u8 = 127;

fn suspend_kernel_routine(_apc: &Apc, _a1: *mut (), _a2: *mut ()) {
    // The real work happens in the normal routine, which waits on the
    // suspend semaphore on the thread's own stack.
}

fn suspend_normal_routine(_context: *mut (), _a1: *mut (), _a2: *mut ()) {
    // A scheduler would block here on the suspend semaphore; the platform
    // core stages the objects only.
}

impl KThread {
    /// Builds a thread over the given stack extent.
    ///
    /// The thread starts [`ThreadState::Initialized`] with an empty APC
    /// state, reset wait blocks, an unset built-in timer, and the suspension
    /// objects staged (count zero, semaphore unsignaled with limit 2).
    #[must_use]
    pub fn new(stack_base: VirtualAddress, stack_limit: VirtualAddress) -> Self {
        Self {
            header: DispatcherHeader::new(ObjectType::Thread, 0),
            state: AtomicU8::new(ThreadState::Initialized as u8),
            initial_stack: stack_base,
            kernel_stack: stack_base,
            stack_base,
            stack_limit,
            apc_state: ApcState::new(),
            wait_blocks: [WaitBlock::new(), WaitBlock::new(), WaitBlock::new()],
            timer_wait_block: WaitBlock::new(),
            timer: Timer::new(TimerType::Notification),
            suspend_apc: Apc::new(
                ApcMode::Kernel,
                ApcEnvironment::Original,
                suspend_kernel_routine,
                None,
                Some(suspend_normal_routine),
                core::ptr::null_mut(),
            ),
            suspend_semaphore: Semaphore::new(0, 2),
            suspend_count: AtomicU8::new(0),
            previous_mode: PreviousMode::Kernel,
            priority: AtomicU8::new(8),
            affinity: !0,
            thread_lock: RawSpin::new(),
        }
    }

    #[must_use]
    pub const fn header(&self) -> &DispatcherHeader {
        &self.header
    }

    #[must_use]
    pub fn state(&self) -> ThreadState {
        match self.state.load(Ordering::Acquire) {
            0 => ThreadState::Initialized,
            1 => ThreadState::Ready,
            2 => ThreadState::Running,
            _ => ThreadState::Terminated,
        }
    }

    /// Advances the lifecycle. Transitions only move forward; termination
    /// additionally signals the header so joiners wake.
    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
        if state == ThreadState::Terminated {
            self.header.set_signal_state(1);
            while self.header.wake_one_waiter() {}
        }
    }

    #[must_use]
    pub const fn initial_stack(&self) -> VirtualAddress {
        self.initial_stack
    }

    #[must_use]
    pub const fn stack_base(&self) -> VirtualAddress {
        self.stack_base
    }

    #[must_use]
    pub const fn stack_limit(&self) -> VirtualAddress {
        self.stack_limit
    }

    /// Saved kernel stack pointer (while not running).
    #[must_use]
    pub const fn kernel_stack(&self) -> VirtualAddress {
        self.kernel_stack
    }

    /// Updates the saved kernel stack pointer at a context switch.
    pub fn set_kernel_stack(&mut self, stack: VirtualAddress) {
        self.kernel_stack = stack;
    }

    #[must_use]
    pub const fn previous_mode(&self) -> PreviousMode {
        self.previous_mode
    }

    #[must_use]
    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: u8) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    #[must_use]
    pub const fn affinity(&self) -> u64 {
        self.affinity
    }

    /// Current suspension depth.
    #[must_use]
    pub fn suspend_count(&self) -> u8 {
        self.suspend_count.load(Ordering::Acquire)
    }

    /// Requests a suspension: bumps the count and, on the first one, queues
    /// the suspend APC at the thread.
    ///
    /// Returns the previous count.
    ///
    /// # Panics
    /// If the count would pass [`MAXIMUM_SUSPEND_COUNT`].
    pub fn suspend(&self) -> u8 {
        let previous = self.suspend_count.fetch_add(1, Ordering::AcqRel);
        assert!(previous < MAXIMUM_SUSPEND_COUNT, "suspend count overflow");
        if previous == 0 {
            // SAFETY: the APC is embedded in the thread and lives as long
            // as it does.
            unsafe {
                self.apc_state
                    .insert(&self.suspend_apc, core::ptr::null_mut(), core::ptr::null_mut());
            }
        }
        previous
    }

    /// Releases one suspension; at zero the suspend semaphore is released
    /// so the parked thread resumes.
    ///
    /// Returns the previous count (zero means the thread was not
    /// suspended).
    pub fn resume(&self) -> u8 {
        let mut current = self.suspend_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return 0;
            }
            match self.suspend_count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => {
                    if previous == 1 {
                        let _ = self.suspend_semaphore.release(1);
                    }
                    return previous;
                }
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stacked() -> KThread {
        KThread::new(
            VirtualAddress::new(0xFFFF_8000_0011_0000),
            VirtualAddress::new(0xFFFF_8000_0010_C000),
        )
    }

    #[test]
    fn lifecycle_moves_forward() {
        let thread = stacked();
        assert_eq!(thread.state(), ThreadState::Initialized);
        thread.set_state(ThreadState::Ready);
        thread.set_state(ThreadState::Running);
        assert_eq!(thread.state(), ThreadState::Running);

        thread.set_state(ThreadState::Terminated);
        assert_eq!(thread.state(), ThreadState::Terminated);
        assert_eq!(thread.header().signal_state(), 1, "joiners are signaled");
    }

    #[test]
    fn suspension_is_counted() {
        let thread = stacked();
        assert_eq!(thread.suspend(), 0);
        assert!(thread.apc_state.pending(ApcMode::Kernel), "suspend APC queued");
        assert_eq!(thread.suspend(), 1);
        assert_eq!(thread.suspend_count(), 2);

        assert_eq!(thread.resume(), 2);
        assert_eq!(thread.suspend_semaphore.count(), 0, "still suspended");
        assert_eq!(thread.resume(), 1);
        assert_eq!(thread.suspend_semaphore.count(), 1, "final resume releases");
        assert_eq!(thread.resume(), 0, "resume of a running thread is a no-op");
    }

    #[test]
    fn stack_extents() {
        let thread = stacked();
        assert_eq!(thread.initial_stack(), thread.stack_base());
        assert!(thread.stack_limit() < thread.stack_base());
    }
}
