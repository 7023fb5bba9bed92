//! # Thread Initialization
//!
//! The platform core ends where scheduling begins: it builds the boot
//! processor's idle thread over the boot stack and records it in the
//! processor block. A scheduler adopting the machine later finds a fully
//! formed thread object as the current thread.

use crate::{percpu, stacks};
use kernel_dispatch::{KThread, ThreadState};
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SyncOnceCell;

/// The boot processor's idle thread.
static IDLE_THREAD: SyncOnceCell<KThread> = SyncOnceCell::new();

/// Builds the idle thread over the boot stack and wires it into the
/// processor block as the current (and idle) thread.
pub fn initialize_idle_thread() {
    let idle = IDLE_THREAD.get_or_init(|| {
        let base = VirtualAddress::new(stacks::stack_top(&raw const stacks::BOOT_STACK));
        let limit = VirtualAddress::new(&raw const stacks::BOOT_STACK as u64);
        let thread = KThread::new(base, limit);
        thread.set_state(ThreadState::Running);
        thread
    });

    // SAFETY: GS is anchored; bring-up is single-threaded.
    let block = unsafe { percpu::current() };
    let idle = core::ptr::from_ref(idle).cast_mut();
    block.idle_thread = idle;
    block.current_thread = idle;
}
