//! # Kernel Panic
//!
//! The end of the line: a best-effort diagnostic on whatever debug sink is
//! still alive, then interrupts off and halt forever. Panic codes identify
//! the checkpoint that gave up.

use crate::bootinfo;
use kernel_hal::debug_print;

/// Panic checkpoint codes.
pub mod codes {
    /// Not enough physical memory to boot.
    pub const INSUFFICIENT_MEMORY: u32 = 0x0000_0001;
    /// The hand-off block is unusable.
    pub const BAD_INITIALIZATION_BLOCK: u32 = 0x0000_0002;
    /// The hardware pool could not satisfy a bring-up allocation.
    pub const HARDWARE_POOL_EXHAUSTED: u32 = 0x0000_0003;
}

/// Halts the system after a best-effort diagnostic.
pub fn panic(code: u32) -> ! {
    debug_print!("\n*** KERNEL PANIC: checkpoint {:#010x} ***\n", code);
    bootinfo::loader_debug_print("*** KERNEL PANIC ***\n");
    halt_forever()
}

/// Interrupts off, halt, forever.
pub fn halt_forever() -> ! {
    loop {
        // SAFETY: taking the CPU down is the whole point.
        unsafe { kernel_ports::clear_interrupt_flag() };
        kernel_ports::halt();
    }
}

/// Rust panics funnel into the same halt path.
#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo<'_>) -> ! {
    debug_print!("\n*** KERNEL PANIC: {} ***\n", info);
    bootinfo::loader_debug_print("*** KERNEL PANIC (rust) ***\n");
    halt_forever()
}
