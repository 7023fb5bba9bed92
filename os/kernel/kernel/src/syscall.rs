//! # SYSCALL Fast Path
//!
//! Long mode enters the kernel through `syscall` using four MSRs: STAR
//! carries the segment selectors, LSTAR the 64-bit entry point, CSTAR the
//! compatibility-mode entry point, and FMASK the RFLAGS bits cleared on
//! entry. Programmed once per processor.
//!
//! The entries themselves are stubs at this layer: system services live
//! above the platform core, so both paths report and halt.

use crate::gdt;
use crate::panic;
use kernel_hal::debug_print;
use kernel_registers::msr::Msr;

/// RFLAGS bits cleared on syscall entry: IF, TF and DF.
const FMASK: u64 = (1 << 9) | (1 << 8) | (1 << 10);

/// Programs STAR/LSTAR/CSTAR/FMASK for this processor.
///
/// # Safety
/// Once per processor, at CPL0, after the GDT is live (STAR encodes its
/// selectors).
pub unsafe fn initialize() {
    // STAR: kernel CS/SS base in bits 32–47, sysret user base in 48–63.
    let star =
        (u64::from(gdt::KERNEL_CS) << 32) | ((u64::from(gdt::USER_CS) - 16) << 48);
    // SAFETY: CPL0 per this function's contract.
    unsafe {
        Msr::IA32_STAR.store_raw(star);
        Msr::IA32_LSTAR.store_raw(handle_system_call_64 as usize as u64);
        Msr::IA32_CSTAR.store_raw(handle_system_call_32 as usize as u64);
        Msr::IA32_FMASK.store_raw(FMASK);
    }
}

/// 64-bit `syscall` entry.
extern "C" fn handle_system_call_64() {
    debug_print!("SYSCALL (64-bit) before system services exist\n");
    panic::halt_forever();
}

/// Compatibility-mode `syscall` entry.
extern "C" fn handle_system_call_32() {
    debug_print!("SYSCALL (32-bit) before system services exist\n");
    panic::halt_forever();
}
