//! # TLB Maintenance
//!
//! A full flush must also drop *global* translations, which a plain CR3
//! reload leaves in place. When the processor supports global pages the
//! flush therefore toggles CR4.PGE — an architectural full-TLB invalidation —
//! and restores the original value. Interrupts are masked across the toggle
//! so no handler observes the window where global pages are disabled.

use crate::cpuid::{CPUID_FEATURES_EDX_PGE, CpuidLeaf, CpuidRegisters, cpuid};
use crate::{clear_interrupt_flag, interrupts_enabled, set_interrupt_flag};
use kernel_registers::cr3::Cr3;
use kernel_registers::cr4::Cr4;
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

/// Flushes the entire TLB, including global entries where possible.
///
/// # Safety
/// CPL0 only. Briefly disables interrupts.
pub unsafe fn flush_tlb() {
    // Mask interrupts across the CR4 toggle and restore the previous state.
    let enabled = interrupts_enabled();
    unsafe {
        clear_interrupt_flag();
    }

    let mut registers = CpuidRegisters::for_leaf(CpuidLeaf::StandardFeatures);
    cpuid(&mut registers);

    unsafe {
        if registers.edx & CPUID_FEATURES_EDX_PGE != 0 {
            // Toggling CR4.PGE invalidates all translations, global included.
            let cr4 = Cr4::load_unsafe();
            cr4.with_pge(false).store_unsafe();
            cr4.store_unsafe();
        } else {
            // No global pages: a CR3 reload flushes everything there is.
            Cr3::load_unsafe().store_unsafe();
        }

        if enabled {
            set_interrupt_flag();
        }
    }
}

/// Invalidates the translation for a single virtual address (`invlpg`).
///
/// # Safety
/// CPL0 only.
#[inline]
pub unsafe fn invalidate_tlb_entry(address: u64) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) address, options(nostack, preserves_flags));
    }
}
