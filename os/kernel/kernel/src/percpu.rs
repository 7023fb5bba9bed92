//! # The Processor Block
//!
//! Per-CPU anchor reachable through the GS segment: the first field is a
//! self-pointer, so `mov rax, gs:[0]` recovers the block's own virtual
//! address from any context. The block carries the processor number, the
//! current-thread pointer, the control/debug/MSR save area, the descriptor
//! tables, and the queued-spinlock slots.
//!
//! The boot processor's block is statically allocated. Application
//! processors carve theirs out of a per-CPU structures buffer whose layout
//! is fixed: boot stack, fault stack, GDT, then the block itself.

use crate::gdt::{Gdt, Tss64, boot_tss};
use crate::idt::Idt;
use crate::stacks::KERNEL_STACK_SIZE;
use core::mem::size_of;
use kernel_registers::msr::Msr;
use kernel_sync::LockQueueEntry;

/// Queued-spinlock slots per processor (one per lock level).
pub const LOCK_QUEUE_LEVELS: usize = 16;

/// Saved control state of a processor.
#[repr(C)]
pub struct ProcessorControlState {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr: [u64; 8],
    pub msr_gs_base: u64,
    pub msr_kernel_gs_base: u64,
    pub msr_star: u64,
    pub msr_lstar: u64,
    pub msr_cstar: u64,
    pub msr_fmask: u64,
    pub mxcsr: u32,
    pub gdtr_limit: u16,
    pub gdtr_base: u64,
    pub idtr_limit: u16,
    pub idtr_base: u64,
    pub ldtr: u16,
    pub tr: u16,
}

impl ProcessorControlState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dr: [0; 8],
            msr_gs_base: 0,
            msr_kernel_gs_base: 0,
            msr_star: 0,
            msr_lstar: 0,
            msr_cstar: 0,
            msr_fmask: 0,
            mxcsr: 0,
            gdtr_limit: 0,
            gdtr_base: 0,
            idtr_limit: 0,
            idtr_base: 0,
            ldtr: 0,
            tr: 0,
        }
    }

    /// Snapshots the live control registers, debug registers and MSRs.
    ///
    /// # Safety
    /// CPL0 only.
    pub unsafe fn capture(&mut self) {
        use kernel_registers::raw::read_control_register;
        // SAFETY: CPL0 per this function's contract.
        unsafe {
            self.cr0 = read_control_register(0);
            self.cr2 = read_control_register(2);
            self.cr3 = read_control_register(3);
            self.cr4 = read_control_register(4);
            for n in [0u32, 1, 2, 3, 6, 7] {
                self.dr[n as usize] = kernel_registers::dr::read_debug_register(n);
            }
            self.msr_gs_base = Msr::IA32_GS_BASE.load_raw();
            self.msr_kernel_gs_base = Msr::IA32_KERNEL_GS_BASE.load_raw();
            self.msr_star = Msr::IA32_STAR.load_raw();
            self.msr_lstar = Msr::IA32_LSTAR.load_raw();
            self.msr_cstar = Msr::IA32_CSTAR.load_raw();
            self.msr_fmask = Msr::IA32_FMASK.load_raw();
        }
    }
}

/// The per-processor control block.
///
/// Field order matters for the assembly side: the self-pointer must stay at
/// offset zero and the PRCB pointer right after it.
#[repr(C, align(64))]
pub struct ProcessorBlock {
    /// Offset 0: the block's own virtual address.
    pub self_pointer: *mut ProcessorBlock,
    /// Offset 8: the processor control region (scheduler-visible state).
    pub prcb: *mut ProcessorBlock,
    /// Logical processor number; the boot processor is zero.
    pub cpu_number: u32,
    /// The thread currently running here.
    pub current_thread: *mut kernel_dispatch::KThread,
    /// The idle thread owned by this processor.
    pub idle_thread: *mut kernel_dispatch::KThread,
    /// Control/debug/MSR save area.
    pub processor_state: ProcessorControlState,
    /// Queued-spinlock slots, one per lock level.
    pub lock_queue: [LockQueueEntry; LOCK_QUEUE_LEVELS],
    /// This processor's descriptor tables.
    pub gdt: Gdt,
    pub tss: Tss64,
    pub idt: Idt,
}

// SAFETY: a block belongs to exactly one processor; cross-processor access
// is limited to the atomic lock-queue slots.
unsafe impl Sync for ProcessorBlock {}

impl ProcessorBlock {
    #[must_use]
    pub const fn new(cpu_number: u32) -> Self {
        Self {
            self_pointer: core::ptr::null_mut(),
            prcb: core::ptr::null_mut(),
            cpu_number,
            current_thread: core::ptr::null_mut(),
            idle_thread: core::ptr::null_mut(),
            processor_state: ProcessorControlState::new(),
            lock_queue: [const { LockQueueEntry::new() }; LOCK_QUEUE_LEVELS],
            gdt: Gdt::new(),
            tss: Tss64::new(),
            idt: Idt::new(),
        }
    }
}

/// Size of the per-processor structures buffer an AP boots from:
/// boot stack, fault stack, GDT storage, and the block itself, page-aligned.
pub const KPROCESSOR_STRUCTURES_SIZE: usize =
    (2 * KERNEL_STACK_SIZE + size_of::<u64>() * crate::gdt::GDT_ENTRIES
        + size_of::<ProcessorBlock>() + 0xFFF)
        & !0xFFF;

/// Offsets of the pieces inside a per-processor structures buffer.
#[must_use]
pub const fn processor_structures_layout() -> (usize, usize, usize, usize) {
    let boot_stack = 0;
    let fault_stack = boot_stack + KERNEL_STACK_SIZE;
    let gdt = fault_stack + KERNEL_STACK_SIZE;
    let block = gdt + size_of::<u64>() * crate::gdt::GDT_ENTRIES;
    (boot_stack, fault_stack, gdt, block)
}

/// The boot processor's statically allocated block.
static mut BOOT_PROCESSOR_BLOCK: ProcessorBlock = ProcessorBlock::new(0);

/// Anchors the boot processor: self-pointer, descriptor tables, GS base.
///
/// # Safety
/// Once, on the boot processor, with interrupts off.
pub unsafe fn initialize_boot_processor() {
    // SAFETY: single-processor bring-up; the static is unshared here.
    let block = &raw mut BOOT_PROCESSOR_BLOCK;
    unsafe {
        (*block).self_pointer = block;
        (*block).prcb = block;
        (*block).tss = boot_tss();

        let tss = &raw const (*block).tss;
        (*block).gdt.set_tss(tss);
        (*block).processor_state.capture();

        // Descriptor tables live in the block; load them from there.
        (&*block).gdt.load();

        // GS points at the block from here on.
        Msr::IA32_GS_BASE.store_raw(block as u64);
        Msr::IA32_KERNEL_GS_BASE.store_raw(0);
    }
}

/// The current processor's block, recovered through GS.
///
/// # Safety
/// GS must already be anchored by [`initialize_boot_processor`] (or the AP
/// equivalent).
#[must_use]
pub unsafe fn current() -> &'static mut ProcessorBlock {
    let block: *mut ProcessorBlock;
    // SAFETY: offset 0 of the block is the self-pointer.
    unsafe {
        core::arch::asm!(
            "mov {}, gs:[0]",
            out(reg) block,
            options(nostack, preserves_flags, readonly)
        );
        &mut *block
    }
}

/// Reads a `u64` field of the current processor block by offset.
///
/// # Safety
/// `OFFSET` must be the byte offset of a `u64` field within
/// [`ProcessorBlock`], and GS must be anchored.
#[must_use]
pub unsafe fn cpu_local_read<const OFFSET: usize>() -> u64 {
    let value: u64;
    // SAFETY: per the function contract.
    unsafe {
        core::arch::asm!(
            "mov {}, gs:[{offset}]",
            out(reg) value,
            offset = const OFFSET,
            options(nostack, preserves_flags, readonly)
        );
    }
    value
}

/// Logical number of the current processor.
#[must_use]
pub fn cpu_number() -> u32 {
    // Before GS is anchored only the boot processor runs.
    let gs = unsafe { Msr::IA32_GS_BASE.load_raw() };
    if gs == 0 {
        return 0;
    }
    // SAFETY: GS anchored means a valid block.
    unsafe { current().cpu_number }
}

/// The boot processor's IDT storage (the trap dispatcher fills it).
///
/// # Safety
/// Single-processor bring-up only.
#[must_use]
pub unsafe fn boot_idt() -> *mut Idt {
    // SAFETY: per the function contract.
    unsafe { &raw mut (*(&raw mut BOOT_PROCESSOR_BLOCK)).idt }
}
