//! # Trap Dispatcher
//!
//! All 256 interrupt vectors funnel through tiny assembly stubs into one
//! dispatcher. A stub pushes a dummy error code when the processor did not
//! push one, pushes its vector number, and jumps to the common entry, which
//! captures the machine register state into a [`KTrapFrame`] and calls the
//! per-vector handler. Returning from the handler resumes execution from
//! the (possibly modified) frame.
//!
//! Every vector starts out with the diagnostic handler, which reports the
//! frame and halts; individual vectors are upgraded in place through
//! [`set_interrupt_handler`] (the interrupt-controller bring-up does this
//! for the spurious vectors).

use crate::{bootinfo, idt::IdtEntry, panic, percpu};
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_hal::debug_print;

/// Vectors the processor pushes an error code for.
const ERROR_CODE_VECTORS: u32 = (1 << 8)
    | (1 << 10)
    | (1 << 11)
    | (1 << 12)
    | (1 << 13)
    | (1 << 14)
    | (1 << 17)
    | (1 << 21)
    | (1 << 29)
    | (1 << 30);

// The 256 vector stubs and their address table. Each stub normalizes the
// stack to {error code, vector} and joins the common path.
core::arch::global_asm!(
    r#"
    .altmacro

    .macro trap_stub vector
        .align 16
        trap_stub_\vector:
        .if ((\vector == 8) || (\vector == 10) || (\vector == 11) || (\vector == 12) || (\vector == 13) || (\vector == 14) || (\vector == 17) || (\vector == 21) || (\vector == 29) || (\vector == 30))
        .else
            push 0
        .endif
            push \vector
            jmp trap_common
    .endm

    .macro trap_stub_entry vector
        .quad trap_stub_\vector
    .endm

    .text
    .set vector_index, 0
    .rept 256
        trap_stub %vector_index
        .set vector_index, vector_index + 1
    .endr

    .align 16
    trap_common:
        // General-purpose registers, matching KTrapFrame's layout.
        push rax
        push rcx
        push rdx
        push rbx
        push rbp
        push rsi
        push rdi
        push r8
        push r9
        push r10
        push r11
        push r12
        push r13
        push r14
        push r15
        // Segment selectors.
        xor eax, eax
        mov ax, ds
        push rax
        mov ax, es
        push rax
        mov ax, fs
        push rax
        mov ax, gs
        push rax
        // Dispatch with the frame as the single argument.
        mov rdi, rsp
        cld
        call trap_dispatch
        // Unwind: segments are selector snapshots, nothing to restore.
        add rsp, 32
        pop r15
        pop r14
        pop r13
        pop r12
        pop r11
        pop r10
        pop r9
        pop r8
        pop rdi
        pop rsi
        pop rbp
        pop rbx
        pop rdx
        pop rcx
        pop rax
        // Drop vector and error code.
        add rsp, 16
        iretq

    .section .rodata
    .global TRAP_STUB_TABLE
    .balign 8
    TRAP_STUB_TABLE:
    .set vector_index, 0
    .rept 256
        trap_stub_entry %vector_index
        .set vector_index, vector_index + 1
    .endr
    .text
"#
);

unsafe extern "C" {
    /// Addresses of the 256 vector stubs, in vector order.
    static TRAP_STUB_TABLE: [u64; 256];
}

/// The machine state captured at trap entry.
///
/// Layout mirrors the push sequence in `trap_common`; the tail is the
/// hardware interrupt frame.
#[repr(C)]
#[derive(Debug)]
pub struct KTrapFrame {
    pub gs: u64,
    pub fs: u64,
    pub es: u64,
    pub ds: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    /// Vector number the stub pushed.
    pub vector: u64,
    /// Hardware error code, or the stub's zero.
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// A per-vector handler; returning resumes from the frame.
pub type TrapHandler = fn(&mut KTrapFrame);

/// The dispatch table. Entries hold the handler as a function address; zero
/// means the diagnostic default.
static HANDLERS: [AtomicUsize; 256] = [const { AtomicUsize::new(0) }; 256];

/// Replaces the handler for `vector`.
pub fn set_interrupt_handler(vector: u8, handler: TrapHandler) {
    HANDLERS[usize::from(vector)].store(handler as usize, Ordering::Release);
}

/// The common dispatcher every stub lands in.
#[unsafe(no_mangle)]
extern "C" fn trap_dispatch(frame: &mut KTrapFrame) {
    let handler = HANDLERS[frame.vector as usize].load(Ordering::Acquire);
    if handler == 0 {
        default_handler(frame);
        return;
    }
    // SAFETY: only TrapHandler addresses enter the table.
    let handler: TrapHandler = unsafe { core::mem::transmute::<usize, TrapHandler>(handler) };
    handler(frame);
}

/// Architectural exception mnemonics for the low vectors.
const EXCEPTION_NAMES: [&str; 20] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 floating point",
    "alignment check",
    "machine check",
    "SIMD floating point",
];

fn vector_name(vector: u64) -> &'static str {
    match vector {
        0..20 => EXCEPTION_NAMES[vector as usize],
        0x2C => "assertion",
        0x2D => "debug service",
        0x1F | 0x37 | 0x3F => "spurious",
        0xE1 => "IPI",
        0xFF => "NMI (APIC)",
        _ => "unexpected interrupt",
    }
}

/// Reports an unhandled trap on whatever sink is live, then halts.
fn default_handler(frame: &mut KTrapFrame) {
    debug_print!(
        "Trap {:#04x} ({}): error={:#x} rip={:#018x} cs={:#x} rflags={:#x} rsp={:#018x}\n",
        frame.vector,
        vector_name(frame.vector),
        frame.error_code,
        frame.rip,
        frame.cs,
        frame.rflags,
        frame.rsp
    );
    if frame.vector == 0x0E {
        // Page faults additionally carry the faulting address in CR2.
        // SAFETY: CPL0 in a trap handler.
        let cr2 = unsafe { kernel_registers::raw::read_control_register(2) };
        debug_print!("  faulting address (CR2) = {:#018x}\n", cr2);
    }
    bootinfo::loader_debug_print("Unhandled trap, halting\n");
    panic::halt_forever();
}

/// Spurious interrupts simply resume.
pub fn handle_spurious(_frame: &mut KTrapFrame) {}

/// Populates the boot processor's IDT with the vector stubs and loads it.
///
/// NMIs and double faults run on the dedicated fault stack through IST1.
///
/// # Safety
/// Once, on the boot processor, after the processor block (and its GDT/TSS)
/// is live.
pub unsafe fn initialize() {
    // SAFETY: single-processor bring-up per this function's contract.
    unsafe {
        let idt = percpu::boot_idt();
        for vector in 0..=255u8 {
            let ist = match vector {
                2 | 8 => crate::gdt::FAULT_IST_INDEX as u8,
                _ => 0,
            };
            (*idt).set_gate(
                vector,
                IdtEntry::interrupt_gate(TRAP_STUB_TABLE[usize::from(vector)], ist),
            );
        }
        (&*idt.cast_const()).load();
    }
}
