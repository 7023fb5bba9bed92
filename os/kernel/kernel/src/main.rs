//! # Kernel Entry and Bring-Up
//!
//! The loader jumps here with a pointer to the initialization block after
//! `ExitBootServices`. Bring-up is strictly single-processor: switch to the
//! kernel's own boot stack, anchor the processor block, install descriptor
//! tables and the trap dispatcher, account physical memory, program the
//! interrupt controllers, publish the debug sinks, and finally drop to
//! passive level and idle.

#![no_std]
#![no_main]
#![allow(unsafe_code)]

mod bootinfo;
mod gdt;
mod idt;
mod mm;
mod panic;
mod percpu;
mod stacks;
mod syscall;
mod sysres;
mod thread;
mod traps;

use kernel_hal::apic::{ApicMode, HardwareApic};
use kernel_hal::runlevel::{self, RunLevel};
use kernel_hal::{dbgout, pic};
use kernel_info::boot::KernelInitBlock;
use kernel_ports::HardwarePorts;
use kernel_sync::SyncOnceCell;
use log::LevelFilter;

/// The boot processor's APIC handle, fixed once bring-up selects the mode.
static BOOT_APIC: SyncOnceCell<kernel_sync::SpinMutex<HardwareApic>> = SyncOnceCell::new();

/// The global logger over the debug sink dispatcher.
static LOGGER: dbgout::DebugLogger = dbgout::DebugLogger::new(LevelFilter::Debug);

/// The kernel entry point.
///
/// The loader's hand-off trampoline arrives with the initialization-block
/// pointer in `RDI` (System V). Interrupts are off; the stack is whatever
/// the loader left. Switch to the kernel's own boot stack, then continue in
/// Rust.
#[unsafe(no_mangle)]
#[unsafe(naked)]
pub extern "C" fn _start_kernel(_init_block: *const KernelInitBlock) -> ! {
    core::arch::naked_asm!(
        "cli",
        // Keep the block pointer across the stack switch.
        "mov r12, rdi",
        // Top of the statically allocated boot stack, ABI-aligned.
        "lea rax, [rip + {boot_stack}]",
        "add rax, {boot_stack_size}",
        "and rax, -16",
        "mov rsp, rax",
        "xor rbp, rbp",
        "mov rdi, r12",
        // Emulate a call so RSP % 16 == 8 at entry.
        "push 0",
        "jmp {start}",
        boot_stack = sym stacks::BOOT_STACK,
        boot_stack_size = const stacks::KERNEL_STACK_SIZE,
        start = sym start_kernel,
    );
}

/// Rust-side bring-up, running on the kernel boot stack.
#[unsafe(no_mangle)]
extern "C" fn start_kernel(init_block: *const KernelInitBlock) -> ! {
    // The block is loader-owned and immutable from here on.
    // SAFETY: the loader passes a mapped, fully constructed block.
    unsafe { bootinfo::set_init_block(init_block) };
    bootinfo::loader_debug_print("Kernel: architecture bring-up\n");

    // Descriptor tables and the trap dispatcher come first; everything
    // after this can fault diagnostically instead of triple-faulting.
    // SAFETY: single-processor bring-up, interrupts off.
    unsafe {
        percpu::initialize_boot_processor();
        traps::initialize();
        syscall::initialize();
    }

    // Physical page accounting and the hardware pool.
    // SAFETY: the hand-off lists are well-formed and exclusively ours now.
    unsafe { mm::initialize() };

    // Interrupt controllers: legacy PIC masked behind the local APIC.
    let want_x2apic = pic::check_x2apic_support();
    // SAFETY: CPL0, once per processor.
    let mode = unsafe { pic::enable_apic(percpu::cpu_number(), want_x2apic) };
    let apic = BOOT_APIC.get_or_init(|| {
        // SAFETY: compat mode relies on the APIC page mapping established
        // by the loader's hardware window.
        kernel_sync::SpinMutex::new(unsafe { HardwareApic::new(mode) })
    });
    {
        let mut apic = apic.lock();
        pic::initialize_apic(&mut *apic, percpu::cpu_number(), |vector, _| {
            traps::set_interrupt_handler(vector, traps::handle_spurious);
        });
        pic::initialize_legacy_pic(&mut HardwarePorts);
        log::debug!(
            "APIC initialized in {} mode",
            if mode == ApicMode::X2Apic { "x2APIC" } else { "xAPIC" }
        );
    }

    // Adopt the loader's system resources, then bring up the debug sinks
    // they describe.
    // SAFETY: resource nodes are loader-owned and stay mapped.
    unsafe { sysres::initialize_system_resources() };
    dbgout_initialize();

    // The idle thread adopts the boot stack.
    thread::initialize_idle_thread();

    log::info!("Kernel: bring-up complete, entering idle");

    // Everything is in place: open up and idle.
    {
        let mut apic = apic.lock();
        runlevel::lower_run_level(&mut *apic, RunLevel::Passive);
    }
    // SAFETY: IDT and controllers are fully initialized.
    unsafe { kernel_ports::set_interrupt_flag() };

    loop {
        kernel_ports::halt();
    }
}

/// Brings up the debug sinks selected by the `DEBUG=` kernel parameter and
/// routes the `log` facade through them.
fn dbgout_initialize() {
    let Some(command_line) = bootinfo::kernel_parameters() else {
        return;
    };

    if let Ok(value) = kernel_info::widestr::parameter_value(command_line, "DEBUG") {
        let (selectors, count) = dbgout::parse_debug_selectors(value);
        for selector in selectors.iter().take(count).flatten() {
            match *selector {
                dbgout::SinkSelector::Com {
                    number,
                    address,
                    baud,
                } => {
                    let address = if number == 0 {
                        Some(address)
                    } else {
                        dbgout::com_port_address(number)
                    };
                    if let Some(address) = address {
                        sysres::register_serial_sink(address, baud);
                    }
                }
                dbgout::SinkSelector::Screen => sysres::register_framebuffer_sink(),
            }
        }
    }

    // Errors only mean a logger is already installed, which is fine.
    let _ = LOGGER.install();
}
