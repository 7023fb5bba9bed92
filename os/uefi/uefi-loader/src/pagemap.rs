//! # Address-Space Construction and the Hand-Off Jump
//!
//! The boot protocol decides what the kernel's address space contains; this
//! module turns the decision into page tables and performs the switch.
//!
//! Construction follows a strict order: build the page map (root, self-map,
//! then every mapping record), keep the loader image, the loaded modules
//! and the trampoline identity-mapped so execution survives the CR3 load,
//! exit boot services, write CR3, and jump.
//!
//! Five-level paging cannot be entered from four-level long mode directly:
//! CR4.LA57 only changes with paging disabled. For that path a small
//! trampoline is staged at a fixed low physical address; it drops to
//! protected mode, flips LA57, loads the new root and re-enters long mode
//! straight into the kernel.

use crate::loader;
use crate::memory::{BootServicesFrameAlloc, IdentityMapper, MappingList};
use crate::protocol::module_list;
use kernel_info::memory::MemoryKind;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, size_to_pages};
use kernel_ports::{CPUID_FEATURES_ECX_LA57, CpuidLeaf, CpuidRegisters, cpuid};
use kernel_vmem::info::{PML4_INFO, PML5_INFO};
use kernel_vmem::{PageMap, PageMapLevel};
use log::{debug, info};
use uefi::Status;

/// Physical home of the mode-switch trampoline.
pub const TRAMPOLINE_ADDRESS: u64 = 0x10_0000;

/// Fixed layout inside the trampoline page (absolute addresses baked into
/// the trampoline code).
const TRAMPOLINE_PARAMS: u64 = TRAMPOLINE_ADDRESS + 0xF00;
const PARAM_CR3: u64 = TRAMPOLINE_PARAMS;
const PARAM_ENTRY: u64 = TRAMPOLINE_PARAMS + 8;
const PARAM_INIT_BLOCK: u64 = TRAMPOLINE_PARAMS + 16;
const PARAM_STACK: u64 = TRAMPOLINE_PARAMS + 24;
const PARAM_FAR_POINTER: u64 = TRAMPOLINE_PARAMS + 0x30;
const TRAMPOLINE_GDT: u64 = TRAMPOLINE_PARAMS + 0x40;
const TRAMPOLINE_GDTR: u64 = TRAMPOLINE_PARAMS + 0x60;

// The trampoline: self-contained, absolute-addressed, copied to its fixed
// home before use. Entered in 64-bit mode with paging still on the old
// root.
core::arch::global_asm!(
    r#"
    .global la57_trampoline_start
    .global la57_trampoline_long
    .global la57_trampoline_end
    .align 16
la57_trampoline_start:
    cli
    // The blob's own descriptor tables, prepared by the staging code.
    lgdt [{gdtr}]
    // Drop into the blob's 32-bit code segment.
    push 0x18
    lea rax, [rip + 2f]
    push rax
    retfq
2:
    .code32
    // Paging off: this leaves long mode (EFER.LMA clears with CR0.PG).
    mov eax, cr0
    and eax, 0x7FFFFFFF
    mov cr0, eax
    // 57-bit linear addressing on top of PAE.
    mov eax, cr4
    or eax, (1 << 12) | (1 << 5)
    mov cr4, eax
    // The five-level root (staged below 4 GiB).
    mov eax, [{param_cr3}]
    mov cr3, eax
    // Paging back on: long mode resumes, now five levels deep.
    mov eax, cr0
    or eax, 0x80000000
    mov cr0, eax
    // Far jump into the blob's 64-bit code segment through the staged
    // far pointer.
    jmp fword ptr [{param_far}]
    .code64
la57_trampoline_long:
    // Kernel ABI: the initialization block pointer rides in RDI.
    mov rdi, [{param_init_block}]
    mov rsp, [{param_stack}]
    mov rax, [{param_entry}]
    push 0
    jmp rax
la57_trampoline_end:
"#,
    gdtr = const TRAMPOLINE_GDTR,
    param_cr3 = const PARAM_CR3,
    param_far = const PARAM_FAR_POINTER,
    param_init_block = const PARAM_INIT_BLOCK,
    param_stack = const PARAM_STACK,
    param_entry = const PARAM_ENTRY,
);

unsafe extern "C" {
    static la57_trampoline_start: u8;
    static la57_trampoline_long: u8;
    static la57_trampoline_end: u8;
}

/// Chooses the paging depth: five levels when the processor supports LA57
/// and the `NOXPA` kernel parameter does not veto it.
#[must_use]
pub fn determine_paging_level(kernel_parameters: &str) -> PageMapLevel {
    let mut registers = CpuidRegisters::for_leaf(CpuidLeaf::VendorString);
    cpuid(&mut registers);
    if registers.eax >= CpuidLeaf::ExtendedFeatures as u32 {
        let mut registers = CpuidRegisters::for_leaf(CpuidLeaf::ExtendedFeatures);
        cpuid(&mut registers);
        let vetoed = kernel_parameters
            .split_whitespace()
            .any(|token| token.eq_ignore_ascii_case("NOXPA"));
        if registers.ecx & CPUID_FEATURES_ECX_LA57 != 0 && !vetoed {
            return PageMapLevel::Pml5;
        }
    }
    PageMapLevel::Pml4
}

/// The self-map window base for a paging depth.
#[must_use]
pub const fn self_map_base(level: PageMapLevel) -> u64 {
    match level {
        PageMapLevel::Pml5 => PML5_INFO.p5e_base,
        _ => PML4_INFO.pxe_base,
    }
}

/// Builds the kernel page map from the accumulated mapping records.
///
/// The loader image, every loaded module and the trampoline page are
/// identity-mapped first so execution continues across the CR3 switch;
/// then the record list is materialized.
///
/// # Errors
/// [`Status::OUT_OF_RESOURCES`] when page-table frames run out.
pub fn build_page_map(
    level: PageMapLevel,
    mappings: &mut MappingList,
) -> Result<PageMap, Status> {
    let mut alloc = BootServicesFrameAlloc;
    let mapper = IdentityMapper;

    let map = PageMap::build(&mut alloc, &mapper, level, self_map_base(level))
        .map_err(|_| Status::OUT_OF_RESOURCES)?;

    // The trampoline page stays reachable at its identity address.
    mappings.map_virtual_memory(
        VirtualAddress::new(TRAMPOLINE_ADDRESS),
        PhysicalAddress::new(TRAMPOLINE_ADDRESS),
        1,
        MemoryKind::FirmwareTemporary,
    );

    // So does every loaded module.
    for module in module_list() {
        mappings.map_virtual_memory(
            VirtualAddress::new(module.base as u64),
            PhysicalAddress::new(module.base as u64),
            size_to_pages(module.size as u64),
            MemoryKind::FirmwareTemporary,
        );
    }

    // And the loader itself.
    let (loader_base, loader_size) = loader::loader_image_information();
    if loader_base == 0 || loader_size == 0 {
        return Err(Status::PROTOCOL_ERROR);
    }
    mappings.map_virtual_memory(
        VirtualAddress::new(loader_base as u64),
        PhysicalAddress::new(loader_base as u64),
        size_to_pages(loader_size),
        MemoryKind::FirmwareTemporary,
    );

    debug!("Mapping and dumping boot-time memory:");
    map.map_records(&mut alloc, &mapper, mappings.records())
        .map_err(|_| Status::OUT_OF_RESOURCES)?;

    info!(
        "Page map built: {:?}, root {}",
        map.level(),
        map.root()
    );
    Ok(map)
}

/// Stages the LA57 trampoline at its fixed physical home.
///
/// # Errors
/// [`Status::OUT_OF_RESOURCES`] when the page at the fixed address is not
/// available.
pub fn stage_trampoline() -> Result<(), Status> {
    let page = crate::memory::allocate_pages_at(TRAMPOLINE_ADDRESS, 1)
        .ok_or(Status::OUT_OF_RESOURCES)?;

    let start = &raw const la57_trampoline_start;
    let end = &raw const la57_trampoline_end;
    let size = end as usize - start as usize;
    assert!(size as u64 <= PAGE_SIZE - 0x100, "trampoline outgrew its page");

    let long_entry_offset =
        &raw const la57_trampoline_long as usize - start as usize;

    // SAFETY: the page was just allocated at the fixed address.
    unsafe {
        core::ptr::copy_nonoverlapping(start, page.as_u64() as *mut u8, size);

        // Far pointer for the compat -> 64-bit jump: offset, then selector.
        #[allow(clippy::cast_possible_truncation)]
        (PARAM_FAR_POINTER as *mut u32)
            .write((TRAMPOLINE_ADDRESS as u32) + long_entry_offset as u32);
        ((PARAM_FAR_POINTER + 4) as *mut u16).write(0x08);

        // The blob's descriptor table: null, 64-bit code, data, 32-bit code.
        let gdt = TRAMPOLINE_GDT as *mut u64;
        gdt.write(0);
        gdt.add(1).write(0x00AF_9B00_0000_FFFF); // 0x08: 64-bit code
        gdt.add(2).write(0x00CF_9300_0000_FFFF); // 0x10: data
        gdt.add(3).write(0x00CF_9B00_0000_FFFF); // 0x18: 32-bit code

        // GDTR: limit then base.
        (TRAMPOLINE_GDTR as *mut u16).write(4 * 8 - 1);
        ((TRAMPOLINE_GDTR + 2) as *mut u64).write(TRAMPOLINE_GDT);
    }

    info!("LA57 trampoline staged at {TRAMPOLINE_ADDRESS:#x} ({size} bytes)");
    Ok(())
}

/// Performs the hand-off for four-level paging: write CR3, jump.
///
/// # Safety
/// Boot services must already be exited; the page map must identity-map
/// this code and map the kernel, stack and block at the given addresses.
pub unsafe fn enter_kernel_pml4(
    root: PhysicalAddress,
    entry: VirtualAddress,
    init_block: VirtualAddress,
    stack_top: VirtualAddress,
) -> ! {
    // SAFETY: per this function's contract.
    unsafe {
        core::arch::asm!(
            "cli",
            "mov cr3, {root}",
            "mov rsp, {stack}",
            "mov rdi, {block}",
            "push 0",
            "jmp {entry}",
            root = in(reg) root.as_u64(),
            stack = in(reg) stack_top.as_u64(),
            block = in(reg) init_block.as_u64(),
            entry = in(reg) entry.as_u64(),
            options(noreturn)
        )
    }
}

/// Performs the hand-off for five-level paging through the staged
/// trampoline.
///
/// # Safety
/// [`stage_trampoline`] must have run, boot services must be exited, and
/// the five-level root must sit below 4 GiB.
pub unsafe fn enter_kernel_pml5(
    root: PhysicalAddress,
    entry: VirtualAddress,
    init_block: VirtualAddress,
    stack_top: VirtualAddress,
) -> ! {
    assert!(root.as_u64() < u64::from(u32::MAX), "five-level root above 4 GiB");

    // SAFETY: staged page per this function's contract.
    unsafe {
        (PARAM_CR3 as *mut u64).write(root.as_u64());
        (PARAM_ENTRY as *mut u64).write(entry.as_u64());
        (PARAM_INIT_BLOCK as *mut u64).write(init_block.as_u64());
        (PARAM_STACK as *mut u64).write(stack_top.as_u64());

        let trampoline: extern "C" fn() -> ! =
            core::mem::transmute(TRAMPOLINE_ADDRESS as usize);
        trampoline()
    }
}
