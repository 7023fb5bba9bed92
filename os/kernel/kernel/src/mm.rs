//! # Memory-Manager Bring-Up
//!
//! The architecture-dependent slice of memory management: scan the hand-off
//! descriptors, verify the machine has enough pages at all, bind the paging
//! regime the loader built, place the PFN database through the hardware
//! pool, and thread every free page onto the PFN lists.

use crate::{bootinfo, panic, percpu};
use core::mem::size_of;
use kernel_alloc::pfn::{MmPfn, PfnDatabase, PfnListId};
use kernel_alloc::{HardwarePool, scan};
use kernel_info::containing_record;
use kernel_info::list::ListEntry;
use kernel_info::memory::{MemoryDescriptor, MemoryKind};
use kernel_memory_addresses::{PAGE_SHIFT, PageFrameNumber, VirtualAddress, size_to_pages};
use kernel_sync::SyncOnceCell;
use kernel_vmem::HwPte;
use kernel_vmem::regime::Paging;

/// The active paging regime, bound once at bring-up.
static PAGING: SyncOnceCell<Paging> = SyncOnceCell::new();

/// Number of pages the hardware window can map.
const HARDWARE_WINDOW_PAGES: u64 =
    (u64::MAX - kernel_alloc::hardware::HARDWARE_VA_START + 1) >> PAGE_SHIFT;

/// The bound paging regime.
pub fn paging() -> &'static Paging {
    PAGING.get_or_init(|| Paging::from_level(bootinfo::page_map_level()))
}

/// Brings up physical page accounting.
///
/// # Safety
/// Once, during single-processor bring-up, with the hand-off lists mapped
/// and exclusively owned.
pub unsafe fn initialize() {
    let regime = paging();

    // SAFETY: hand-off list ownership per this function's contract.
    let layout = unsafe { scan::scan_descriptors(bootinfo::get_memory_descriptors()) }
        .unwrap_or_else(|_| panic::panic(panic::codes::BAD_INITIALIZATION_BLOCK));

    if !layout.has_minimum_memory() {
        bootinfo::loader_debug_print("Insufficient physical pages! Install additional memory\n");
        panic::panic(panic::codes::INSUFFICIENT_MEMORY);
    }

    log::debug!(
        "Physical memory: {} pages, frames {:#x}..{:#x}, XPA {}",
        layout.number_of_physical_pages,
        layout.lowest_physical_page,
        layout.highest_physical_page,
        regime.xpa_status()
    );

    // The hardware window's PTE run is reachable through the self-map.
    let window_base = VirtualAddress::new(kernel_alloc::hardware::HARDWARE_VA_START);
    let window_ptes = regime.info().pte_address(window_base).as_mut_ptr::<HwPte>();
    // SAFETY: the loader established the self-map; the window PTE run is
    // mapped page-table memory.
    let mut pool = unsafe { HardwarePool::new(window_ptes, HARDWARE_WINDOW_PAGES) };

    // Place the PFN database: one record per page between lowest and
    // highest, physically carved from the free descriptors and mapped
    // through the hardware window.
    let represented = layout.highest_physical_page - layout.lowest_physical_page + 1;
    let database_bytes = represented * size_of::<MmPfn>() as u64;
    let database_pages = size_to_pages(database_bytes);

    // SAFETY: descriptor-list ownership per this function's contract.
    let database_physical = unsafe {
        pool.allocate_hardware_memory(bootinfo::get_memory_descriptors(), database_pages, false)
    }
    .unwrap_or_else(|_| panic::panic(panic::codes::HARDWARE_POOL_EXHAUSTED));

    let database_virtual = pool
        .map_hardware_memory(database_physical, database_pages, true)
        .unwrap_or_else(|_| panic::panic(panic::codes::HARDWARE_POOL_EXHAUSTED));

    // SAFETY: freshly mapped, correctly sized, exclusively ours.
    let records = unsafe {
        core::slice::from_raw_parts_mut(
            database_virtual.as_mut_ptr::<MmPfn>(),
            represented as usize,
        )
    };
    let mut database = PfnDatabase::new(records, layout.lowest_physical_page);

    // Thread every descriptor's pages onto the canonical lists.
    // SAFETY: list ownership per this function's contract.
    unsafe {
        for entry in ListEntry::iter(bootinfo::get_memory_descriptors()) {
            let descriptor = containing_record!(entry, MemoryDescriptor, list_entry);
            let descriptor = &*descriptor;
            if descriptor.kind.is_invisible()
                || descriptor.kind == MemoryKind::HardwareCachedMemory
            {
                continue;
            }
            let list = if descriptor.kind == MemoryKind::Bad {
                PfnListId::Bad
            } else if descriptor.kind.is_free() {
                PfnListId::Free
            } else {
                continue;
            };
            for page in 0..descriptor.page_count {
                database.insert_page(list, PageFrameNumber(descriptor.base_page + page));
            }
        }
    }

    log::debug!(
        "PFN database: {} records at {database_virtual}, {} free pages",
        represented,
        database.list_count(PfnListId::Free)
    );

    // Remember the processor's view of CR3 and friends now that the
    // address space is final.
    // SAFETY: CPL0, single processor.
    unsafe {
        percpu::current().processor_state.capture();
    }
}
