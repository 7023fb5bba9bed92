//! # Loader Memory Services
//!
//! Firmware-backed allocation, the virtual-mapping record list the page-map
//! builder consumes, and the translation from firmware memory-map entries
//! to the hand-off descriptor classification.

use alloc::vec::Vec;
use kernel_info::memory::MemoryKind;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{FrameAlloc, MemoryMappingRecord, PhysMapper};
use uefi::boot::{self, AllocateType, MemoryType};
use uefi::mem::memory_map::MemoryDescriptor as EfiMemoryDescriptor;

/// Zeroed 4 KiB frames from the firmware's page allocator.
pub struct BootServicesFrameAlloc;

impl FrameAlloc for BootServicesFrameAlloc {
    fn allocate_page(&mut self) -> Option<PhysicalAddress> {
        // Below 4 GiB: the five-level trampoline loads roots with a 32-bit
        // CR3 write.
        let pages = boot::allocate_pages(
            AllocateType::MaxAddress(0x1_0000_0000),
            MemoryType::LOADER_DATA,
            1,
        )
        .ok()?;
        // The loader runs identity-mapped; the frame is directly reachable.
        // SAFETY: freshly allocated, exclusively ours.
        unsafe {
            core::ptr::write_bytes(pages.as_ptr(), 0, 4096);
        }
        Some(PhysicalAddress::from_nonnull(pages))
    }
}

/// Identity mapping: physical addresses are directly dereferenceable while
/// the firmware's page tables are live.
pub struct IdentityMapper;

impl PhysMapper for IdentityMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // SAFETY: identity-mapped per the loader's execution environment.
        unsafe { &mut *(pa.as_u64() as *mut T) }
    }
}

/// Allocates `pages` at a fixed physical address (the trampoline needs a
/// low, identity-reachable home).
pub fn allocate_pages_at(address: u64, pages: usize) -> Option<PhysicalAddress> {
    let allocation =
        boot::allocate_pages(AllocateType::Address(address), MemoryType::LOADER_DATA, pages)
            .ok()?;
    Some(PhysicalAddress::from_nonnull(allocation))
}

/// The in-progress virtual memory map: appended while the boot protocol
/// decides what goes where, consumed exactly once by the page-map builder.
#[derive(Debug, Default)]
pub struct MappingList {
    records: Vec<MemoryMappingRecord>,
}

impl MappingList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Appends one mapping record.
    pub fn map_virtual_memory(
        &mut self,
        virtual_address: VirtualAddress,
        physical_address: PhysicalAddress,
        page_count: u64,
        kind: MemoryKind,
    ) {
        self.records.push(MemoryMappingRecord {
            virtual_address,
            physical_address,
            page_count,
            kind,
        });
    }

    /// The accumulated records.
    #[must_use]
    pub fn records(&self) -> &[MemoryMappingRecord] {
        &self.records
    }
}

/// Classifies a firmware memory-map entry for the hand-off descriptors.
#[must_use]
pub fn memory_kind_from_efi(descriptor: &EfiMemoryDescriptor) -> MemoryKind {
    match descriptor.ty {
        MemoryType::CONVENTIONAL => MemoryKind::Free,
        MemoryType::UNUSABLE => MemoryKind::Bad,
        MemoryType::LOADER_CODE => MemoryKind::SystemCode,
        MemoryType::LOADER_DATA => MemoryKind::OsloaderHeap,
        MemoryType::BOOT_SERVICES_CODE | MemoryType::BOOT_SERVICES_DATA => {
            MemoryKind::FirmwareTemporary
        }
        MemoryType::RUNTIME_SERVICES_CODE | MemoryType::RUNTIME_SERVICES_DATA => {
            MemoryKind::FirmwarePermanent
        }
        MemoryType::ACPI_RECLAIM | MemoryType::ACPI_NON_VOLATILE => MemoryKind::SpecialMemory,
        _ => MemoryKind::SpecialMemory,
    }
}
