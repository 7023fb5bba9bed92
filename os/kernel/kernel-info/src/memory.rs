//! # Loader Memory Descriptors
//!
//! The loader condenses the firmware memory map into a list of
//! [`MemoryDescriptor`] records before the hand-off. The kernel's physical
//! page accounting classifies each descriptor's [`MemoryKind`] into one of
//! three buckets: *free* (the pages join the free pool), *invisible* (the
//! pages are never represented in the PFN database), or neither (the pages
//! are represented but start out owned).

use crate::list::ListEntry;

/// What a region of physical memory was used for at hand-off time.
#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum MemoryKind {
    /// Plain usable RAM.
    Free = 0,
    /// RAM that failed testing; never allocated.
    Bad,
    /// Firmware memory reclaimable after exit-boot-services.
    FirmwareTemporary,
    /// Firmware memory that must stay untouched (runtime services).
    FirmwarePermanent,
    /// The loaded kernel image.
    LoadedProgram,
    /// Loader heap.
    OsloaderHeap,
    /// Loader stack; reclaimable once the kernel runs on its own stack.
    OsloaderStack,
    /// Loader code.
    SystemCode,
    /// Hardware abstraction layer code.
    HalCode,
    /// Boot-driver images.
    BootDriver,
    /// Startup DPC stack.
    StartupDpcStack,
    /// Startup kernel stack.
    StartupKernelStack,
    /// Startup panic stack.
    StartupPanicStack,
    /// Startup processor control region pages.
    StartupPcrPage,
    /// Startup processor data region pages.
    StartupPdrPage,
    /// Registry data.
    RegistryData,
    /// National-language-support tables.
    NlsData,
    /// Special memory (firmware-described, do not touch).
    SpecialMemory,
    /// Bad-block-table memory.
    BbtMemory,
    /// Reserved.
    Reserve,
    /// Execute-in-place ROM.
    XipRom,
    /// Memory carved out for hardware-layer mappings.
    HardwareCachedMemory,
}

impl MemoryKind {
    /// Whether pages of this kind join the kernel's free pool at bring-up.
    #[must_use]
    pub const fn is_free(self) -> bool {
        matches!(
            self,
            Self::Free | Self::FirmwareTemporary | Self::LoadedProgram | Self::OsloaderStack
        )
    }

    /// Whether pages of this kind stay invisible to the physical page
    /// accounting (no PFN record, not counted).
    #[must_use]
    pub const fn is_invisible(self) -> bool {
        matches!(
            self,
            Self::FirmwarePermanent | Self::SpecialMemory | Self::BbtMemory
        )
    }
}

/// One contiguous physical region in the hand-off memory map.
#[repr(C)]
#[derive(Debug)]
pub struct MemoryDescriptor {
    /// Link in the initialization block's memory-descriptor list.
    pub list_entry: ListEntry,
    /// Region classification.
    pub kind: MemoryKind,
    /// First page frame of the region.
    pub base_page: u64,
    /// Length of the region in pages.
    pub page_count: u64,
}

impl MemoryDescriptor {
    /// A detached descriptor for the given extent.
    #[must_use]
    pub const fn new(kind: MemoryKind, base_page: u64, page_count: u64) -> Self {
        Self {
            list_entry: ListEntry::new(),
            kind,
            base_page,
            page_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_buckets() {
        assert!(MemoryKind::Free.is_free());
        assert!(MemoryKind::FirmwareTemporary.is_free());
        assert!(MemoryKind::LoadedProgram.is_free());
        assert!(MemoryKind::OsloaderStack.is_free());
        assert!(!MemoryKind::OsloaderHeap.is_free());
        assert!(!MemoryKind::Bad.is_free());

        assert!(MemoryKind::FirmwarePermanent.is_invisible());
        assert!(MemoryKind::SpecialMemory.is_invisible());
        assert!(MemoryKind::BbtMemory.is_invisible());
        assert!(!MemoryKind::Free.is_invisible());
        assert!(!MemoryKind::HardwareCachedMemory.is_invisible());
    }
}
