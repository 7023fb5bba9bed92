//! # Memory-Descriptor Scan
//!
//! First thing the memory manager does at bring-up: walk the loader's
//! descriptor list once and summarize it. Hardware-cached and invisible
//! regions are skipped outright; bad memory is represented but not counted;
//! the single largest free descriptor becomes the bootstrap allocator's
//! region, with its original extent saved for later reconciliation.

use crate::MINIMUM_PHYSICAL_PAGES;
use kernel_info::containing_record;
use kernel_info::list::ListEntry;
use kernel_info::memory::{MemoryDescriptor, MemoryKind};
use kernel_status::Status;

/// Summary of the descriptor scan.
#[derive(Debug)]
pub struct MemoryLayout {
    /// Countable physical pages (everything visible and not bad).
    pub number_of_physical_pages: u64,
    /// Lowest visible page frame.
    pub lowest_physical_page: u64,
    /// Highest visible page frame.
    pub highest_physical_page: u64,
    /// The largest free descriptor; the bootstrap allocator carves from it.
    pub free_descriptor: *mut MemoryDescriptor,
    /// Original extent of the free descriptor before any carving.
    pub old_free_base_page: u64,
    pub old_free_page_count: u64,
}

impl MemoryLayout {
    /// Whether the machine has enough memory to boot at all.
    #[must_use]
    pub const fn has_minimum_memory(&self) -> bool {
        self.number_of_physical_pages >= MINIMUM_PHYSICAL_PAGES
    }
}

/// Scans the hand-off descriptor list.
///
/// # Errors
/// [`Status::InsufficientResources`] when no free descriptor exists at all;
/// the caller treats that (and a failed minimum-page check) as fatal.
///
/// # Safety
/// `list_head` must be the initialized head of a well-formed descriptor
/// list that stays unmodified during the scan.
pub unsafe fn scan_descriptors(list_head: *mut ListEntry) -> Result<MemoryLayout, Status> {
    let mut summary = Summary::new();
    for entry in unsafe { ListEntry::iter(list_head) } {
        let descriptor = unsafe { containing_record!(entry, MemoryDescriptor, list_entry) };
        summary.account(unsafe { &*descriptor }, descriptor);
    }
    summary.finish()
}

/// Slice-based scan used by unit tests (same accounting, no raw list).
///
/// # Errors
/// Same as [`scan_descriptors`].
pub fn scan_descriptor_slice(descriptors: &mut [MemoryDescriptor]) -> Result<MemoryLayout, Status> {
    let mut summary = Summary::new();
    for descriptor in descriptors.iter_mut() {
        let ptr = core::ptr::from_mut(&mut *descriptor);
        summary.account(descriptor, ptr);
    }
    summary.finish()
}

struct Summary {
    number_of_physical_pages: u64,
    lowest_physical_page: u64,
    highest_physical_page: u64,
    free_descriptor: *mut MemoryDescriptor,
    free_pages: u64,
    old_free_base_page: u64,
    old_free_page_count: u64,
}

impl Summary {
    const fn new() -> Self {
        Self {
            number_of_physical_pages: 0,
            lowest_physical_page: u64::MAX,
            highest_physical_page: 0,
            free_descriptor: core::ptr::null_mut(),
            free_pages: 0,
            old_free_base_page: 0,
            old_free_page_count: 0,
        }
    }

    fn account(&mut self, descriptor: &MemoryDescriptor, ptr: *mut MemoryDescriptor) {
        // Invisible and hardware-cached regions never enter the accounting.
        if descriptor.kind.is_invisible() || descriptor.kind == MemoryKind::HardwareCachedMemory {
            return;
        }

        if descriptor.kind != MemoryKind::Bad {
            self.number_of_physical_pages += descriptor.page_count;
        }

        if descriptor.base_page < self.lowest_physical_page {
            self.lowest_physical_page = descriptor.base_page;
        }
        if descriptor.base_page + descriptor.page_count > self.highest_physical_page {
            self.highest_physical_page = descriptor.base_page + descriptor.page_count - 1;
        }

        if descriptor.kind.is_free() && descriptor.page_count >= self.free_pages {
            self.free_pages = descriptor.page_count;
            self.free_descriptor = ptr;
            self.old_free_base_page = descriptor.base_page;
            self.old_free_page_count = descriptor.page_count;
        }
    }

    fn finish(self) -> Result<MemoryLayout, Status> {
        if self.free_descriptor.is_null() {
            return Err(Status::InsufficientResources);
        }
        Ok(MemoryLayout {
            number_of_physical_pages: self.number_of_physical_pages,
            lowest_physical_page: self.lowest_physical_page,
            highest_physical_page: self.highest_physical_page,
            free_descriptor: self.free_descriptor,
            old_free_base_page: self.old_free_base_page,
            old_free_page_count: self.old_free_page_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(kind: MemoryKind, base: u64, count: u64) -> MemoryDescriptor {
        MemoryDescriptor::new(kind, base, count)
    }

    #[test]
    fn classification_and_extent() {
        let mut descriptors = [
            descriptor(MemoryKind::FirmwarePermanent, 0, 16), // invisible
            descriptor(MemoryKind::Free, 0x100, 0x300),
            descriptor(MemoryKind::LoadedProgram, 0x400, 0x80),
            descriptor(MemoryKind::Bad, 0x480, 0x10), // extent yes, count no
            descriptor(MemoryKind::Free, 0x1000, 0x4000), // the big one
            descriptor(MemoryKind::HardwareCachedMemory, 0x6000, 0x10), // skipped
            descriptor(MemoryKind::OsloaderHeap, 0x5000, 0x20),
        ];

        let layout = scan_descriptor_slice(&mut descriptors).expect("scan");
        assert_eq!(
            layout.number_of_physical_pages,
            0x300 + 0x80 + 0x4000 + 0x20
        );
        assert_eq!(layout.lowest_physical_page, 0x100);
        assert_eq!(layout.highest_physical_page, 0x5000 + 0x20 - 1);

        // The largest free region wins, and its original extent is kept.
        assert_eq!(layout.old_free_base_page, 0x1000);
        assert_eq!(layout.old_free_page_count, 0x4000);
        let free = unsafe { &*layout.free_descriptor };
        assert_eq!(free.base_page, 0x1000);

        assert!(layout.has_minimum_memory());
    }

    #[test]
    fn no_free_region_is_fatal() {
        let mut descriptors = [
            descriptor(MemoryKind::FirmwarePermanent, 0, 16),
            descriptor(MemoryKind::OsloaderHeap, 0x100, 0x10),
        ];
        assert_eq!(
            scan_descriptor_slice(&mut descriptors).unwrap_err(),
            Status::InsufficientResources
        );
    }

    #[test]
    fn tiny_machines_fail_the_minimum_check() {
        let mut descriptors = [descriptor(MemoryKind::Free, 0x100, 64)];
        let layout = scan_descriptor_slice(&mut descriptors).expect("scan");
        assert!(!layout.has_minimum_memory());
    }

    #[test]
    fn raw_list_scan_matches() {
        let mut a = descriptor(MemoryKind::Free, 0x200, 0x100);
        let mut b = descriptor(MemoryKind::LoadedProgram, 0x300, 0x40);
        let mut head = ListEntry::new();
        unsafe {
            ListEntry::initialize_head(&raw mut head);
            ListEntry::insert_tail(&raw mut head, &raw mut a.list_entry);
            ListEntry::insert_tail(&raw mut head, &raw mut b.list_entry);

            let layout = scan_descriptors(&raw mut head).expect("scan");
            assert_eq!(layout.number_of_physical_pages, 0x140);
            assert_eq!(layout.free_descriptor, &raw mut a);
        }
    }
}
