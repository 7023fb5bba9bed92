//! # The Hardware Pool
//!
//! Early device mappings need physical memory and a virtual window before
//! the real virtual-memory manager exists. The pool carves physical pages
//! out of the loader's free descriptors (labelling them hardware-cached so
//! the later PFN scan skips them) and maps them into a reserved virtual
//! window by scanning that window's PTEs for a free run.
//!
//! A fixed table of descriptors tracks the carvings; a 64 KiB-aligned
//! carving can split a source descriptor and therefore consumes two table
//! slots.

use kernel_info::containing_record;
use kernel_info::list::ListEntry;
use kernel_info::memory::{MemoryDescriptor, MemoryKind};
use kernel_memory_addresses::{PAGE_SHIFT, PhysicalAddress, VirtualAddress};
use kernel_status::Status;
use kernel_vmem::HwPte;
use kernel_vmem::regime::Paging;

/// Start of the hardware virtual window.
pub const HARDWARE_VA_START: u64 = 0xFFFF_FFFF_FFC0_0000;

/// First mappable address: the window base plus one mebibyte.
pub const HARDWARE_HEAP_START: u64 = HARDWARE_VA_START + 0x10_0000;

/// Size of the descriptor table.
pub const HARDWARE_ALLOCATION_DESCRIPTORS: usize = 64;

/// Highest physical address the pool will carve from.
pub const MAXIMUM_PHYSICAL_ADDRESS: u64 = 0x0000_0000_FFFF_FFFF;

/// The hardware-pool allocator.
///
/// `window` points at the PTE run backing the virtual window (reachable
/// through the self-map on hardware; an array in tests); `window_pages` is
/// its length in pages.
pub struct HardwarePool {
    descriptors: [MemoryDescriptor; HARDWARE_ALLOCATION_DESCRIPTORS],
    used_descriptors: usize,
    window: *mut HwPte,
    window_pages: u64,
    /// Lowest window address worth scanning; lowered again on unmap.
    heap_watermark: VirtualAddress,
}

impl HardwarePool {
    /// A pool over the PTE run backing the hardware window.
    ///
    /// # Safety
    /// `window` must point at `window_pages` consecutive PTEs that stay
    /// valid for the pool's lifetime.
    #[must_use]
    pub const unsafe fn new(window: *mut HwPte, window_pages: u64) -> Self {
        Self {
            descriptors: [const { MemoryDescriptor::new(MemoryKind::HardwareCachedMemory, 0, 0) };
                HARDWARE_ALLOCATION_DESCRIPTORS],
            used_descriptors: 0,
            window,
            window_pages,
            heap_watermark: VirtualAddress::new(HARDWARE_HEAP_START),
        }
    }

    /// Carves `page_count` physical pages from the loader's free
    /// descriptors, optionally 64 KiB-aligned, and records the carving as a
    /// hardware-cached descriptor on the list.
    ///
    /// # Errors
    /// [`Status::InsufficientResources`] when the descriptor table is full
    /// or no free descriptor can satisfy the request below the physical
    /// ceiling.
    ///
    /// # Safety
    /// `memory_descriptors` must be the initialized head of the loader's
    /// descriptor list, exclusively owned for the duration of the call.
    pub unsafe fn allocate_hardware_memory(
        &mut self,
        memory_descriptors: *mut ListEntry,
        page_count: u64,
        aligned: bool,
    ) -> Result<PhysicalAddress, Status> {
        let max_page = MAXIMUM_PHYSICAL_ADDRESS >> PAGE_SHIFT;

        // A split consumes two slots; demand both up front.
        if self.used_descriptors + 2 > HARDWARE_ALLOCATION_DESCRIPTORS {
            return Err(Status::InsufficientResources);
        }

        let mut found: *mut MemoryDescriptor = core::ptr::null_mut();
        let mut alignment = 0u64;
        for entry in unsafe { ListEntry::iter(memory_descriptors) } {
            let descriptor = unsafe { containing_record!(entry, MemoryDescriptor, list_entry) };
            let candidate = unsafe { &*descriptor };
            if candidate.kind != MemoryKind::Free {
                continue;
            }

            // 64 KiB alignment is sixteen pages.
            alignment = if aligned {
                ((candidate.base_page + 0x0F) & !0x0F) - candidate.base_page
            } else {
                0
            };

            if candidate.base_page != 0
                && candidate.base_page + page_count + alignment < max_page
                && candidate.page_count >= page_count + alignment
            {
                found = descriptor;
                break;
            }
        }

        if found.is_null() {
            return Err(Status::InsufficientResources);
        }
        // SAFETY: exclusive list ownership per the caller's contract.
        let source = unsafe { &mut *found };
        let physical = PhysicalAddress::new((source.base_page + alignment) << PAGE_SHIFT);

        let slot = self.used_descriptors;
        self.descriptors[slot] =
            MemoryDescriptor::new(MemoryKind::HardwareCachedMemory, source.base_page + alignment, page_count);
        self.used_descriptors += 1;

        if alignment > 0 {
            if source.page_count > page_count + alignment {
                // Split: a second descriptor covers the tail left over.
                let extra = self.used_descriptors;
                self.descriptors[extra] = MemoryDescriptor::new(
                    MemoryKind::Free,
                    source.base_page + alignment + page_count,
                    source.page_count - (alignment + page_count),
                );
                self.used_descriptors += 1;
                unsafe {
                    ListEntry::insert_head(
                        &raw mut source.list_entry,
                        &raw mut self.descriptors[extra].list_entry,
                    );
                }
            }
            // The source keeps only the pages below the alignment gap.
            source.page_count = alignment;
            unsafe {
                ListEntry::insert_head(
                    &raw mut source.list_entry,
                    &raw mut self.descriptors[slot].list_entry,
                );
            }
        } else {
            source.base_page += page_count;
            source.page_count -= page_count;
            unsafe {
                ListEntry::insert_tail(
                    &raw mut source.list_entry,
                    &raw mut self.descriptors[slot].list_entry,
                );
            }
            if source.page_count == 0 {
                unsafe { ListEntry::remove(&raw mut source.list_entry) };
            }
        }

        Ok(physical)
    }

    fn window_pte(&self, index: u64) -> *mut HwPte {
        debug_assert!(index < self.window_pages);
        unsafe { self.window.add(index as usize) }
    }

    const fn window_index(&self, va: VirtualAddress) -> u64 {
        (va.as_u64() - HARDWARE_VA_START) >> PAGE_SHIFT
    }

    /// Maps `page_count` physical pages into the window, returning their
    /// virtual address.
    ///
    /// Scans from the heap watermark for a run of invalid PTEs, installs
    /// valid + writable entries, and optionally flushes the TLB.
    ///
    /// # Errors
    /// [`Status::InsufficientResources`] when no large-enough run exists.
    pub fn map_hardware_memory(
        &mut self,
        physical: PhysicalAddress,
        page_count: u64,
        flush_tlb: bool,
    ) -> Result<VirtualAddress, Status> {
        let start_index = self.window_index(self.heap_watermark);
        let mut run_start = start_index;
        let mut run_length = 0u64;

        let mut index = start_index;
        while index < self.window_pages && run_length < page_count {
            // SAFETY: in-bounds window entry per the constructor contract.
            if unsafe { Paging::pte_valid(self.window_pte(index)) } {
                run_start = index + 1;
                run_length = 0;
            } else {
                run_length += 1;
            }
            index += 1;
        }

        if run_length < page_count {
            return Err(Status::InsufficientResources);
        }

        let mut pfn = kernel_memory_addresses::PageFrameNumber::from_address(physical);
        for page in 0..page_count {
            // SAFETY: the run was just verified invalid and in bounds.
            unsafe { Paging::set_pte(self.window_pte(run_start + page), pfn, true) };
            pfn = pfn.next();
        }

        let va = VirtualAddress::new(HARDWARE_VA_START + (run_start << PAGE_SHIFT));
        let end = VirtualAddress::new(va.as_u64() + (page_count << PAGE_SHIFT));
        if end > self.heap_watermark {
            self.heap_watermark = end;
        }

        if flush_tlb {
            // SAFETY: CPL0 on hardware; tests never pass true.
            unsafe { Paging::flush_tlb() };
        }

        // Keep the page offset of the source address.
        Ok(VirtualAddress::new(
            va.as_u64() + (physical.as_u64() & 0xFFF),
        ))
    }

    /// Sets cache-disable + write-through on `page_count` PTEs starting at
    /// `va`.
    pub fn mark_hardware_memory_write_through(&mut self, va: VirtualAddress, page_count: u64) {
        let start = self.window_index(va.page_base());
        for page in 0..page_count {
            // SAFETY: window entries per the constructor contract.
            unsafe { Paging::set_pte_caching(self.window_pte(start + page), true, true) };
        }
    }

    /// Clears `page_count` window PTEs starting at `va`; lowers the heap
    /// watermark when the freed run sits below it.
    pub fn unmap_hardware_memory(&mut self, va: VirtualAddress, page_count: u64, flush_tlb: bool) {
        let base = va.page_base();
        let start = self.window_index(base);
        for page in 0..page_count {
            // SAFETY: window entries per the constructor contract.
            unsafe { Paging::clear_pte(self.window_pte(start + page)) };
        }

        if base < self.heap_watermark {
            self.heap_watermark = base;
        }

        if flush_tlb {
            // SAFETY: CPL0 on hardware; tests never pass true.
            unsafe { Paging::flush_tlb() };
        }
    }

    /// Descriptor-table slots consumed so far.
    #[must_use]
    pub const fn used_descriptors(&self) -> usize {
        self.used_descriptors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PageFrameNumber;

    fn window(pages: usize) -> Vec<HwPte> {
        vec![HwPte::new(); pages]
    }

    struct FreeList {
        head: ListEntry,
        descriptors: Vec<Box<MemoryDescriptor>>,
    }

    impl FreeList {
        fn new(regions: &[(u64, u64)]) -> Self {
            let mut list = Self {
                head: ListEntry::new(),
                descriptors: regions
                    .iter()
                    .map(|&(base, count)| Box::new(MemoryDescriptor::new(MemoryKind::Free, base, count)))
                    .collect(),
            };
            unsafe {
                ListEntry::initialize_head(&raw mut list.head);
                for descriptor in &mut list.descriptors {
                    ListEntry::insert_tail(&raw mut list.head, &raw mut descriptor.list_entry);
                }
            }
            list
        }
    }

    #[test]
    fn carving_consumes_the_source_descriptor() {
        let mut ptes = window(64);
        let mut pool = unsafe { HardwarePool::new(ptes.as_mut_ptr(), 64) };
        let mut list = FreeList::new(&[(0x100, 0x40)]);

        let pa = unsafe {
            pool.allocate_hardware_memory(&raw mut list.head, 4, false)
                .expect("allocate")
        };
        assert_eq!(pa.as_u64(), 0x100 << 12);
        assert_eq!(list.descriptors[0].base_page, 0x104);
        assert_eq!(list.descriptors[0].page_count, 0x3C);
        assert_eq!(pool.used_descriptors(), 1);

        // The carving shows up on the list as hardware-cached memory.
        let kinds: Vec<MemoryKind> = unsafe {
            ListEntry::iter(&raw mut list.head)
                .map(|e| (*containing_record!(e, MemoryDescriptor, list_entry)).kind)
                .collect()
        };
        assert!(kinds.contains(&MemoryKind::HardwareCachedMemory));
    }

    #[test]
    fn aligned_carving_splits_the_source() {
        let mut ptes = window(64);
        let mut pool = unsafe { HardwarePool::new(ptes.as_mut_ptr(), 64) };
        // Base page 0x101 is not 64 KiB aligned; alignment is 15 pages.
        let mut list = FreeList::new(&[(0x101, 0x100)]);

        let pa = unsafe {
            pool.allocate_hardware_memory(&raw mut list.head, 8, true)
                .expect("allocate")
        };
        assert_eq!(pa.as_u64(), 0x110 << 12, "aligned to the next 64 KiB");
        assert_eq!(pool.used_descriptors(), 2, "split consumed an extra slot");
        assert_eq!(list.descriptors[0].page_count, 0x0F, "head trimmed to gap");
    }

    #[test]
    fn descriptor_table_exhaustion() {
        let mut ptes = window(8);
        let mut pool = unsafe { HardwarePool::new(ptes.as_mut_ptr(), 8) };
        pool.used_descriptors = HARDWARE_ALLOCATION_DESCRIPTORS - 1;
        let mut list = FreeList::new(&[(0x100, 0x40)]);
        let status = unsafe {
            pool.allocate_hardware_memory(&raw mut list.head, 1, false)
                .unwrap_err()
        };
        assert_eq!(status, Status::InsufficientResources);
    }

    #[test]
    fn window_mapping_finds_contiguous_runs() {
        let mut ptes = window(1024);
        // Pre-occupy the entry right after the heap start (index 256).
        unsafe {
            Paging::set_pte(ptes.as_mut_ptr().add(257), PageFrameNumber(0x999), true);
        }
        let mut pool = unsafe { HardwarePool::new(ptes.as_mut_ptr(), 1024) };

        let va = pool
            .map_hardware_memory(PhysicalAddress::new(0x20_0000), 4, false)
            .expect("map");
        // Index 256 is free but too short a run; the mapping lands at 258.
        assert_eq!(va.as_u64(), HARDWARE_VA_START + (258 << 12));
        for i in 0..4 {
            let pte = unsafe { Paging::read_pte(ptes.as_ptr().add(258 + i)) };
            assert!(pte.valid() && pte.writable());
            assert_eq!(pte.pfn(), PageFrameNumber(0x200 + i as u64));
        }

        // Sub-page offsets survive the mapping.
        let offset_va = pool
            .map_hardware_memory(PhysicalAddress::new(0x30_0123), 1, false)
            .expect("map");
        assert_eq!(offset_va.as_u64() & 0xFFF, 0x123);
    }

    #[test]
    fn write_through_marking_and_unmap() {
        let mut ptes = window(1024);
        let mut pool = unsafe { HardwarePool::new(ptes.as_mut_ptr(), 1024) };

        let va = pool
            .map_hardware_memory(PhysicalAddress::new(0x40_0000), 2, false)
            .expect("map");
        pool.mark_hardware_memory_write_through(va, 2);

        let index = ((va.as_u64() - HARDWARE_VA_START) >> 12) as usize;
        let pte = unsafe { Paging::read_pte(ptes.as_ptr().add(index)) };
        assert!(pte.cache_disable() && pte.write_through());

        let watermark_before = pool.heap_watermark;
        pool.unmap_hardware_memory(va, 2, false);
        let pte = unsafe { Paging::read_pte(ptes.as_ptr().add(index)) };
        assert!(!pte.valid());
        assert!(pool.heap_watermark < watermark_before, "watermark lowered");

        // The freed run is immediately reusable.
        let va2 = pool
            .map_hardware_memory(PhysicalAddress::new(0x50_0000), 2, false)
            .expect("map");
        assert_eq!(va2.page_base(), va.page_base());
    }

    #[test]
    fn window_exhaustion() {
        let mut ptes = window(260);
        let mut pool = unsafe { HardwarePool::new(ptes.as_mut_ptr(), 260) };
        let status = pool
            .map_hardware_memory(PhysicalAddress::new(0x1000), 8, false)
            .unwrap_err();
        assert_eq!(status, Status::InsufficientResources);
    }
}
