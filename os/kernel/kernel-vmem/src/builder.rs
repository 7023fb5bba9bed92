//! # Loader-Side Page-Map Construction
//!
//! Builds a fresh address space before the hand-off: allocate the top-level
//! table, install the self-map, then walk the loader's mapping records and
//! materialize translations, creating intermediate tables on demand.
//!
//! The walker is shared by all regimes; only the index schedule differs.
//! The legacy 2-level regime uses 32-bit entries and 1024-entry tables, the
//! PAE regime a four-entry top level whose page directories are allocated up
//! front, long mode the familiar 512-entry tables at four or five levels.

use crate::info::{P5I_SHIFT, PDI_SHIFT, PPI_SHIFT, PTI_SHIFT, PXI_SHIFT, PageMapLevel};
use crate::pte::{HwPte, HwPte32};
use crate::{FrameAlloc, PhysMapper};
use kernel_info::memory::MemoryKind;
use kernel_memory_addresses::{PAGE_SHIFT, PageFrameNumber, PhysicalAddress, VirtualAddress};
use thiserror::Error;

/// Failures while building a page map.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum PageMapError {
    /// The frame allocator ran dry; the boot cannot continue.
    #[error("out of physical pages for page tables")]
    OutOfMemory,
}

/// One virtual→physical run the loader wants materialized.
///
/// Records with a null virtual address describe physical-only bookkeeping
/// (page-table frames themselves, firmware regions); the builder records
/// them in the memory map but installs no translation.
#[derive(Debug, Copy, Clone)]
pub struct MemoryMappingRecord {
    /// Target virtual address, or null for physical-only records.
    pub virtual_address: VirtualAddress,
    /// Source physical address.
    pub physical_address: PhysicalAddress,
    /// Run length in pages.
    pub page_count: u64,
    /// Classification carried into the hand-off memory map.
    pub kind: MemoryKind,
}

/// A page map under construction (and the root handed to CR3 afterwards).
#[derive(Debug)]
pub struct PageMap {
    root: PhysicalAddress,
    level: PageMapLevel,
}

/// A 512-entry table of 64-bit entries.
type Table = [HwPte; 512];

/// A 1024-entry table of legacy 32-bit entries.
type LegacyTable = [HwPte32; 1024];

impl PageMap {
    /// Allocates the top-level table and installs the self-map.
    ///
    /// `self_map_base` is the virtual base the page tables will be visible
    /// at — the regime's PTE window base.
    ///
    /// # Errors
    /// [`PageMapError::OutOfMemory`] when the allocator runs dry.
    pub fn build<A: FrameAlloc, M: PhysMapper>(
        alloc: &mut A,
        mapper: &M,
        level: PageMapLevel,
        self_map_base: u64,
    ) -> Result<Self, PageMapError> {
        let root = alloc.allocate_page().ok_or(PageMapError::OutOfMemory)?;
        let map = Self { root, level };

        match level {
            PageMapLevel::Pml3 => {
                // The PAE top level has exactly four slots; allocate the four
                // page directories up front and hang them in.
                let pdpt: &mut Table = unsafe { mapper.phys_to_mut(root) };
                for slot in pdpt.iter_mut().take(4) {
                    let pd = alloc.allocate_page().ok_or(PageMapError::OutOfMemory)?;
                    // PAE top-level entries carry no write permission bit.
                    *slot = HwPte::new()
                        .with_valid(true)
                        .with_pfn(PageFrameNumber::from_address(pd));
                }
                map.self_map_pae(mapper, self_map_base);
            }
            PageMapLevel::Pml2 => {
                let table: &mut LegacyTable = unsafe { mapper.phys_to_mut(root) };
                let index = (self_map_base >> 22) as usize;
                table[index] = HwPte32::new()
                    .with_valid(true)
                    .with_writable(true)
                    .with_page_frame_number(
                        u32::try_from(PageFrameNumber::from_address(root).as_u64())
                            .expect("legacy root frame below 4 GiB"),
                    );
            }
            PageMapLevel::Pml4 | PageMapLevel::Pml5 => {
                let shift = if level == PageMapLevel::Pml5 {
                    P5I_SHIFT
                } else {
                    PXI_SHIFT
                };
                let index = ((self_map_base >> shift) & 0x1FF) as usize;
                let table: &mut Table = unsafe { mapper.phys_to_mut(root) };
                table[index] = HwPte::new()
                    .with_valid(true)
                    .with_writable(true)
                    .with_pfn(PageFrameNumber::from_address(root));
            }
        }

        Ok(map)
    }

    /// PAE self-map: four contiguous PDEs in the directory covering the
    /// self-map window, each pointing at one of the four page directories.
    fn self_map_pae<M: PhysMapper>(&self, mapper: &M, self_map_base: u64) {
        let pdpt: &mut Table = unsafe { mapper.phys_to_mut(self.root) };
        let covering = ((self_map_base >> PPI_SHIFT) & 0x3) as usize;
        let pd_pa = pdpt[covering].pfn().base();
        let start = ((self_map_base >> PDI_SHIFT) & 0x1FF) as usize;

        let targets: [PageFrameNumber; 4] = core::array::from_fn(|i| pdpt[i].pfn());
        let pd: &mut Table = unsafe { mapper.phys_to_mut(pd_pa) };
        for (i, target) in targets.into_iter().enumerate() {
            pd[start + i] = HwPte::new()
                .with_valid(true)
                .with_writable(true)
                .with_pfn(target);
        }
    }

    /// Physical address of the top-level table (the future CR3 value).
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Depth this map was built for.
    #[must_use]
    pub const fn level(&self) -> PageMapLevel {
        self.level
    }

    /// Installs `page_count` 4 KiB translations starting at `va` → `pa`.
    ///
    /// Intermediate tables are created on demand, zeroed, and marked
    /// valid + writable. Leaves are valid + writable.
    ///
    /// # Errors
    /// [`PageMapError::OutOfMemory`] when an intermediate table cannot be
    /// allocated.
    pub fn map_page<A: FrameAlloc, M: PhysMapper>(
        &self,
        alloc: &mut A,
        mapper: &M,
        va: VirtualAddress,
        pa: PhysicalAddress,
        page_count: u64,
    ) -> Result<(), PageMapError> {
        let mut va = va.as_u64();
        let mut pfn = PageFrameNumber::from_address(pa);

        for _ in 0..page_count {
            if self.level == PageMapLevel::Pml2 {
                self.map_one_legacy(alloc, mapper, va, pfn)?;
            } else {
                self.map_one(alloc, mapper, va, pfn)?;
            }
            va += 1 << PAGE_SHIFT;
            pfn = pfn.next();
        }

        Ok(())
    }

    /// Walks the records of the in-progress memory map and installs every
    /// translation that names a virtual address.
    ///
    /// # Errors
    /// Propagates [`PageMapError::OutOfMemory`] from the walker.
    pub fn map_records<A: FrameAlloc, M: PhysMapper>(
        &self,
        alloc: &mut A,
        mapper: &M,
        records: &[MemoryMappingRecord],
    ) -> Result<(), PageMapError> {
        for record in records {
            if record.virtual_address.is_null() {
                continue;
            }
            log::debug!(
                "   Type={:?}, PhysicalBase={}, VirtualBase={}, Pages={}",
                record.kind,
                record.physical_address,
                record.virtual_address,
                record.page_count
            );
            self.map_page(
                alloc,
                mapper,
                record.virtual_address,
                record.physical_address,
                record.page_count,
            )?;
        }
        Ok(())
    }

    /// One 64-bit-entry translation (PML3/PML4/PML5).
    fn map_one<A: FrameAlloc, M: PhysMapper>(
        &self,
        alloc: &mut A,
        mapper: &M,
        va: u64,
        pfn: PageFrameNumber,
    ) -> Result<(), PageMapError> {
        let mut table_pa = self.root;

        // Index schedule from the top level down to the page directory.
        let shifts: &[u32] = match self.level {
            PageMapLevel::Pml5 => &[P5I_SHIFT, PXI_SHIFT, PPI_SHIFT, PDI_SHIFT],
            PageMapLevel::Pml4 => &[PXI_SHIFT, PPI_SHIFT, PDI_SHIFT],
            PageMapLevel::Pml3 => &[PPI_SHIFT, PDI_SHIFT],
            PageMapLevel::Pml2 => unreachable!("legacy path handles 2-level maps"),
        };

        for (depth, &shift) in shifts.iter().enumerate() {
            // The PAE top level has four entries; every other table 512.
            let mask = if self.level == PageMapLevel::Pml3 && depth == 0 {
                0x3
            } else {
                0x1FF
            };
            let index = ((va >> shift) & mask) as usize;
            table_pa = Self::next_table(alloc, mapper, table_pa, index)?;
        }

        let table: &mut Table = unsafe { mapper.phys_to_mut(table_pa) };
        let index = ((va >> PTI_SHIFT) & 0x1FF) as usize;
        table[index] = HwPte::new()
            .with_valid(true)
            .with_writable(true)
            .with_pfn(pfn);
        Ok(())
    }

    /// One legacy 32-bit-entry translation.
    fn map_one_legacy<A: FrameAlloc, M: PhysMapper>(
        &self,
        alloc: &mut A,
        mapper: &M,
        va: u64,
        pfn: PageFrameNumber,
    ) -> Result<(), PageMapError> {
        let directory: &mut LegacyTable = unsafe { mapper.phys_to_mut(self.root) };
        let pde_index = ((va >> 22) & 0x3FF) as usize;

        let table_pa = if directory[pde_index].valid() {
            PageFrameNumber(u64::from(directory[pde_index].page_frame_number())).base()
        } else {
            let page = alloc.allocate_page().ok_or(PageMapError::OutOfMemory)?;
            directory[pde_index] = HwPte32::new()
                .with_valid(true)
                .with_writable(true)
                .with_page_frame_number(
                    u32::try_from(PageFrameNumber::from_address(page).as_u64())
                        .expect("legacy table frame below 4 GiB"),
                );
            page
        };

        let table: &mut LegacyTable = unsafe { mapper.phys_to_mut(table_pa) };
        let pte_index = ((va >> PTI_SHIFT) & 0x3FF) as usize;
        table[pte_index] = HwPte32::new()
            .with_valid(true)
            .with_writable(true)
            .with_page_frame_number(u32::try_from(pfn.as_u64()).expect("legacy PFN below 4 GiB"));
        Ok(())
    }

    /// Descends one level, allocating and linking a zeroed table if the
    /// entry is not valid yet.
    fn next_table<A: FrameAlloc, M: PhysMapper>(
        alloc: &mut A,
        mapper: &M,
        table_pa: PhysicalAddress,
        index: usize,
    ) -> Result<PhysicalAddress, PageMapError> {
        let table: &mut Table = unsafe { mapper.phys_to_mut(table_pa) };
        if table[index].valid() {
            return Ok(table[index].pfn().base());
        }

        let page = alloc.allocate_page().ok_or(PageMapError::OutOfMemory)?;
        table[index] = HwPte::new()
            .with_valid(true)
            .with_writable(true)
            .with_pfn(PageFrameNumber::from_address(page));
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::{PML2_INFO, PML3_INFO, PML4_INFO, PML5_INFO};

    /// A 4 KiB-aligned frame backing simulated physical memory.
    #[repr(align(4096))]
    struct Frame([u8; 4096]);

    /// Simulated physical RAM: frame `i` lives at physical address `i << 12`.
    struct TestPhys {
        frames: Vec<Box<Frame>>,
    }

    impl TestPhys {
        fn with_frames(count: usize) -> Self {
            let mut frames = Vec::with_capacity(count);
            for _ in 0..count {
                frames.push(Box::new(Frame([0u8; 4096])));
            }
            Self { frames }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let index = (pa.as_u64() >> 12) as usize;
            let offset = (pa.as_u64() & 0xFFF) as usize;
            assert_eq!(offset, 0, "page tables are whole frames");
            let ptr = core::ptr::addr_of!(*self.frames[index]) as *mut T;
            unsafe { &mut *ptr }
        }
    }

    /// Hands out simulated frames in order, skipping frame 0 so a zero PFN
    /// never looks like a real table.
    struct BumpAlloc {
        next: u64,
        end: u64,
    }

    impl BumpAlloc {
        fn new(end: u64) -> Self {
            Self { next: 1, end }
        }
        fn used(&self) -> u64 {
            self.next - 1
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn allocate_page(&mut self) -> Option<PhysicalAddress> {
            if self.next >= self.end {
                return None;
            }
            let pa = PhysicalAddress::new(self.next << 12);
            self.next += 1;
            Some(pa)
        }
    }

    fn entry<'a>(phys: &TestPhys, table: PhysicalAddress, index: usize) -> &'a HwPte {
        let table: &mut Table = unsafe { phys.phys_to_mut(table) };
        &table[index]
    }

    #[test]
    fn four_level_map_reaches_ordered_pfns() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(64);

        let map = PageMap::build(&mut alloc, &phys, PageMapLevel::Pml4, PML4_INFO.pte_base)
            .expect("build");

        let va = VirtualAddress::new(0xFFFF_8800_0000_0000);
        let pa = PhysicalAddress::new(0x0020_0000);
        map.map_page(&mut alloc, &phys, va, pa, 4).expect("map");

        // Walk from the root exactly like the hardware would.
        let raw = va.as_u64();
        let pxe = entry(&phys, map.root(), ((raw >> PXI_SHIFT) & 0x1FF) as usize);
        assert!(pxe.valid() && pxe.writable());
        let ppe = entry(&phys, pxe.pfn().base(), ((raw >> PPI_SHIFT) & 0x1FF) as usize);
        assert!(ppe.valid());
        let pde = entry(&phys, ppe.pfn().base(), ((raw >> PDI_SHIFT) & 0x1FF) as usize);
        assert!(pde.valid());

        for i in 0..4u64 {
            let pte = entry(
                &phys,
                pde.pfn().base(),
                ((raw >> PTI_SHIFT) & 0x1FF) as usize + i as usize,
            );
            assert!(pte.valid(), "page {i} valid");
            assert!(pte.writable(), "page {i} writable");
            assert_eq!(pte.pfn(), PageFrameNumber(0x200 + i), "page {i} PFN");
        }

        // The self-map entry points back at the root frame.
        let self_index = ((PML4_INFO.pte_base >> PXI_SHIFT) & 0x1FF) as usize;
        assert_eq!(self_index, 0x1ED);
        let self_entry = entry(&phys, map.root(), self_index);
        assert!(self_entry.valid() && self_entry.writable());
        assert_eq!(self_entry.pfn().base(), map.root());
    }

    #[test]
    fn five_level_self_map_index() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(64);
        let map = PageMap::build(&mut alloc, &phys, PageMapLevel::Pml5, PML5_INFO.pte_base)
            .expect("build");

        let self_index = ((PML5_INFO.pte_base >> P5I_SHIFT) & 0x1FF) as usize;
        let self_entry = entry(&phys, map.root(), self_index);
        assert!(self_entry.valid());
        assert_eq!(self_entry.pfn().base(), map.root());

        // A five-level walk materializes four intermediate tables.
        let before = alloc.used();
        map.map_page(
            &mut alloc,
            &phys,
            VirtualAddress::new(0xFF77_0000_0010_0000),
            PhysicalAddress::new(0x40_0000),
            1,
        )
        .expect("map");
        assert_eq!(alloc.used() - before, 4);
    }

    #[test]
    fn pae_build_installs_directories_and_self_map() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(64);
        let map = PageMap::build(&mut alloc, &phys, PageMapLevel::Pml3, PML3_INFO.pte_base)
            .expect("build");

        // Four valid page directories in the four top-level slots.
        let directories: Vec<PhysicalAddress> = (0..4)
            .map(|i| {
                let e = entry(&phys, map.root(), i);
                assert!(e.valid());
                e.pfn().base()
            })
            .collect();

        // Self-map: four contiguous PDEs in the directory covering the
        // window, pointing at the four directories in order.
        let covering = ((PML3_INFO.pte_base >> PPI_SHIFT) & 0x3) as usize;
        assert_eq!(covering, 3);
        let start = ((PML3_INFO.pte_base >> PDI_SHIFT) & 0x1FF) as usize;
        for (i, expected) in directories.iter().enumerate() {
            let e = entry(&phys, directories[covering], start + i);
            assert!(e.valid() && e.writable());
            assert_eq!(e.pfn().base(), *expected);
        }

        // Mapping through the preinstalled directories allocates only the
        // page table.
        let before = alloc.used();
        map.map_page(
            &mut alloc,
            &phys,
            VirtualAddress::new(0x0040_0000),
            PhysicalAddress::new(0x80_0000),
            1,
        )
        .expect("map");
        assert_eq!(alloc.used() - before, 1);
    }

    #[test]
    fn legacy_build_and_map() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(64);
        let map = PageMap::build(&mut alloc, &phys, PageMapLevel::Pml2, PML2_INFO.pte_base)
            .expect("build");

        // Self-map PDE.
        let directory: &mut LegacyTable = unsafe { phys.phys_to_mut(map.root()) };
        let self_index = (PML2_INFO.pte_base >> 22) as usize;
        assert_eq!(self_index, 0x300);
        assert!(directory[self_index].valid());
        assert_eq!(
            u64::from(directory[self_index].page_frame_number()) << 12,
            map.root().as_u64()
        );

        map.map_page(
            &mut alloc,
            &phys,
            VirtualAddress::new(0x0800_0000),
            PhysicalAddress::new(0x0100_0000),
            2,
        )
        .expect("map");

        let pde = directory[(0x0800_0000_u64 >> 22) as usize];
        assert!(pde.valid());
        let table: &mut LegacyTable =
            unsafe { phys.phys_to_mut(PageFrameNumber(u64::from(pde.page_frame_number())).base()) };
        let base_index = ((0x0800_0000_u64 >> 12) & 0x3FF) as usize;
        assert_eq!(table[base_index].page_frame_number(), 0x1000);
        assert_eq!(table[base_index + 1].page_frame_number(), 0x1001);
    }

    #[test]
    fn allocator_exhaustion_is_reported() {
        let phys = TestPhys::with_frames(8);
        let mut alloc = BumpAlloc::new(3);
        let map = PageMap::build(&mut alloc, &phys, PageMapLevel::Pml4, PML4_INFO.pte_base)
            .expect("root fits");
        let err = map
            .map_page(
                &mut alloc,
                &phys,
                VirtualAddress::new(0xFFFF_8800_0000_0000),
                PhysicalAddress::new(0x20_0000),
                1,
            )
            .unwrap_err();
        assert_eq!(err, PageMapError::OutOfMemory);
    }

    #[test]
    fn records_without_virtual_addresses_are_skipped() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(64);
        let map = PageMap::build(&mut alloc, &phys, PageMapLevel::Pml4, PML4_INFO.pte_base)
            .expect("build");

        let records = [
            MemoryMappingRecord {
                virtual_address: VirtualAddress::zero(),
                physical_address: PhysicalAddress::new(0x5000),
                page_count: 1,
                kind: MemoryKind::OsloaderHeap,
            },
            MemoryMappingRecord {
                virtual_address: VirtualAddress::new(0xFFFF_8800_0000_0000),
                physical_address: PhysicalAddress::new(0x20_0000),
                page_count: 1,
                kind: MemoryKind::LoadedProgram,
            },
        ];
        let before = alloc.used();
        map.map_records(&mut alloc, &phys, &records).expect("map");
        // Only the second record allocated tables (three intermediates).
        assert_eq!(alloc.used() - before, 3);
    }
}
