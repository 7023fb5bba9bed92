//! # The Active Translation Regime
//!
//! [`Paging`] binds the constants table of the regime the processor is
//! actually running to the operations the memory manager performs on live
//! page tables. The regime is chosen exactly once during bring-up by
//! inspecting CR4 and never changes afterwards.
//!
//! Entry-address math lives on [`PageMapInfo`]; this module adds the
//! operations that dereference PTE pointers, which only make sense on a
//! machine whose page tables are mapped (through the self-map window).

use crate::info::{PageMapInfo, PageMapLevel};
use crate::pte::HwPte;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};

/// The paging interface over the active regime.
#[derive(Debug)]
pub struct Paging {
    info: &'static PageMapInfo,
}

impl Paging {
    /// Binds the interface to an explicitly chosen regime (the kernel takes
    /// the level from the initialization block).
    #[must_use]
    pub const fn from_level(level: PageMapLevel) -> Self {
        Self {
            info: PageMapInfo::for_level(level),
        }
    }

    /// Selects the regime from processor state.
    ///
    /// In long mode that is CR4.LA57: set means 5-level, clear means
    /// 4-level.
    ///
    /// # Safety
    /// CPL0 only (reads CR4).
    #[cfg(target_arch = "x86_64")]
    #[must_use]
    pub unsafe fn detect() -> Self {
        let level = if unsafe { detect_xpa() } {
            PageMapLevel::Pml5
        } else {
            PageMapLevel::Pml4
        };
        Self::from_level(level)
    }

    /// The constants table of the bound regime.
    #[must_use]
    pub const fn info(&self) -> &'static PageMapInfo {
        self.info
    }

    /// Whether the bound regime is the extended (XPA) form.
    #[must_use]
    pub const fn xpa_status(&self) -> bool {
        self.info.xpa
    }

    /// Reads the PTE at `pte`.
    ///
    /// # Safety
    /// `pte` must point at a mapped page-table entry.
    #[must_use]
    pub unsafe fn read_pte(pte: *const HwPte) -> HwPte {
        unsafe { core::ptr::read_volatile(pte) }
    }

    /// Whether the entry at `pte` is valid for hardware.
    ///
    /// # Safety
    /// `pte` must point at a mapped page-table entry.
    #[must_use]
    pub unsafe fn pte_valid(pte: *const HwPte) -> bool {
        unsafe { Self::read_pte(pte) }.valid()
    }

    /// Clears the hardware fields of the entry at `pte`.
    ///
    /// Software overlay bits survive; only validity, the frame, and the
    /// write/caching attributes are dropped.
    ///
    /// # Safety
    /// `pte` must point at a mapped, writable page-table entry; the caller
    /// owns TLB coherence for the unmapped translation.
    pub unsafe fn clear_pte(pte: *mut HwPte) {
        unsafe {
            let entry = Self::read_pte(pte)
                .with_valid(false)
                .with_writable(false)
                .with_write_through(false)
                .with_cache_disable(false)
                .with_page_frame_number(0);
            core::ptr::write_volatile(pte, entry);
        }
    }

    /// Points the entry at `pte` at `pfn`, valid, with the given write
    /// permission. Any previous content is replaced.
    ///
    /// # Safety
    /// Same contract as [`Paging::clear_pte`]; additionally `pfn` must index
    /// an existing physical page.
    pub unsafe fn set_pte(
        pte: *mut HwPte,
        pfn: kernel_memory_addresses::PageFrameNumber,
        writable: bool,
    ) {
        unsafe {
            core::ptr::write_volatile(
                pte,
                HwPte::new()
                    .with_valid(true)
                    .with_writable(writable)
                    .with_pfn(pfn),
            );
        }
    }

    /// Adjusts the caching attributes of the entry at `pte`.
    ///
    /// # Safety
    /// Same contract as [`Paging::clear_pte`].
    pub unsafe fn set_pte_caching(pte: *mut HwPte, cache_disable: bool, write_through: bool) {
        unsafe {
            let entry = Self::read_pte(pte)
                .with_cache_disable(cache_disable)
                .with_write_through(write_through);
            core::ptr::write_volatile(pte, entry);
        }
    }

    /// Fills whole pages with zeroes.
    ///
    /// # Safety
    /// `[va, va + size)` must be mapped writable; `size` must be a multiple
    /// of the page size.
    pub unsafe fn zero_pages(va: VirtualAddress, size: u64) {
        debug_assert_eq!(size % PAGE_SIZE, 0);
        unsafe {
            core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0, size as usize);
        }
    }

    /// Flushes the entire TLB (global entries included where supported).
    ///
    /// # Safety
    /// CPL0 only.
    pub unsafe fn flush_tlb() {
        unsafe { kernel_ports::flush_tlb() }
    }
}

/// Probes the processor for the extended-addressing state.
///
/// # Safety
/// CPL0 only (reads CR4).
#[cfg(target_arch = "x86_64")]
#[must_use]
pub unsafe fn detect_xpa() -> bool {
    use kernel_registers::LoadRegisterUnsafe;
    unsafe { kernel_registers::cr4::Cr4::load_unsafe() }.la57()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PageFrameNumber;

    #[test]
    fn set_read_clear_cycle() {
        let mut slot = HwPte::new();
        let pte = &raw mut slot;
        unsafe {
            assert!(!Paging::pte_valid(pte));

            Paging::set_pte(pte, PageFrameNumber(0x200), true);
            assert!(Paging::pte_valid(pte));
            let entry = Paging::read_pte(pte);
            assert_eq!(entry.pfn(), PageFrameNumber(0x200));
            assert!(entry.writable());

            Paging::set_pte_caching(pte, true, true);
            let entry = Paging::read_pte(pte);
            assert!(entry.cache_disable());
            assert!(entry.write_through());
            assert!(entry.valid());

            Paging::clear_pte(pte);
            assert!(!Paging::pte_valid(pte));
            assert_eq!(Paging::read_pte(pte).pfn(), PageFrameNumber(0));
        }
    }

    #[test]
    fn clear_preserves_software_bits() {
        let mut slot = HwPte::new()
            .with_valid(true)
            .with_prototype(true)
            .with_software_ws_index(5)
            .with_pfn(PageFrameNumber(7));
        let pte = &raw mut slot;
        unsafe {
            Paging::clear_pte(pte);
            let entry = Paging::read_pte(pte);
            assert!(!entry.valid());
            assert!(entry.prototype());
            assert_eq!(entry.software_ws_index(), 5);
        }
    }

    #[test]
    fn regime_binding() {
        let paging = Paging::from_level(PageMapLevel::Pml5);
        assert!(paging.xpa_status());
        assert_eq!(paging.info().va_bits, 57);

        let paging = Paging::from_level(PageMapLevel::Pml4);
        assert!(!paging.xpa_status());
    }
}
