use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PageFrameNumber, PhysicalAddress};

/// CR3 — page-table base register.
///
/// Holds the physical frame of the top-level page table plus the PCD/PWT
/// caching bits for accesses to that table. Writing CR3 flushes all
/// non-global TLB entries.
#[bitfield(u64, order = Lsb)]
pub struct Cr3 {
    /// Bits 0–2 — Ignored.
    #[bits(3, access = RO)]
    ignored0: u8,

    /// Bit 3 — PWT: write-through access to the top-level table.
    pub pwt: bool,

    /// Bit 4 — PCD: cache-disable access to the top-level table.
    pub pcd: bool,

    /// Bits 5–11 — Ignored.
    #[bits(7, access = RO)]
    ignored1: u8,

    /// Bits 12–51 — Physical frame number of the top-level page table.
    #[bits(40)]
    pub page_frame_number: u64,

    /// Bits 52–63 — Reserved.
    #[bits(12, access = RO)]
    reserved: u16,
}

impl Cr3 {
    /// Builds a CR3 value pointing at the page-table root `frame`.
    #[must_use]
    pub const fn with_root(frame: PageFrameNumber) -> Self {
        Self::new().with_page_frame_number(frame.as_u64())
    }

    /// Physical address of the top-level page table.
    #[must_use]
    pub const fn root_address(self) -> PhysicalAddress {
        PageFrameNumber(self.page_frame_number()).base()
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nomem, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_round_trip() {
        let cr3 = Cr3::with_root(PageFrameNumber(0x1234));
        assert_eq!(cr3.root_address().as_u64(), 0x1234 << 12);
        assert_eq!(cr3.into_bits(), 0x1234 << 12);
    }
}
