use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// CR0 — Control Register 0.
///
/// Governs protected mode, paging, and the FPU-related trap bits. Only the
/// architecturally defined bits are named; everything else is reserved.
#[bitfield(u64, order = Lsb)]
pub struct Cr0 {
    /// Bit 0 — PE: Protection Enable (protected mode).
    pub pe: bool,

    /// Bit 1 — MP: Monitor Coprocessor.
    pub mp: bool,

    /// Bit 2 — EM: Emulation (no x87 present).
    pub em: bool,

    /// Bit 3 — TS: Task Switched.
    pub ts: bool,

    /// Bit 4 — ET: Extension Type (hardwired on modern CPUs).
    pub et: bool,

    /// Bit 5 — NE: Numeric Error reporting.
    pub ne: bool,

    /// Bits 6–15 — Reserved.
    #[bits(10, access = RO)]
    reserved0: u16,

    /// Bit 16 — WP: Write Protect in supervisor mode.
    pub wp: bool,

    /// Bit 17 — Reserved.
    #[bits(access = RO)]
    reserved1: bool,

    /// Bit 18 — AM: Alignment Mask.
    pub am: bool,

    /// Bits 19–28 — Reserved.
    #[bits(10, access = RO)]
    reserved2: u16,

    /// Bit 29 — NW: Not Write-through.
    pub nw: bool,

    /// Bit 30 — CD: Cache Disable.
    pub cd: bool,

    /// Bit 31 — PG: Paging enable.
    pub pg: bool,

    /// Bits 32–63 — Reserved.
    #[bits(32, access = RO)]
    reserved3: u32,
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr0 {
    unsafe fn load_unsafe() -> Self {
        let cr0: u64;
        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nomem, preserves_flags));
        }
        Self::from_bits(cr0)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr0 {
    unsafe fn store_unsafe(self) {
        let cr0 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr0, {}", in(reg) cr0, options(nomem, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_positions() {
        let cr0 = Cr0::new().with_pe(true).with_wp(true).with_pg(true);
        assert_eq!(cr0.into_bits(), (1 << 0) | (1 << 16) | (1 << 31));
    }
}
