//! # Hardware Page-Table Entries
//!
//! The bit layouts are hardware-defined and must round-trip bit-exactly, so
//! each form is a `bitfield-struct` over the raw word rather than anything
//! the compiler could reorder.
//!
//! [`HwPte`] is the 64-bit entry used by the PAE and long-mode regimes (and
//! all non-leaf levels there). The legacy 2-level regime uses the 32-bit
//! [`HwPte32`]. When `valid` is clear the hardware ignores the entry and the
//! memory manager overlays one of the software forms on the same word —
//! [`SoftwarePte`], [`TransitionPte`], [`PrototypePte`] or [`ListPte`],
//! discriminated by the `prototype`/`transition` bits.

use bitfield_struct::bitfield;
use kernel_memory_addresses::PageFrameNumber;

/// A 64-bit hardware PTE (PAE / long mode).
#[bitfield(u64, order = Lsb)]
pub struct HwPte {
    /// Bit 0 — P: the entry maps a present page.
    pub valid: bool,

    /// Bit 1 — RW: writes allowed.
    pub writable: bool,

    /// Bit 2 — US: user-mode accessible.
    pub owner: bool,

    /// Bit 3 — PWT: write-through caching.
    pub write_through: bool,

    /// Bit 4 — PCD: caching disabled.
    pub cache_disable: bool,

    /// Bit 5 — A: set by hardware on first access.
    pub accessed: bool,

    /// Bit 6 — D: set by hardware on first write (leaf only).
    pub dirty: bool,

    /// Bit 7 — PS: large-page leaf (PDE/PPE only).
    pub large_page: bool,

    /// Bit 8 — G: survives CR3 reloads.
    pub global: bool,

    /// Bit 9 — software: copy-on-write.
    pub copy_on_write: bool,

    /// Bit 10 — software: prototype PTE.
    pub prototype: bool,

    /// Bit 11 — software: reserved (write intent).
    pub write: bool,

    /// Bits 12–51 — page frame number.
    #[bits(40)]
    pub page_frame_number: u64,

    /// Bits 52–62 — software: working-set index.
    #[bits(11)]
    pub software_ws_index: u16,

    /// Bit 63 — NX: no-execute (with EFER.NXE).
    pub no_execute: bool,
}

impl HwPte {
    /// Page frame this entry points at.
    #[must_use]
    pub const fn pfn(self) -> PageFrameNumber {
        PageFrameNumber(self.page_frame_number())
    }

    /// Replaces the page frame this entry points at.
    #[must_use]
    pub const fn with_pfn(self, pfn: PageFrameNumber) -> Self {
        self.with_page_frame_number(pfn.as_u64())
    }
}

/// A 32-bit legacy (non-PAE) hardware PTE.
#[bitfield(u32, order = Lsb)]
pub struct HwPte32 {
    /// Bit 0 — P: present.
    pub valid: bool,

    /// Bit 1 — RW: writes allowed.
    pub writable: bool,

    /// Bit 2 — US: user-mode accessible.
    pub owner: bool,

    /// Bit 3 — PWT: write-through caching.
    pub write_through: bool,

    /// Bit 4 — PCD: caching disabled.
    pub cache_disable: bool,

    /// Bit 5 — A: accessed.
    pub accessed: bool,

    /// Bit 6 — D: dirty.
    pub dirty: bool,

    /// Bit 7 — PS: large-page leaf (PDE only).
    pub large_page: bool,

    /// Bit 8 — G: global.
    pub global: bool,

    /// Bit 9 — software: copy-on-write.
    pub copy_on_write: bool,

    /// Bit 10 — software: prototype.
    pub prototype: bool,

    /// Bit 11 — software: reserved (write intent).
    pub write: bool,

    /// Bits 12–31 — page frame number.
    #[bits(20)]
    pub page_frame_number: u32,
}

/// Software form: the page lives in a paging file.
///
/// Only consulted while `valid` is clear.
#[bitfield(u64, order = Lsb)]
pub struct SoftwarePte {
    /// Bit 0 — must be clear for any software form.
    pub valid: bool,

    /// Bits 1–4 — low bits of the paging-file index.
    #[bits(4)]
    pub page_file_low: u8,

    /// Bits 5–9 — protection mask for the eventual hardware entry.
    #[bits(5)]
    pub protection: u8,

    /// Bit 10 — must be clear (otherwise this is a prototype form).
    pub prototype: bool,

    /// Bit 11 — must be clear (otherwise this is a transition form).
    pub transition: bool,

    /// Bits 12–63 — offset within the paging file.
    #[bits(52)]
    pub page_file_high: u64,
}

/// Software form: the page is in physical memory but on a transition list.
#[bitfield(u64, order = Lsb)]
pub struct TransitionPte {
    /// Bit 0 — must be clear.
    pub valid: bool,

    /// Bit 1 — write intent preserved across the transition.
    pub write: bool,

    /// Bit 2 — owner preserved across the transition.
    pub owner: bool,

    /// Bit 3 — PWT preserved.
    pub write_through: bool,

    /// Bit 4 — PCD preserved.
    pub cache_disable: bool,

    /// Bits 5–9 — protection mask.
    #[bits(5)]
    pub protection: u8,

    /// Bit 10 — must be clear.
    pub prototype: bool,

    /// Bit 11 — set: this is the transition form.
    pub transition: bool,

    /// Bits 12–51 — page frame number still backing the page.
    #[bits(40)]
    pub page_frame_number: u64,

    /// Bits 52–63 — unused.
    #[bits(12)]
    reserved: u16,
}

/// Software form: the entry defers to a prototype PTE.
#[bitfield(u64, order = Lsb)]
pub struct PrototypePte {
    /// Bit 0 — must be clear.
    pub valid: bool,

    /// Bits 1–7 — unused.
    #[bits(7)]
    reserved0: u8,

    /// Bits 8–9 — read-only flag space.
    #[bits(2)]
    pub read_only: u8,

    /// Bit 10 — set: this is the prototype form.
    pub prototype: bool,

    /// Bits 11–15 — unused.
    #[bits(5)]
    reserved1: u8,

    /// Bits 16–63 — address of the prototype PTE.
    #[bits(48)]
    pub proto_address: u64,
}

/// Software form: a link in a free-entry list threaded through the table.
#[bitfield(u64, order = Lsb)]
pub struct ListPte {
    /// Bit 0 — must be clear.
    pub valid: bool,

    /// Bit 1 — set when exactly one entry remains behind this one.
    pub one_entry: bool,

    /// Bits 2–31 — unused.
    #[bits(30)]
    reserved: u32,

    /// Bits 32–63 — index of the next free entry.
    #[bits(32)]
    pub next_entry: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_bits_round_trip() {
        let pte = HwPte::new()
            .with_valid(true)
            .with_writable(true)
            .with_pfn(PageFrameNumber(0x1_2345))
            .with_no_execute(true);
        assert_eq!(
            pte.into_bits(),
            (1 << 0) | (1 << 1) | (0x1_2345_u64 << 12) | (1 << 63)
        );

        let back = HwPte::from_bits(pte.into_bits());
        assert!(back.valid());
        assert!(back.writable());
        assert!(!back.owner());
        assert_eq!(back.pfn(), PageFrameNumber(0x1_2345));
        assert!(back.no_execute());
    }

    #[test]
    fn legacy_pfn_width() {
        let pte = HwPte32::new()
            .with_valid(true)
            .with_page_frame_number(0xF_FFFF);
        assert_eq!(pte.into_bits(), 0xFFFF_F001);
    }

    #[test]
    fn software_overlay_reads_the_same_word() {
        // A transition PTE: invalid for hardware, PFN still meaningful.
        let transition = TransitionPte::new()
            .with_transition(true)
            .with_protection(0b100)
            .with_page_frame_number(0x777);
        let word = transition.into_bits();

        let hw = HwPte::from_bits(word);
        assert!(!hw.valid());
        assert!(hw.write()); // bit 11 doubles as the transition flag
        assert_eq!(hw.pfn(), PageFrameNumber(0x777));
    }

    #[test]
    fn ws_index_field_is_masked() {
        let pte = HwPte::new().with_software_ws_index(0x7FF);
        assert_eq!(pte.into_bits(), 0x7FF_u64 << 52);
        assert_eq!(pte.software_ws_index(), 0x7FF);
        assert!(!pte.no_execute());
    }
}
