use crate::msr::Msr;
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// IA32_EFER — Extended Feature Enable Register (MSR `0xC000_0080`).
#[bitfield(u64, order = Lsb)]
pub struct Efer {
    /// Bit 0 — SCE: SYSCALL/SYSRET enable.
    pub sce: bool,

    /// Bits 1–7 — Reserved.
    #[bits(7, access = RO)]
    reserved0: u8,

    /// Bit 8 — LME: Long Mode Enable.
    pub lme: bool,

    /// Bit 9 — Reserved.
    #[bits(access = RO)]
    reserved1: bool,

    /// Bit 10 — LMA: Long Mode Active (read-only in practice).
    pub lma: bool,

    /// Bit 11 — NXE: No-Execute Enable.
    pub nxe: bool,

    /// Bits 12–63 — Reserved.
    #[bits(52, access = RO)]
    reserved2: u64,
}

impl Efer {
    /// The MSR index this register lives at.
    pub const MSR: Msr = Msr::IA32_EFER;
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Efer {
    unsafe fn load_unsafe() -> Self {
        Self::from_bits(unsafe { Self::MSR.load_raw() })
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Efer {
    unsafe fn store_unsafe(self) {
        unsafe { Self::MSR.store_raw(self.into_bits()) }
    }
}
