use crate::LoadRegister;
use bitfield_struct::bitfield;

/// RFLAGS — processor status flags.
///
/// Bit 9 (`IF`) is the one the platform core cares about: it gates delivery
/// of maskable interrupts and is saved/restored around every interrupt-off
/// critical section.
#[bitfield(u64, order = Lsb)]
pub struct RFlags {
    /// Bit 0 — CF: Carry.
    pub cf: bool,

    /// Bit 1 — Always 1.
    #[bits(access = RO)]
    always_one: bool,

    /// Bit 2 — PF: Parity.
    pub pf: bool,

    /// Bit 3 — Reserved.
    #[bits(access = RO)]
    reserved0: bool,

    /// Bit 4 — AF: Auxiliary carry.
    pub af: bool,

    /// Bit 5 — Reserved.
    #[bits(access = RO)]
    reserved1: bool,

    /// Bit 6 — ZF: Zero.
    pub zf: bool,

    /// Bit 7 — SF: Sign.
    pub sf: bool,

    /// Bit 8 — TF: Trap (single-step).
    pub tf: bool,

    /// Bit 9 — IF: Interrupt enable.
    pub interrupt: bool,

    /// Bit 10 — DF: Direction.
    pub df: bool,

    /// Bit 11 — OF: Overflow.
    pub of: bool,

    /// Bits 12–13 — IOPL: I/O privilege level.
    #[bits(2)]
    pub iopl: u8,

    /// Bit 14 — NT: Nested task.
    pub nt: bool,

    /// Bits 15–63 — Reserved / system flags beyond this layer's interest.
    #[bits(49, access = RO)]
    reserved2: u64,
}

#[cfg(feature = "asm")]
impl LoadRegister for RFlags {
    #[inline]
    fn load() -> Self {
        let rflags: u64;
        unsafe {
            core::arch::asm!("pushfq", "pop {}", out(reg) rflags, options(nomem, preserves_flags));
        }
        Self::from_bits(rflags)
    }
}
