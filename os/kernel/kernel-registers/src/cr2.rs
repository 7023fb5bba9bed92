use kernel_memory_addresses::VirtualAddress;

/// CR2 — Page-Fault Linear Address.
///
/// The processor latches the faulting linear address here before delivering
/// `#PF`; the trap dispatcher reads it into the trap frame.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Cr2(pub VirtualAddress);

#[cfg(feature = "asm")]
impl Cr2 {
    /// Reads the faulting address of the most recent page fault.
    ///
    /// # Safety
    /// CPL0 only.
    #[inline]
    #[must_use]
    pub unsafe fn load_unsafe() -> Self {
        let cr2: u64;
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, preserves_flags));
        }
        Self(VirtualAddress::new(cr2))
    }
}
