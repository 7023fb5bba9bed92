//! # Local APIC Access
//!
//! The local APIC exposes the same register file two ways: as an MMIO page
//! in xAPIC compatibility mode (register index × 16 added to the APIC
//! base), or as an MSR range in x2APIC mode (register index added to the
//! MSR base). [`ApicAccess`] abstracts the difference; [`HardwareApic`]
//! talks to the real controller, and unit tests use an array-backed
//! register file.

use kernel_registers::msr::Msr;

/// APIC register indices (the 8-bit architectural offsets).
#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ApicRegister {
    /// Local APIC ID.
    Id = 0x02,
    /// Version.
    Version = 0x03,
    /// Task Priority Register.
    TaskPriority = 0x08,
    /// End Of Interrupt.
    EndOfInterrupt = 0x0B,
    /// Logical Destination Register.
    LogicalDestination = 0x0D,
    /// Destination Format Register (xAPIC only).
    DestinationFormat = 0x0E,
    /// Spurious Interrupt Vector Register.
    SpuriousInterruptVector = 0x0F,
    /// Error Status Register.
    ErrorStatus = 0x28,
    /// Interrupt Command Register, low half.
    InterruptCommandLow = 0x30,
    /// Interrupt Command Register, high half (xAPIC only).
    InterruptCommandHigh = 0x31,
    /// LVT: timer.
    TimerVectorTable = 0x32,
    /// LVT: performance counter overflow.
    PerformanceCounter = 0x34,
    /// LVT: LINT0 pin.
    LocalInterrupt0 = 0x35,
    /// LVT: LINT1 pin.
    LocalInterrupt1 = 0x36,
    /// LVT: error.
    ErrorVectorTable = 0x37,
    /// Timer initial count.
    TimerInitialCount = 0x38,
    /// Timer current count.
    TimerCurrentCount = 0x39,
    /// Timer divide configuration.
    TimerDivideConfiguration = 0x3E,
}

/// MMIO base of the APIC register page in xAPIC compatibility mode.
pub const APIC_BASE: u64 = 0xFFFF_FFFF_FFFE_0000;

/// First MSR of the x2APIC register range.
pub const APIC_X2APIC_MSR_BASE: u32 = 0x0000_0800;

/// Addressing mode of the local APIC.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ApicMode {
    /// xAPIC compatibility: MMIO register page.
    Compat,
    /// x2APIC: MSR-addressed registers.
    X2Apic,
}

/// Register-level access to a local APIC.
pub trait ApicAccess {
    /// The addressing mode in effect.
    fn mode(&self) -> ApicMode;

    /// Reads an APIC register.
    fn read(&mut self, register: ApicRegister) -> u64;

    /// Writes an APIC register.
    fn write(&mut self, register: ApicRegister, value: u64);
}

/// The machine's local APIC.
#[derive(Debug)]
pub struct HardwareApic {
    mode: ApicMode,
}

impl HardwareApic {
    /// Binds to the local APIC in the given mode.
    ///
    /// # Safety
    /// In compat mode the APIC MMIO page must be mapped at [`APIC_BASE`];
    /// in x2APIC mode the processor must actually be in x2APIC mode.
    #[must_use]
    pub const unsafe fn new(mode: ApicMode) -> Self {
        Self { mode }
    }
}

impl ApicAccess for HardwareApic {
    fn mode(&self) -> ApicMode {
        self.mode
    }

    fn read(&mut self, register: ApicRegister) -> u64 {
        match self.mode {
            ApicMode::X2Apic => {
                // SAFETY: the constructor vouched for x2APIC mode.
                unsafe { Msr(APIC_X2APIC_MSR_BASE + register as u32).load_raw() }
            }
            ApicMode::Compat => {
                let address = APIC_BASE + (u64::from(register as u32) << 4);
                // SAFETY: the constructor vouched for the MMIO mapping.
                u64::from(unsafe { kernel_ports::read_register32(address as *const u32) })
            }
        }
    }

    fn write(&mut self, register: ApicRegister, value: u64) {
        match self.mode {
            ApicMode::X2Apic => {
                // SAFETY: the constructor vouched for x2APIC mode.
                unsafe { Msr(APIC_X2APIC_MSR_BASE + register as u32).store_raw(value) }
            }
            ApicMode::Compat => {
                let address = APIC_BASE + (u64::from(register as u32) << 4);
                // SAFETY: the constructor vouched for the MMIO mapping.
                #[allow(clippy::cast_possible_truncation)]
                unsafe {
                    kernel_ports::write_register32(address as *mut u32, value as u32);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{ApicAccess, ApicMode, ApicRegister};
    use std::collections::BTreeMap;

    /// An array-backed APIC register file for unit tests.
    pub struct FakeApic {
        pub mode: ApicMode,
        pub registers: BTreeMap<u32, u64>,
        pub writes: Vec<(ApicRegister, u64)>,
    }

    impl FakeApic {
        pub fn new(mode: ApicMode) -> Self {
            Self {
                mode,
                registers: BTreeMap::new(),
                writes: Vec::new(),
            }
        }
    }

    impl ApicAccess for FakeApic {
        fn mode(&self) -> ApicMode {
            self.mode
        }

        fn read(&mut self, register: ApicRegister) -> u64 {
            *self.registers.get(&(register as u32)).unwrap_or(&0)
        }

        fn write(&mut self, register: ApicRegister, value: u64) {
            self.registers.insert(register as u32, value);
            self.writes.push((register, value));
        }
    }
}
