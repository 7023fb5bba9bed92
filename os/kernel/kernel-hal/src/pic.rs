//! # Interrupt Controllers
//!
//! Bring-up of the machine's two interrupt controllers. The legacy 8259
//! pair is initialized the long way (ICW1–ICW4) and then fully masked — its
//! only remaining job is to swallow spurious interrupts on the designated
//! vector. The local APIC is the real controller: enabled through its base
//! MSR, wired vector by vector through the local vector table, and finally
//! unmasked by dropping the task priority to zero.

use crate::apic::{ApicAccess, ApicMode, ApicRegister};
use bitfield_struct::bitfield;
use kernel_ports::{CpuidLeaf, CpuidRegisters, PortSpace, cpuid};
use kernel_registers::msr::{ApicBase, Msr};

/// Command/data ports of the two 8259s.
pub const PIC1_CONTROL_PORT: u16 = 0x20;
pub const PIC1_DATA_PORT: u16 = 0x21;
pub const PIC2_CONTROL_PORT: u16 = 0xA0;
pub const PIC2_DATA_PORT: u16 = 0xA1;

/// Spurious vector of the masked legacy master PIC.
pub const PIC1_VECTOR_SPURIOUS: u8 = 0x37;

/// APIC spurious vector.
#[cfg(target_arch = "x86_64")]
pub const APIC_VECTOR_SPURIOUS: u8 = 0x3F;
#[cfg(target_arch = "x86")]
pub const APIC_VECTOR_SPURIOUS: u8 = 0x1F;

/// APIC error vector.
pub const APIC_VECTOR_ERROR: u8 = 0xE3;

/// APIC profile (timer) vector.
pub const APIC_VECTOR_PROFILE: u8 = 0xFD;

/// APIC performance-counter vector.
pub const APIC_VECTOR_PERF: u8 = 0xFE;

/// APIC NMI vector.
pub const APIC_VECTOR_NMI: u8 = 0xFF;

/// IPI vector.
pub const APIC_VECTOR_IPI: u8 = 0xE1;

/// Flat destination format (xAPIC only).
const APIC_DF_FLAT: u64 = 0xFFFF_FFFF;

/// Logical-destination shift in xAPIC mode.
const APIC_XAPIC_LDR_SHIFT: u32 = 24;

/// 8259 ICW1: edge/level, cascade, and the ICW4 announcement.
#[bitfield(u8, order = Lsb)]
pub struct Icw1 {
    /// Bit 0 — IC4: an ICW4 will follow.
    pub need_icw4: bool,

    /// Bit 1 — SNGL: single controller (clear = cascade).
    pub single_mode: bool,

    /// Bit 2 — ADI: 4-byte call interval (clear = 8).
    pub interval4: bool,

    /// Bit 3 — LTIM: level-triggered (clear = edge).
    pub level_triggered: bool,

    /// Bit 4 — always set: this is an initialization word.
    pub init: bool,

    /// Bits 5–7 — 8080-era vector address bits, zero on x86.
    #[bits(3)]
    pub interrupt_vector_address: u8,
}

/// 8259 ICW3 for the master: bitmask of cascaded inputs.
#[bitfield(u8, order = Lsb)]
pub struct Icw3Master {
    #[bits(2)]
    reserved0: u8,

    /// Bit 2 — a slave hangs off IRQ2.
    pub slave_on_irq2: bool,

    #[bits(5)]
    reserved1: u8,
}

/// 8259 ICW3 for the slave: its cascade identity.
#[bitfield(u8, order = Lsb)]
pub struct Icw3Slave {
    /// Bits 0–2 — slave ID (the IRQ it cascades through).
    #[bits(3)]
    pub slave_id: u8,

    #[bits(5)]
    reserved: u8,
}

/// 8259 ICW4: operating mode details.
#[bitfield(u8, order = Lsb)]
pub struct Icw4 {
    /// Bit 0 — µPM: 8086/8088 mode (clear = 8080).
    pub new_8086_mode: bool,

    /// Bit 1 — AEOI: automatic EOI (clear = normal EOI).
    pub automatic_eoi: bool,

    /// Bit 2 — M/S: buffered master (with bit 3).
    pub buffered_master: bool,

    /// Bit 3 — BUF: buffered mode.
    pub buffered_mode: bool,

    /// Bit 4 — SFNM: special fully nested mode.
    pub special_fully_nested: bool,

    #[bits(3)]
    reserved: u8,
}

/// APIC spurious-interrupt vector register.
#[bitfield(u64, order = Lsb)]
pub struct ApicSpuriousRegister {
    /// Bits 0–7 — spurious vector.
    pub vector: u8,

    /// Bit 8 — APIC software enable.
    pub software_enable: bool,

    /// Bit 9 — focus-processor core checking.
    pub core_checking: bool,

    /// Bits 10–63 — reserved.
    #[bits(54, access = RO)]
    reserved: u64,
}

/// Delivery modes of a local vector table entry.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum ApicDeliveryMode {
    Fixed = 0b000,
    Smi = 0b010,
    Nmi = 0b100,
    Init = 0b101,
    ExtInt = 0b111,
}

impl ApicDeliveryMode {
    const fn into_bits(self) -> u8 {
        self as u8
    }

    const fn from_bits(bits: u8) -> Self {
        match bits {
            0b010 => Self::Smi,
            0b100 => Self::Nmi,
            0b101 => Self::Init,
            0b111 => Self::ExtInt,
            _ => Self::Fixed,
        }
    }
}

/// A local vector table entry.
#[bitfield(u64, order = Lsb)]
pub struct ApicLvtRegister {
    /// Bits 0–7 — vector.
    pub vector: u8,

    /// Bits 8–10 — delivery mode.
    #[bits(3)]
    pub delivery_mode: ApicDeliveryMode,

    /// Bit 11 — reserved.
    #[bits(access = RO)]
    reserved0: bool,

    /// Bit 12 — delivery status (read-only on hardware).
    pub delivery_status: bool,

    /// Bit 13 — input pin polarity.
    pub polarity: bool,

    /// Bit 14 — remote IRR.
    pub remote_irr: bool,

    /// Bit 15 — level-triggered (clear = edge).
    pub level_triggered: bool,

    /// Bit 16 — masked.
    pub mask: bool,

    /// Bit 17 — periodic timer mode.
    pub timer_mode: bool,

    /// Bits 18–63 — reserved.
    #[bits(46, access = RO)]
    reserved1: u64,
}

/// Checks whether the processor supports x2APIC mode.
#[must_use]
pub fn check_x2apic_support() -> bool {
    let mut registers = CpuidRegisters::for_leaf(CpuidLeaf::StandardFeatures);
    cpuid(&mut registers);
    registers.ecx & kernel_ports::CPUID_FEATURES_ECX_X2APIC != 0
}

/// Globally enables the local APIC, selecting x2APIC mode when asked and
/// marking the bootstrap processor.
///
/// Returns the mode that was enabled.
///
/// # Safety
/// CPL0 only; call once per processor during bring-up.
pub unsafe fn enable_apic(cpu_number: u32, want_x2apic: bool) -> ApicMode {
    let mode = if want_x2apic {
        ApicMode::X2Apic
    } else {
        ApicMode::Compat
    };

    // SAFETY: CPL0 per this function's contract.
    unsafe {
        let base = ApicBase::from_bits(Msr::IA32_APIC_BASE.load_raw())
            .with_enable(true)
            .with_extended_mode(mode == ApicMode::X2Apic)
            .with_bootstrap_processor(cpu_number == 0);
        Msr::IA32_APIC_BASE.store_raw(base.into_bits());
    }
    mode
}

/// Programs the local APIC's vector table and unmasks it.
///
/// `register_handler` wires a dispatcher entry for the spurious vectors
/// (both the APIC's and the legacy master's).
pub fn initialize_apic<A: ApicAccess>(
    apic: &mut A,
    cpu_number: u32,
    mut register_handler: impl FnMut(u8, fn()),
) {
    // Mask everything while the vector table is rewired.
    apic.write(ApicRegister::TaskPriority, 0xFF);

    if apic.mode() == ApicMode::Compat {
        // Flat logical destination model; both registers are read-only or
        // absent in x2APIC mode.
        apic.write(ApicRegister::DestinationFormat, APIC_DF_FLAT);
        apic.write(
            ApicRegister::LogicalDestination,
            u64::from(1u32 << cpu_number) << APIC_XAPIC_LDR_SHIFT,
        );
    }

    // Spurious vector, software-enabled, no core checking.
    let spurious = ApicSpuriousRegister::from_bits(apic.read(ApicRegister::SpuriousInterruptVector))
        .with_vector(APIC_VECTOR_SPURIOUS)
        .with_software_enable(true)
        .with_core_checking(false);
    apic.write(ApicRegister::SpuriousInterruptVector, spurious.into_bits());

    // APIC errors on a dedicated vector.
    apic.write(ApicRegister::ErrorVectorTable, u64::from(APIC_VECTOR_ERROR));

    // Timer: masked, periodic, edge-triggered.
    let timer = ApicLvtRegister::new()
        .with_mask(true)
        .with_delivery_mode(ApicDeliveryMode::Fixed)
        .with_timer_mode(true)
        .with_vector(APIC_VECTOR_PROFILE);
    apic.write(ApicRegister::TimerVectorTable, timer.into_bits());

    // Performance counter overflow: unmasked, one-shot, edge-triggered.
    let perf = ApicLvtRegister::new()
        .with_mask(false)
        .with_delivery_mode(ApicDeliveryMode::Fixed)
        .with_vector(APIC_VECTOR_PERF);
    apic.write(ApicRegister::PerformanceCounter, perf.into_bits());

    // LINT0: masked, fixed, edge, spurious vector.
    let lint0 = ApicLvtRegister::new()
        .with_mask(true)
        .with_delivery_mode(ApicDeliveryMode::Fixed)
        .with_vector(APIC_VECTOR_SPURIOUS);
    apic.write(ApicRegister::LocalInterrupt0, lint0.into_bits());

    // LINT1: unmasked NMI, edge.
    let lint1 = ApicLvtRegister::new()
        .with_mask(false)
        .with_delivery_mode(ApicDeliveryMode::Nmi)
        .with_vector(APIC_VECTOR_NMI);
    apic.write(ApicRegister::LocalInterrupt1, lint1.into_bits());

    // Spurious deliveries just return.
    register_handler(APIC_VECTOR_SPURIOUS, handle_apic_spurious);
    register_handler(PIC1_VECTOR_SPURIOUS, handle_pic_spurious);

    // Drop any stale error state, then unmask.
    apic.write(ApicRegister::ErrorStatus, 0);
    apic.write(ApicRegister::TaskPriority, 0x00);
}

/// Masks the legacy 8259 pair behind the APIC.
///
/// Full initialization sequence (ICW1–ICW4) on both controllers, then all
/// eight lines masked on each.
pub fn initialize_legacy_pic<P: PortSpace>(ports: &mut P) {
    let icw1 = Icw1::new()
        .with_init(true)
        .with_level_triggered(false)
        .with_interrupt_vector_address(0)
        .with_interval4(false)
        .with_need_icw4(true)
        .with_single_mode(false);
    let icw4 = Icw4::new()
        .with_new_8086_mode(true)
        .with_automatic_eoi(false)
        .with_buffered_mode(false)
        .with_buffered_master(false)
        .with_special_fully_nested(false);

    // Master: vectors at offset 0, slave cascaded on IRQ2.
    ports.write(PIC1_CONTROL_PORT, icw1.into_bits());
    ports.write(PIC1_DATA_PORT, 0x00);
    ports.write(
        PIC1_DATA_PORT,
        Icw3Master::new().with_slave_on_irq2(true).into_bits(),
    );
    ports.write(PIC1_DATA_PORT, icw4.into_bits());
    ports.write(PIC1_DATA_PORT, 0xFF);

    // Slave: vectors at offset 8, cascade identity 2.
    ports.write(PIC2_CONTROL_PORT, icw1.into_bits());
    ports.write(PIC2_DATA_PORT, 0x08);
    ports.write(PIC2_DATA_PORT, Icw3Slave::new().with_slave_id(2).into_bits());
    ports.write(PIC2_DATA_PORT, icw4.into_bits());
    ports.write(PIC2_DATA_PORT, 0xFF);
}

/// Local APIC ID of the current processor.
pub fn get_cpu_apic_id<A: ApicAccess>(apic: &mut A) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    let id = apic.read(ApicRegister::Id) as u32;
    if apic.mode() == ApicMode::Compat {
        id >> APIC_XAPIC_LDR_SHIFT
    } else {
        id
    }
}

/// Sends an inter-processor interrupt to the processor with `apic_id`.
pub fn send_ipi<A: ApicAccess>(apic: &mut A, apic_id: u32, vector: u8) {
    if apic.mode() == ApicMode::X2Apic {
        // One 64-bit ICR write carries destination and vector.
        apic.write(
            ApicRegister::InterruptCommandLow,
            (u64::from(apic_id) << 32) | u64::from(vector),
        );
    } else {
        // Two-register sequence; the low write initiates the send.
        apic.write(
            ApicRegister::InterruptCommandHigh,
            u64::from(apic_id) << APIC_XAPIC_LDR_SHIFT,
        );
        apic.write(ApicRegister::InterruptCommandLow, u64::from(vector));
    }
}

/// Signals end-of-interrupt to the local APIC.
pub fn send_eoi<A: ApicAccess>(apic: &mut A) {
    apic.write(ApicRegister::EndOfInterrupt, 0);
}

/// Clears the APIC error status register.
pub fn clear_apic_errors<A: ApicAccess>(apic: &mut A) {
    apic.write(ApicRegister::ErrorStatus, 0);
}

/// Spurious APIC interrupts end here.
fn handle_apic_spurious() {}

/// Spurious legacy-PIC interrupts end here.
fn handle_pic_spurious() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apic::test_support::FakeApic;

    struct FakePorts {
        writes: Vec<(u16, u8)>,
    }

    impl PortSpace for FakePorts {
        fn read(&mut self, _port: u16) -> u8 {
            0
        }
        fn write(&mut self, port: u16, value: u8) {
            self.writes.push((port, value));
        }
    }

    #[test]
    fn apic_initialization_leaves_the_controller_open() {
        let mut apic = FakeApic::new(ApicMode::X2Apic);
        let mut handlers = Vec::new();
        initialize_apic(&mut apic, 0, |vector, _| handlers.push(vector));

        // Final TPR is zero: nothing masked by priority.
        assert_eq!(apic.read(ApicRegister::TaskPriority), 0);

        // LINT1 delivers NMIs on vector 0xFF, unmasked.
        let lint1 = ApicLvtRegister::from_bits(apic.read(ApicRegister::LocalInterrupt1));
        assert_eq!(lint1.vector(), APIC_VECTOR_NMI);
        assert_eq!(lint1.delivery_mode(), ApicDeliveryMode::Nmi);
        assert!(!lint1.mask());

        // Spurious vector installed and software-enabled.
        let spurious =
            ApicSpuriousRegister::from_bits(apic.read(ApicRegister::SpuriousInterruptVector));
        assert_eq!(spurious.vector(), APIC_VECTOR_SPURIOUS);
        assert!(spurious.software_enable());
        assert!(!spurious.core_checking());

        // Timer masked and periodic; both spurious handlers registered.
        let timer = ApicLvtRegister::from_bits(apic.read(ApicRegister::TimerVectorTable));
        assert!(timer.mask());
        assert!(timer.timer_mode());
        assert_eq!(handlers, vec![APIC_VECTOR_SPURIOUS, PIC1_VECTOR_SPURIOUS]);

        // x2APIC mode never touches DFR/LDR.
        assert!(
            !apic
                .writes
                .iter()
                .any(|(r, _)| *r == ApicRegister::DestinationFormat
                    || *r == ApicRegister::LogicalDestination)
        );

        // The very first write masked everything.
        assert_eq!(apic.writes[0], (ApicRegister::TaskPriority, 0xFF));
    }

    #[test]
    fn compat_mode_programs_the_destination_registers() {
        let mut apic = FakeApic::new(ApicMode::Compat);
        initialize_apic(&mut apic, 1, |_, _| {});
        assert_eq!(apic.read(ApicRegister::DestinationFormat), APIC_DF_FLAT);
        assert_eq!(apic.read(ApicRegister::LogicalDestination), 2 << 24);
    }

    #[test]
    fn legacy_pic_ends_fully_masked() {
        let mut ports = FakePorts { writes: Vec::new() };
        initialize_legacy_pic(&mut ports);

        // ICW1 to both control ports: init + cascade + need-ICW4, edge.
        assert_eq!(ports.writes[0], (PIC1_CONTROL_PORT, 0x11));
        assert_eq!(ports.writes[5], (PIC2_CONTROL_PORT, 0x11));

        // Vector offsets 0x00 / 0x08, cascade wiring, 8086 mode.
        assert_eq!(ports.writes[1], (PIC1_DATA_PORT, 0x00));
        assert_eq!(ports.writes[2], (PIC1_DATA_PORT, 0x04));
        assert_eq!(ports.writes[3], (PIC1_DATA_PORT, 0x01));
        assert_eq!(ports.writes[6], (PIC2_DATA_PORT, 0x08));
        assert_eq!(ports.writes[7], (PIC2_DATA_PORT, 0x02));
        assert_eq!(ports.writes[8], (PIC2_DATA_PORT, 0x01));

        // Both controllers end with every line masked.
        assert_eq!(ports.writes[4], (PIC1_DATA_PORT, 0xFF));
        assert_eq!(ports.writes[9], (PIC2_DATA_PORT, 0xFF));
    }

    #[test]
    fn ipi_encoding_differs_by_mode() {
        let mut apic = FakeApic::new(ApicMode::X2Apic);
        send_ipi(&mut apic, 3, APIC_VECTOR_IPI);
        assert_eq!(
            apic.writes,
            vec![(ApicRegister::InterruptCommandLow, (3u64 << 32) | 0xE1)]
        );

        let mut apic = FakeApic::new(ApicMode::Compat);
        send_ipi(&mut apic, 3, APIC_VECTOR_IPI);
        assert_eq!(
            apic.writes,
            vec![
                (ApicRegister::InterruptCommandHigh, 3u64 << 24),
                (ApicRegister::InterruptCommandLow, 0xE1),
            ]
        );
    }

    #[test]
    fn apic_id_decoding() {
        let mut apic = FakeApic::new(ApicMode::Compat);
        apic.registers.insert(ApicRegister::Id as u32, 5 << 24);
        assert_eq!(get_cpu_apic_id(&mut apic), 5);

        let mut apic = FakeApic::new(ApicMode::X2Apic);
        apic.registers.insert(ApicRegister::Id as u32, 5);
        assert_eq!(get_cpu_apic_id(&mut apic), 5);
    }

    #[test]
    fn eoi_writes_zero() {
        let mut apic = FakeApic::new(ApicMode::X2Apic);
        send_eoi(&mut apic);
        assert_eq!(apic.writes, vec![(ApicRegister::EndOfInterrupt, 0)]);
    }
}
