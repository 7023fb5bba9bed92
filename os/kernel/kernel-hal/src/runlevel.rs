//! # Run-Level Management
//!
//! A run level is the software interrupt priority of the current processor,
//! projected onto the local APIC's task priority register. Two fixed tables
//! carry the projection: run level → TPR vector, and TPR priority class →
//! run level. Raising is ordered (new ≥ current) and lowering is ordered
//! (new ≤ current); violating either is a kernel bug and panics.

use crate::apic::{ApicAccess, ApicRegister};

/// The software run levels, lowest to highest priority.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum RunLevel {
    /// Normal thread execution.
    Passive = 0,
    /// Asynchronous procedure calls.
    Apc = 1,
    /// Dispatcher and DPC execution.
    Dispatch = 2,
    /// Device interrupt levels.
    Device1 = 4,
    Device2 = 5,
    Device3 = 6,
    Device4 = 7,
    Device5 = 8,
    Device6 = 9,
    Device7 = 10,
    /// Profiling interrupt.
    Profile = 27,
    /// Clock interrupt.
    Clock = 28,
    /// Inter-processor interrupts.
    Ipi = 29,
    /// Power-failure notification.
    Power = 30,
    /// Everything masked.
    High = 31,
}

/// APIC TPR vectors for the run levels (indexed by run level).
const RUN_LEVEL_TO_TPR: [u8; 32] = [
    0x00, // passive
    0x1F, // APC
    0x28, // dispatch
    0x28, // (alias of dispatch)
    0x51, // device 1
    0x61, // device 2
    0x71, // device 3
    0x81, // device 4
    0x91, // device 5
    0xA1, // device 6
    0xB1, // device 7
    0xB1, 0xB1, 0xB1, 0xB1, 0xB1, 0xB1, 0xB1, 0xB1, 0xB1, 0xB1, 0xB1, 0xB1, 0xB1, 0xB1, 0xB1,
    0xB1, // unassigned levels share device 7
    0xC1, // profile
    0xD1, // clock
    0xE1, // IPI
    0xEF, // power
    0xFF, // high
];

/// Run levels for the sixteen TPR priority classes (indexed by TPR / 16).
const TPR_TO_RUN_LEVEL: [RunLevel; 16] = [
    RunLevel::Passive,
    RunLevel::Apc,
    RunLevel::Dispatch,
    RunLevel::Dispatch,
    RunLevel::Dispatch,
    RunLevel::Device1,
    RunLevel::Device2,
    RunLevel::Device3,
    RunLevel::Device4,
    RunLevel::Device5,
    RunLevel::Device6,
    RunLevel::Device7,
    RunLevel::Profile,
    RunLevel::Clock,
    RunLevel::Ipi,
    RunLevel::High,
];

impl RunLevel {
    /// The TPR vector this run level masks at.
    #[must_use]
    pub const fn to_tpr(self) -> u8 {
        RUN_LEVEL_TO_TPR[self as usize]
    }

    /// The run level a TPR value decodes to.
    #[must_use]
    pub const fn from_tpr(tpr: u8) -> Self {
        TPR_TO_RUN_LEVEL[(tpr / 16) as usize]
    }
}

/// The current processor's run level, read from the TPR.
pub fn get_run_level<A: ApicAccess>(apic: &mut A) -> RunLevel {
    #[allow(clippy::cast_possible_truncation)]
    RunLevel::from_tpr(apic.read(ApicRegister::TaskPriority) as u8)
}

/// Raises the run level to `new_level`, returning the previous level.
///
/// # Panics
/// If `new_level` is below the current level — raising downward is a
/// corruption of the priority discipline.
pub fn raise_run_level<A: ApicAccess>(apic: &mut A, new_level: RunLevel) -> RunLevel {
    let current = get_run_level(apic);
    assert!(
        new_level >= current,
        "run level raise from {current:?} to lower {new_level:?}"
    );
    apic.write(ApicRegister::TaskPriority, u64::from(new_level.to_tpr()));
    current
}

/// Lowers the run level to `new_level`.
///
/// Pending software interrupts between the two levels become deliverable
/// the moment the TPR write lands.
///
/// # Panics
/// If `new_level` is above the current level.
pub fn lower_run_level<A: ApicAccess>(apic: &mut A, new_level: RunLevel) {
    let current = get_run_level(apic);
    assert!(
        new_level <= current,
        "run level lower from {current:?} to higher {new_level:?}"
    );
    apic.write(ApicRegister::TaskPriority, u64::from(new_level.to_tpr()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apic::ApicMode;
    use crate::apic::test_support::FakeApic;

    #[test]
    fn raise_and_lower_round_trip() {
        let mut apic = FakeApic::new(ApicMode::X2Apic);

        // TPR starts at 0: passive.
        assert_eq!(get_run_level(&mut apic), RunLevel::Passive);

        let previous = raise_run_level(&mut apic, RunLevel::Dispatch);
        assert_eq!(previous, RunLevel::Passive);
        assert_eq!(apic.read(ApicRegister::TaskPriority), 0x28);

        let previous = raise_run_level(&mut apic, RunLevel::Clock);
        assert_eq!(previous, RunLevel::Dispatch);
        assert_eq!(apic.read(ApicRegister::TaskPriority), 0xD1);

        lower_run_level(&mut apic, RunLevel::Passive);
        assert_eq!(apic.read(ApicRegister::TaskPriority), 0x00);

        // Lowering at passive again is a no-op, not a violation.
        lower_run_level(&mut apic, RunLevel::Passive);
        assert_eq!(apic.read(ApicRegister::TaskPriority), 0x00);
    }

    #[test]
    fn raise_to_same_level_is_allowed() {
        let mut apic = FakeApic::new(ApicMode::X2Apic);
        raise_run_level(&mut apic, RunLevel::Dispatch);
        let previous = raise_run_level(&mut apic, RunLevel::Dispatch);
        assert_eq!(previous, RunLevel::Dispatch);
    }

    #[test]
    #[should_panic(expected = "run level raise")]
    fn raising_downward_panics() {
        let mut apic = FakeApic::new(ApicMode::X2Apic);
        raise_run_level(&mut apic, RunLevel::Clock);
        raise_run_level(&mut apic, RunLevel::Dispatch);
    }

    #[test]
    #[should_panic(expected = "run level lower")]
    fn lowering_upward_panics() {
        let mut apic = FakeApic::new(ApicMode::X2Apic);
        raise_run_level(&mut apic, RunLevel::Dispatch);
        lower_run_level(&mut apic, RunLevel::Clock);
    }

    #[test]
    fn tpr_projection_inverts() {
        // Every mappable run level survives the round trip through the TPR.
        for level in [
            RunLevel::Passive,
            RunLevel::Apc,
            RunLevel::Dispatch,
            RunLevel::Device1,
            RunLevel::Device4,
            RunLevel::Device7,
            RunLevel::Profile,
            RunLevel::Clock,
            RunLevel::Ipi,
            RunLevel::High,
        ] {
            assert_eq!(RunLevel::from_tpr(level.to_tpr()), level);
        }
    }
}
