//! ARM core drivers.

pub mod armv7m;
pub mod cortex_m;

use bitfield::bitfield;

use crate::core::{HaltReason, MemoryMappedRegister};

bitfield! {
    /// Debug Fault Status Register. Sticky; write-1-clear.
    #[derive(Copy, Clone)]
    pub struct Dfsr(u32);
    impl Debug;
    /// An external debug request halted the core.
    pub external, set_external: 4;
    /// A vector catch triggered.
    pub vcatch, set_vcatch: 3;
    /// The DWT halted the core.
    pub dwttrap, set_dwttrap: 2;
    /// A breakpoint (FPB or BKPT instruction) halted the core.
    pub bkpt, set_bkpt: 1;
    /// C_HALT or C_STEP halted the core.
    pub halted, set_halted: 0;
}

impl Dfsr {
    /// A value that clears every sticky flag when written back.
    pub fn clear_all() -> Self {
        Dfsr(0b11111)
    }

    /// Decode the halt reason. Single-step detection needs resume-time
    /// context, so `stepping` comes from the driver.
    pub fn halt_reason(&self, stepping: bool) -> HaltReason {
        if self.bkpt() {
            HaltReason::Breakpoint
        } else if self.dwttrap() {
            HaltReason::Watchpoint { address: None }
        } else if self.vcatch() {
            HaltReason::Fault
        } else if self.external() {
            HaltReason::External
        } else if self.halted() {
            if stepping {
                HaltReason::Step
            } else {
                HaltReason::Request
            }
        } else {
            HaltReason::Unknown
        }
    }
}

impl From<u32> for Dfsr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dfsr> for u32 {
    fn from(value: Dfsr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Dfsr {
    const ADDRESS: u32 = 0xE000_ED30;
    const NAME: &'static str = "DFSR";
}

/// Per-core state that outlives a single borrow of the memory interface.
#[derive(Debug, Default)]
pub struct CortexMState {
    /// Whether debug was enabled and the comparator inventory read.
    pub(crate) initialized: bool,
    /// FPB revision (1 or 2), deciding the comparator encoding.
    pub(crate) fpb_rev: u8,
    /// Instruction comparators, `true` when occupied.
    pub(crate) fpb_slots: Vec<bool>,
    /// Data comparators, `true` when occupied.
    pub(crate) dwt_slots: Vec<bool>,
    /// Whether a single step was requested by the last resume.
    pub(crate) stepping: bool,
    /// Whether an FPU was detected.
    pub fp_present: bool,
}
