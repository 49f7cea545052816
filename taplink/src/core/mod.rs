//! Architecture-independent core control.

use std::time::Duration;

use crate::Error;

/// What the core is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreStatus {
    /// Executing instructions.
    Running,
    /// In debug state, with the decoded reason.
    Halted(HaltReason),
    /// Waiting for an interrupt or event.
    Sleeping,
    /// Not determined yet.
    Unknown,
}

impl CoreStatus {
    /// Whether the core is halted.
    pub fn is_halted(&self) -> bool {
        matches!(self, CoreStatus::Halted(_))
    }
}

/// Why a core entered debug state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// A breakpoint comparator or a BKPT instruction.
    Breakpoint,
    /// A data watchpoint, with the matched comparator address when the
    /// hardware reports one.
    Watchpoint {
        /// Address programmed into the comparator that fired.
        address: Option<u32>,
    },
    /// A single step completed.
    Step,
    /// An explicit halt request.
    Request,
    /// A vector catch or escalated fault.
    Fault,
    /// An external debug request signal.
    External,
    /// The hardware gave no usable reason.
    Unknown,
}

/// The kind of a breakwatch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakwatchKind {
    /// Instruction breakpoint.
    Breakpoint,
    /// Watchpoint on reads.
    WatchRead,
    /// Watchpoint on writes.
    WatchWrite,
    /// Watchpoint on any access.
    WatchAccess,
}

/// One breakpoint or watchpoint owned by a target.
///
/// `slot` is the hardware comparator the core driver picked when the entry
/// was set; clearing the entry returns the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakwatch {
    /// What to match.
    pub kind: BreakwatchKind,
    /// Address to match.
    pub address: u32,
    /// Match size in bytes; 1, 2 or 4 for watchpoints, 2 or 4 for
    /// breakpoints.
    pub size: u32,
    /// Hardware comparator index, valid while the entry is set.
    pub slot: usize,
}

/// Exception classes a core can be told to halt on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorCatch {
    /// Halt on HardFault.
    HardFault,
    /// Halt on a fault during exception entry or return.
    InterruptError,
    /// Halt on BusFault.
    BusFault,
    /// Halt on state information errors (e.g. undefined instructions).
    StateError,
    /// Halt on checking errors (e.g. alignment).
    CheckError,
    /// Halt on coprocessor access errors.
    NoCoprocessorError,
    /// Halt on MemManage faults.
    MemManageError,
    /// Halt out of reset.
    CoreReset,
}

/// A core register selector, architecture-defined numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterId(pub u16);

/// A 32-bit register mapped into the target's memory.
pub trait MemoryMappedRegister: Clone + From<u32> + Into<u32> {
    /// Where the register lives.
    const ADDRESS: u32;
    /// Architected name.
    const NAME: &'static str;
}

/// Driver operations every supported core provides.
///
/// Implementations borrow a memory interface for the duration of the call
/// chain; the target owns the persistent state.
pub trait CoreInterface {
    /// Determine the current status without blocking, decoding the halt
    /// reason if the core sits in debug state.
    fn status(&mut self) -> Result<CoreStatus, Error>;

    /// Request a halt and wait for the core to enter debug state.
    fn halt(&mut self, timeout: Duration) -> Result<(), Error>;

    /// Leave debug state.
    fn run(&mut self) -> Result<(), Error>;

    /// Execute one instruction and halt again.
    fn step(&mut self) -> Result<(), Error>;

    /// Reset the core, optionally catching the reset vector so the core
    /// halts before the first instruction.
    fn reset(&mut self, halt: bool) -> Result<(), Error>;

    /// Read a core register.
    fn read_core_reg(&mut self, id: RegisterId) -> Result<u32, Error>;

    /// Write a core register.
    fn write_core_reg(&mut self, id: RegisterId, value: u32) -> Result<(), Error>;

    /// Program a hardware comparator for `entry` and record the allocated
    /// slot in it.
    fn set_breakwatch(&mut self, entry: &mut Breakwatch) -> Result<(), Error>;

    /// Free the comparator an entry occupies.
    fn clear_breakwatch(&mut self, entry: &Breakwatch) -> Result<(), Error>;

    /// Enable or disable halting on an exception class.
    fn set_vector_catch(&mut self, catch: VectorCatch, enable: bool) -> Result<(), Error>;

    /// Short architecture name for the memory map and monitor output.
    fn architecture(&self) -> &'static str;
}
