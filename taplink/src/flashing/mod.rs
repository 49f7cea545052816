//! The Flash programming engine.
//!
//! Vendor drivers describe their geometry with a [`FlashRegion`] and
//! implement [`FlashDriver`]; the [`FlashContext`] pipeline in
//! [`writer`] turns GDB-style erase/write/done traffic into block-aligned
//! erases and `write_size`-aligned programs through a lazy write buffer.

pub mod stub;
pub mod writer;

pub use stub::{run_stub, StubRequest};
pub use writer::{FlashBank, FlashContext};

use crate::core::CoreInterface;
use crate::memory::MemoryInterface;

/// A Flash programming error. Fatal to the running GDB operation, but the
/// driver locks the controller again so a later attempt can retry.
#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    /// The controller refused the unlock key sequence.
    #[error("flash controller is locked and did not accept the unlock keys")]
    Locked,
    /// An erase operation reported failure.
    #[error("erase failed at address {address:#010x}")]
    EraseFailed {
        /// First address of the failed block.
        address: u32,
    },
    /// A program operation reported failure.
    #[error("programming failed at address {address:#010x}")]
    ProgramFailed {
        /// First address of the failed write.
        address: u32,
    },
    /// The controller stayed busy past the operation deadline.
    #[error("flash operation timed out")]
    Timeout,
    /// The address is not inside any registered Flash region.
    #[error("address {address:#010x} is outside every flash region")]
    OutOfRegion {
        /// The offending address.
        address: u32,
    },
    /// A write violated the region's alignment rules.
    #[error("write at {address:#010x} violates the {alignment}-byte write alignment")]
    Alignment {
        /// The offending address.
        address: u32,
        /// Required alignment.
        alignment: u32,
    },
    /// The region's driver cannot do this (e.g. mass erase).
    #[error("operation not supported by this flash driver")]
    NotSupported,
    /// Target access underneath the driver failed.
    #[error("target access failed during a flash operation")]
    Memory(#[from] crate::Error),
}

/// What a region is currently set up for. A class change flushes the old
/// state and runs the driver's `done`/`prepare` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOperation {
    /// Block erase.
    Erase,
    /// Buffered programming.
    Write,
    /// Full-device erase.
    MassErase,
}

/// Geometry and write semantics of one Flash region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashRegion {
    /// First address of the region.
    pub start: u32,
    /// Region length in bytes.
    pub length: u32,
    /// Erase granularity; erases are aligned to and sized in blocks.
    pub block_size: u32,
    /// Program granularity; every physical write is this size, aligned.
    pub write_size: u32,
    /// Size of the lazy write buffer.
    pub write_buf_size: u32,
    /// The value erased cells read; used to pad partial writes.
    pub erased_byte: u8,
}

impl FlashRegion {
    /// Whether `address` falls inside the region.
    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && address - self.start < self.length
    }

    /// One-past-the-end address.
    pub fn end(&self) -> u32 {
        self.start + self.length
    }
}

/// Everything a driver may touch on the target while programming: the
/// memory path to the controller registers plus run control for drivers
/// that execute stubs. One object, because on a live target the memory
/// path and the core are the same thing.
pub trait TargetAccess: CoreInterface + MemoryInterface {}

impl<T: CoreInterface + MemoryInterface + ?Sized> TargetAccess for T {}

/// A vendor Flash controller state machine.
///
/// Calls arrive with class changes bracketed by `prepare`/`done`; `erase`
/// gets block-aligned addresses and `write` spans aligned to and sized in
/// multiples of `write_size`.
pub trait FlashDriver {
    /// The geometry this driver serves.
    fn region(&self) -> &FlashRegion;

    /// Unlock and configure the controller for `op`.
    fn prepare(
        &mut self,
        access: &mut dyn TargetAccess,
        op: FlashOperation,
    ) -> Result<(), FlashError>;

    /// Erase the block starting at `block_address`.
    fn erase(
        &mut self,
        access: &mut dyn TargetAccess,
        block_address: u32,
    ) -> Result<(), FlashError>;

    /// Program `data` at `address`.
    fn write(
        &mut self,
        access: &mut dyn TargetAccess,
        address: u32,
        data: &[u8],
    ) -> Result<(), FlashError>;

    /// Relock and return the controller to idle. Runs exactly once per
    /// `prepare`, errors included.
    fn done(&mut self, access: &mut dyn TargetAccess) -> Result<(), FlashError>;

    /// Erase the whole device, when the controller has a faster path than
    /// block-by-block.
    fn mass_erase(&mut self, _access: &mut dyn TargetAccess) -> Result<(), FlashError> {
        Err(FlashError::NotSupported)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! A combined core + memory double for flash driver tests.

    use std::time::Duration;

    use crate::core::{
        Breakwatch, CoreInterface, CoreStatus, HaltReason, RegisterId, VectorCatch,
    };
    use crate::memory::mock::MockMemory;
    use crate::memory::MemoryInterface;
    use crate::Error;

    /// A halted target over a [`MockMemory`], with just enough run-control
    /// behaviour for stub handoffs.
    #[derive(Default)]
    pub struct MockTarget {
        /// The backing memory.
        pub memory: MockMemory,
        /// Number of resume requests seen.
        pub resumes: usize,
        /// Status polls answering `Running` before the core "hits the
        /// breakpoint" after a resume.
        pub polls_until_halt: usize,
        /// PC values written.
        pub pc_writes: Vec<u32>,
        pub(crate) running: bool,
    }

    impl CoreInterface for MockTarget {
        fn status(&mut self) -> Result<CoreStatus, Error> {
            if !self.running {
                return Ok(CoreStatus::Halted(HaltReason::Request));
            }
            if self.polls_until_halt > 0 {
                self.polls_until_halt -= 1;
                return Ok(CoreStatus::Running);
            }
            self.running = false;
            Ok(CoreStatus::Halted(HaltReason::Breakpoint))
        }
        fn halt(&mut self, _timeout: Duration) -> Result<(), Error> {
            self.running = false;
            Ok(())
        }
        fn run(&mut self) -> Result<(), Error> {
            self.running = true;
            self.resumes += 1;
            Ok(())
        }
        fn step(&mut self) -> Result<(), Error> {
            Ok(())
        }
        fn reset(&mut self, _halt: bool) -> Result<(), Error> {
            Ok(())
        }
        fn read_core_reg(&mut self, _id: RegisterId) -> Result<u32, Error> {
            Ok(0)
        }
        fn write_core_reg(&mut self, id: RegisterId, value: u32) -> Result<(), Error> {
            if id == RegisterId(15) {
                self.pc_writes.push(value);
            }
            Ok(())
        }
        fn set_breakwatch(&mut self, _entry: &mut Breakwatch) -> Result<(), Error> {
            Ok(())
        }
        fn clear_breakwatch(&mut self, _entry: &Breakwatch) -> Result<(), Error> {
            Ok(())
        }
        fn set_vector_catch(&mut self, _catch: VectorCatch, _enable: bool) -> Result<(), Error> {
            Ok(())
        }
        fn architecture(&self) -> &'static str {
            "mock"
        }
    }

    impl MemoryInterface for MockTarget {
        fn read_word_32(&mut self, address: u32) -> Result<u32, Error> {
            self.memory.read_word_32(address)
        }
        fn read_word_16(&mut self, address: u32) -> Result<u16, Error> {
            self.memory.read_word_16(address)
        }
        fn read_word_8(&mut self, address: u32) -> Result<u8, Error> {
            self.memory.read_word_8(address)
        }
        fn read_32(&mut self, address: u32, data: &mut [u32]) -> Result<(), Error> {
            self.memory.read_32(address, data)
        }
        fn read_16(&mut self, address: u32, data: &mut [u16]) -> Result<(), Error> {
            self.memory.read_16(address, data)
        }
        fn read_8(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error> {
            self.memory.read_8(address, data)
        }
        fn write_word_32(&mut self, address: u32, data: u32) -> Result<(), Error> {
            self.memory.write_word_32(address, data)
        }
        fn write_word_16(&mut self, address: u32, data: u16) -> Result<(), Error> {
            self.memory.write_word_16(address, data)
        }
        fn write_word_8(&mut self, address: u32, data: u8) -> Result<(), Error> {
            self.memory.write_word_8(address, data)
        }
        fn write_32(&mut self, address: u32, data: &[u32]) -> Result<(), Error> {
            self.memory.write_32(address, data)
        }
        fn write_16(&mut self, address: u32, data: &[u16]) -> Result<(), Error> {
            self.memory.write_16(address, data)
        }
        fn write_8(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
            self.memory.write_8(address, data)
        }
    }
}
