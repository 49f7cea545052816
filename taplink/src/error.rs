#![warn(missing_docs)]

use crate::architecture::arm::ArmError;
use crate::architecture::riscv::RiscvError;
use crate::flashing::FlashError;
use crate::probe::DebugProbeError;
use crate::remote::RemoteError;

/// The overarching error type which contains all possible errors as
/// variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error in the probe driver occurred.
    #[error("an error with the usage of the probe occurred")]
    Probe(#[from] DebugProbeError),
    /// An ARM specific error occurred.
    #[error("an ARM specific error occurred")]
    Arm(#[from] ArmError),
    /// A RISC-V specific error occurred.
    #[error("a RISC-V specific error occurred")]
    Riscv(#[source] RiscvError),
    /// A Flash programming error occurred.
    #[error("a flash programming error occurred")]
    Flash(#[from] Box<FlashError>),
    /// The remote protocol failed.
    #[error("a remote protocol error occurred")]
    Remote(#[from] RemoteError),
    /// No registered driver claimed the discovered silicon.
    #[error("no driver claimed the target (designer {designer:#06x}, part {part:#06x})")]
    UnknownTarget {
        /// JEP-106 designer code read from the part, zero when unknown.
        designer: u16,
        /// Part number read from the part, zero when unknown.
        part: u16,
    },
    /// The operation was cancelled from above.
    #[error("operation was cancelled")]
    Cancelled,
    /// Any other error occurred.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<RiscvError> for Error {
    fn from(err: RiscvError) -> Self {
        Error::Riscv(err)
    }
}
