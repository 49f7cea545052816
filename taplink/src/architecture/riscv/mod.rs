//! RISC-V debug stack: the Debug Transport Module transports and the
//! Debug Module driver.

pub mod communication_interface;
pub mod dtm;

pub use communication_interface::RiscvCommunicationInterface;
pub use dtm::{DtmAccess, JtagDtm};

use crate::probe::DebugProbeError;

/// A RISC-V specific error.
#[derive(Debug, thiserror::Error)]
pub enum RiscvError {
    /// The tap driver failed underneath the DTM.
    #[error("probe error")]
    Probe(#[from] DebugProbeError),
    /// A DMI transaction reported a failure status.
    #[error("DMI transfer failed with status {0}")]
    DmiFailed(u8),
    /// The DTM stayed busy past the retry deadline.
    #[error("DMI transfer timed out in the busy state")]
    DmiBusy,
    /// An operation did not finish within its deadline.
    #[error("timeout occurred during operation")]
    Timeout,
    /// An abstract command failed; the value is ABSTRACTCS.CMDERR.
    #[error("abstract command failed with cmderr {0}")]
    AbstractCommand(u8),
    /// The DTM speaks a spec version this driver does not.
    #[error("unsupported debug transport module version {0}")]
    UnsupportedDtmVersion(u8),
    /// The Debug Module lacks a capability the operation needs.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),
}
