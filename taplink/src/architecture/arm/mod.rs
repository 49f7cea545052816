//! ARM ADIv5/ADIv6 debug stack: DP and AP register files, the SWD and JTAG
//! DAP transports, MEM-AP memory access, ROM tables and the Cortex-M core
//! driver.

pub mod ap;
pub mod communication_interface;
pub mod core;
pub mod dap;
pub mod dp;
pub mod memory;

pub use communication_interface::{ArmCommunicationInterface, DapAccess};
pub use dap::{RawDapAccess, WAIT_RETRY_DEADLINE};

use crate::probe::{DebugProbeError, ScanChainError};

/// An error in the communication with an access port or debug port.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq, Copy)]
pub enum DapError {
    /// Corrupted or unintelligible traffic on the SWD wire.
    #[error("an error occurred in the SWD communication between probe and device")]
    SwdProtocol,
    /// The target did not drive an acknowledge at all.
    #[error("target device did not respond to the request")]
    NoAcknowledge,
    /// The target answered the request with FAULT.
    #[error("target device responded with a FAULT response to the request")]
    FaultResponse,
    /// The target answered the request with WAIT for longer than the retry
    /// deadline.
    #[error("target device responded only with WAIT responses to the request")]
    WaitResponse,
    /// The parity over the read payload did not match.
    #[error("incorrect parity on READ request")]
    IncorrectParity,
}

/// An ARM-specific error.
#[derive(Debug, thiserror::Error)]
pub enum ArmError {
    /// The tap driver failed underneath the DAP.
    #[error("probe error")]
    Probe(#[from] DebugProbeError),
    /// A DP/AP transaction failed on the wire.
    #[error("DAP transaction failed")]
    Dap(#[from] DapError),
    /// Enumerating the JTAG scan chain failed.
    #[error("scan chain error")]
    ScanChain(#[from] ScanChainError),
    /// An operation did not finish within its deadline.
    #[error("timeout occurred during operation")]
    Timeout,
    /// A memory access violated its alignment requirement.
    #[error("address {address:#010x} is not aligned to {alignment} bytes")]
    BadAlignment {
        /// The offending address.
        address: u32,
        /// The required alignment in bytes.
        alignment: usize,
    },
    /// A memory access fell outside the addressable range.
    #[error("address {address:#010x} is out of range")]
    OutOfRange {
        /// The first address outside the supported range.
        address: u32,
    },
    /// The operation requires a capability this DP/AP does not advertise.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),
    /// No target responded to the connect sequence.
    #[error("no debug port responded on the wire")]
    NoResponse,
    /// A ROM table entry could not be parsed.
    #[error("ROM table parse error: {0}")]
    RomTable(&'static str),
    /// Any other ARM-side failure.
    #[error("{0}")]
    Other(String),
}

/// DP or AP register space selector for a raw DAP transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortType {
    /// The debug port's own register file.
    DebugPort,
    /// The currently selected access port.
    AccessPort,
}

/// Address of a debug port on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DpAddress {
    /// The only DP on a classic (non-multidrop) wire.
    Default,
    /// An SWDv2 multidrop DP, selected by its TARGETSEL value.
    Multidrop(u32),
}

/// Address of an access port behind a DP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ApAddress {
    /// ADIv5: the 8-bit APSEL.
    V1(u8),
    /// ADIv6: the AP's base address in the DP address space.
    V2(u64),
}

/// An AP address qualified with the DP it lives behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FullyQualifiedApAddress {
    dp: DpAddress,
    ap: ApAddress,
}

impl FullyQualifiedApAddress {
    /// An ADIv5 AP behind the default DP.
    pub fn v1_with_default_dp(ap: u8) -> Self {
        Self {
            dp: DpAddress::Default,
            ap: ApAddress::V1(ap),
        }
    }

    /// An ADIv6 AP behind the default DP.
    pub fn v2_with_default_dp(ap: u64) -> Self {
        Self {
            dp: DpAddress::Default,
            ap: ApAddress::V2(ap),
        }
    }

    /// An AP behind a specific DP.
    pub fn new(dp: DpAddress, ap: ApAddress) -> Self {
        Self { dp, ap }
    }

    /// The debug port half of the address.
    pub fn dp(&self) -> DpAddress {
        self.dp
    }

    /// The access port half of the address.
    pub fn ap(&self) -> ApAddress {
        self.ap
    }
}

/// A 32-bit architected register with a fixed address.
pub trait Register: Clone + From<u32> + Into<u32> + Sized + std::fmt::Debug {
    /// Register address. For DP registers the in-bank address, for AP
    /// registers the full byte offset including the bank nibble.
    const ADDRESS: u8;
    /// Architected name.
    const NAME: &'static str;
}

/// Bank selection requirement of a DP register.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum DpBankSel {
    /// The register decodes in every bank.
    DontCare,
    /// DPBANKSEL must hold this value.
    Bank(u8),
}

/// A register in the debug port's register file.
pub trait DpRegister: Register {
    /// Which DPBANKSEL value this register needs.
    const BANK: DpBankSel;
}

/// A register in an access port's register file.
pub trait ApRegister: Register {}
