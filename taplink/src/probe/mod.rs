//! Tap-level drivers.
//!
//! Everything in this module moves raw bits: SWD sequences with optional
//! parity, and JTAG TMS/TDI/TDO shifts. The ADI and DTM layers sit on top of
//! the [`RawSwdIo`] and [`RawJtagIo`] traits and never touch pins directly.
//!
//! Exactly one driver implementation is selected when a session is opened:
//! either the [`bitbang`] driver over a pin pair, or the host side of the
//! remote wire protocol (see [`crate::remote::RemoteProbe`]).

pub mod bitbang;
pub(crate) mod common;
pub mod fake;
pub mod jtag;

use std::time::Duration;

use crate::remote::RemoteError;

pub use common::IdCode;
pub use jtag::{JtagChain, JtagDevice, ScanChainError};

/// An error at the probe driver layer.
///
/// This layer produces raw bits; protocol-level failures (WAIT, FAULT,
/// parity) are reported by the DAP transports instead.
#[derive(Debug, thiserror::Error)]
pub enum DebugProbeError {
    /// A driver operation did not complete within its deadline.
    #[error("probe operation timed out after {0:?}")]
    Timeout(Duration),
    /// The selected driver cannot perform the requested operation.
    #[error("operation not supported by this probe: {0}")]
    NotSupported(&'static str),
    /// The remote link failed underneath the driver.
    #[error("remote link error")]
    Remote(#[from] RemoteError),
    /// Any other driver failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The wire protocol a session talks to the target with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    /// Two-wire Serial Wire Debug.
    Swd,
    /// IEEE 1149.1 JTAG.
    Jtag,
}

impl std::fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireProtocol::Swd => f.write_str("SWD"),
            WireProtocol::Jtag => f.write_str("JTAG"),
        }
    }
}

/// Who is driving the shared SWDIO wire.
///
/// The SWD drivers track this internally and insert exactly one turnaround
/// cycle when the direction changes; back-to-back sequences in the same
/// direction do not pay for a turnaround.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineDirection {
    /// The probe drives SWDIO.
    Drive,
    /// SWDIO floats so the target can drive it.
    Float,
}

/// Bit-level SWD operations.
///
/// All sequences shift LSB-first. Parity is even parity over the data
/// payload. A parity mismatch on input is reported through the second tuple
/// element, not as an error: the DP layer decides whether the word is
/// salvageable.
pub trait RawSwdIo {
    /// Clock `bits` cycles (at most 32) and sample SWDIO on each.
    fn swd_seq_in(&mut self, bits: u8) -> Result<u32, DebugProbeError>;

    /// Clock `bits` data cycles plus one parity cycle. The returned flag is
    /// `true` when the sampled parity matched the data.
    fn swd_seq_in_parity(&mut self, bits: u8) -> Result<(u32, bool), DebugProbeError>;

    /// Drive the low `bits` bits of `value` onto SWDIO.
    fn swd_seq_out(&mut self, value: u32, bits: u8) -> Result<(), DebugProbeError>;

    /// Drive `value` followed by its even parity bit.
    fn swd_seq_out_parity(&mut self, value: u32, bits: u8) -> Result<(), DebugProbeError>;
}

/// Bit-level JTAG operations.
pub trait RawJtagIo {
    /// Put the TAP into Run-Test/Idle via Test-Logic-Reset
    /// (five consecutive cycles with TMS high).
    fn tap_reset(&mut self) -> Result<(), DebugProbeError>;

    /// Clock a single cycle with the given TMS and TDI values, returning the
    /// sampled TDO.
    fn jtag_next(&mut self, tms: bool, tdi: bool) -> Result<bool, DebugProbeError>;

    /// Clock out a TMS sequence, LSB-first, holding TDI high.
    ///
    /// Implementations backed by a hardware primitive that only takes 7 TMS
    /// bits at a time must chunk longer sequences.
    fn tms_sequence(&mut self, states: u32, cycles: u8) -> Result<(), DebugProbeError>;

    /// Shift `tdi` through the active register, sampling TDO for every bit.
    /// When `final_tms` is set, TMS goes high on the last cycle so the TAP
    /// leaves the shift state.
    fn tdi_tdo_sequence(
        &mut self,
        tdi: &bitvec::slice::BitSlice<u8>,
        final_tms: bool,
    ) -> Result<bitvec::vec::BitVec<u8>, DebugProbeError>;

    /// Shift `tdi` without capturing TDO.
    fn tdi_sequence(
        &mut self,
        tdi: &bitvec::slice::BitSlice<u8>,
        final_tms: bool,
    ) -> Result<(), DebugProbeError> {
        self.tdi_tdo_sequence(tdi, final_tms).map(|_| ())
    }

    /// Clock `cycles` cycles with constant TMS and TDI.
    fn jtag_cycle(&mut self, tms: bool, tdi: bool, cycles: usize) -> Result<(), DebugProbeError>;
}

/// Even parity of the low `bits` bits of `value`.
pub(crate) fn parity(value: u32, bits: u8) -> bool {
    let masked = if bits >= 32 {
        value
    } else {
        value & ((1u32 << bits) - 1)
    };
    masked.count_ones() % 2 == 1
}

#[cfg(test)]
mod tests {
    use super::parity;

    #[test]
    fn parity_is_even_parity() {
        assert!(!parity(0x0000_0000, 32));
        assert!(parity(0x0000_0001, 32));
        assert!(!parity(0x0000_0003, 32));
        // 0xDEADBEEF has 24 set bits.
        assert!(!parity(0xDEAD_BEEF, 32));
    }

    #[test]
    fn parity_masks_to_width() {
        // Only the low four bits participate.
        assert!(parity(0xFFF1, 4));
        assert!(!parity(0xFFF3, 4));
    }
}
