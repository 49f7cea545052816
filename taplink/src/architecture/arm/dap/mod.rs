//! DAP transports: the transaction layer between the tap drivers and the
//! DP/AP register files.
//!
//! Both transports implement [`RawDapAccess`]. WAIT answers are retried
//! against a deadline inside the transport; FAULT and parity failures
//! propagate so the communication interface can run the sticky-error
//! recovery.

pub mod jtag;
pub mod swd;

use std::time::Duration;

use super::{ArmError, DpAddress, PortType};
use crate::probe::WireProtocol;

pub use jtag::JtagDapInterface;
pub use swd::SwdDapInterface;

/// How long a transport keeps retrying a WAIT-ing target before giving up.
pub const WAIT_RETRY_DEADLINE: Duration = Duration::from_millis(250);

/// Raw register-level access to a debug port and its currently selected
/// access port.
///
/// Addresses are the in-bank byte offsets (`0x0`, `0x4`, `0x8`, `0xC`);
/// bank routing happens above this trait through SELECT.
pub trait RawDapAccess {
    /// Read a DP or AP register.
    ///
    /// AP reads are posted: the transport issues the access and drains the
    /// result through RDBUFF before returning.
    fn raw_read_register(&mut self, port: PortType, address: u8) -> Result<u32, ArmError>;

    /// Write a DP or AP register.
    fn raw_write_register(
        &mut self,
        port: PortType,
        address: u8,
        value: u32,
    ) -> Result<(), ArmError>;

    /// Read the same register repeatedly, e.g. DRW bursts. Posted AP reads
    /// pipeline with a single extra access at the end.
    fn raw_read_block(
        &mut self,
        port: PortType,
        address: u8,
        values: &mut [u32],
    ) -> Result<(), ArmError> {
        for value in values.iter_mut() {
            *value = self.raw_read_register(port, address)?;
        }
        Ok(())
    }

    /// Write the same register repeatedly.
    fn raw_write_block(
        &mut self,
        port: PortType,
        address: u8,
        values: &[u32],
    ) -> Result<(), ArmError> {
        for value in values {
            self.raw_write_register(port, address, *value)?;
        }
        Ok(())
    }

    /// Bring the wire up and select `dp`, returning the raw DPIDR.
    fn connect(&mut self, dp: DpAddress) -> Result<u32, ArmError>;

    /// Reset transport-internal line state after an error, without touching
    /// the target.
    fn reset_line_state(&mut self);

    /// The wire protocol this transport drives.
    fn protocol(&self) -> WireProtocol;
}
