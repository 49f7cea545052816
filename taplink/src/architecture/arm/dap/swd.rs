//! The SWD DAP transport.
//!
//! Requests are an 8-bit header `{start, APnDP, RnW, A2, A3, parity, stop,
//! park}` shifted LSB-first, a 3-bit acknowledge after the turnaround, then
//! 32 data bits plus even parity in whichever direction the header asked
//! for. After every data phase the transport clocks eight idle cycles so
//! ADIv5.0-5.2 parts commit the transaction.

use std::time::Instant;

use super::{RawDapAccess, WAIT_RETRY_DEADLINE};
use crate::architecture::arm::{ArmError, DapError, DpAddress, PortType};
use crate::probe::{parity, RawSwdIo, WireProtocol};

/// SWD acknowledge: OK.
const ACK_OK: u32 = 0b001;
/// SWD acknowledge: WAIT.
const ACK_WAIT: u32 = 0b010;
/// SWD acknowledge: FAULT.
const ACK_FAULT: u32 = 0b100;

/// Idle cycles clocked after the data phase of every transaction.
const IDLE_CYCLES_AFTER_TRANSFER: u8 = 8;

/// The JTAG-to-SWD switch key, shifted LSB-first.
const JTAG_TO_SWD: u32 = 0xE79E;

/// The SW-DP activation code following a dormant selection alert.
const SWD_ACTIVATION_CODE: u32 = 0x1A;

/// The 128-bit dormant selection alert, transmitted low word first.
const SELECTION_ALERT: [u32; 4] = [0x6209_F392, 0x8685_2D95, 0xE3DD_AFE9, 0x19BC_0EA2];

/// SWD transport over any [`RawSwdIo`] tap driver.
#[derive(Debug)]
pub struct SwdDapInterface<P: RawSwdIo> {
    probe: P,
}

impl<P: RawSwdIo> SwdDapInterface<P> {
    /// Wrap a tap driver.
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    /// Direct access to the tap driver.
    pub fn probe_mut(&mut self) -> &mut P {
        &mut self.probe
    }

    /// Release the tap driver.
    pub fn into_probe(self) -> P {
        self.probe
    }

    /// Build the request header for a transaction.
    fn request(port: PortType, read: bool, address: u8) -> u32 {
        let apndp = (port == PortType::AccessPort) as u32;
        let rnw = read as u32;
        let a2 = (address >> 2 & 1) as u32;
        let a3 = (address >> 3 & 1) as u32;
        let body = apndp | rnw << 1 | a2 << 2 | a3 << 3;
        // {start, body, parity(body), stop = 0, park}.
        1 | body << 1 | (parity(body, 4) as u32) << 5 | 1 << 7
    }

    /// One transaction with WAIT retry. Returns the read value, or the
    /// written value echoed back.
    fn transfer(&mut self, port: PortType, read: bool, address: u8, value: u32) -> Result<u32, ArmError> {
        let header = Self::request(port, read, address);
        let deadline = Instant::now() + WAIT_RETRY_DEADLINE;

        loop {
            self.probe.swd_seq_out(header, 8)?;
            let ack = self.probe.swd_seq_in(3)?;

            match ack {
                ACK_OK => {
                    if read {
                        let (value, parity_ok) = self.probe.swd_seq_in_parity(32)?;
                        // The turnaround back to drive rides on the idle
                        // cycles.
                        self.probe.swd_seq_out(0, IDLE_CYCLES_AFTER_TRANSFER)?;
                        if !parity_ok {
                            return Err(DapError::IncorrectParity.into());
                        }
                        return Ok(value);
                    }
                    self.probe.swd_seq_out_parity(value, 32)?;
                    self.probe.swd_seq_out(0, IDLE_CYCLES_AFTER_TRANSFER)?;
                    return Ok(value);
                }
                ACK_WAIT => {
                    if Instant::now() >= deadline {
                        tracing::warn!("SWD WAIT storm exceeded the retry deadline");
                        return Err(DapError::WaitResponse.into());
                    }
                    tracing::trace!("SWD WAIT, retrying");
                }
                ACK_FAULT => {
                    tracing::debug!("SWD FAULT response for {port:?} address {address:#x}");
                    return Err(DapError::FaultResponse.into());
                }
                0b111 => {
                    // Nobody drove the line.
                    return Err(DapError::NoAcknowledge.into());
                }
                _ => return Err(DapError::SwdProtocol.into()),
            }
        }
    }

    /// Clock out a line reset: at least 50 cycles with SWDIO high, followed
    /// by a few idle cycles so the next header is cleanly framed.
    fn line_reset(&mut self) -> Result<(), ArmError> {
        self.probe.swd_seq_out(0xFFFF_FFFF, 32)?;
        self.probe.swd_seq_out(0xFFFF_FFFF, 32)?;
        self.probe.swd_seq_out(0, 4)?;
        Ok(())
    }

    /// Leave dormant state: alert sequence plus the SW-DP activation code.
    fn leave_dormant(&mut self) -> Result<(), ArmError> {
        // At least eight high bits to synchronise the alert detector.
        self.probe.swd_seq_out(0xFF, 8)?;
        for word in SELECTION_ALERT {
            self.probe.swd_seq_out(word, 32)?;
        }
        self.probe.swd_seq_out(0, 4)?;
        self.probe.swd_seq_out(SWD_ACTIVATION_CODE, 8)?;
        Ok(())
    }

    /// Write TARGETSEL under reset. The selected target must not drive an
    /// acknowledge here, so the ACK phase is clocked and ignored.
    fn write_targetsel(&mut self, targetsel: u32) -> Result<(), ArmError> {
        let header = Self::request(PortType::DebugPort, false, 0xC);
        self.probe.swd_seq_out(header, 8)?;
        self.probe.swd_seq_in(3)?;
        self.probe.swd_seq_out_parity(targetsel, 32)?;
        self.probe.swd_seq_out(0, IDLE_CYCLES_AFTER_TRANSFER)?;
        Ok(())
    }

    fn try_connect(&mut self, dp: DpAddress) -> Result<u32, ArmError> {
        self.line_reset()?;
        if let DpAddress::Multidrop(targetsel) = dp {
            self.write_targetsel(targetsel)?;
        }
        self.transfer(PortType::DebugPort, true, 0x0, 0)
    }
}

impl<P: RawSwdIo> RawDapAccess for SwdDapInterface<P> {
    fn raw_read_register(&mut self, port: PortType, address: u8) -> Result<u32, ArmError> {
        match port {
            PortType::DebugPort => self.transfer(port, true, address, 0),
            PortType::AccessPort => {
                // AP reads are posted; drain the result through RDBUFF.
                self.transfer(PortType::AccessPort, true, address, 0)?;
                self.transfer(PortType::DebugPort, true, 0xC, 0)
            }
        }
    }

    fn raw_write_register(
        &mut self,
        port: PortType,
        address: u8,
        value: u32,
    ) -> Result<(), ArmError> {
        self.transfer(port, false, address, value).map(|_| ())
    }

    fn raw_read_block(
        &mut self,
        port: PortType,
        address: u8,
        values: &mut [u32],
    ) -> Result<(), ArmError> {
        if port == PortType::DebugPort || values.is_empty() {
            for value in values.iter_mut() {
                *value = self.raw_read_register(port, address)?;
            }
            return Ok(());
        }

        // Posted-read pipeline: the first access primes the chain, each
        // subsequent access returns its predecessor's data, and RDBUFF
        // drains the final one.
        self.transfer(PortType::AccessPort, true, address, 0)?;
        let len = values.len();
        for value in values[..len - 1].iter_mut() {
            *value = self.transfer(PortType::AccessPort, true, address, 0)?;
        }
        let last = values.len() - 1;
        values[last] = self.transfer(PortType::DebugPort, true, 0xC, 0)?;
        Ok(())
    }

    fn connect(&mut self, dp: DpAddress) -> Result<u32, ArmError> {
        // Assume the target might be in JTAG mode: send the switch key
        // framed by line resets.
        self.line_reset()?;
        self.probe.swd_seq_out(JTAG_TO_SWD, 16)?;

        match self.try_connect(dp) {
            Ok(dpidr) => Ok(dpidr),
            Err(_) => {
                // No response: the part may be dormant.
                tracing::debug!("no DPIDR response, trying dormant wake");
                self.leave_dormant()?;
                let dpidr = self.try_connect(dp).map_err(|_| ArmError::NoResponse)?;
                Ok(dpidr)
            }
        }
    }

    fn reset_line_state(&mut self) {
        // Nothing buffered at this level; the next sequence re-establishes
        // the turnaround direction.
    }

    fn protocol(&self) -> WireProtocol {
        WireProtocol::Swd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake::{SimDap, SwdTargetSim};

    fn interface() -> SwdDapInterface<SwdTargetSim> {
        SwdDapInterface::new(SwdTargetSim::new(SimDap::new()))
    }

    #[test]
    fn request_headers_match_the_architecture() {
        // DPIDR read and RDBUFF read are the classic fixed patterns.
        assert_eq!(SwdDapInterface::<SwdTargetSim>::request(PortType::DebugPort, true, 0x0), 0xA5);
        assert_eq!(SwdDapInterface::<SwdTargetSim>::request(PortType::DebugPort, true, 0xC), 0xBD);
        // CTRL/STAT write.
        assert_eq!(SwdDapInterface::<SwdTargetSim>::request(PortType::DebugPort, false, 0x4), 0xA9);
        // TAR write on the AP.
        assert_eq!(SwdDapInterface::<SwdTargetSim>::request(PortType::AccessPort, false, 0x4), 0x8B);
    }

    #[test]
    fn connect_reads_dpidr() {
        let mut dap = interface();
        let dpidr = dap.connect(DpAddress::Default).unwrap();
        assert_eq!(dpidr, 0x2BA0_1477);
        assert!(dap.probe_mut().saw_jtag_to_swd);
        assert!(dap.probe_mut().line_resets >= 2);
    }

    #[test]
    fn connect_wakes_a_dormant_target() {
        let mut sim = SwdTargetSim::new(SimDap::new());
        sim.dormant = true;
        let mut dap = SwdDapInterface::new(sim);

        let dpidr = dap.connect(DpAddress::Default).unwrap();
        assert_eq!(dpidr, 0x2BA0_1477);
        assert_eq!(dap.probe_mut().selection_alerts, 1);
    }

    #[test]
    fn wait_storm_completes_within_deadline() {
        let mut dap = interface();
        dap.probe_mut().dap.wait_responses = 10;

        let started = Instant::now();
        let dpidr = dap.raw_read_register(PortType::DebugPort, 0x0).unwrap();
        assert_eq!(dpidr, 0x2BA0_1477);
        assert!(started.elapsed() < WAIT_RETRY_DEADLINE);
    }

    #[test]
    fn wait_forever_times_out() {
        let mut dap = interface();
        dap.probe_mut().dap.wait_responses = usize::MAX;
        let err = dap.raw_read_register(PortType::DebugPort, 0x0).unwrap_err();
        assert!(matches!(err, ArmError::Dap(DapError::WaitResponse)));
    }

    #[test]
    fn fault_response_propagates() {
        let mut dap = interface();
        dap.connect(DpAddress::Default).unwrap();
        dap.probe_mut().dap.inject_fault();
        let err = dap.raw_read_register(PortType::AccessPort, 0xC).unwrap_err();
        assert!(matches!(err, ArmError::Dap(DapError::FaultResponse)));
    }

    #[test]
    fn parity_error_is_distinguished() {
        let mut dap = interface();
        dap.probe_mut().corrupt_next_read_parity = true;
        let err = dap.raw_read_register(PortType::DebugPort, 0x0).unwrap_err();
        assert!(matches!(err, ArmError::Dap(DapError::IncorrectParity)));
    }

    #[test]
    fn posted_ap_reads_drain_through_rdbuff() {
        let mut dap = interface();
        dap.connect(DpAddress::Default).unwrap();
        // IDR read: select bank 0xF, then read AP address 0xC.
        dap.raw_write_register(PortType::DebugPort, 0x8, 0xF0).unwrap();
        let idr = dap.raw_read_register(PortType::AccessPort, 0xC).unwrap();
        assert_eq!(idr, 0x2477_0011);
    }

    #[test]
    fn block_read_pipelines_with_one_extra_access() {
        let mut dap = interface();
        dap.connect(DpAddress::Default).unwrap();
        for i in 0..4u32 {
            dap.probe_mut().dap.write_mem_word(0x2000_0000 + i * 4, 0x1111_0000 + i);
        }
        // CSW: word size, single increment; TAR at the base.
        dap.raw_write_register(PortType::DebugPort, 0x8, 0x00).unwrap();
        dap.raw_write_register(PortType::AccessPort, 0x0, 0x12).unwrap();
        dap.raw_write_register(PortType::AccessPort, 0x4, 0x2000_0000).unwrap();

        let log_start = dap.probe_mut().dap.access_log.len();
        let mut values = [0u32; 4];
        dap.raw_read_block(PortType::AccessPort, 0xC, &mut values).unwrap();
        assert_eq!(values, [0x1111_0000, 0x1111_0001, 0x1111_0002, 0x1111_0003]);

        // Four data words cost four AP accesses plus the RDBUFF drain.
        let accesses = dap.probe_mut().dap.access_log.len() - log_start;
        assert_eq!(accesses, 5);
    }
}
