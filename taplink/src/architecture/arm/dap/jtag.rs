//! The JTAG-DP transport.
//!
//! DPACC/APACC scans move a 35-bit DR `{data:32, addr[3:2]:2, RnW:1}` and
//! capture `{data:32, ack:3}`. Every read is posted: the data comes back in
//! the following scan, so a read costs one extra RDBUFF scan at the end of
//! a chain.

use std::time::Instant;

use bitvec::prelude::*;

use super::{RawDapAccess, WAIT_RETRY_DEADLINE};
use crate::architecture::arm::{ArmError, DapError, DpAddress, PortType};
use crate::probe::{JtagChain, RawJtagIo, WireProtocol};

/// ABORT instruction.
const IR_ABORT: u32 = 0x8;
/// DPACC instruction.
const IR_DPACC: u32 = 0xA;
/// APACC instruction.
const IR_APACC: u32 = 0xB;

/// JTAG-DP acknowledge: OK/FAULT (faults surface through CTRL/STAT).
const ACK_OK: u32 = 0b010;
/// JTAG-DP acknowledge: previous transaction still in progress.
const ACK_WAIT: u32 = 0b001;

/// RDBUFF address within the DP register file.
const RDBUFF: u8 = 0xC;

/// JTAG transport for one JTAG-DP on a scan chain.
#[derive(Debug)]
pub struct JtagDapInterface<P: RawJtagIo> {
    chain: JtagChain<P>,
    /// Which scan-chain device is the DP we talk to.
    dev_index: usize,
}

impl<P: RawJtagIo> JtagDapInterface<P> {
    /// Drive the DP at `dev_index` on an already enumerated chain.
    pub fn new(chain: JtagChain<P>, dev_index: usize) -> Self {
        Self { chain, dev_index }
    }

    /// The chain this transport drives.
    pub fn chain_mut(&mut self) -> &mut JtagChain<P> {
        &mut self.chain
    }

    /// Release the scan chain.
    pub fn into_chain(self) -> JtagChain<P> {
        self.chain
    }

    /// One DPACC/APACC scan with WAIT retry. Returns the 32 captured data
    /// bits, which belong to the *previous* posted transaction.
    fn scan(&mut self, ir: u32, read: bool, address: u8, value: u32) -> Result<u32, ArmError> {
        self.chain.shift_ir(self.dev_index, ir)?;

        let mut request = BitVec::<u8>::with_capacity(35);
        request.push(read);
        request.push(address >> 2 & 1 == 1);
        request.push(address >> 3 & 1 == 1);
        for bit in 0..32 {
            request.push(value >> bit & 1 == 1);
        }

        let deadline = Instant::now() + WAIT_RETRY_DEADLINE;
        loop {
            let captured = self.chain.shift_dr(self.dev_index, &request)?;
            let ack = captured[..3].load_le::<u32>();
            match ack {
                ACK_OK => return Ok(captured[3..35].load_le::<u32>()),
                ACK_WAIT => {
                    if Instant::now() >= deadline {
                        tracing::warn!("JTAG-DP WAIT storm exceeded the retry deadline");
                        return Err(DapError::WaitResponse.into());
                    }
                    tracing::trace!("JTAG-DP WAIT, retrying scan");
                }
                other => {
                    tracing::debug!("JTAG-DP returned unexpected ack {other:#05b}");
                    return Err(DapError::FaultResponse.into());
                }
            }
        }
    }

    fn ir_for(port: PortType) -> u32 {
        match port {
            PortType::DebugPort => IR_DPACC,
            PortType::AccessPort => IR_APACC,
        }
    }
}

impl<P: RawJtagIo> RawDapAccess for JtagDapInterface<P> {
    fn raw_read_register(&mut self, port: PortType, address: u8) -> Result<u32, ArmError> {
        // Post the read, then drain it with an RDBUFF scan.
        self.scan(Self::ir_for(port), true, address, 0)?;
        self.scan(IR_DPACC, true, RDBUFF, 0)
    }

    fn raw_write_register(
        &mut self,
        port: PortType,
        address: u8,
        value: u32,
    ) -> Result<(), ArmError> {
        // A DP write to address 0 is ABORT, which has its own instruction.
        if port == PortType::DebugPort && address == 0x0 {
            self.scan(IR_ABORT, false, 0x0, value)?;
            return Ok(());
        }
        self.scan(Self::ir_for(port), false, address, value)?;
        Ok(())
    }

    fn raw_read_block(
        &mut self,
        port: PortType,
        address: u8,
        values: &mut [u32],
    ) -> Result<(), ArmError> {
        if values.is_empty() {
            return Ok(());
        }

        let ir = Self::ir_for(port);
        self.scan(ir, true, address, 0)?;
        let len = values.len();
        for value in values[..len - 1].iter_mut() {
            *value = self.scan(ir, true, address, 0)?;
        }
        let last = values.len() - 1;
        values[last] = self.scan(IR_DPACC, true, RDBUFF, 0)?;
        Ok(())
    }

    fn connect(&mut self, dp: DpAddress) -> Result<u32, ArmError> {
        if dp != DpAddress::Default {
            return Err(ArmError::NotSupported("multidrop addressing on JTAG"));
        }
        // DPIDR is DP register 0; the scan chain walk already reset the
        // TAPs, so only the read is needed here.
        self.raw_read_register(PortType::DebugPort, 0x0)
    }

    fn reset_line_state(&mut self) {
        self.chain.invalidate_ir_cache();
    }

    fn protocol(&self) -> WireProtocol {
        WireProtocol::Jtag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake::{ChainSim, SimDap};
    use crate::probe::JtagChain;

    fn interface() -> JtagDapInterface<ChainSim> {
        let sim = ChainSim::new(vec![(0x4BA0_0477, 4), (0x0641_3041, 5)]).with_dap(0, SimDap::new());
        let chain = JtagChain::scan(sim).unwrap();
        JtagDapInterface::new(chain, 0)
    }

    #[test]
    fn connect_reads_dpidr_through_posted_scan() {
        let mut dap = interface();
        let dpidr = dap.connect(DpAddress::Default).unwrap();
        assert_eq!(dpidr, 0x2BA0_1477);
    }

    #[test]
    fn ap_register_read_via_select() {
        let mut dap = interface();
        dap.connect(DpAddress::Default).unwrap();
        dap.raw_write_register(PortType::DebugPort, 0x8, 0xF0).unwrap();
        let idr = dap.raw_read_register(PortType::AccessPort, 0xC).unwrap();
        assert_eq!(idr, 0x2477_0011);
    }

    #[test]
    fn wait_retries_until_ok() {
        let mut dap = interface();
        dap.chain_mut().probe_mut().dap_mut(0).wait_responses = 3;
        let dpidr = dap.raw_read_register(PortType::DebugPort, 0x0).unwrap();
        assert_eq!(dpidr, 0x2BA0_1477);
    }

    #[test]
    fn block_read_returns_memory_in_order() {
        let mut dap = interface();
        dap.connect(DpAddress::Default).unwrap();
        {
            let sim_dap = dap.chain_mut().probe_mut().dap_mut(0);
            for i in 0..3u32 {
                sim_dap.write_mem_word(0x2000_0000 + i * 4, 0xAB00 + i);
            }
        }
        dap.raw_write_register(PortType::DebugPort, 0x8, 0x00).unwrap();
        dap.raw_write_register(PortType::AccessPort, 0x0, 0x12).unwrap();
        dap.raw_write_register(PortType::AccessPort, 0x4, 0x2000_0000).unwrap();

        let mut values = [0u32; 3];
        dap.raw_read_block(PortType::AccessPort, 0xC, &mut values).unwrap();
        assert_eq!(values, [0xAB00, 0xAB01, 0xAB02]);
    }
}
