//! Debug Transport Modules: how DMI requests reach the Debug Module.

use std::time::{Duration, Instant};

use bitfield::bitfield;
use bitvec::prelude::*;

use super::RiscvError;
use crate::probe::{JtagChain, RawJtagIo};

/// How long busy DMI answers are retried before giving up.
const DMI_RETRY_DEADLINE: Duration = Duration::from_millis(250);

/// DTMCS instruction.
const IR_DTMCS: u32 = 0x10;
/// DMI instruction.
const IR_DMI: u32 = 0x11;

/// DMI operation: read the addressed register.
const DMI_OP_READ: u64 = 0b01;
/// DMI operation: write the addressed register.
const DMI_OP_WRITE: u64 = 0b10;
/// DMI operation: no operation, collects the previous result.
const DMI_OP_NOP: u64 = 0b00;

/// DMI status: the previous operation is still executing.
const DMI_STATUS_BUSY: u8 = 3;

/// Address/data/op transactions to a RISC-V Debug Module.
pub trait DtmAccess {
    /// Read a DM register.
    fn dmi_read(&mut self, address: u32) -> Result<u32, RiscvError>;

    /// Write a DM register.
    fn dmi_write(&mut self, address: u32, value: u32) -> Result<(), RiscvError>;

    /// The DMI address width in bits.
    fn abits(&self) -> u8;
}

bitfield! {
    /// DTMCS: control and status of the transport itself.
    #[derive(Copy, Clone)]
    pub struct Dtmcs(u32);
    impl Debug;
    /// Hard-reset the DTM.
    pub _, set_dmihardreset: 17;
    /// Clear a sticky busy condition.
    pub _, set_dmireset: 16;
    /// Run-Test/Idle cycles the debugger should insert between scans.
    pub u8, idle, _: 14, 12;
    /// Status of the last DMI operation.
    pub u8, dmistat, _: 11, 10;
    /// DMI address width.
    pub u8, abits, _: 9, 4;
    /// Spec version implemented by this DTM.
    pub u8, version, _: 3, 0;
}

impl From<u32> for Dtmcs {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dtmcs> for u32 {
    fn from(value: Dtmcs) -> Self {
        value.0
    }
}

/// The JTAG DTM: DTMCS/DMI registers on a scan-chain device.
#[derive(Debug)]
pub struct JtagDtm<P: RawJtagIo> {
    chain: JtagChain<P>,
    dev_index: usize,
    abits: u8,
    /// Idle cycles inserted after every DMI scan, grown on busy answers.
    idle_cycles: u8,
}

impl<P: RawJtagIo> JtagDtm<P> {
    /// Attach to the DTM at `dev_index`, reading its DTMCS capabilities.
    pub fn new(mut chain: JtagChain<P>, dev_index: usize) -> Result<Self, RiscvError> {
        chain.shift_ir(dev_index, IR_DTMCS)?;
        let zero = bitvec![u8, Lsb0; 0; 32];
        let captured = chain.shift_dr(dev_index, &zero)?;
        let dtmcs = Dtmcs(captured.load_le::<u32>());

        // Version 1 is spec 0.13 and later, the only thing we speak.
        if dtmcs.version() != 1 {
            return Err(RiscvError::UnsupportedDtmVersion(dtmcs.version()));
        }
        tracing::debug!(
            "JTAG DTM: abits {}, {} advised idle cycles",
            dtmcs.abits(),
            dtmcs.idle()
        );

        Ok(Self {
            chain,
            dev_index,
            abits: dtmcs.abits(),
            idle_cycles: dtmcs.idle().max(1),
        })
    }

    /// The chain this DTM sits on.
    pub fn chain_mut(&mut self) -> &mut JtagChain<P> {
        &mut self.chain
    }

    /// Release the scan chain.
    pub fn into_chain(self) -> JtagChain<P> {
        self.chain
    }

    fn dmi_request(&self, op: u64, address: u32, data: u32) -> BitVec<u8> {
        let mut request = BitVec::with_capacity(34 + self.abits as usize);
        let word = op | (data as u64) << 2 | (address as u64) << 34;
        for bit in 0..34 + self.abits as usize {
            request.push(word >> bit & 1 == 1);
        }
        request
    }

    /// One DMI scan; the captured status refers to this scan's request, the
    /// captured data to the previous one.
    fn scan(&mut self, op: u64, address: u32, data: u32) -> Result<(u8, u32), RiscvError> {
        let request = self.dmi_request(op, address, data);
        self.chain.shift_ir(self.dev_index, IR_DMI)?;
        let captured = self.chain.shift_dr(self.dev_index, &request)?;
        // Post-scan idle cycles give the DM time to execute.
        self.chain
            .probe_mut()
            .jtag_cycle(false, true, self.idle_cycles as usize)?;

        let status = captured[..2].load_le::<u8>();
        let value = captured[2..34].load_le::<u32>();
        Ok((status, value))
    }

    /// Clear a sticky busy condition and back off with more idle cycles.
    fn recover_busy(&mut self) -> Result<(), RiscvError> {
        let mut dtmcs = Dtmcs(0);
        dtmcs.set_dmireset(true);
        self.chain.shift_ir(self.dev_index, IR_DTMCS)?;
        let mut request = BitVec::<u8>::with_capacity(32);
        let word: u32 = dtmcs.into();
        for bit in 0..32 {
            request.push(word >> bit & 1 == 1);
        }
        self.chain.shift_dr(self.dev_index, &request)?;

        self.idle_cycles = (self.idle_cycles + 1).min(8);
        tracing::trace!("DMI busy, idle cycles now {}", self.idle_cycles);
        Ok(())
    }

    /// Issue an operation and collect its result with a NOP scan, retrying
    /// busy answers against a deadline.
    fn transact(&mut self, op: u64, address: u32, data: u32) -> Result<u32, RiscvError> {
        let deadline = Instant::now() + DMI_RETRY_DEADLINE;
        loop {
            let (status, _) = self.scan(op, address, data)?;
            if status == DMI_STATUS_BUSY {
                self.recover_busy()?;
                if Instant::now() >= deadline {
                    return Err(RiscvError::DmiBusy);
                }
                continue;
            }
            if status != 0 {
                return Err(RiscvError::DmiFailed(status));
            }

            let (status, value) = self.scan(DMI_OP_NOP, 0, 0)?;
            match status {
                0 => return Ok(value),
                DMI_STATUS_BUSY => {
                    self.recover_busy()?;
                    if Instant::now() >= deadline {
                        return Err(RiscvError::DmiBusy);
                    }
                    // The operation itself was accepted; re-collect.
                    let (status, value) = self.scan(DMI_OP_NOP, 0, 0)?;
                    if status == 0 {
                        return Ok(value);
                    }
                    return Err(RiscvError::DmiFailed(status));
                }
                other => return Err(RiscvError::DmiFailed(other)),
            }
        }
    }
}

impl<P: RawJtagIo> DtmAccess for JtagDtm<P> {
    fn dmi_read(&mut self, address: u32) -> Result<u32, RiscvError> {
        self.transact(DMI_OP_READ, address, 0)
    }

    fn dmi_write(&mut self, address: u32, value: u32) -> Result<(), RiscvError> {
        self.transact(DMI_OP_WRITE, address, value).map(|_| ())
    }

    fn abits(&self) -> u8 {
        self.abits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake::{ChainSim, SimDm};
    use crate::probe::JtagChain;

    fn dtm() -> JtagDtm<ChainSim> {
        let sim = ChainSim::new(vec![(0x1000_563D, 5)]).with_dm(0, SimDm::new());
        let chain = JtagChain::scan(sim).unwrap();
        JtagDtm::new(chain, 0).unwrap()
    }

    #[test]
    fn attach_reads_dtmcs() {
        let dtm = dtm();
        assert_eq!(dtm.abits(), 7);
        assert_eq!(dtm.idle_cycles, 1);
    }

    #[test]
    fn read_write_round_trip() {
        let mut dtm = dtm();
        dtm.dmi_write(0x20, 0xCAFE_F00D).unwrap();
        assert_eq!(dtm.dmi_read(0x20).unwrap(), 0xCAFE_F00D);
    }

    #[test]
    fn busy_recovery_retries_with_dmireset() {
        let mut dtm = dtm();
        dtm.dmi_write(0x21, 0x55).unwrap();
        dtm.chain_mut().probe_mut().dm_mut(0).busy_responses = 2;
        assert_eq!(dtm.dmi_read(0x21).unwrap(), 0x55);
        // Busy answers grew the idle budget.
        assert!(dtm.idle_cycles > 1);
    }
}
