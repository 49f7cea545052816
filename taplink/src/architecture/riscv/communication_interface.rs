//! The RISC-V Debug Module driver: hart run control, abstract register
//! access and system-bus memory.

use std::time::{Duration, Instant};

use bitfield::bitfield;

use super::dtm::DtmAccess;
use super::RiscvError;
use crate::core::{
    Breakwatch, BreakwatchKind, CoreInterface, CoreStatus, HaltReason, RegisterId, VectorCatch,
};
use crate::memory::MemoryInterface;
use crate::Error;

/// DM register addresses.
mod registers {
    pub const DATA0: u32 = 0x04;
    pub const DMCONTROL: u32 = 0x10;
    pub const DMSTATUS: u32 = 0x11;
    pub const ABSTRACTCS: u32 = 0x16;
    pub const COMMAND: u32 = 0x17;
    pub const SBCS: u32 = 0x38;
    pub const SBADDRESS0: u32 = 0x39;
    pub const SBDATA0: u32 = 0x3C;
}

/// Abstract register number of GPR x0.
const GPR_BASE: u32 = 0x1000;
/// CSR number of dcsr.
const CSR_DCSR: u32 = 0x7B0;
/// CSR number of tselect.
const CSR_TSELECT: u32 = 0x7A0;
/// CSR number of tdata1.
const CSR_TDATA1: u32 = 0x7A1;
/// CSR number of tdata2.
const CSR_TDATA2: u32 = 0x7A2;

/// How long run-control handshakes may take.
const HART_TIMEOUT: Duration = Duration::from_millis(500);

bitfield! {
    /// dmcontrol: requests to the hart.
    #[derive(Copy, Clone, Default)]
    pub struct Dmcontrol(u32);
    impl Debug;
    /// Halt request.
    pub _, set_haltreq: 31;
    /// Resume request.
    pub _, set_resumereq: 30;
    /// Reset everything except the DM.
    pub ndmreset, set_ndmreset: 1;
    /// DM enable; writing 0 resets the DM.
    pub dmactive, set_dmactive: 0;
}

impl From<u32> for Dmcontrol {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dmcontrol> for u32 {
    fn from(value: Dmcontrol) -> Self {
        value.0
    }
}

bitfield! {
    /// dmstatus: what the harts are doing.
    #[derive(Copy, Clone)]
    pub struct Dmstatus(u32);
    impl Debug;
    /// All selected harts acknowledged the last resume request.
    pub allresumeack, _: 17;
    /// Some selected hart acknowledged the last resume request.
    pub anyresumeack, _: 16;
    /// All selected harts are running.
    pub allrunning, _: 11;
    /// Some selected hart is running.
    pub anyrunning, _: 10;
    /// All selected harts are halted.
    pub allhalted, _: 9;
    /// Some selected hart is halted.
    pub anyhalted, _: 8;
    /// Spec version of this DM.
    pub u8, version, _: 3, 0;
}

impl From<u32> for Dmstatus {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dmstatus> for u32 {
    fn from(value: Dmstatus) -> Self {
        value.0
    }
}

bitfield! {
    /// abstractcs: abstract command engine status.
    #[derive(Copy, Clone)]
    pub struct Abstractcs(u32);
    impl Debug;
    /// An abstract command is executing.
    pub busy, _: 12;
    /// Error from the last command; write-1-clear.
    pub u8, cmderr, set_cmderr: 10, 8;
    /// Number of data registers.
    pub u8, datacount, _: 3, 0;
}

impl From<u32> for Abstractcs {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Abstractcs> for u32 {
    fn from(value: Abstractcs) -> Self {
        value.0
    }
}

/// A connected RISC-V Debug Module over any DTM transport.
#[derive(Debug)]
pub struct RiscvCommunicationInterface<D: DtmAccess> {
    dtm: D,
    /// Triggers discovered so far; `true` when occupied.
    trigger_slots: Vec<bool>,
    stepping: bool,
}

impl<D: DtmAccess> RiscvCommunicationInterface<D> {
    /// Activate the DM and sanity-check its version.
    pub fn new(mut dtm: D) -> Result<Self, RiscvError> {
        let mut control = Dmcontrol::default();
        control.set_dmactive(true);
        dtm.dmi_write(registers::DMCONTROL, control.into())?;

        let status = Dmstatus::from(dtm.dmi_read(registers::DMSTATUS)?);
        tracing::info!("RISC-V DM version {}", status.version());
        if status.version() != 2 {
            return Err(RiscvError::NotSupported("debug module version"));
        }

        Ok(Self {
            dtm,
            // Four triggers is a common floor; refined on first use.
            trigger_slots: vec![false; 4],
            stepping: false,
        })
    }

    /// The transport underneath.
    pub fn dtm_mut(&mut self) -> &mut D {
        &mut self.dtm
    }

    /// Release the transport.
    pub fn into_dtm(self) -> D {
        self.dtm
    }

    fn dmstatus(&mut self) -> Result<Dmstatus, RiscvError> {
        Ok(Dmstatus::from(self.dtm.dmi_read(registers::DMSTATUS)?))
    }

    fn dmcontrol_write(&mut self, f: impl FnOnce(&mut Dmcontrol)) -> Result<(), RiscvError> {
        let mut control = Dmcontrol::default();
        control.set_dmactive(true);
        f(&mut control);
        self.dtm.dmi_write(registers::DMCONTROL, control.into())
    }

    /// Whether the hart sits in debug mode.
    pub fn is_halted(&mut self) -> Result<bool, RiscvError> {
        Ok(self.dmstatus()?.allhalted())
    }

    fn wait_for(
        &mut self,
        mut condition: impl FnMut(&Dmstatus) -> bool,
    ) -> Result<(), RiscvError> {
        let deadline = Instant::now() + HART_TIMEOUT;
        loop {
            if condition(&self.dmstatus()?) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RiscvError::Timeout);
            }
        }
    }

    /// Request a halt and wait for the hart to take it.
    pub fn halt_hart(&mut self) -> Result<(), RiscvError> {
        self.dmcontrol_write(|c| c.set_haltreq(true))?;
        self.wait_for(|s| s.allhalted())?;
        self.dmcontrol_write(|_| {})?;
        self.stepping = false;
        Ok(())
    }

    /// Resume and wait for the acknowledge.
    pub fn resume_hart(&mut self) -> Result<(), RiscvError> {
        self.dmcontrol_write(|c| c.set_resumereq(true))?;
        self.wait_for(|s| s.allresumeack())?;
        self.dmcontrol_write(|_| {})?;
        Ok(())
    }

    fn wait_abstract_done(&mut self) -> Result<(), RiscvError> {
        let deadline = Instant::now() + HART_TIMEOUT;
        loop {
            let status = Abstractcs::from(self.dtm.dmi_read(registers::ABSTRACTCS)?);
            if !status.busy() {
                if status.cmderr() != 0 {
                    // Write-1-clear so the next command starts clean.
                    let mut clear = Abstractcs::from(0);
                    clear.set_cmderr(0b111);
                    self.dtm.dmi_write(registers::ABSTRACTCS, clear.into())?;
                    return Err(RiscvError::AbstractCommand(status.cmderr()));
                }
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RiscvError::Timeout);
            }
        }
    }

    /// Abstract access-register read: GPRs at `0x1000 + n`, CSRs at their
    /// CSR number.
    pub fn abstract_register_read(&mut self, regno: u32) -> Result<u32, RiscvError> {
        // cmdtype 0, aarsize 32-bit, transfer.
        let command = 2 << 20 | 1 << 17 | regno & 0xFFFF;
        self.dtm.dmi_write(registers::COMMAND, command)?;
        self.wait_abstract_done()?;
        self.dtm.dmi_read(registers::DATA0)
    }

    /// Abstract access-register write.
    pub fn abstract_register_write(&mut self, regno: u32, value: u32) -> Result<(), RiscvError> {
        self.dtm.dmi_write(registers::DATA0, value)?;
        let command = 2 << 20 | 1 << 17 | 1 << 16 | regno & 0xFFFF;
        self.dtm.dmi_write(registers::COMMAND, command)?;
        self.wait_abstract_done()
    }

    /// Single-step: set dcsr.step, ride one resume handshake, clear it.
    pub fn step_hart(&mut self) -> Result<(), RiscvError> {
        let dcsr = self.abstract_register_read(CSR_DCSR)?;
        self.abstract_register_write(CSR_DCSR, dcsr | 1 << 2)?;

        self.dmcontrol_write(|c| c.set_resumereq(true))?;
        self.wait_for(|s| s.allresumeack())?;
        self.wait_for(|s| s.allhalted())?;
        self.dmcontrol_write(|_| {})?;

        let dcsr = self.abstract_register_read(CSR_DCSR)?;
        self.abstract_register_write(CSR_DCSR, dcsr & !(1 << 2))?;
        self.stepping = true;
        Ok(())
    }

    /// Reset the platform (everything but the DM), optionally halting out
    /// of reset.
    pub fn reset_hart(&mut self, halt: bool) -> Result<(), RiscvError> {
        self.dmcontrol_write(|c| {
            c.set_ndmreset(true);
            c.set_haltreq(halt);
        })?;
        self.dmcontrol_write(|c| c.set_haltreq(halt))?;
        if halt {
            self.wait_for(|s| s.allhalted())?;
            self.dmcontrol_write(|_| {})?;
        }
        Ok(())
    }

    fn sbcs_for_word_access(autoincrement: bool, read_on_addr: bool) -> u32 {
        // sbaccess = 32-bit.
        let mut sbcs = 2 << 17;
        if autoincrement {
            sbcs |= 1 << 16;
        }
        if read_on_addr {
            sbcs |= 1 << 20;
        }
        sbcs
    }

    /// System-bus word read.
    pub fn sysbus_read_word(&mut self, address: u32) -> Result<u32, RiscvError> {
        self.dtm
            .dmi_write(registers::SBCS, Self::sbcs_for_word_access(false, true))?;
        self.dtm.dmi_write(registers::SBADDRESS0, address)?;
        self.dtm.dmi_read(registers::SBDATA0)
    }

    /// System-bus word write.
    pub fn sysbus_write_word(&mut self, address: u32, value: u32) -> Result<(), RiscvError> {
        self.dtm
            .dmi_write(registers::SBCS, Self::sbcs_for_word_access(false, false))?;
        self.dtm.dmi_write(registers::SBADDRESS0, address)?;
        self.dtm.dmi_write(registers::SBDATA0, value)
    }
}

/// The RV32 core driver over a connected Debug Module.
pub struct Rv32Core<'iface, D: DtmAccess> {
    iface: &'iface mut RiscvCommunicationInterface<D>,
}

impl<'iface, D: DtmAccess> Rv32Core<'iface, D> {
    /// Drive the hart behind `iface`.
    pub fn new(iface: &'iface mut RiscvCommunicationInterface<D>) -> Self {
        Self { iface }
    }
}

impl<D: DtmAccess> CoreInterface for Rv32Core<'_, D> {
    fn status(&mut self) -> Result<CoreStatus, Error> {
        if !self.iface.is_halted().map_err(Error::Riscv)? {
            return Ok(CoreStatus::Running);
        }
        // dcsr.cause tells why the hart is in debug mode.
        let dcsr = self
            .iface
            .abstract_register_read(CSR_DCSR)
            .map_err(Error::Riscv)?;
        let reason = match dcsr >> 6 & 0b111 {
            1 => HaltReason::Breakpoint,
            2 => HaltReason::Watchpoint { address: None },
            3 => HaltReason::Request,
            4 => HaltReason::Step,
            5 => HaltReason::Fault,
            _ => {
                if self.iface.stepping {
                    HaltReason::Step
                } else {
                    HaltReason::Unknown
                }
            }
        };
        Ok(CoreStatus::Halted(reason))
    }

    fn halt(&mut self, _timeout: Duration) -> Result<(), Error> {
        self.iface.halt_hart().map_err(Error::Riscv)
    }

    fn run(&mut self) -> Result<(), Error> {
        self.iface.stepping = false;
        self.iface.resume_hart().map_err(Error::Riscv)
    }

    fn step(&mut self) -> Result<(), Error> {
        self.iface.step_hart().map_err(Error::Riscv)
    }

    fn reset(&mut self, halt: bool) -> Result<(), Error> {
        self.iface.reset_hart(halt).map_err(Error::Riscv)
    }

    fn read_core_reg(&mut self, id: RegisterId) -> Result<u32, Error> {
        self.iface
            .abstract_register_read(GPR_BASE + id.0 as u32)
            .map_err(Error::Riscv)
    }

    fn write_core_reg(&mut self, id: RegisterId, value: u32) -> Result<(), Error> {
        self.iface
            .abstract_register_write(GPR_BASE + id.0 as u32, value)
            .map_err(Error::Riscv)
    }

    fn set_breakwatch(&mut self, entry: &mut Breakwatch) -> Result<(), Error> {
        let slot = self
            .iface
            .trigger_slots
            .iter()
            .position(|used| !used)
            .ok_or(Error::Riscv(RiscvError::NotSupported(
                "all triggers in use",
            )))?;

        // mcontrol trigger: fire before the instruction, enter debug mode.
        let mut tdata1 = 2 << 28 | 1 << 27 | 1 << 12 | 0b1000;
        tdata1 |= match entry.kind {
            BreakwatchKind::Breakpoint => 0b100,
            BreakwatchKind::WatchRead => 0b001,
            BreakwatchKind::WatchWrite => 0b010,
            BreakwatchKind::WatchAccess => 0b011,
        };

        self.iface
            .abstract_register_write(CSR_TSELECT, slot as u32)
            .map_err(Error::Riscv)?;
        self.iface
            .abstract_register_write(CSR_TDATA2, entry.address)
            .map_err(Error::Riscv)?;
        self.iface
            .abstract_register_write(CSR_TDATA1, tdata1)
            .map_err(Error::Riscv)?;

        self.iface.trigger_slots[slot] = true;
        entry.slot = slot;
        Ok(())
    }

    fn clear_breakwatch(&mut self, entry: &Breakwatch) -> Result<(), Error> {
        self.iface
            .abstract_register_write(CSR_TSELECT, entry.slot as u32)
            .map_err(Error::Riscv)?;
        self.iface
            .abstract_register_write(CSR_TDATA1, 0)
            .map_err(Error::Riscv)?;
        if let Some(slot) = self.iface.trigger_slots.get_mut(entry.slot) {
            *slot = false;
        }
        Ok(())
    }

    fn set_vector_catch(&mut self, catch: VectorCatch, enable: bool) -> Result<(), Error> {
        // dcsr.ebreakm/s/u makes environment breaks enter debug mode; the
        // closest thing this architecture has to a vector catch.
        if !matches!(catch, VectorCatch::HardFault) {
            return Err(Error::Riscv(RiscvError::NotSupported(
                "vector catch class",
            )));
        }
        let dcsr = self
            .iface
            .abstract_register_read(CSR_DCSR)
            .map_err(Error::Riscv)?;
        let ebreak_bits = 1 << 15 | 1 << 13 | 1 << 12;
        let value = if enable {
            dcsr | ebreak_bits
        } else {
            dcsr & !ebreak_bits
        };
        self.iface
            .abstract_register_write(CSR_DCSR, value)
            .map_err(Error::Riscv)
    }

    fn architecture(&self) -> &'static str {
        "rv32"
    }
}

impl<D: DtmAccess> MemoryInterface for RiscvCommunicationInterface<D> {
    fn read_word_32(&mut self, address: u32) -> Result<u32, Error> {
        self.sysbus_read_word(address).map_err(Error::Riscv)
    }

    fn read_word_16(&mut self, address: u32) -> Result<u16, Error> {
        let word = self.read_word_32(address & !3)?;
        Ok((word >> ((address & 2) * 8)) as u16)
    }

    fn read_word_8(&mut self, address: u32) -> Result<u8, Error> {
        let word = self.read_word_32(address & !3)?;
        Ok((word >> ((address & 3) * 8)) as u8)
    }

    fn read_32(&mut self, address: u32, data: &mut [u32]) -> Result<(), Error> {
        for (i, word) in data.iter_mut().enumerate() {
            *word = self.read_word_32(address + i as u32 * 4)?;
        }
        Ok(())
    }

    fn read_16(&mut self, address: u32, data: &mut [u16]) -> Result<(), Error> {
        for (i, half) in data.iter_mut().enumerate() {
            *half = self.read_word_16(address + i as u32 * 2)?;
        }
        Ok(())
    }

    fn read_8(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error> {
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = self.read_word_8(address + i as u32)?;
        }
        Ok(())
    }

    fn write_word_32(&mut self, address: u32, data: u32) -> Result<(), Error> {
        self.sysbus_write_word(address, data).map_err(Error::Riscv)
    }

    fn write_word_16(&mut self, address: u32, data: u16) -> Result<(), Error> {
        let word = self.read_word_32(address & !3)?;
        let shift = (address & 2) * 8;
        let merged = word & !(0xFFFF << shift) | (data as u32) << shift;
        self.write_word_32(address & !3, merged)
    }

    fn write_word_8(&mut self, address: u32, data: u8) -> Result<(), Error> {
        let word = self.read_word_32(address & !3)?;
        let shift = (address & 3) * 8;
        let merged = word & !(0xFF << shift) | (data as u32) << shift;
        self.write_word_32(address & !3, merged)
    }

    fn write_32(&mut self, address: u32, data: &[u32]) -> Result<(), Error> {
        for (i, word) in data.iter().enumerate() {
            self.write_word_32(address + i as u32 * 4, *word)?;
        }
        Ok(())
    }

    fn write_16(&mut self, address: u32, data: &[u16]) -> Result<(), Error> {
        for (i, half) in data.iter().enumerate() {
            self.write_word_16(address + i as u32 * 2, *half)?;
        }
        Ok(())
    }

    fn write_8(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        for (i, byte) in data.iter().enumerate() {
            self.write_word_8(address + i as u32, *byte)?;
        }
        Ok(())
    }
}


// Flash drivers want one object for run control and memory; the RV32 core
// driver forwards memory traffic to the system bus underneath it.
impl<D: DtmAccess> MemoryInterface for Rv32Core<'_, D> {
    fn read_word_32(&mut self, address: u32) -> Result<u32, Error> {
        self.iface.read_word_32(address)
    }
    fn read_word_16(&mut self, address: u32) -> Result<u16, Error> {
        self.iface.read_word_16(address)
    }
    fn read_word_8(&mut self, address: u32) -> Result<u8, Error> {
        self.iface.read_word_8(address)
    }
    fn read_32(&mut self, address: u32, data: &mut [u32]) -> Result<(), Error> {
        self.iface.read_32(address, data)
    }
    fn read_16(&mut self, address: u32, data: &mut [u16]) -> Result<(), Error> {
        self.iface.read_16(address, data)
    }
    fn read_8(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error> {
        self.iface.read_8(address, data)
    }
    fn write_word_32(&mut self, address: u32, data: u32) -> Result<(), Error> {
        self.iface.write_word_32(address, data)
    }
    fn write_word_16(&mut self, address: u32, data: u16) -> Result<(), Error> {
        self.iface.write_word_16(address, data)
    }
    fn write_word_8(&mut self, address: u32, data: u8) -> Result<(), Error> {
        self.iface.write_word_8(address, data)
    }
    fn write_32(&mut self, address: u32, data: &[u32]) -> Result<(), Error> {
        self.iface.write_32(address, data)
    }
    fn write_16(&mut self, address: u32, data: &[u16]) -> Result<(), Error> {
        self.iface.write_16(address, data)
    }
    fn write_8(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        self.iface.write_8(address, data)
    }
}
