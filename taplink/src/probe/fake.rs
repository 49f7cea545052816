//! Simulated targets for driver development and tests.
//!
//! [`ChainSim`] models a JTAG scan chain with full TAP state machines,
//! [`SwdTargetSim`] models an SWD target at the sequence-call level, and
//! [`SimDap`] provides the ADIv5 DP/MEM-AP register behaviour both wire
//! models share, backed by a sparse byte memory.

use std::collections::HashMap;

use bitvec::prelude::*;

use super::{parity, DebugProbeError, RawJtagIo, RawSwdIo};

/// SWD acknowledge values as read LSB-first off the wire.
pub const SWD_ACK_OK: u32 = 0b001;
/// SWD WAIT acknowledge.
pub const SWD_ACK_WAIT: u32 = 0b010;
/// SWD FAULT acknowledge.
pub const SWD_ACK_FAULT: u32 = 0b100;

/// JTAG-DP acknowledge: transaction accepted.
pub const JTAG_ACK_OK: u32 = 0b010;
/// JTAG-DP acknowledge: previous transaction still in progress.
pub const JTAG_ACK_WAIT: u32 = 0b001;

/// Outcome of one simulated DP/AP access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimAck {
    /// Transaction accepted.
    Ok,
    /// Target busy, retry.
    Wait,
    /// Sticky error set, access refused.
    Fault,
}

/// ADIv5 debug-port and MEM-AP register model.
///
/// One AP (index 0) with a 32-bit MEM-AP in front of a sparse byte-addressed
/// memory. WAIT storms and sticky faults can be injected for retry-path
/// tests.
#[derive(Debug)]
pub struct SimDap {
    /// DPIDR returned for DP address 0 reads.
    pub dpidr: u32,
    /// TARGETID (DP bank 2).
    pub targetid: u32,
    /// IDR of AP 0.
    pub ap_idr: u32,
    /// BASE of AP 0.
    pub ap_base: u32,
    /// Whether CSW accepts the packed auto-increment mode.
    pub supports_packed: bool,
    /// Upcoming accesses answer WAIT this many times before completing.
    pub wait_responses: usize,
    /// Sparse target memory.
    pub memory: HashMap<u32, u8>,

    select: u32,
    ctrl_stat: u32,
    posted: u32,
    sticky_err: bool,
    csw: u32,
    tar: u32,
    /// Every (is_ap, is_read, address) access in order, for sequencing
    /// assertions.
    pub access_log: Vec<(bool, bool, u8)>,
}

impl Default for SimDap {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDap {
    /// A target that looks like a single Cortex-M behind an AHB-AP.
    pub fn new() -> Self {
        Self {
            dpidr: 0x2BA0_1477,
            targetid: 0,
            ap_idr: 0x2477_0011,
            ap_base: 0xE00F_F003,
            supports_packed: true,
            wait_responses: 0,
            memory: HashMap::new(),
            select: 0,
            ctrl_stat: 0,
            posted: 0,
            sticky_err: false,
            csw: 0x0000_0040,
            tar: 0,
            access_log: Vec::new(),
        }
    }

    /// Raise the sticky error flag, as a FAULTing transaction would.
    pub fn inject_fault(&mut self) {
        self.sticky_err = true;
    }

    /// Whether the sticky error flag is currently set.
    pub fn sticky_error(&self) -> bool {
        self.sticky_err
    }

    /// Store a little-endian word in simulated memory.
    pub fn write_mem_word(&mut self, address: u32, value: u32) {
        for (i, byte) in value.to_le_bytes().iter().enumerate() {
            self.memory.insert(address + i as u32, *byte);
        }
    }

    /// Load a little-endian word from simulated memory.
    pub fn read_mem_word(&self, address: u32) -> u32 {
        u32::from_le_bytes(std::array::from_fn(|i| {
            self.memory.get(&(address + i as u32)).copied().unwrap_or(0)
        }))
    }

    /// Perform one DP or AP access. `address` is the in-bank register
    /// address (0x0/0x4/0x8/0xC); banking comes from the cached SELECT.
    /// Returns the immediate result; posted-read buffering is the wire
    /// model's business.
    pub fn access(&mut self, ap: bool, read: bool, address: u8, value: u32) -> (SimAck, u32) {
        self.access_log.push((ap, read, address));

        if self.wait_responses > 0 {
            self.wait_responses -= 1;
            return (SimAck::Wait, 0);
        }
        if self.sticky_err && ap {
            return (SimAck::Fault, 0);
        }

        let result = if ap {
            let bank = (self.select >> 4 & 0xF) as u8;
            let reg = bank << 4 | address;
            // Only AP 0 is implemented; other APSELs read as zero.
            if self.select >> 24 != 0 {
                if read {
                    self.posted = 0;
                }
                0
            } else if read {
                let v = self.ap_register_read(reg);
                self.posted = v;
                v
            } else {
                self.ap_register_write(reg, value);
                0
            }
        } else if read {
            self.dp_register_read(address)
        } else {
            self.dp_register_write(address, value);
            0
        };

        (SimAck::Ok, result)
    }

    /// The value a posted AP read left in RDBUFF.
    pub fn posted(&self) -> u32 {
        self.posted
    }

    fn dp_register_read(&mut self, address: u8) -> u32 {
        match address {
            0x0 => self.dpidr,
            0x4 => match self.select & 0xF {
                2 => self.targetid,
                _ => {
                    let mut v = self.ctrl_stat;
                    // Power-up acks mirror the requests.
                    if v >> 28 & 1 == 1 {
                        v |= 1 << 29;
                    }
                    if v >> 30 & 1 == 1 {
                        v |= 1 << 31;
                    }
                    if self.sticky_err {
                        v |= 1 << 5;
                    }
                    v
                }
            },
            0xC => self.posted,
            _ => 0,
        }
    }

    fn dp_register_write(&mut self, address: u8, value: u32) {
        match address {
            0x0 => {
                // ABORT: write-1-clear of the sticky flags.
                if value & 0b11110 != 0 {
                    self.sticky_err = false;
                }
            }
            0x4 => self.ctrl_stat = value,
            0x8 => self.select = value,
            _ => {}
        }
    }

    fn ap_register_read(&mut self, reg: u8) -> u32 {
        match reg {
            0x00 => self.csw,
            0x04 => self.tar,
            0x0C => self.drw_read(),
            0x10 | 0x14 | 0x18 | 0x1C => {
                let base = self.tar & !0xF;
                self.read_mem_word(base + (reg as u32 & 0xC))
            }
            0xF8 => self.ap_base,
            0xFC => self.ap_idr,
            _ => 0,
        }
    }

    fn ap_register_write(&mut self, reg: u8, value: u32) {
        match reg {
            0x00 => {
                let mut csw = value;
                if !self.supports_packed && csw >> 4 & 0b11 == 0b10 {
                    // Packed unsupported: reads back as increment-single.
                    csw = csw & !0x30 | 0x10;
                }
                self.csw = csw;
            }
            0x04 => self.tar = value,
            0x0C => self.drw_write(value),
            0x10 | 0x14 | 0x18 | 0x1C => {
                let base = self.tar & !0xF;
                self.write_mem_word(base + (reg as u32 & 0xC), value);
            }
            _ => {}
        }
    }

    fn size_bytes(&self) -> u32 {
        match self.csw & 0b111 {
            0 => 1,
            1 => 2,
            _ => 4,
        }
    }

    fn addrinc(&self) -> u32 {
        self.csw >> 4 & 0b11
    }

    fn drw_read(&mut self) -> u32 {
        let size = self.size_bytes();
        match self.addrinc() {
            0b10 => {
                // Packed: fill the lanes from TAR up to the word boundary.
                let mut value = 0u32;
                let mut addr = self.tar;
                while addr < (self.tar & !3) + 4 {
                    let lane = addr & 3;
                    for b in 0..size {
                        let byte =
                            self.memory.get(&(addr + b)).copied().unwrap_or(0) as u32;
                        value |= byte << ((lane + b) * 8);
                    }
                    addr += size;
                }
                self.tar = addr;
                value
            }
            inc => {
                let lane = self.tar & 3;
                let mut value = 0u32;
                for b in 0..size {
                    let byte = self.memory.get(&(self.tar + b)).copied().unwrap_or(0) as u32;
                    value |= byte << ((lane + b) * 8);
                }
                if inc != 0 {
                    self.tar += size;
                }
                value
            }
        }
    }

    fn drw_write(&mut self, value: u32) {
        // DFSR is write-1-clear.
        if self.tar == 0xE000_ED30 && self.size_bytes() == 4 {
            let old = self.read_mem_word(self.tar);
            self.write_mem_word(self.tar, old & !value);
            if self.addrinc() != 0 {
                self.tar += 4;
            }
            return;
        }

        let size = self.size_bytes();
        match self.addrinc() {
            0b10 => {
                let mut addr = self.tar;
                while addr < (self.tar & !3) + 4 {
                    let lane = addr & 3;
                    for b in 0..size {
                        let byte = (value >> ((lane + b) * 8)) as u8;
                        self.memory.insert(addr + b, byte);
                    }
                    addr += size;
                }
                self.tar = addr;
            }
            inc => {
                let lane = self.tar & 3;
                for b in 0..size {
                    let byte = (value >> ((lane + b) * 8)) as u8;
                    self.memory.insert(self.tar + b, byte);
                }
                if inc != 0 {
                    self.tar += size;
                }
            }
        }
        self.emulate_core();
    }

    /// A Cortex-M's worth of reactive behaviour on top of the flat memory:
    /// halt requests are acknowledged in DHCSR, register transfers are
    /// always ready, and a caught reset halts.
    fn emulate_core(&mut self) {
        const DHCSR: u32 = 0xE000_EDF0;
        const DFSR: u32 = 0xE000_ED30;
        const AIRCR: u32 = 0xE000_ED0C;
        const DEMCR: u32 = 0xE000_EDFC;

        let dhcsr = self.read_mem_word(DHCSR);
        if dhcsr >> 16 == 0xA05F {
            let mut status = 1 << 16;
            if dhcsr & 0b10 != 0 {
                status |= 1 << 17;
                let dfsr = self.read_mem_word(DFSR);
                self.write_mem_word(DFSR, dfsr | 1);
            }
            self.write_mem_word(DHCSR, dhcsr & 0xFFFF | status);
        }

        let aircr = self.read_mem_word(AIRCR);
        if aircr >> 16 == 0x05FA && aircr & 0b101 != 0 {
            let mut dhcsr = self.read_mem_word(DHCSR) | 1 << 25;
            if self.read_mem_word(DEMCR) & 1 != 0 {
                dhcsr |= 1 << 17;
                let dfsr = self.read_mem_word(DFSR);
                self.write_mem_word(DFSR, dfsr | 0b1000);
            }
            self.write_mem_word(DHCSR, dhcsr);
            self.write_mem_word(AIRCR, 0);
        }
    }
}

/// The sixteen TAP controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TapState {
    TestLogicReset,
    RunTestIdle,
    SelectDrScan,
    CaptureDr,
    ShiftDr,
    Exit1Dr,
    PauseDr,
    Exit2Dr,
    UpdateDr,
    SelectIrScan,
    CaptureIr,
    ShiftIr,
    Exit1Ir,
    PauseIr,
    Exit2Ir,
    UpdateIr,
}

impl TapState {
    fn next(self, tms: bool) -> TapState {
        use TapState::*;
        match (self, tms) {
            (TestLogicReset, false) => RunTestIdle,
            (TestLogicReset, true) => TestLogicReset,
            (RunTestIdle, false) => RunTestIdle,
            (RunTestIdle, true) => SelectDrScan,
            (SelectDrScan, false) => CaptureDr,
            (SelectDrScan, true) => SelectIrScan,
            (CaptureDr, false) => ShiftDr,
            (CaptureDr, true) => Exit1Dr,
            (ShiftDr, false) => ShiftDr,
            (ShiftDr, true) => Exit1Dr,
            (Exit1Dr, false) => PauseDr,
            (Exit1Dr, true) => UpdateDr,
            (PauseDr, false) => PauseDr,
            (PauseDr, true) => Exit2Dr,
            (Exit2Dr, false) => ShiftDr,
            (Exit2Dr, true) => UpdateDr,
            (UpdateDr, false) => RunTestIdle,
            (UpdateDr, true) => SelectDrScan,
            (SelectIrScan, false) => CaptureIr,
            (SelectIrScan, true) => TestLogicReset,
            (CaptureIr, false) => ShiftIr,
            (CaptureIr, true) => Exit1Ir,
            (ShiftIr, false) => ShiftIr,
            (ShiftIr, true) => Exit1Ir,
            (Exit1Ir, false) => PauseIr,
            (Exit1Ir, true) => UpdateIr,
            (PauseIr, false) => PauseIr,
            (PauseIr, true) => Exit2Ir,
            (Exit2Ir, false) => ShiftIr,
            (Exit2Ir, true) => UpdateIr,
            (UpdateIr, false) => RunTestIdle,
            (UpdateIr, true) => SelectDrScan,
        }
    }
}

/// A RISC-V Debug Module with enough behaviour for driver tests: halt and
/// resume handshakes, abstract register transfers and a system-bus window
/// into a sparse memory.
#[derive(Debug, Default)]
pub struct SimDm {
    /// DM register file by DMI address.
    pub regs: HashMap<u32, u32>,
    /// Abstract register file (GPRs at 0x1000.., CSRs below).
    pub arch_regs: HashMap<u32, u32>,
    /// System-bus memory.
    pub memory: HashMap<u32, u32>,
    /// Upcoming DMI operations answer busy this many times.
    pub busy_responses: usize,
    sticky_busy: bool,
    last: (u32, u32),
}

/// DMI register addresses the model implements.
mod dmi {
    pub const DATA0: u32 = 0x04;
    pub const DMCONTROL: u32 = 0x10;
    pub const DMSTATUS: u32 = 0x11;
    pub const ABSTRACTCS: u32 = 0x16;
    pub const COMMAND: u32 = 0x17;
    pub const SBCS: u32 = 0x38;
    pub const SBADDRESS0: u32 = 0x39;
    pub const SBDATA0: u32 = 0x3C;
}

impl SimDm {
    /// A powered-down DM in the running state.
    pub fn new() -> Self {
        let mut dm = Self::default();
        // Version 0.13, running hart.
        dm.regs.insert(dmi::DMSTATUS, 0x2 | 1 << 11 | 1 << 10);
        dm
    }

    fn read(&mut self, address: u32) -> u32 {
        self.regs.get(&address).copied().unwrap_or(0)
    }

    fn write(&mut self, address: u32, value: u32) {
        match address {
            dmi::DMCONTROL => {
                self.regs.insert(address, value);
                let mut dmstatus = self.read(dmi::DMSTATUS) & !0xF0F00;
                if value >> 31 & 1 == 1 {
                    // haltreq: allhalted | anyhalted.
                    dmstatus |= 1 << 9 | 1 << 8;
                } else if value >> 30 & 1 == 1 {
                    // resumereq: acks plus either running, or halted again
                    // right away when dcsr.step is set.
                    dmstatus |= 1 << 17 | 1 << 16;
                    let stepping =
                        self.arch_regs.get(&0x7B0).copied().unwrap_or(0) & 1 << 2 != 0;
                    if stepping {
                        dmstatus |= 1 << 9 | 1 << 8;
                    } else {
                        dmstatus |= 1 << 11 | 1 << 10;
                    }
                } else if self.read(dmi::DMSTATUS) & 1 << 9 != 0 {
                    dmstatus |= 1 << 9 | 1 << 8;
                } else {
                    dmstatus |= 1 << 11 | 1 << 10;
                }
                self.regs.insert(dmi::DMSTATUS, dmstatus);
            }
            dmi::COMMAND => {
                // Access-register commands only.
                if value >> 24 & 0xFF == 0 && value >> 17 & 1 == 1 {
                    let regno = value & 0xFFFF;
                    if value >> 16 & 1 == 1 {
                        let data0 = self.read(dmi::DATA0);
                        self.arch_regs.insert(regno, data0);
                    } else {
                        let v = self.arch_regs.get(&regno).copied().unwrap_or(0);
                        self.regs.insert(dmi::DATA0, v);
                    }
                }
            }
            dmi::SBADDRESS0 => {
                self.regs.insert(address, value);
                if self.read(dmi::SBCS) >> 20 & 1 == 1 {
                    let word = self.memory.get(&value).copied().unwrap_or(0);
                    self.regs.insert(dmi::SBDATA0, word);
                }
            }
            dmi::SBDATA0 => {
                let addr = self.read(dmi::SBADDRESS0);
                self.memory.insert(addr, value);
                if self.read(dmi::SBCS) >> 16 & 1 == 1 {
                    self.regs.insert(dmi::SBADDRESS0, addr.wrapping_add(4));
                }
            }
            _ => {
                self.regs.insert(address, value);
            }
        }
    }
}

/// One simulated TAP on a [`ChainSim`] chain.
#[derive(Debug)]
pub struct SimTap {
    /// IDCODE presented out of test-logic-reset.
    pub idcode: u32,
    /// Instruction register length.
    pub ir_len: u8,
    /// IR capture pattern; conforming devices capture `0b…01`.
    pub ir_capture: u32,
    /// ADIv5 DP behind DPACC/APACC, when this TAP is a JTAG-DP.
    pub dap: Option<SimDap>,
    /// RISC-V DM behind DTMCS/DMI, when this TAP is a RISC-V DTM.
    pub dm: Option<SimDm>,

    ir_shift: u64,
    /// Latched instruction; `None` right after test-logic-reset (IDCODE).
    ir: Option<u64>,
    dr_shift: u64,
    dr_len: u8,
    /// Result latch for the posted DPACC/APACC capture.
    jtag_last: (u32, u32),
}

const IR_DPACC: u64 = 0xA;
const IR_APACC: u64 = 0xB;
const IR_DTMCS: u64 = 0x10;
const IR_DMI: u64 = 0x11;

/// abits advertised by the simulated DTM.
const SIM_DTM_ABITS: u8 = 7;

impl SimTap {
    fn new(idcode: u32, ir_len: u8) -> Self {
        Self {
            idcode,
            ir_len,
            ir_capture: 0b01,
            dap: None,
            dm: None,
            ir_shift: 0,
            ir: None,
            dr_shift: 0,
            dr_len: 1,
            jtag_last: (JTAG_ACK_OK, 0),
        }
    }

    fn in_bypass(&self) -> bool {
        match self.ir {
            Some(ir) => ir == (1u64 << self.ir_len) - 1,
            None => false,
        }
    }

    fn capture_dr(&mut self) {
        if self.in_bypass() {
            self.dr_len = 1;
            self.dr_shift = 0;
        } else if let Some(dm) = self.dm.as_ref() {
            match self.ir {
                Some(IR_DTMCS) => {
                    self.dr_len = 32;
                    // version 1 (0.13), abits, one idle cycle advised.
                    self.dr_shift = 1 | (SIM_DTM_ABITS as u64) << 4 | 1 << 12;
                }
                Some(IR_DMI) => {
                    self.dr_len = 34 + SIM_DTM_ABITS;
                    self.dr_shift = if dm.sticky_busy || dm.busy_responses > 0 {
                        0b11
                    } else {
                        let (status, data) = dm.last;
                        status as u64 | (data as u64) << 2
                    };
                }
                _ => {
                    self.dr_len = 32;
                    self.dr_shift = self.idcode as u64;
                }
            }
        } else if let Some(dap) = self.dap.as_ref() {
            if matches!(self.ir, Some(IR_DPACC) | Some(IR_APACC)) {
                self.dr_len = 35;
                // A busy DP answers WAIT and will discard the request
                // shifted in by this very scan.
                self.dr_shift = if dap.wait_responses > 0 {
                    JTAG_ACK_WAIT as u64
                } else {
                    let (ack, data) = self.jtag_last;
                    (data as u64) << 3 | ack as u64
                };
                return;
            }
            self.dr_len = 32;
            self.dr_shift = self.idcode as u64;
        } else {
            self.dr_len = 32;
            self.dr_shift = self.idcode as u64;
        }
    }

    fn update_dr(&mut self) {
        if let Some(dm) = self.dm.as_mut() {
            match self.ir {
                Some(IR_DTMCS) => {
                    if self.dr_shift >> 16 & 1 == 1 {
                        dm.sticky_busy = false;
                    }
                }
                Some(IR_DMI) => {
                    if dm.busy_responses > 0 {
                        dm.busy_responses -= 1;
                        dm.sticky_busy = true;
                        return;
                    }
                    if dm.sticky_busy {
                        return;
                    }
                    let op = self.dr_shift & 0b11;
                    let data = (self.dr_shift >> 2) as u32;
                    let address = (self.dr_shift >> 34) as u32 & ((1 << SIM_DTM_ABITS) - 1);
                    match op {
                        1 => dm.last = (0, dm.read(address)),
                        2 => {
                            dm.write(address, data);
                            dm.last = (0, 0);
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
            return;
        }
        let Some(dap) = self.dap.as_mut() else {
            return;
        };
        let ap = match self.ir {
            Some(IR_DPACC) => false,
            Some(IR_APACC) => true,
            _ => return,
        };
        if dap.wait_responses > 0 {
            // The capture already reported WAIT; drop the request.
            dap.wait_responses -= 1;
            return;
        }
        let read = self.dr_shift & 1 == 1;
        let address = ((self.dr_shift >> 1 & 0b11) as u8) << 2;
        let value = (self.dr_shift >> 3) as u32;
        let previous = dap.posted();
        let (ack, data) = dap.access(ap, read, address, value);
        self.jtag_last = match ack {
            SimAck::Wait => (JTAG_ACK_WAIT, 0),
            // JTAG-DPs report faults through CTRL/STAT, not the ACK.
            _ => (JTAG_ACK_OK, if read { data } else { previous }),
        };
    }
}

/// A JTAG scan chain of [`SimTap`]s driven through [`RawJtagIo`].
///
/// Index 0 sits nearest TDO, matching [`crate::probe::JtagChain`]'s device
/// numbering.
#[derive(Debug)]
pub struct ChainSim {
    /// The devices on the chain.
    pub devices: Vec<SimTap>,
    state: TapState,
    /// Rising edges seen, for "did it do any work" assertions.
    pub clocks: usize,
    /// Extra single-bit shift stages inserted on the TDO side while every
    /// device is in BYPASS. Simulates a chain that lies about its length.
    pub extra_bypass_delay: usize,
    extra_stages: Vec<bool>,
}

impl ChainSim {
    /// Build a chain from `(idcode, ir_len)` pairs, index 0 nearest TDO.
    pub fn new(devices: Vec<(u32, u8)>) -> Self {
        Self {
            devices: devices
                .into_iter()
                .map(|(idcode, ir_len)| SimTap::new(idcode, ir_len))
                .collect(),
            state: TapState::TestLogicReset,
            clocks: 0,
            extra_bypass_delay: 0,
            extra_stages: Vec::new(),
        }
    }

    /// Attach an ADIv5 DP model behind device `index`.
    pub fn with_dap(mut self, index: usize, dap: SimDap) -> Self {
        self.devices[index].dap = Some(dap);
        self
    }

    /// Borrow the DP model attached to device `index`.
    pub fn dap_mut(&mut self, index: usize) -> &mut SimDap {
        self.devices[index].dap.as_mut().expect("no DAP attached")
    }

    /// Attach a RISC-V DM model behind device `index`.
    pub fn with_dm(mut self, index: usize, dm: SimDm) -> Self {
        self.devices[index].dm = Some(dm);
        self
    }

    /// Borrow the DM model attached to device `index`.
    pub fn dm_mut(&mut self, index: usize) -> &mut SimDm {
        self.devices[index].dm.as_mut().expect("no DM attached")
    }

    fn all_bypassed(&self) -> bool {
        self.devices.iter().all(|d| d.in_bypass())
    }

    fn clock(&mut self, tms: bool, tdi: bool) -> bool {
        self.clocks += 1;

        let shifting_dr = self.state == TapState::ShiftDr;
        let shifting_ir = self.state == TapState::ShiftIr;

        // TDO reflects the pre-shift output of the device nearest TDO.
        let tdo = if shifting_dr {
            if self.extra_stages.is_empty() {
                self.devices[0].dr_shift & 1 == 1
            } else {
                self.extra_stages[0]
            }
        } else if shifting_ir {
            self.devices[0].ir_shift & 1 == 1
        } else {
            false
        };

        match self.state {
            TapState::TestLogicReset => {
                for device in &mut self.devices {
                    device.ir = None;
                }
            }
            TapState::CaptureDr => {
                for device in &mut self.devices {
                    device.capture_dr();
                }
                self.extra_stages = if self.all_bypassed() {
                    vec![false; self.extra_bypass_delay]
                } else {
                    Vec::new()
                };
            }
            TapState::ShiftDr => {
                // TDI enters the highest-index device and ripples toward
                // TDO.
                let mut bit = tdi;
                for device in self.devices.iter_mut().rev() {
                    let out = device.dr_shift & 1 == 1;
                    device.dr_shift = device.dr_shift >> 1
                        | (bit as u64) << (device.dr_len - 1);
                    bit = out;
                }
                for stage in self.extra_stages.iter_mut().rev() {
                    std::mem::swap(stage, &mut bit);
                }
            }
            TapState::UpdateDr => {
                for device in &mut self.devices {
                    device.update_dr();
                }
            }
            TapState::CaptureIr => {
                for device in &mut self.devices {
                    device.ir_shift = device.ir_capture as u64;
                }
            }
            TapState::ShiftIr => {
                let mut bit = tdi;
                for device in self.devices.iter_mut().rev() {
                    let out = device.ir_shift & 1 == 1;
                    device.ir_shift =
                        device.ir_shift >> 1 | (bit as u64) << (device.ir_len - 1);
                    bit = out;
                }
            }
            TapState::UpdateIr => {
                for device in &mut self.devices {
                    let mask = (1u64 << device.ir_len) - 1;
                    device.ir = Some(device.ir_shift & mask);
                }
            }
            _ => {}
        }

        self.state = self.state.next(tms);
        tdo
    }
}

impl RawJtagIo for ChainSim {
    fn tap_reset(&mut self) -> Result<(), DebugProbeError> {
        self.tms_sequence(0x1F, 5)?;
        self.tms_sequence(0, 1)
    }

    fn jtag_next(&mut self, tms: bool, tdi: bool) -> Result<bool, DebugProbeError> {
        Ok(self.clock(tms, tdi))
    }

    fn tms_sequence(&mut self, states: u32, cycles: u8) -> Result<(), DebugProbeError> {
        for index in 0..cycles {
            self.clock(states >> index & 1 == 1, true);
        }
        Ok(())
    }

    fn tdi_tdo_sequence(
        &mut self,
        tdi: &BitSlice<u8>,
        final_tms: bool,
    ) -> Result<BitVec<u8>, DebugProbeError> {
        let mut tdo = BitVec::with_capacity(tdi.len());
        let last = tdi.len().saturating_sub(1);
        for (index, bit) in tdi.iter().by_vals().enumerate() {
            tdo.push(self.clock(final_tms && index == last, bit));
        }
        Ok(tdo)
    }

    fn jtag_cycle(&mut self, tms: bool, tdi: bool, cycles: usize) -> Result<(), DebugProbeError> {
        for _ in 0..cycles {
            self.clock(tms, tdi);
        }
        Ok(())
    }
}

/// What the SWD target model expects next on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwdPhase {
    Header,
    Ack { read: bool },
    ReadData,
    WriteData,
}

/// An SWD target modelled at the sequence-call level.
///
/// Parses request headers out of 8-bit `seq_out` calls, produces ACK and
/// data phases, and routes register traffic into a [`SimDap`]. Line resets
/// and protocol switch sequences are recognised and counted.
#[derive(Debug)]
pub struct SwdTargetSim {
    /// The DP/AP register model.
    pub dap: SimDap,
    /// Corrupt the parity bit of the next data read.
    pub corrupt_next_read_parity: bool,
    /// Number of line resets seen (>= 50 high bits).
    pub line_resets: usize,
    /// Whether the JTAG-to-SWD switch key was observed.
    pub saw_jtag_to_swd: bool,
    /// Respond to nothing until a selection alert arrives.
    pub dormant: bool,
    /// Number of dormant selection alerts seen.
    pub selection_alerts: usize,

    phase: SwdPhase,
    pending: Option<(bool, bool, u8)>,
    high_bits_run: usize,
    ap_read_buffer: u32,
}

impl SwdTargetSim {
    /// A responsive target in the SWD state.
    pub fn new(dap: SimDap) -> Self {
        Self {
            dap,
            corrupt_next_read_parity: false,
            line_resets: 0,
            saw_jtag_to_swd: false,
            dormant: false,
            selection_alerts: 0,
            phase: SwdPhase::Header,
            pending: None,
            high_bits_run: 0,
            ap_read_buffer: 0,
        }
    }

    fn track_reset_bits(&mut self, value: u32, bits: u8) {
        for index in 0..bits {
            if value >> index & 1 == 1 {
                self.high_bits_run += 1;
                if self.high_bits_run >= 50 {
                    self.line_resets += 1;
                    self.high_bits_run = 0;
                    self.phase = SwdPhase::Header;
                }
            } else {
                self.high_bits_run = 0;
            }
        }
    }

    fn handle_header(&mut self, header: u32) {
        // {start, APnDP, RnW, A2, A3, parity, stop, park}, LSB-first.
        let start = header & 1 == 1;
        let ap = header >> 1 & 1 == 1;
        let read = header >> 2 & 1 == 1;
        let a2 = header >> 3 & 1;
        let a3 = header >> 4 & 1;
        let par = header >> 5 & 1 == 1;
        let stop = header >> 6 & 1 == 1;
        let park = header >> 7 & 1 == 1;

        if !start || stop || !park || par != parity(header >> 1, 4) {
            // Not a request; idle bits or garbage.
            return;
        }
        if self.dormant {
            return;
        }

        let address = (a3 << 3 | a2 << 2) as u8;
        self.pending = Some((ap, read, address));
        self.phase = SwdPhase::Ack { read };
    }
}

impl RawSwdIo for SwdTargetSim {
    fn swd_seq_in(&mut self, bits: u8) -> Result<u32, DebugProbeError> {
        if let SwdPhase::Ack { read } = self.phase {
            assert_eq!(bits, 3, "ack phase is three bits");
            let (ap, is_read, address) = self.pending.expect("ack without request");

            if self.dap.wait_responses > 0 {
                self.dap.wait_responses -= 1;
                self.dap.access_log.push((ap, is_read, address));
                self.phase = SwdPhase::Header;
                return Ok(SWD_ACK_WAIT);
            }
            if self.dap.sticky_error() && ap {
                self.dap.access_log.push((ap, is_read, address));
                self.phase = SwdPhase::Header;
                return Ok(SWD_ACK_FAULT);
            }

            self.phase = if read {
                SwdPhase::ReadData
            } else {
                SwdPhase::WriteData
            };
            return Ok(SWD_ACK_OK);
        }
        // Sampling a floating line outside a transaction.
        Ok(0)
    }

    fn swd_seq_in_parity(&mut self, bits: u8) -> Result<(u32, bool), DebugProbeError> {
        assert_eq!(self.phase, SwdPhase::ReadData, "unexpected read data phase");
        assert_eq!(bits, 32);
        let (ap, _, address) = self.pending.take().expect("read without request");

        let value = if ap {
            // Posted: this transaction returns the previous AP read.
            let previous = self.ap_read_buffer;
            let (_, v) = self.dap.access(true, true, address, 0);
            self.ap_read_buffer = v;
            previous
        } else {
            let (_, v) = self.dap.access(false, true, address, 0);
            v
        };

        self.phase = SwdPhase::Header;
        let good = !std::mem::take(&mut self.corrupt_next_read_parity);
        Ok((value, good))
    }

    fn swd_seq_out(&mut self, value: u32, bits: u8) -> Result<(), DebugProbeError> {
        if bits == 8 && self.phase == SwdPhase::Header && value != 0 && value != 0xFF {
            self.handle_header(value);
            return Ok(());
        }
        if bits == 16 && value == 0xE79E {
            self.saw_jtag_to_swd = true;
            return Ok(());
        }
        if bits == 32 && value == 0x19BC_0EA2 {
            // Final word of the selection alert sequence.
            self.selection_alerts += 1;
            self.dormant = false;
            return Ok(());
        }
        self.track_reset_bits(value, bits);
        Ok(())
    }

    fn swd_seq_out_parity(&mut self, value: u32, bits: u8) -> Result<(), DebugProbeError> {
        assert_eq!(bits, 32);
        if self.phase == SwdPhase::WriteData {
            let (ap, _, address) = self.pending.take().expect("write without request");
            self.dap.access(ap, false, address, value);
            self.phase = SwdPhase::Header;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_dap_packed_byte_lanes() {
        let mut dap = SimDap::new();
        for (i, byte) in [0x11u8, 0x22, 0x33, 0x44, 0x55, 0x66].iter().enumerate() {
            dap.memory.insert(0x2000_0002 + i as u32, *byte);
        }

        // CSW: byte size, packed increment.
        dap.access(false, false, 0x8, 0);
        dap.access(true, false, 0x0, 0x20);
        dap.access(true, false, 0x4, 0x2000_0002);

        // First packed read only covers lanes 2 and 3.
        let (_, first) = dap.access(true, true, 0xC, 0);
        assert_eq!(first & 0xFFFF_0000, 0x2211_0000);
        let (_, second) = dap.access(true, true, 0xC, 0);
        assert_eq!(second, 0x6655_4433);
    }

    #[test]
    fn sim_dap_wait_then_ok() {
        let mut dap = SimDap::new();
        dap.wait_responses = 2;
        assert_eq!(dap.access(false, true, 0x0, 0).0, SimAck::Wait);
        assert_eq!(dap.access(false, true, 0x0, 0).0, SimAck::Wait);
        let (ack, value) = dap.access(false, true, 0x0, 0);
        assert_eq!(ack, SimAck::Ok);
        assert_eq!(value, 0x2BA0_1477);
    }

    #[test]
    fn sim_dap_fault_clears_via_abort() {
        let mut dap = SimDap::new();
        dap.inject_fault();
        assert_eq!(dap.access(true, true, 0xC, 0).0, SimAck::Fault);
        // CTRL/STAT shows STICKYERR.
        let (_, ctrl) = dap.access(false, true, 0x4, 0);
        assert_ne!(ctrl & 1 << 5, 0);
        // ABORT with STKERRCLR clears it.
        dap.access(false, false, 0x0, 1 << 2);
        assert_eq!(dap.access(true, true, 0xC, 0).0, SimAck::Ok);
    }

    #[test]
    fn swd_sim_counts_line_resets() {
        let mut sim = SwdTargetSim::new(SimDap::new());
        sim.swd_seq_out(0xFFFF_FFFF, 32).unwrap();
        sim.swd_seq_out(0xFFFF_FFFF, 32).unwrap();
        assert_eq!(sim.line_resets, 1);
    }
}
