//! The armv6-M/armv7-M core driver.

use std::time::{Duration, Instant};

use super::cortex_m::{
    dwt, fp_rev1_comparator, fp_rev2_comparator, registers, Aircr, Dcrdr, Dcrsr, Dhcsr, Demcr,
    FpCtrl, Mvfr0, FP_COMP_BASE,
};
use super::{CortexMState, Dfsr};
use crate::architecture::arm::ArmError;
use crate::core::{
    Breakwatch, BreakwatchKind, CoreInterface, CoreStatus, HaltReason, MemoryMappedRegister,
    RegisterId, VectorCatch,
};
use crate::memory::MemoryInterface;
use crate::Error;

/// How long a DCRSR/DCRDR transfer may take.
const REGISTER_TIMEOUT: Duration = Duration::from_millis(100);

/// How long we give a reset to propagate.
const RESET_TIMEOUT: Duration = Duration::from_millis(500);

/// Driver for a Cortex-M core reached through a memory interface.
///
/// The driver borrows the memory path per call chain; the comparator
/// inventory and stepping flag live in the target's [`CortexMState`].
pub struct Armv7m<'probe> {
    memory: &'probe mut dyn MemoryInterface,
    state: &'probe mut CortexMState,
}

impl<'probe> Armv7m<'probe> {
    /// Attach to the core, enabling halting debug and taking the
    /// comparator inventory on first contact.
    pub fn new(
        memory: &'probe mut dyn MemoryInterface,
        state: &'probe mut CortexMState,
    ) -> Result<Self, Error> {
        let this = Self { memory, state };

        if !this.state.initialized {
            let mut dhcsr = Dhcsr::from(0);
            dhcsr.set_c_debugen(true);
            dhcsr.enable_write();
            this.memory.write_word_32(Dhcsr::ADDRESS, dhcsr.into())?;

            let fp_ctrl = FpCtrl::from(this.memory.read_word_32(FpCtrl::ADDRESS)?);
            this.state.fpb_rev = fp_ctrl.rev() + 1;
            this.state.fpb_slots = vec![false; fp_ctrl.num_code() as usize];

            let dwt_ctrl = this.memory.read_word_32(dwt::CTRL)?;
            this.state.dwt_slots = vec![false; (dwt_ctrl >> 28) as usize];

            this.state.fp_present =
                Mvfr0::from(this.memory.read_word_32(Mvfr0::ADDRESS)?).fp_present();

            // Start from a clean slate of sticky fault flags.
            this.memory
                .write_word_32(Dfsr::ADDRESS, Dfsr::clear_all().into())?;

            tracing::debug!(
                "Cortex-M debug up: {} FPB rev{} comparators, {} DWT comparators, FPU: {}",
                this.state.fpb_slots.len(),
                this.state.fpb_rev,
                this.state.dwt_slots.len(),
                this.state.fp_present,
            );
            this.state.initialized = true;
        }

        Ok(this)
    }

    fn read_dhcsr(&mut self) -> Result<Dhcsr, Error> {
        Ok(Dhcsr::from(self.memory.read_word_32(Dhcsr::ADDRESS)?))
    }

    fn write_dhcsr(&mut self, mut dhcsr: Dhcsr) -> Result<(), Error> {
        dhcsr.enable_write();
        self.memory.write_word_32(Dhcsr::ADDRESS, dhcsr.into())
    }

    fn wait_for_halt(&mut self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.read_dhcsr()?.s_halt() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Arm(ArmError::Timeout));
            }
        }
    }

    fn wait_for_regrdy(&mut self) -> Result<(), Error> {
        let deadline = Instant::now() + REGISTER_TIMEOUT;
        loop {
            if self.read_dhcsr()?.s_regrdy() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Arm(ArmError::Timeout));
            }
        }
    }

    /// The comparator address of the DWT unit that matched, if any still
    /// flags one.
    fn matched_watchpoint(&mut self) -> Result<Option<u32>, Error> {
        for slot in 0..self.state.dwt_slots.len() as u32 {
            let base = dwt::COMP_BASE + slot * dwt::STRIDE;
            let function = self.memory.read_word_32(base + dwt::FUNCTION)?;
            if function & dwt::FUNCTION_MATCHED != 0 {
                return Ok(Some(self.memory.read_word_32(base + dwt::COMP)?));
            }
        }
        Ok(None)
    }

    /// Hand the core back: drop C_DEBUGEN so halting debug is off and the
    /// core runs free. Idempotent.
    pub fn detach(&mut self) -> Result<(), Error> {
        self.write_dhcsr(Dhcsr::from(0))
    }

    /// Reset without touching the peripheral domain, via VECTRESET. Only
    /// architecturally defined on armv7-M.
    pub fn reset_core_only(&mut self, halt: bool) -> Result<(), Error> {
        self.prepare_reset_catch(halt)?;
        let mut aircr = Aircr::from(0);
        aircr.vectkey();
        aircr.set_vectclractive(true);
        aircr.set_vectreset(true);
        self.memory.write_word_32(Aircr::ADDRESS, aircr.into())?;
        self.finish_reset(halt)
    }

    fn prepare_reset_catch(&mut self, halt: bool) -> Result<(), Error> {
        let mut demcr = Demcr::from(self.memory.read_word_32(Demcr::ADDRESS)?);
        demcr.set_vc_corereset(halt);
        self.memory.write_word_32(Demcr::ADDRESS, demcr.into())?;
        // Reading DHCSR clears the sticky S_RESET_ST, so the poll below
        // observes this reset and not an older one.
        self.read_dhcsr()?;
        Ok(())
    }

    fn finish_reset(&mut self, halt: bool) -> Result<(), Error> {
        let deadline = Instant::now() + RESET_TIMEOUT;
        loop {
            if self.read_dhcsr()?.s_reset_st() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(Error::Arm(ArmError::Timeout));
            }
        }

        if halt {
            self.wait_for_halt(RESET_TIMEOUT)?;
            self.memory
                .write_word_32(Dfsr::ADDRESS, Dfsr::clear_all().into())?;
        }
        Ok(())
    }
}

impl CoreInterface for Armv7m<'_> {
    fn status(&mut self) -> Result<CoreStatus, Error> {
        let dhcsr = self.read_dhcsr()?;
        if dhcsr.s_lockup() {
            return Ok(CoreStatus::Halted(HaltReason::Fault));
        }
        if !dhcsr.s_halt() {
            return Ok(if dhcsr.s_sleep() {
                CoreStatus::Sleeping
            } else {
                CoreStatus::Running
            });
        }

        let dfsr = Dfsr::from(self.memory.read_word_32(Dfsr::ADDRESS)?);
        let mut reason = dfsr.halt_reason(self.state.stepping);
        if let HaltReason::Watchpoint { address } = &mut reason {
            *address = self.matched_watchpoint()?;
        }

        // The flags are sticky; clear them so the next halt decodes fresh.
        self.memory
            .write_word_32(Dfsr::ADDRESS, Dfsr::clear_all().into())?;
        Ok(CoreStatus::Halted(reason))
    }

    fn halt(&mut self, timeout: Duration) -> Result<(), Error> {
        let mut dhcsr = Dhcsr::from(0);
        dhcsr.set_c_debugen(true);
        dhcsr.set_c_halt(true);
        self.write_dhcsr(dhcsr)?;

        self.state.stepping = false;
        self.wait_for_halt(timeout)
    }

    fn run(&mut self) -> Result<(), Error> {
        let mut dhcsr = Dhcsr::from(0);
        dhcsr.set_c_debugen(true);
        self.write_dhcsr(dhcsr)?;
        self.state.stepping = false;
        Ok(())
    }

    fn step(&mut self) -> Result<(), Error> {
        // Mask interrupts for the step so a pending IRQ doesn't hijack the
        // program counter; the maskints change must happen while C_HALT is
        // still set.
        let mut dhcsr = Dhcsr::from(0);
        dhcsr.set_c_debugen(true);
        dhcsr.set_c_halt(true);
        dhcsr.set_c_maskints(true);
        self.write_dhcsr(dhcsr)?;

        let mut dhcsr = Dhcsr::from(0);
        dhcsr.set_c_debugen(true);
        dhcsr.set_c_maskints(true);
        dhcsr.set_c_step(true);
        self.write_dhcsr(dhcsr)?;

        self.state.stepping = true;
        self.wait_for_halt(REGISTER_TIMEOUT)
    }

    fn reset(&mut self, halt: bool) -> Result<(), Error> {
        self.prepare_reset_catch(halt)?;
        let mut aircr = Aircr::from(0);
        aircr.vectkey();
        aircr.set_sysresetreq(true);
        self.memory.write_word_32(Aircr::ADDRESS, aircr.into())?;
        self.finish_reset(halt)
    }

    fn read_core_reg(&mut self, id: RegisterId) -> Result<u32, Error> {
        let mut dcrsr = Dcrsr::from(0);
        dcrsr.set_regsel(id.0);
        self.memory.write_word_32(Dcrsr::ADDRESS, dcrsr.into())?;
        self.wait_for_regrdy()?;
        self.memory.read_word_32(Dcrdr::ADDRESS)
    }

    fn write_core_reg(&mut self, id: RegisterId, value: u32) -> Result<(), Error> {
        self.memory.write_word_32(Dcrdr::ADDRESS, value)?;
        let mut dcrsr = Dcrsr::from(0);
        dcrsr.set_regsel(id.0);
        dcrsr.set_regwnr(true);
        self.memory.write_word_32(Dcrsr::ADDRESS, dcrsr.into())?;
        self.wait_for_regrdy()
    }

    fn set_breakwatch(&mut self, entry: &mut Breakwatch) -> Result<(), Error> {
        match entry.kind {
            BreakwatchKind::Breakpoint => {
                let slot = self
                    .state
                    .fpb_slots
                    .iter()
                    .position(|used| !used)
                    .ok_or(Error::Arm(ArmError::NotSupported(
                        "all breakpoint comparators in use",
                    )))?;

                let comparator = if self.state.fpb_rev == 1 {
                    fp_rev1_comparator(entry.address).ok_or(Error::Arm(ArmError::OutOfRange {
                        address: entry.address,
                    }))?
                } else {
                    fp_rev2_comparator(entry.address)
                };

                let mut ctrl = FpCtrl::from(0);
                ctrl.set_key(true);
                ctrl.set_enable(true);
                self.memory.write_word_32(FpCtrl::ADDRESS, ctrl.into())?;
                self.memory
                    .write_word_32(FP_COMP_BASE + slot as u32 * 4, comparator)?;

                self.state.fpb_slots[slot] = true;
                entry.slot = slot;
            }
            kind => {
                if !matches!(entry.size, 1 | 2 | 4) {
                    return Err(Error::Arm(ArmError::BadAlignment {
                        address: entry.address,
                        alignment: entry.size as usize,
                    }));
                }
                let slot = self
                    .state
                    .dwt_slots
                    .iter()
                    .position(|used| !used)
                    .ok_or(Error::Arm(ArmError::NotSupported(
                        "all watchpoint comparators in use",
                    )))?;

                let function = match kind {
                    BreakwatchKind::WatchRead => dwt::FUNCTION_READ,
                    BreakwatchKind::WatchWrite => dwt::FUNCTION_WRITE,
                    _ => dwt::FUNCTION_ACCESS,
                };

                let base = dwt::COMP_BASE + slot as u32 * dwt::STRIDE;
                self.memory.write_word_32(base + dwt::COMP, entry.address)?;
                self.memory
                    .write_word_32(base + dwt::MASK, entry.size.trailing_zeros())?;
                self.memory.write_word_32(base + dwt::FUNCTION, function)?;

                self.state.dwt_slots[slot] = true;
                entry.slot = slot;
            }
        }
        Ok(())
    }

    fn clear_breakwatch(&mut self, entry: &Breakwatch) -> Result<(), Error> {
        match entry.kind {
            BreakwatchKind::Breakpoint => {
                self.memory
                    .write_word_32(FP_COMP_BASE + entry.slot as u32 * 4, 0)?;
                if let Some(slot) = self.state.fpb_slots.get_mut(entry.slot) {
                    *slot = false;
                }
            }
            _ => {
                let base = dwt::COMP_BASE + entry.slot as u32 * dwt::STRIDE;
                self.memory.write_word_32(base + dwt::FUNCTION, 0)?;
                if let Some(slot) = self.state.dwt_slots.get_mut(entry.slot) {
                    *slot = false;
                }
            }
        }
        Ok(())
    }

    fn set_vector_catch(&mut self, catch: VectorCatch, enable: bool) -> Result<(), Error> {
        let mut demcr = Demcr::from(self.memory.read_word_32(Demcr::ADDRESS)?);
        match catch {
            VectorCatch::HardFault => demcr.set_vc_harderr(enable),
            VectorCatch::InterruptError => demcr.set_vc_interr(enable),
            VectorCatch::BusFault => demcr.set_vc_buserr(enable),
            VectorCatch::StateError => demcr.set_vc_staterr(enable),
            VectorCatch::CheckError => demcr.set_vc_chkerr(enable),
            VectorCatch::NoCoprocessorError => demcr.set_vc_nocperr(enable),
            VectorCatch::MemManageError => demcr.set_vc_mmerr(enable),
            VectorCatch::CoreReset => demcr.set_vc_corereset(enable),
        }
        self.memory.write_word_32(Demcr::ADDRESS, demcr.into())
    }

    fn architecture(&self) -> &'static str {
        "armv7m"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::mock::MockMemory;

    const DHCSR_HALTED: u32 = 1 << 17 | 0b11;
    const DHCSR_REGRDY: u32 = 1 << 16 | 1 << 17;

    fn fresh_memory() -> MockMemory {
        let mut memory = MockMemory::new();
        // 6 FPB rev1 comparators, 4 DWT comparators, FPU present.
        memory.set_word(FpCtrl::ADDRESS, 0x0000_0060);
        memory.set_word(dwt::CTRL, 0x4000_0000);
        memory.set_word(Mvfr0::ADDRESS, 0x1011_0021);
        memory
    }

    #[test]
    fn attach_takes_comparator_inventory() {
        let mut memory = fresh_memory();
        let mut state = CortexMState::default();
        let _ = Armv7m::new(&mut memory, &mut state).unwrap();

        assert_eq!(state.fpb_slots.len(), 6);
        assert_eq!(state.fpb_rev, 1);
        assert_eq!(state.dwt_slots.len(), 4);
        assert!(state.fp_present);
        // Debug got enabled with the key.
        assert_eq!(memory.writes_to(Dhcsr::ADDRESS), vec![0xA05F_0001]);
    }

    #[test]
    fn halt_writes_the_debug_key_and_polls() {
        let mut memory = fresh_memory();
        memory.script_read(Dhcsr::ADDRESS, &[0, DHCSR_HALTED]);
        let mut state = CortexMState::default();
        let mut core = Armv7m::new(&mut memory, &mut state).unwrap();

        core.halt(Duration::from_millis(100)).unwrap();
        let writes = memory.writes_to(Dhcsr::ADDRESS);
        assert_eq!(*writes.last().unwrap(), 0xA05F_0003);
    }

    #[test]
    fn register_read_uses_dcrsr_handshake() {
        let mut memory = fresh_memory();
        memory.set_word(Dhcsr::ADDRESS, DHCSR_REGRDY);
        memory.set_word(Dcrdr::ADDRESS, 0x1234_5678);
        let mut state = CortexMState::default();
        let mut core = Armv7m::new(&mut memory, &mut state).unwrap();

        let pc = core.read_core_reg(registers::PC).unwrap();
        assert_eq!(pc, 0x1234_5678);
        assert_eq!(memory.writes_to(Dcrsr::ADDRESS), vec![15]);
    }

    #[test]
    fn register_write_sets_regwnr() {
        let mut memory = fresh_memory();
        memory.set_word(Dhcsr::ADDRESS, DHCSR_REGRDY);
        let mut state = CortexMState::default();
        let mut core = Armv7m::new(&mut memory, &mut state).unwrap();

        core.write_core_reg(registers::r(2), 42).unwrap();
        assert_eq!(memory.word(Dcrdr::ADDRESS), 42);
        assert_eq!(memory.writes_to(Dcrsr::ADDRESS), vec![1 << 16 | 2]);
    }

    #[test]
    fn breakpoint_slots_allocate_and_recycle() {
        let mut memory = fresh_memory();
        let mut state = CortexMState::default();
        let mut core = Armv7m::new(&mut memory, &mut state).unwrap();

        let mut first = Breakwatch {
            kind: BreakwatchKind::Breakpoint,
            address: 0x0800_0100,
            size: 2,
            slot: 0,
        };
        let mut second = Breakwatch {
            address: 0x0800_0202,
            ..first
        };
        core.set_breakwatch(&mut first).unwrap();
        core.set_breakwatch(&mut second).unwrap();
        assert_eq!((first.slot, second.slot), (0, 1));
        drop(core);

        // Rev1 encoding: lower halfword for +0x0, upper for +0x2.
        assert_eq!(memory.word(FP_COMP_BASE), 0x4800_0101);
        assert_eq!(memory.word(FP_COMP_BASE + 4), 0x8800_0201);

        let mut core = Armv7m::new(&mut memory, &mut state).unwrap();
        core.clear_breakwatch(&first).unwrap();
        let mut third = Breakwatch {
            address: 0x0800_0400,
            ..first
        };
        core.set_breakwatch(&mut third).unwrap();
        assert_eq!(third.slot, 0);
    }

    #[test]
    fn rev1_breakpoints_reject_high_addresses() {
        let mut memory = fresh_memory();
        let mut state = CortexMState::default();
        let mut core = Armv7m::new(&mut memory, &mut state).unwrap();

        let mut entry = Breakwatch {
            kind: BreakwatchKind::Breakpoint,
            address: 0x2000_0000,
            size: 2,
            slot: 0,
        };
        assert!(core.set_breakwatch(&mut entry).is_err());
    }

    #[test]
    fn watchpoint_programs_comp_mask_function() {
        let mut memory = fresh_memory();
        let mut state = CortexMState::default();
        let mut core = Armv7m::new(&mut memory, &mut state).unwrap();

        let mut entry = Breakwatch {
            kind: BreakwatchKind::WatchWrite,
            address: 0x2000_0010,
            size: 4,
            slot: 0,
        };
        core.set_breakwatch(&mut entry).unwrap();

        assert_eq!(memory.word(dwt::COMP_BASE + dwt::COMP), 0x2000_0010);
        assert_eq!(memory.word(dwt::COMP_BASE + dwt::MASK), 2);
        assert_eq!(
            memory.word(dwt::COMP_BASE + dwt::FUNCTION),
            dwt::FUNCTION_WRITE
        );
    }

    #[test]
    fn status_decodes_watchpoint_with_address() {
        let mut memory = fresh_memory();
        let mut state = CortexMState::default();
        let mut core = Armv7m::new(&mut memory, &mut state).unwrap();

        let mut entry = Breakwatch {
            kind: BreakwatchKind::WatchAccess,
            address: 0x2000_0020,
            size: 1,
            slot: 0,
        };
        core.set_breakwatch(&mut entry).unwrap();

        memory.set_word(Dhcsr::ADDRESS, DHCSR_HALTED);
        memory.set_word(Dfsr::ADDRESS, 0b100);
        memory.set_word(
            dwt::COMP_BASE + dwt::FUNCTION,
            dwt::FUNCTION_ACCESS | dwt::FUNCTION_MATCHED,
        );

        let mut core = Armv7m::new(&mut memory, &mut state).unwrap();
        let status = core.status().unwrap();
        assert_eq!(
            status,
            CoreStatus::Halted(HaltReason::Watchpoint {
                address: Some(0x2000_0020)
            })
        );
        // The sticky DFSR flags were write-1-cleared after decoding.
        assert_eq!(*memory.writes_to(Dfsr::ADDRESS).last().unwrap(), 0b11111);
    }

    #[test]
    fn step_masks_interrupts() {
        let mut memory = fresh_memory();
        memory.script_read(Dhcsr::ADDRESS, &[DHCSR_HALTED]);
        let mut state = CortexMState::default();
        let mut core = Armv7m::new(&mut memory, &mut state).unwrap();

        core.step().unwrap();
        let writes = memory.writes_to(Dhcsr::ADDRESS);
        // Mask-while-halted first, then the step request.
        assert_eq!(writes[writes.len() - 2], 0xA05F_000B);
        assert_eq!(writes[writes.len() - 1], 0xA05F_000D);
        assert!(state.stepping);
    }

    #[test]
    fn reset_catches_the_reset_vector() {
        let mut memory = fresh_memory();
        // S_RESET_ST then halted out of reset.
        memory.script_read(Dhcsr::ADDRESS, &[0, 1 << 25 | DHCSR_HALTED, DHCSR_HALTED]);
        let mut state = CortexMState::default();
        let mut core = Armv7m::new(&mut memory, &mut state).unwrap();

        core.reset(true).unwrap();
        assert_eq!(memory.word(Demcr::ADDRESS) & 1, 1);
        let aircr = memory.writes_to(Aircr::ADDRESS);
        assert_eq!(aircr, vec![0x05FA_0004]);
    }
}

// The core driver doubles as the target's memory path, so flash drivers
// get run control and memory access through one object.
impl MemoryInterface for Armv7m<'_> {
    fn read_word_32(&mut self, address: u32) -> Result<u32, Error> {
        self.memory.read_word_32(address)
    }
    fn read_word_16(&mut self, address: u32) -> Result<u16, Error> {
        self.memory.read_word_16(address)
    }
    fn read_word_8(&mut self, address: u32) -> Result<u8, Error> {
        self.memory.read_word_8(address)
    }
    fn read_32(&mut self, address: u32, data: &mut [u32]) -> Result<(), Error> {
        self.memory.read_32(address, data)
    }
    fn read_16(&mut self, address: u32, data: &mut [u16]) -> Result<(), Error> {
        self.memory.read_16(address, data)
    }
    fn read_8(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error> {
        self.memory.read_8(address, data)
    }
    fn write_word_32(&mut self, address: u32, data: u32) -> Result<(), Error> {
        self.memory.write_word_32(address, data)
    }
    fn write_word_16(&mut self, address: u32, data: u16) -> Result<(), Error> {
        self.memory.write_word_16(address, data)
    }
    fn write_word_8(&mut self, address: u32, data: u8) -> Result<(), Error> {
        self.memory.write_word_8(address, data)
    }
    fn write_32(&mut self, address: u32, data: &[u32]) -> Result<(), Error> {
        self.memory.write_32(address, data)
    }
    fn write_16(&mut self, address: u32, data: &[u16]) -> Result<(), Error> {
        self.memory.write_16(address, data)
    }
    fn write_8(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        self.memory.write_8(address, data)
    }
    fn flush(&mut self) -> Result<(), Error> {
        self.memory.flush()
    }
}
