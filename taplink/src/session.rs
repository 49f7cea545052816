//! Target lifecycle: the probe registry, attach/detach, breakwatch
//! bookkeeping, the GDB memory map and monitor commands.

use std::fmt::Write as _;
use std::time::Duration;

use crate::architecture::arm::ap::MemoryAp;
use crate::architecture::arm::core::armv7m::Armv7m;
use crate::architecture::arm::core::CortexMState;
use crate::architecture::arm::memory::{romtable, AdiMemoryInterface};
use crate::architecture::arm::{ArmCommunicationInterface, DpAddress, RawDapAccess};
use crate::config::RamRegion;
use crate::core::{Breakwatch, BreakwatchKind, CoreInterface, CoreStatus, RegisterId};
use crate::flashing::{FlashContext, FlashDriver, FlashRegion, TargetAccess};
use crate::memory::MemoryInterface;
use crate::Error;

/// How long an attach-time halt request may take.
const HALT_TIMEOUT: Duration = Duration::from_secs(1);

/// A `qRcmd`-style monitor command.
pub struct MonitorCommand {
    /// The word the user types.
    pub name: &'static str,
    /// One-line description for `monitor help`.
    pub help: &'static str,
    /// The implementation; output goes to the user verbatim.
    pub handler: fn(&mut dyn TargetAccess, &[&str], &mut String) -> Result<(), Error>,
}

/// A claimed target: everything a vendor probe learned about the silicon.
pub struct Target {
    /// Driver name, e.g. `STM32F4`.
    pub name: &'static str,
    /// RAM regions for the memory map.
    pub ram_regions: Vec<RamRegion>,
    /// Flash banks and the programming pipeline.
    pub flash: FlashContext,
    /// Breakpoints and watchpoints currently set.
    pub breakwatch: Vec<Breakwatch>,
    /// Core-driver private state.
    pub core_state: CortexMState,
    /// Per-target monitor commands.
    pub commands: Vec<MonitorCommand>,
}

impl Target {
    /// A bare target claimed by `name`.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ram_regions: Vec::new(),
            flash: FlashContext::new(),
            breakwatch: Vec::new(),
            core_state: CortexMState::default(),
            commands: Vec::new(),
        }
    }

    /// Register a RAM region.
    pub fn add_ram_region(&mut self, start: u32, length: u32) {
        self.ram_regions.push(RamRegion::new(start, length));
    }

    /// Register a Flash bank driver.
    pub fn add_flash(&mut self, driver: Box<dyn FlashDriver>) {
        self.flash.add_bank(driver);
    }

    /// Register a monitor command.
    pub fn add_command(&mut self, command: MonitorCommand) {
        self.commands.push(command);
    }

    /// The GDB `<memory-map>` fragment for this target, deterministically
    /// ordered by start address.
    pub fn memory_map_xml(&self) -> String {
        let mut rams = self.ram_regions.clone();
        rams.sort_by_key(|region| region.range.start);
        let mut flash: Vec<FlashRegion> = self.flash.regions();
        flash.sort_by_key(|region| region.start);

        let mut xml = String::from("<memory-map>");
        for region in rams {
            write!(
                xml,
                "<memory type=\"ram\" start=\"{:#x}\" length=\"{:#x}\"/>",
                region.range.start,
                region.length()
            )
            .expect("writing to a String cannot fail");
        }
        for region in flash {
            write!(
                xml,
                "<memory type=\"flash\" start=\"{:#x}\" length=\"{:#x}\">\
                 <property name=\"blocksize\">{:#x}</property></memory>",
                region.start, region.length, region.block_size
            )
            .expect("writing to a String cannot fail");
        }
        xml.push_str("</memory-map>");
        xml
    }
}

/// A vendor probe: look at the silicon, claim it or decline.
pub type ProbeFn = fn(&mut dyn MemoryInterface) -> Result<Option<Target>, Error>;

/// The ordered probe list. First claimant wins, so specific drivers come
/// before generic fallbacks.
pub struct ProbeRegistry {
    entries: Vec<(&'static str, ProbeFn)>,
}

impl ProbeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// All builtin vendor drivers, most specific first.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("stm32f4", crate::vendor::stm32f4::probe);
        registry.register("stm32l4", crate::vendor::stm32l4::probe);
        registry.register("lpc11xx", crate::vendor::lpc::probe);
        registry.register("stellaris", crate::vendor::stellaris::probe);
        registry.register("kinetis", crate::vendor::kinetis::probe);
        registry.register("cortexm", crate::vendor::cortexm::probe);
        registry
    }

    /// Append a probe. Order of registration is the order of preference.
    pub fn register(&mut self, name: &'static str, probe: ProbeFn) {
        self.entries.push((name, probe));
    }

    /// Run the chain; the first probe that claims the target decides.
    pub fn probe(&self, memory: &mut dyn MemoryInterface) -> Result<Option<Target>, Error> {
        for (name, probe) in &self.entries {
            match probe(memory) {
                Ok(Some(target)) => {
                    tracing::info!("probe '{name}' claimed the target as {}", target.name);
                    return Ok(Some(target));
                }
                Ok(None) => {}
                Err(e) => tracing::debug!("probe '{name}' failed: {e}"),
            }
        }
        Ok(None)
    }
}

impl Default for ProbeRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// A debug session: one DP, one MEM-AP, one claimed target.
pub struct Session<P: RawDapAccess> {
    iface: ArmCommunicationInterface<P>,
    ap: Option<MemoryAp>,
    target: Target,
    in_flash_mode: bool,
}

impl<P: RawDapAccess> Session<P> {
    /// Bring up the wire, discover the memory AP, run the probe chain and
    /// halt the claimed core.
    pub fn attach(probe: P, dp: DpAddress, registry: &ProbeRegistry) -> Result<Self, Error> {
        let mut iface = ArmCommunicationInterface::connect(probe, dp)?;

        let aps = iface.valid_access_ports()?;
        let ap_address = aps.first().ok_or(Error::UnknownTarget {
            designer: 0,
            part: 0,
        })?;
        let ap = iface.memory_ap(ap_address)?;
        let rom_base = ap.rom_table_address();

        let mut session = Self {
            iface,
            ap: Some(ap),
            target: Target::new("unknown"),
            in_flash_mode: false,
        };

        let mut chip_info = None;
        if let Some(base) = rom_base {
            // Identification is best-effort; a part with a broken ROM table
            // can still be claimed by a vendor probe.
            chip_info = session
                .with_memory(|memory| romtable::read_chip_info(memory, base))
                .ok()
                .flatten();
            if let Some(info) = &chip_info {
                tracing::info!("ROM table identifies the part as {info}");
            }
        }

        let target = session.with_memory(|memory| registry.probe(memory))?;
        session.target = target.ok_or_else(|| {
            let (designer, part) = chip_info
                .map(|info| {
                    let designer =
                        (info.designer.cc as u16) << 8 | info.designer.id as u16;
                    (designer, info.part)
                })
                .unwrap_or((0, 0));
            Error::UnknownTarget { designer, part }
        })?;

        session.halt()?;
        Ok(session)
    }

    /// The claimed target.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// The communication interface, e.g. for monitor diagnostics.
    pub fn interface_mut(&mut self) -> &mut ArmCommunicationInterface<P> {
        &mut self.iface
    }

    /// Run `f` over the target's memory.
    fn with_memory<R>(
        &mut self,
        f: impl FnOnce(&mut AdiMemoryInterface<'_, P>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let ap = self.ap.take().expect("memory AP is present between calls");
        let mut memory = AdiMemoryInterface::new(&mut self.iface, ap);
        let result = f(&mut memory);
        self.ap = Some(memory.into_ap());
        result
    }

    /// Run `f` with the core driver and the target's flash/breakwatch
    /// state, which stay independently borrowable.
    fn with_core<R>(
        &mut self,
        f: impl FnOnce(
            &mut Armv7m<'_>,
            &mut FlashContext,
            &mut Vec<Breakwatch>,
        ) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let ap = self.ap.take().expect("memory AP is present between calls");
        let mut memory = AdiMemoryInterface::new(&mut self.iface, ap);
        let Target {
            flash,
            breakwatch,
            core_state,
            ..
        } = &mut self.target;

        let result = (|| {
            let mut core = Armv7m::new(&mut memory, core_state)?;
            f(&mut core, flash, breakwatch)
        })();

        self.ap = Some(memory.into_ap());
        result
    }

    /// Read target memory.
    pub fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error> {
        self.with_memory(|memory| memory.read(address, data))
    }

    /// Write target memory.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        self.with_memory(|memory| memory.write(address, data))
    }

    /// Read aligned words from target memory.
    pub fn read_memory_32(&mut self, address: u32, data: &mut [u32]) -> Result<(), Error> {
        self.with_memory(|memory| memory.read_32(address, data))
    }

    /// Write aligned words to target memory.
    pub fn write_memory_32(&mut self, address: u32, data: &[u32]) -> Result<(), Error> {
        self.with_memory(|memory| memory.write_32(address, data))
    }

    /// Halt the core.
    pub fn halt(&mut self) -> Result<(), Error> {
        self.with_core(|core, _, _| core.halt(HALT_TIMEOUT))
    }

    /// Resume the core.
    pub fn run(&mut self) -> Result<(), Error> {
        self.with_core(|core, _, _| core.run())
    }

    /// Single-step the core.
    pub fn step(&mut self) -> Result<(), Error> {
        self.with_core(|core, _, _| core.step())
    }

    /// Reset the target, optionally halting at the reset vector.
    pub fn reset(&mut self, halt: bool) -> Result<(), Error> {
        self.with_core(|core, _, _| core.reset(halt))
    }

    /// Current core status with a decoded halt reason.
    pub fn status(&mut self) -> Result<CoreStatus, Error> {
        self.with_core(|core, _, _| core.status())
    }

    /// Read a core register.
    pub fn read_register(&mut self, id: RegisterId) -> Result<u32, Error> {
        self.with_core(|core, _, _| core.read_core_reg(id))
    }

    /// Write a core register.
    pub fn write_register(&mut self, id: RegisterId, value: u32) -> Result<(), Error> {
        self.with_core(|core, _, _| core.write_core_reg(id, value))
    }

    /// Set a breakpoint or watchpoint and record it on the target.
    pub fn set_breakwatch(
        &mut self,
        kind: BreakwatchKind,
        address: u32,
        size: u32,
    ) -> Result<(), Error> {
        self.with_core(|core, _, breakwatch| {
            let mut entry = Breakwatch {
                kind,
                address,
                size,
                slot: 0,
            };
            core.set_breakwatch(&mut entry)?;
            breakwatch.push(entry);
            Ok(())
        })
    }

    /// Clear a previously set breakpoint or watchpoint, freeing its slot.
    pub fn clear_breakwatch(
        &mut self,
        kind: BreakwatchKind,
        address: u32,
        size: u32,
    ) -> Result<(), Error> {
        self.with_core(|core, _, breakwatch| {
            let index = breakwatch
                .iter()
                .position(|e| e.kind == kind && e.address == address && e.size == size)
                .ok_or(Error::Arm(crate::architecture::arm::ArmError::NotSupported(
                    "no such breakpoint",
                )))?;
            let entry = breakwatch.remove(index);
            core.clear_breakwatch(&entry)
        })
    }

    /// First erase or write after attach resets the target so the Flash
    /// controller starts from sane interrupt state.
    fn enter_flash_mode(&mut self) -> Result<(), Error> {
        if !self.in_flash_mode {
            self.reset(true)?;
            self.in_flash_mode = true;
        }
        Ok(())
    }

    /// GDB `vFlashErase`.
    pub fn flash_erase(&mut self, address: u32, length: u32) -> Result<(), Error> {
        self.enter_flash_mode()?;
        self.with_core(|core, flash, _| {
            flash.erase(core, address, length).map_err(Box::new)?;
            Ok(())
        })
    }

    /// GDB `vFlashWrite`.
    pub fn flash_write(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        self.enter_flash_mode()?;
        self.with_core(|core, flash, _| {
            flash.write(core, address, data).map_err(Box::new)?;
            Ok(())
        })
    }

    /// GDB `vFlashDone`: flush, relock, reset.
    pub fn flash_done(&mut self) -> Result<(), Error> {
        let result = self.with_core(|core, flash, _| {
            flash.complete(core).map_err(Box::new)?;
            Ok(())
        });
        if self.in_flash_mode {
            self.in_flash_mode = false;
            self.reset(true)?;
        }
        result
    }

    /// Erase every bank that supports a device-level erase.
    pub fn mass_erase(&mut self) -> Result<(), Error> {
        self.enter_flash_mode()?;
        let result = self.with_core(|core, flash, _| {
            flash.mass_erase(core).map_err(Box::new)?;
            Ok(())
        });
        self.in_flash_mode = false;
        result
    }

    /// Dispatch a monitor command line to the target and global tables.
    pub fn monitor(&mut self, line: &str) -> Result<String, Error> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let mut out = String::new();

        let Some((&command, args)) = words.split_first() else {
            self.monitor_help(&mut out);
            return Ok(out);
        };

        if let Some(handler) = self
            .target
            .commands
            .iter()
            .find(|c| c.name == command)
            .map(|c| c.handler)
        {
            self.with_core(|core, _, _| handler(core, args, &mut out))?;
            return Ok(out);
        }

        match command {
            "help" => self.monitor_help(&mut out),
            "reset" => {
                self.reset(false)?;
                out.push_str("target reset\n");
            }
            "erase_mass" => {
                self.mass_erase()?;
                out.push_str("flash erased\n");
            }
            other => {
                let _ = writeln!(out, "unknown command: {other}");
            }
        }
        Ok(out)
    }

    fn monitor_help(&self, out: &mut String) {
        out.push_str("general commands:\n");
        out.push_str("  help        print this text\n");
        out.push_str("  reset       reset the target\n");
        out.push_str("  erase_mass  erase all flash banks\n");
        if !self.target.commands.is_empty() {
            let _ = writeln!(out, "{} commands:", self.target.name);
            for command in &self.target.commands {
                let _ = writeln!(out, "  {:<11} {}", command.name, command.help);
            }
        }
    }

    /// Tear the session down: flush and relock the Flash, free the
    /// comparators, hand the core back, return the transport.
    pub fn detach(mut self) -> Result<P, Error> {
        // Buffers are flushed and every prepared bank sees its `done`,
        // even if something here fails.
        let flash_result = self.with_core(|core, flash, _| {
            flash.complete(core).map_err(Box::new)?;
            Ok(())
        });

        let entries: Vec<Breakwatch> = self.target.breakwatch.drain(..).collect();
        for entry in &entries {
            let _ = self.with_core(|core, _, _| core.clear_breakwatch(entry));
        }

        let detach_result = self.with_core(|core, _, _| core.detach());

        flash_result?;
        detach_result?;
        Ok(self.iface.into_probe())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::architecture::arm::dap::SwdDapInterface;
    use crate::core::HaltReason;
    use crate::probe::fake::{SimDap, SwdTargetSim};

    fn f407_sim() -> SwdTargetSim {
        let mut dap = SimDap::new();
        // DBGMCU_IDCODE of an STM32F407 (device id 0x413).
        dap.write_mem_word(0xE004_2000, 0x1000_6413);
        // A rev1 FPB with 6 comparators and a 4-comparator DWT.
        dap.write_mem_word(0xE000_2000, 0x0000_0060);
        dap.write_mem_word(0xE000_1000, 0x4000_0000);
        SwdTargetSim::new(dap)
    }

    fn attach() -> Session<SwdDapInterface<SwdTargetSim>> {
        let transport = SwdDapInterface::new(f407_sim());
        Session::attach(transport, DpAddress::Default, &ProbeRegistry::builtin()).unwrap()
    }

    #[test]
    fn attach_claims_an_stm32f4() {
        let mut session = attach();
        assert_eq!(session.target().name, "STM32F4");
        // Attach leaves the core halted.
        assert!(session.status().unwrap().is_halted());
    }

    #[test]
    fn memory_map_lists_ram_and_flash() {
        let session = attach();
        let xml = session.target().memory_map_xml();
        assert!(xml.starts_with("<memory-map>"));
        assert!(xml.contains("<memory type=\"ram\" start=\"0x20000000\" length=\"0x20000\"/>"));
        assert!(xml.contains("<memory type=\"flash\" start=\"0x8000000\""));
        assert!(xml.contains("<property name=\"blocksize\">0x4000</property>"));
        assert!(xml.ends_with("</memory-map>"));
    }

    #[test]
    fn memory_round_trip_through_session() {
        let mut session = attach();
        session
            .write_memory(0x2000_0100, &[1, 2, 3, 4, 5])
            .unwrap();
        let mut back = [0u8; 5];
        session.read_memory(0x2000_0100, &mut back).unwrap();
        assert_eq!(back, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn breakwatch_set_and_clear_bookkeeping() {
        let mut session = attach();
        session
            .set_breakwatch(BreakwatchKind::Breakpoint, 0x0800_0100, 2)
            .unwrap();
        assert_eq!(session.target().breakwatch.len(), 1);

        session
            .clear_breakwatch(BreakwatchKind::Breakpoint, 0x0800_0100, 2)
            .unwrap();
        assert!(session.target().breakwatch.is_empty());

        // Clearing something that was never set is an error.
        assert!(session
            .clear_breakwatch(BreakwatchKind::Breakpoint, 0x0800_0100, 2)
            .is_err());
    }

    #[test]
    fn unknown_silicon_is_reported() {
        let dap = SimDap::new();
        let transport = SwdDapInterface::new(SwdTargetSim::new(dap));
        let result = Session::attach(transport, DpAddress::Default, &ProbeRegistry::builtin());
        assert!(matches!(result, Err(Error::UnknownTarget { .. })));
    }

    #[test]
    fn monitor_dispatches_builtin_and_target_commands() {
        let mut session = attach();
        let help = session.monitor("help").unwrap();
        assert!(help.contains("erase_mass"));
        // The STM32F4 driver brings its own option-bytes command.
        assert!(help.contains("STM32F4 commands:"));

        let unknown = session.monitor("frobnicate").unwrap();
        assert!(unknown.contains("unknown command"));
    }

    #[test]
    fn status_decodes_a_halt_request() {
        let mut session = attach();
        assert_eq!(
            session.status().unwrap(),
            CoreStatus::Halted(HaltReason::Request)
        );
    }
}
