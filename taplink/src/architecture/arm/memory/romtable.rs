//! CoreSight component identification and ROM-table walking.

use jep106::JEP106Code;

use crate::architecture::arm::communication_interface::ArmChipInfo;
use crate::memory::MemoryInterface;
use crate::Error;

/// Deepest nesting of class-1 ROM tables we follow.
const MAX_ROM_TABLE_DEPTH: usize = 4;

/// A ROM table occupies one 4 KiB frame: 1008 bytes of entries at most.
const MAX_ROM_TABLE_ENTRIES: u32 = 960;

/// Component class out of CIDR1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentClass {
    /// Generic verification component.
    GenericVerification,
    /// A class-1 ROM table with entries to descend into.
    RomTable,
    /// A CoreSight debug component, classified further by DEVARCH/DEVTYPE.
    CoreSight,
    /// Peripheral test block.
    PeripheralTestBlock,
    /// Generic IP component (e.g. the Cortex-M SCS).
    GenericIp,
    /// Anything else.
    Unknown(u8),
}

impl From<u8> for ComponentClass {
    fn from(value: u8) -> Self {
        match value {
            0x0 => ComponentClass::GenericVerification,
            0x1 => ComponentClass::RomTable,
            0x9 => ComponentClass::CoreSight,
            0xB => ComponentClass::PeripheralTestBlock,
            0xE => ComponentClass::GenericIp,
            other => ComponentClass::Unknown(other),
        }
    }
}

/// The identification registers every CoreSight-compliant component carries
/// in the last 64 bytes of its 4 KiB frame.
#[derive(Debug, Clone)]
pub struct ComponentId {
    /// Base address of the component's frame.
    pub component_address: u32,
    /// Component class.
    pub class: ComponentClass,
    /// Decoded peripheral identification.
    pub peripheral_id: PeripheralId,
}

/// Decoded PIDR0-7.
#[derive(Debug, Clone, Copy)]
pub struct PeripheralId {
    /// Designer of the component, when the JEDEC bit is set.
    pub jep106: Option<JEP106Code>,
    /// Designer-assigned part number.
    pub part: u16,
    /// Component revision.
    pub revision: u8,
    /// log2 of the number of 4 KiB blocks the component occupies.
    pub size: u8,
}

impl ComponentId {
    fn try_parse(memory: &mut dyn MemoryInterface, base: u32) -> Result<Self, Error> {
        let mut cidr = [0u32; 4];
        memory.read_32(base + 0xFF0, &mut cidr)?;

        let preamble_ok = cidr[0] & 0xFF == 0x0D
            && cidr[1] & 0x0F == 0x00
            && cidr[2] & 0xFF == 0x05
            && cidr[3] & 0xFF == 0xB1;
        if !preamble_ok {
            tracing::debug!("no component at {base:#010x}: CIDR {cidr:08x?}");
            return Err(Error::Arm(crate::architecture::arm::ArmError::RomTable(
                "invalid component ID preamble",
            )));
        }

        let class = ComponentClass::from((cidr[1] >> 4 & 0xF) as u8);

        let mut pidr_lo = [0u32; 4];
        memory.read_32(base + 0xFE0, &mut pidr_lo)?;
        let mut pidr_hi = [0u32; 4];
        memory.read_32(base + 0xFD0, &mut pidr_hi)?;

        let part = (pidr_lo[0] & 0xFF | (pidr_lo[1] & 0xF) << 8) as u16;
        let jedec = pidr_lo[2] & 0x8 != 0;
        let jep_id = (pidr_lo[1] >> 4 & 0xF | (pidr_lo[2] & 0x7) << 4) as u8;
        let jep_cc = (pidr_hi[0] & 0xF) as u8;
        let revision = (pidr_lo[2] >> 4 & 0xF) as u8;
        let size = (pidr_hi[0] >> 4 & 0xF) as u8;

        Ok(ComponentId {
            component_address: base,
            class,
            peripheral_id: PeripheralId {
                jep106: jedec.then(|| JEP106Code::new(jep_cc, jep_id)),
                part,
                revision,
                size,
            },
        })
    }
}

/// A parsed component tree.
#[derive(Debug, Clone)]
pub enum Component {
    /// A class-1 ROM table and everything present behind it.
    Class1RomTable(ComponentId, RomTable),
    /// A CoreSight component with its DEVARCH architecture ID and DEVTYPE.
    CoresightComponent(ComponentId, CoresightId),
    /// Any other identifiable component.
    Generic(ComponentId),
}

impl Component {
    /// Parse the component at `base`, recursing through ROM tables.
    pub fn try_parse(memory: &mut dyn MemoryInterface, base: u32) -> Result<Component, Error> {
        Self::parse_at_depth(memory, base, 0)
    }

    fn parse_at_depth(
        memory: &mut dyn MemoryInterface,
        base: u32,
        depth: usize,
    ) -> Result<Component, Error> {
        let id = ComponentId::try_parse(memory, base)?;

        match id.class {
            ComponentClass::RomTable => {
                let table = RomTable::parse(memory, base, depth)?;
                Ok(Component::Class1RomTable(id, table))
            }
            ComponentClass::CoreSight => {
                let devarch = memory.read_word_32(base + 0xFBC)?;
                let devtype = memory.read_word_32(base + 0xFCC)?;
                Ok(Component::CoresightComponent(
                    id,
                    CoresightId {
                        arch_id: (devarch & 0xFFFF) as u16,
                        architect: ((devarch >> 21) & 0x7FF) as u16,
                        dev_type: (devtype & 0xFF) as u8,
                    },
                ))
            }
            _ => Ok(Component::Generic(id)),
        }
    }

    /// The identification block of this component.
    pub fn id(&self) -> &ComponentId {
        match self {
            Component::Class1RomTable(id, _) => id,
            Component::CoresightComponent(id, _) => id,
            Component::Generic(id) => id,
        }
    }

    /// Depth-first iteration over this component and everything behind it.
    pub fn iter(&self) -> ComponentIter<'_> {
        ComponentIter { stack: vec![self] }
    }
}

/// DEVARCH/DEVTYPE identification of a class-9 component.
#[derive(Debug, Clone, Copy)]
pub struct CoresightId {
    /// DEVARCH.ARCHID.
    pub arch_id: u16,
    /// DEVARCH.ARCHITECT (JEP-106 of the architecture definer).
    pub architect: u16,
    /// DEVTYPE major/sub class byte.
    pub dev_type: u8,
}

/// One present, parseable ROM table entry.
#[derive(Debug, Clone)]
pub struct RomTableEntry {
    /// The raw entry word.
    pub raw: u32,
    /// Address of the component the entry points to.
    pub component_address: u32,
    /// The component behind the entry.
    pub component: Component,
}

/// A parsed class-1 ROM table.
#[derive(Debug, Clone)]
pub struct RomTable {
    entries: Vec<RomTableEntry>,
}

impl RomTable {
    fn parse(memory: &mut dyn MemoryInterface, base: u32, depth: usize) -> Result<Self, Error> {
        let mut entries = Vec::new();

        if depth >= MAX_ROM_TABLE_DEPTH {
            tracing::warn!("ROM table at {base:#010x} exceeds the nesting limit, not descending");
            return Ok(RomTable { entries });
        }

        for index in 0..MAX_ROM_TABLE_ENTRIES {
            let raw = memory.read_word_32(base + index * 4)?;
            // The table ends at the first zero entry.
            if raw == 0 {
                break;
            }
            // Not-present entries are skipped, the walk continues.
            if raw & 1 == 0 {
                continue;
            }
            // Only the 32-bit format is supported.
            if raw & 2 == 0 {
                tracing::debug!("skipping 8-bit format ROM table entry {raw:#010x}");
                continue;
            }

            let offset = (raw & 0xFFFF_F000) as i32;
            let component_address = base.wrapping_add(offset as u32);

            match Component::parse_at_depth(memory, component_address, depth + 1) {
                Ok(component) => entries.push(RomTableEntry {
                    raw,
                    component_address,
                    component,
                }),
                // A busted entry shouldn't abort the whole walk.
                Err(e) => tracing::warn!(
                    "ROM table entry at {component_address:#010x} failed to parse: {e}"
                ),
            }
        }

        Ok(RomTable { entries })
    }

    /// The present entries in table order.
    pub fn entries(&self) -> &[RomTableEntry] {
        &self.entries
    }
}

/// Depth-first component iterator.
pub struct ComponentIter<'a> {
    stack: Vec<&'a Component>,
}

impl<'a> Iterator for ComponentIter<'a> {
    type Item = &'a Component;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.stack.pop()?;
        if let Component::Class1RomTable(_, table) = next {
            for entry in table.entries.iter().rev() {
                self.stack.push(&entry.component);
            }
        }
        Some(next)
    }
}

/// Identify the chip from the ROM table at `base`, when its peripheral ID
/// carries a designer code.
pub fn read_chip_info(
    memory: &mut dyn MemoryInterface,
    base: u32,
) -> Result<Option<ArmChipInfo>, Error> {
    let component = Component::try_parse(memory, base)?;
    if let Component::Class1RomTable(id, _) = &component {
        if let Some(jep106) = id.peripheral_id.jep106 {
            return Ok(Some(ArmChipInfo {
                designer: jep106,
                part: id.peripheral_id.part,
            }));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake::SimDap;

    /// Plant a component ID block into simulated memory.
    fn plant_cid(dap: &mut SimDap, base: u32, class: u32, part: u16, jep: (u8, u8)) {
        dap.write_mem_word(base + 0xFF0, 0x0D);
        dap.write_mem_word(base + 0xFF4, class << 4);
        dap.write_mem_word(base + 0xFF8, 0x05);
        dap.write_mem_word(base + 0xFFC, 0xB1);

        let (cc, id) = jep;
        dap.write_mem_word(base + 0xFE0, part as u32 & 0xFF);
        dap.write_mem_word(base + 0xFE4, (part as u32 >> 8 & 0xF) | ((id as u32 & 0xF) << 4));
        dap.write_mem_word(base + 0xFE8, 0x8 | (id as u32 >> 4));
        dap.write_mem_word(base + 0xFEC, 0);
        dap.write_mem_word(base + 0xFD0, cc as u32);
    }

    fn memory_with_rom_table() -> SimDap {
        let mut dap = SimDap::new();
        let base = 0xE00F_F000;
        // Root table designed by ARM, with one present entry pointing at a
        // CoreSight component and one not-present entry.
        plant_cid(&mut dap, base, 0x1, 0x4C4, (4, 0x3B));
        dap.write_mem_word(base, 0xFFF0_F003); // SCS at base - 0xF1000 + ...
        dap.write_mem_word(base + 4, 0x0000_2002); // present bit clear
        dap.write_mem_word(base + 8, 0);

        // The pointed-to component: class 9, ITM-ish.
        let child = base.wrapping_add(0xFFF0_F000u32 as i32 as u32);
        plant_cid(&mut dap, child, 0x9, 0x9A1, (4, 0x3B));
        dap.write_mem_word(child + 0xFBC, (0x43 << 21) | 0x1A01);
        dap.write_mem_word(child + 0xFCC, 0x43);
        dap
    }

    fn as_memory(
        dap: SimDap,
    ) -> (
        crate::architecture::arm::ArmCommunicationInterface<
            crate::architecture::arm::dap::SwdDapInterface<crate::probe::fake::SwdTargetSim>,
        >,
        crate::architecture::arm::ap::MemoryAp,
    ) {
        use crate::architecture::arm::dap::SwdDapInterface;
        use crate::architecture::arm::{DpAddress, FullyQualifiedApAddress};
        use crate::probe::fake::SwdTargetSim;

        let transport = SwdDapInterface::new(SwdTargetSim::new(dap));
        let mut iface =
            crate::architecture::arm::ArmCommunicationInterface::connect(transport, DpAddress::Default)
                .unwrap();
        let address = FullyQualifiedApAddress::v1_with_default_dp(0);
        let ap = iface.memory_ap(&address).unwrap();
        (iface, ap)
    }

    #[test]
    fn parses_a_one_entry_rom_table() {
        let (mut iface, ap) = as_memory(memory_with_rom_table());
        let mut memory = iface.memory_interface(ap).unwrap();

        let component = Component::try_parse(&mut memory, 0xE00F_F000).unwrap();
        let Component::Class1RomTable(id, table) = &component else {
            panic!("expected a ROM table, got {component:?}");
        };
        assert_eq!(id.peripheral_id.part, 0x4C4);
        assert_eq!(id.peripheral_id.jep106.unwrap().get(), Some("ARM Ltd"));

        // The not-present entry was skipped.
        assert_eq!(table.entries().len(), 1);
        let Component::CoresightComponent(child, coresight) = &table.entries()[0].component else {
            panic!("expected a CoreSight child");
        };
        assert_eq!(child.peripheral_id.part, 0x9A1);
        assert_eq!(coresight.arch_id, 0x1A01);
        assert_eq!(coresight.dev_type, 0x43);
    }

    #[test]
    fn chip_info_comes_from_the_root_table() {
        let (mut iface, ap) = as_memory(memory_with_rom_table());
        let mut memory = iface.memory_interface(ap).unwrap();

        let info = read_chip_info(&mut memory, 0xE00F_F000).unwrap().unwrap();
        assert_eq!(info.designer.get(), Some("ARM Ltd"));
        assert_eq!(info.part, 0x4C4);
    }

    #[test]
    fn iterator_visits_the_whole_tree() {
        let (mut iface, ap) = as_memory(memory_with_rom_table());
        let mut memory = iface.memory_interface(ap).unwrap();

        let component = Component::try_parse(&mut memory, 0xE00F_F000).unwrap();
        let parts: Vec<u16> = component.iter().map(|c| c.id().peripheral_id.part).collect();
        assert_eq!(parts, vec![0x4C4, 0x9A1]);
    }
}
