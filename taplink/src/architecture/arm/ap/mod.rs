//! Access-port register file and MEM-AP records.

use bitfield::bitfield;
use jep106::JEP106Code;

use super::{ApRegister, FullyQualifiedApAddress, Register};

bitfield! {
    /// CSW: control/status word of a MEM-AP.
    ///
    /// The PROT and TYPE nibbles are device-programmed bus attributes; the
    /// memory interface preserves them by read-modify-write on first touch.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Csw(u32);
    impl Debug;
    /// Debug software access enable.
    pub dbg_sw_enable, set_dbg_sw_enable: 31;
    /// Bus protection attributes.
    pub u8, prot, set_prot: 30, 24;
    /// Secure privileged debug enabled.
    pub spiden, _: 23;
    /// Memory tagging / bus type attributes.
    pub u8, type_, set_type: 15, 12;
    /// Barrier support mode.
    pub u8, mode, set_mode: 11, 8;
    /// A transfer is in progress.
    pub tr_in_prog, _: 7;
    /// Transactions are enabled.
    pub device_en, _: 6;
    /// Address auto-increment mode.
    pub u8, addr_inc, set_addr_inc: 5, 4;
    /// Transfer size.
    pub u8, size, set_size: 2, 0;
}

impl Csw {
    /// No auto-increment.
    pub const ADDR_INC_OFF: u8 = 0b00;
    /// Increment by the transfer size after every DRW access.
    pub const ADDR_INC_SINGLE: u8 = 0b01;
    /// Packed transfers: multiple lanes per DRW access.
    pub const ADDR_INC_PACKED: u8 = 0b10;

    /// CSW.Size encoding for a byte access.
    pub const SIZE_8: u8 = 0b000;
    /// CSW.Size encoding for a halfword access.
    pub const SIZE_16: u8 = 0b001;
    /// CSW.Size encoding for a word access.
    pub const SIZE_32: u8 = 0b010;
}

impl From<u32> for Csw {
    fn from(raw: u32) -> Self {
        Csw(raw)
    }
}

impl From<Csw> for u32 {
    fn from(raw: Csw) -> Self {
        raw.0
    }
}

impl Register for Csw {
    const ADDRESS: u8 = 0x00;
    const NAME: &'static str = "CSW";
}

impl ApRegister for Csw {}

/// TAR: the transfer address for the next DRW access.
#[derive(Debug, Clone, Default)]
pub struct Tar(pub u32);

impl From<u32> for Tar {
    fn from(raw: u32) -> Self {
        Tar(raw)
    }
}

impl From<Tar> for u32 {
    fn from(raw: Tar) -> Self {
        raw.0
    }
}

impl Register for Tar {
    const ADDRESS: u8 = 0x04;
    const NAME: &'static str = "TAR";
}

impl ApRegister for Tar {}

/// DRW: data read/write; every access moves memory at TAR.
#[derive(Debug, Clone, Default)]
pub struct Drw(pub u32);

impl From<u32> for Drw {
    fn from(raw: u32) -> Self {
        Drw(raw)
    }
}

impl From<Drw> for u32 {
    fn from(raw: Drw) -> Self {
        raw.0
    }
}

impl Register for Drw {
    const ADDRESS: u8 = 0x0C;
    const NAME: &'static str = "DRW";
}

impl ApRegister for Drw {}

bitfield! {
    /// CFG: capabilities of the MEM-AP.
    #[derive(Clone, Default)]
    pub struct Cfg(u32);
    impl Debug;
    /// Large data extensions (>32-bit transfers).
    pub ld, _: 2;
    /// Large address extension (64-bit TAR).
    pub la, _: 1;
    /// Big-endian bus.
    pub be, _: 0;
}

impl From<u32> for Cfg {
    fn from(raw: u32) -> Self {
        Cfg(raw)
    }
}

impl From<Cfg> for u32 {
    fn from(raw: Cfg) -> Self {
        raw.0
    }
}

impl Register for Cfg {
    const ADDRESS: u8 = 0xF4;
    const NAME: &'static str = "CFG";
}

impl ApRegister for Cfg {}

bitfield! {
    /// BASE: where the AP's ROM table lives, if it has one.
    #[derive(Clone, Copy, Default)]
    pub struct Base(u32);
    impl Debug;
    /// Bits [31:12] of the ROM table base address.
    pub baseaddr, _: 31, 12;
    /// The register uses the ADIv5 format.
    pub format, _: 1;
    /// A debug entry is present.
    pub present, _: 0;
}

impl Base {
    /// The ROM table base address, or `None` when the AP has no debug
    /// components.
    pub fn rom_table_address(&self) -> Option<u32> {
        // A legacy AP without a ROM table reads all-ones.
        if self.0 == 0xFFFF_FFFF || !self.present() {
            return None;
        }
        Some(self.0 & 0xFFFF_F000)
    }
}

impl From<u32> for Base {
    fn from(raw: u32) -> Self {
        Base(raw)
    }
}

impl From<Base> for u32 {
    fn from(raw: Base) -> Self {
        raw.0
    }
}

impl Register for Base {
    const ADDRESS: u8 = 0xF8;
    const NAME: &'static str = "BASE";
}

impl ApRegister for Base {}

bitfield! {
    /// IDR: identifies the access port. Reads as zero on an unimplemented
    /// APSEL.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Idr(u32);
    impl Debug;
    /// Implementation revision.
    pub u8, revision, _: 31, 28;
    /// JEP-106 designer code.
    pub u16, designer, _: 27, 17;
    u8, jep_cc, _: 27, 24;
    u8, jep_id, _: 23, 17;
    /// AP class.
    pub u8, class, _: 16, 13;
    /// Implementation variant.
    pub u8, variant, _: 7, 4;
    /// Bus type.
    pub u8, type_, _: 3, 0;
}

impl Idr {
    /// Class value of a MEM-AP.
    pub const CLASS_MEM_AP: u8 = 0b1000;

    /// Whether this AP is a MEM-AP.
    pub fn is_memory_ap(&self) -> bool {
        self.class() == Self::CLASS_MEM_AP
    }

    /// The designer of the AP implementation.
    pub fn designer_code(&self) -> JEP106Code {
        JEP106Code::new(self.jep_cc(), self.jep_id())
    }
}

impl From<u32> for Idr {
    fn from(raw: u32) -> Self {
        Idr(raw)
    }
}

impl From<Idr> for u32 {
    fn from(raw: Idr) -> Self {
        raw.0
    }
}

impl Register for Idr {
    const ADDRESS: u8 = 0xFC;
    const NAME: &'static str = "IDR";
}

impl ApRegister for Idr {}

/// A discovered MEM-AP and the cached state that keeps its traffic minimal.
#[derive(Debug, Clone)]
pub struct MemoryAp {
    /// Where the AP sits.
    pub address: FullyQualifiedApAddress,
    /// Its IDR at discovery time.
    pub idr: Idr,
    /// Its BASE register.
    pub base: Base,
    /// Whether CSW accepted the packed auto-increment mode.
    pub supports_packed: bool,
    /// Whether the AP implements the large address extension.
    pub large_address: bool,
    /// Device-programmed CSW bits (PROT, TYPE) preserved across our writes.
    pub(crate) template_csw: Csw,
    /// The last CSW written, so unchanged configurations skip the write.
    pub(crate) cached_csw: Option<Csw>,
}

impl MemoryAp {
    /// The ROM table address behind this AP, when present.
    pub fn rom_table_address(&self) -> Option<u32> {
        self.base.rom_table_address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idr_classifies_ahb_ap() {
        // AHB-AP as found on an STM32F4.
        let idr = Idr(0x2477_0011);
        assert!(idr.is_memory_ap());
        assert_eq!(idr.designer_code().get(), Some("ARM Ltd"));
    }

    #[test]
    fn base_with_no_debug_entries() {
        assert_eq!(Base(0xFFFF_FFFF).rom_table_address(), None);
        assert_eq!(Base(0xE00F_F003).rom_table_address(), Some(0xE00F_F000));
    }
}
