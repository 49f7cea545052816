//! Crate-public structures shared between the tap drivers.

use bitfield::bitfield;

bitfield! {
    /// A JTAG IDCODE, identifying one TAP on the scan chain.
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct IdCode(u32);
    impl Debug;

    u8;
    /// The IDCODE version.
    pub version, set_version: 31, 28;

    u16;
    /// The part number.
    pub part_number, set_part_number: 27, 12;

    /// The JEDEC JEP-106 Manufacturer ID.
    pub designer, set_designer: 11, 1;

    u8;
    /// The continuation code of the JEP-106 Manufacturer ID.
    pub designer_continuation, set_designer_continuation: 11, 8;

    /// The identity code of the JEP-106 Manufacturer ID.
    pub designer_identity, set_designer_identity: 7, 1;

    bool;
    /// The least-significant bit. Always set on a valid IDCODE.
    pub lsbit, set_lsbit: 0;
}

impl IdCode {
    /// An IDCODE is valid when its least significant bit is `1` and the
    /// 7-bit identity code is one of the non-reserved values in `[1, 126]`.
    pub fn valid(&self) -> bool {
        self.lsbit() && self.designer_identity() != 0 && self.designer_identity() != 127
    }

    /// The designer name, when the JEP-106 tables know it.
    pub fn designer_name(&self) -> Option<&'static str> {
        jep106::JEP106Code::new(self.designer_continuation(), self.designer_identity()).get()
    }

    /// The raw 32-bit code.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl From<u32> for IdCode {
    fn from(raw: u32) -> Self {
        IdCode(raw)
    }
}

impl std::fmt::Display for IdCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(name) = self.designer_name() {
            write!(f, "0x{:08X} ({})", self.0, name)
        } else {
            write!(f, "0x{:08X}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARM_TAP: IdCode = IdCode(0x4BA00477);
    const STM_BS_TAP: IdCode = IdCode(0x06413041);

    #[test]
    fn id_code_display() {
        assert_eq!(format!("{ARM_TAP}"), "0x4BA00477 (ARM Ltd)");
        assert_eq!(format!("{STM_BS_TAP}"), "0x06413041 (STMicroelectronics)");
    }

    #[test]
    fn id_code_validity() {
        assert!(ARM_TAP.valid());
        // All-ones designer field is reserved.
        assert!(!IdCode(0xFFFF_FFFF).valid());
        // Bypass bit pattern is not an IDCODE.
        assert!(!IdCode(0x0000_0000).valid());
    }
}
