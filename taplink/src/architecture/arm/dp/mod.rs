//! Debug-port register file.

use bitfield::bitfield;
use jep106::JEP106Code;

use super::{DpBankSel, DpRegister, Register};

bitfield! {
    /// ABORT: write-1-clear of the sticky flags plus the transaction abort.
    #[derive(Clone, Default)]
    pub struct Abort(u32);
    impl Debug;
    /// Clear STICKYORUN.
    pub _, set_orunerrclr: 4;
    /// Clear WDATAERR.
    pub _, set_wderrclr: 3;
    /// Clear STICKYERR.
    pub _, set_stkerrclr: 2;
    /// Clear STICKYCMP.
    pub _, set_stkcmpclr: 1;
    /// Abort the current AP transaction.
    pub _, set_dapabort: 0;
}

impl From<u32> for Abort {
    fn from(raw: u32) -> Self {
        Abort(raw)
    }
}

impl From<Abort> for u32 {
    fn from(raw: Abort) -> Self {
        raw.0
    }
}

impl Register for Abort {
    const ADDRESS: u8 = 0x0;
    const NAME: &'static str = "ABORT";
}

impl DpRegister for Abort {
    const BANK: DpBankSel = DpBankSel::DontCare;
}

bitfield! {
    /// CTRL/STAT: power-up handshakes and the sticky error flags.
    #[derive(Clone, Default)]
    pub struct CtrlStat(u32);
    impl Debug;
    /// System power-up acknowledge.
    pub csyspwrupack, _: 31;
    /// System power-up request.
    pub csyspwrupreq, set_csyspwrupreq: 30;
    /// Debug power-up acknowledge.
    pub cdbgpwrupack, _: 29;
    /// Debug power-up request.
    pub cdbgpwrupreq, set_cdbgpwrupreq: 28;
    /// Debug reset acknowledge.
    pub cdbgrstack, _: 27;
    /// Debug reset request.
    pub cdbgrstreq, set_cdbgrstreq: 26;
    /// Transaction counter.
    pub u16, trn_cnt, set_trn_cnt: 23, 12;
    /// Byte-lane mask for pushed compares.
    pub u8, mask_lane, set_mask_lane: 11, 8;
    /// A write data error occurred (SWD).
    pub wdataerr, _: 7;
    /// The response to a previous AP or RDBUFF read was OK.
    pub readok, _: 6;
    /// A sticky error was set by a failed transaction.
    pub stickyerr, _: 5;
    /// A pushed-compare match occurred.
    pub stickycmp, _: 4;
    /// Transfer mode for pushed operations.
    pub u8, trn_mode, _: 3, 2;
    /// An overrun occurred.
    pub stickyorun, _: 1;
    /// Enable overrun detection.
    pub orun_detect, set_orun_detect: 0;
}

impl CtrlStat {
    /// Mask of the sticky error flags as they appear in CTRL/STAT.
    pub const STICKY_ERROR_MASK: u32 = 1 << 7 | 1 << 5 | 1 << 4 | 1 << 1;

    /// True when any sticky error flag is raised.
    pub fn any_sticky_error(&self) -> bool {
        self.0 & Self::STICKY_ERROR_MASK != 0
    }
}

impl From<u32> for CtrlStat {
    fn from(raw: u32) -> Self {
        CtrlStat(raw)
    }
}

impl From<CtrlStat> for u32 {
    fn from(raw: CtrlStat) -> Self {
        raw.0
    }
}

impl Register for CtrlStat {
    const ADDRESS: u8 = 0x4;
    const NAME: &'static str = "CTRL/STAT";
}

impl DpRegister for CtrlStat {
    const BANK: DpBankSel = DpBankSel::Bank(0);
}

bitfield! {
    /// SELECT: AP and DP bank routing (ADIv5 layout).
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Select(u32);
    impl Debug;
    /// The selected access port.
    pub u8, ap_sel, set_ap_sel: 31, 24;
    /// The selected AP register bank.
    pub u8, ap_bank_sel, set_ap_bank_sel: 7, 4;
    /// The selected DP register bank.
    pub u8, dp_bank_sel, set_dp_bank_sel: 3, 0;
}

impl From<u32> for Select {
    fn from(raw: u32) -> Self {
        Select(raw)
    }
}

impl From<Select> for u32 {
    fn from(raw: Select) -> Self {
        raw.0
    }
}

impl Register for Select {
    const ADDRESS: u8 = 0x8;
    const NAME: &'static str = "SELECT";
}

impl DpRegister for Select {
    const BANK: DpBankSel = DpBankSel::DontCare;
}

/// SELECT1: the upper word of the ADIv6 AP address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Select1(pub u32);

impl From<u32> for Select1 {
    fn from(raw: u32) -> Self {
        Select1(raw)
    }
}

impl From<Select1> for u32 {
    fn from(raw: Select1) -> Self {
        raw.0
    }
}

impl Register for Select1 {
    const ADDRESS: u8 = 0x4;
    const NAME: &'static str = "SELECT1";
}

impl DpRegister for Select1 {
    const BANK: DpBankSel = DpBankSel::Bank(5);
}

/// RDBUFF: drains the result of a posted AP read.
#[derive(Debug, Clone, Default)]
pub struct RdBuff(pub u32);

impl From<u32> for RdBuff {
    fn from(raw: u32) -> Self {
        RdBuff(raw)
    }
}

impl From<RdBuff> for u32 {
    fn from(raw: RdBuff) -> Self {
        raw.0
    }
}

impl Register for RdBuff {
    const ADDRESS: u8 = 0xC;
    const NAME: &'static str = "RDBUFF";
}

impl DpRegister for RdBuff {
    const BANK: DpBankSel = DpBankSel::DontCare;
}

bitfield! {
    /// DPIDR: identifies the debug port.
    #[derive(Clone, Default)]
    pub struct Dpidr(u32);
    impl Debug;
    /// Implementation-defined revision.
    pub u8, revision, _: 31, 28;
    /// Part number of the DP.
    pub u8, part_no, _: 27, 20;
    /// Minimal DP implementation (transaction counter and pushed operations
    /// absent).
    pub min, _: 16;
    /// DP architecture version.
    pub u8, version, _: 15, 12;
    /// The JEP-106 designer code.
    pub designer, _: 11, 1;
    u8, jep_cc, _: 11, 8;
    u8, jep_id, _: 7, 1;
}

impl From<u32> for Dpidr {
    fn from(raw: u32) -> Self {
        Dpidr(raw)
    }
}

impl From<Dpidr> for u32 {
    fn from(raw: Dpidr) -> Self {
        raw.0
    }
}

impl Register for Dpidr {
    const ADDRESS: u8 = 0x0;
    const NAME: &'static str = "DPIDR";
}

impl DpRegister for Dpidr {
    const BANK: DpBankSel = DpBankSel::DontCare;
}

bitfield! {
    /// TARGETID: identifies the silicon behind a multidrop DP (DP bank 2).
    #[derive(Clone, Default)]
    pub struct TargetId(u32);
    impl Debug;
    /// Target revision.
    pub u8, trevision, _: 31, 28;
    /// Designer-assigned part number.
    pub u16, tpartno, _: 27, 12;
    /// JEP-106 designer code of the part.
    pub u16, tdesigner, _: 11, 1;
}

impl From<u32> for TargetId {
    fn from(raw: u32) -> Self {
        TargetId(raw)
    }
}

impl From<TargetId> for u32 {
    fn from(raw: TargetId) -> Self {
        raw.0
    }
}

impl Register for TargetId {
    const ADDRESS: u8 = 0x4;
    const NAME: &'static str = "TARGETID";
}

impl DpRegister for TargetId {
    const BANK: DpBankSel = DpBankSel::Bank(2);
}

/// TARGETSEL: selects one DP on a multidrop wire. Write-only, the target
/// does not drive an acknowledge.
#[derive(Debug, Clone, Default)]
pub struct TargetSel(pub u32);

impl From<u32> for TargetSel {
    fn from(raw: u32) -> Self {
        TargetSel(raw)
    }
}

impl From<TargetSel> for u32 {
    fn from(raw: TargetSel) -> Self {
        raw.0
    }
}

impl Register for TargetSel {
    const ADDRESS: u8 = 0xC;
    const NAME: &'static str = "TARGETSEL";
}

impl DpRegister for TargetSel {
    const BANK: DpBankSel = DpBankSel::DontCare;
}

/// Decoded DPIDR contents.
#[derive(Debug)]
pub struct DebugPortId {
    /// Implementation revision.
    pub revision: u8,
    /// DP part number.
    pub part_no: u8,
    /// Architecture version.
    pub version: DebugPortVersion,
    /// Whether this is a minimal DP.
    pub min_dp_support: bool,
    /// Who designed the DP.
    pub designer: JEP106Code,
}

impl From<Dpidr> for DebugPortId {
    fn from(dpidr: Dpidr) -> DebugPortId {
        DebugPortId {
            revision: dpidr.revision(),
            part_no: dpidr.part_no(),
            version: dpidr.version().into(),
            min_dp_support: dpidr.min(),
            designer: JEP106Code::new(dpidr.jep_cc(), dpidr.jep_id()),
        }
    }
}

/// The debug-port architecture version, which decides the SELECT layout and
/// the AP addressing scheme.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DebugPortVersion {
    /// JTAG-only DPv0.
    DPv0,
    /// DPv1: SWD, banked DP registers.
    DPv1,
    /// DPv2: multidrop, TARGETID.
    DPv2,
    /// DPv3: ADIv6 addressing with SELECT1.
    DPv3,
    /// Anything newer than we know.
    Unsupported(u8),
}

impl DebugPortVersion {
    /// Whether this DP uses the ADIv6 64-bit AP address scheme.
    pub fn is_adiv6(&self) -> bool {
        matches!(self, DebugPortVersion::DPv3)
    }
}

impl From<u8> for DebugPortVersion {
    fn from(value: u8) -> Self {
        match value {
            0 => DebugPortVersion::DPv0,
            1 => DebugPortVersion::DPv1,
            2 => DebugPortVersion::DPv2,
            3 => DebugPortVersion::DPv3,
            other => DebugPortVersion::Unsupported(other),
        }
    }
}

impl std::fmt::Display for DebugPortVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DebugPortVersion::DPv0 => f.write_str("DPv0"),
            DebugPortVersion::DPv1 => f.write_str("DPv1"),
            DebugPortVersion::DPv2 => f.write_str("DPv2"),
            DebugPortVersion::DPv3 => f.write_str("DPv3"),
            DebugPortVersion::Unsupported(v) => write!(f, "<unsupported DPv{v}>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dpidr_decodes_stm32f4_swdp() {
        // SW-DP as found on an STM32F4.
        let id: DebugPortId = Dpidr(0x2BA0_1477).into();
        assert_eq!(id.version, DebugPortVersion::DPv1);
        assert_eq!(id.designer.get(), Some("ARM Ltd"));
        assert!(!id.min_dp_support);
    }

    #[test]
    fn abort_bits_line_up() {
        let mut abort = Abort::default();
        abort.set_stkerrclr(true);
        assert_eq!(u32::from(abort.clone()), 1 << 2);
        abort.set_orunerrclr(true);
        abort.set_wderrclr(true);
        abort.set_stkcmpclr(true);
        assert_eq!(u32::from(abort), 0b11110);
    }
}
