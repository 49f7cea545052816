//! Cortex-M debug register definitions shared by the armv6-M/armv7-M
//! drivers.

use bitfield::bitfield;

use crate::core::{MemoryMappedRegister, RegisterId};

bitfield! {
    /// Debug Halting Control and Status Register.
    ///
    /// Writes only take effect with the debug key in the top halfword; use
    /// [`Dhcsr::enable_write`] before writing.
    #[derive(Copy, Clone)]
    pub struct Dhcsr(u32);
    impl Debug;
    /// A reset happened since the last read. Sticky, clears on read.
    pub s_reset_st, _: 25;
    /// An instruction retired since the last read. Sticky.
    pub s_retire_st, _: 24;
    /// The core is locked up on an unrecoverable exception.
    pub s_lockup, _: 19;
    /// The core is sleeping.
    pub s_sleep, _: 18;
    /// The core is in debug state.
    pub s_halt, _: 17;
    /// DCRSR/DCRDR transfer handshake.
    pub s_regrdy, _: 16;
    /// Allow imprecise entry to debug state.
    pub c_snapstall, set_c_snapstall: 5;
    /// Mask PendSV, SysTick and external interrupts while halted.
    pub c_maskints, set_c_maskints: 3;
    /// Single-step enable.
    pub c_step, set_c_step: 2;
    /// Halt request.
    pub c_halt, set_c_halt: 1;
    /// Halting debug enable.
    pub c_debugen, set_c_debugen: 0;
}

impl Dhcsr {
    /// Put the debug key into the top halfword, making the write valid.
    pub fn enable_write(&mut self) {
        self.0 &= !(0xFFFF << 16);
        self.0 |= 0xA05F << 16;
    }
}

impl From<u32> for Dhcsr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dhcsr> for u32 {
    fn from(value: Dhcsr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Dhcsr {
    const ADDRESS: u32 = 0xE000_EDF0;
    const NAME: &'static str = "DHCSR";
}

bitfield! {
    /// Debug Core Register Selector Register.
    #[derive(Copy, Clone)]
    pub struct Dcrsr(u32);
    impl Debug;
    /// Direction: `true` writes the selected register from DCRDR.
    pub _, set_regwnr: 16;
    /// Which register moves through DCRDR.
    pub u16, _, set_regsel: 6, 0;
}

impl From<u32> for Dcrsr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dcrsr> for u32 {
    fn from(value: Dcrsr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Dcrsr {
    const ADDRESS: u32 = 0xE000_EDF4;
    const NAME: &'static str = "DCRSR";
}

/// Debug Core Register Data Register.
#[derive(Debug, Copy, Clone)]
pub struct Dcrdr(pub u32);

impl From<u32> for Dcrdr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dcrdr> for u32 {
    fn from(value: Dcrdr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Dcrdr {
    const ADDRESS: u32 = 0xE000_EDF8;
    const NAME: &'static str = "DCRDR";
}

bitfield! {
    /// Application Interrupt and Reset Control Register.
    ///
    /// [`Aircr::vectkey`] must be called before a write takes effect.
    #[derive(Copy, Clone)]
    pub struct Aircr(u32);
    impl Debug;
    get_vectkeystat, set_vectkey: 31, 16;
    /// Memory system endianness.
    pub endianness, _: 15;
    /// Priority grouping.
    pub u8, prigroup, set_prigroup: 10, 8;
    /// Request a system reset.
    pub sysresetreq, set_sysresetreq: 2;
    /// Clear active-exception state.
    pub vectclractive, set_vectclractive: 1;
    /// Local core reset (armv7-M only; deprecated but useful for
    /// core-only resets that must not touch peripherals).
    pub vectreset, set_vectreset: 0;
}

impl Aircr {
    /// Set the write key.
    pub fn vectkey(&mut self) {
        self.set_vectkey(0x05FA);
    }
}

impl From<u32> for Aircr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Aircr> for u32 {
    fn from(value: Aircr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Aircr {
    const ADDRESS: u32 = 0xE000_ED0C;
    const NAME: &'static str = "AIRCR";
}

bitfield! {
    /// Debug Exception and Monitor Control Register.
    #[derive(Copy, Clone)]
    pub struct Demcr(u32);
    impl Debug;
    /// Global DWT/ITM enable.
    pub trcena, set_trcena: 24;
    /// Halt on HardFault.
    pub vc_harderr, set_vc_harderr: 10;
    /// Halt on exception entry/return faults.
    pub vc_interr, set_vc_interr: 9;
    /// Halt on BusFault.
    pub vc_buserr, set_vc_buserr: 8;
    /// Halt on state information errors.
    pub vc_staterr, set_vc_staterr: 7;
    /// Halt on checking errors.
    pub vc_chkerr, set_vc_chkerr: 6;
    /// Halt on coprocessor access errors.
    pub vc_nocperr, set_vc_nocperr: 5;
    /// Halt on MemManage faults.
    pub vc_mmerr, set_vc_mmerr: 4;
    /// Reset vector catch.
    pub vc_corereset, set_vc_corereset: 0;
}

impl From<u32> for Demcr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Demcr> for u32 {
    fn from(value: Demcr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Demcr {
    const ADDRESS: u32 = 0xE000_EDFC;
    const NAME: &'static str = "DEMCR";
}

bitfield! {
    /// Flash Patch Control Register.
    #[derive(Copy, Clone)]
    pub struct FpCtrl(u32);
    impl Debug;
    /// FPB architecture revision.
    pub u8, rev, _: 31, 28;
    num_code_1, _: 14, 12;
    /// Literal comparator count.
    pub u8, num_lit, _: 11, 8;
    num_code_0, _: 7, 4;
    /// Must be set for writes to be accepted.
    pub _, set_key: 1;
    /// FPB enable.
    pub enable, set_enable: 0;
}

impl FpCtrl {
    /// The number of instruction address comparators.
    pub fn num_code(&self) -> u32 {
        (self.num_code_1() << 4) | self.num_code_0()
    }
}

impl From<u32> for FpCtrl {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<FpCtrl> for u32 {
    fn from(value: FpCtrl) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for FpCtrl {
    const ADDRESS: u32 = 0xE000_2000;
    const NAME: &'static str = "FP_CTRL";
}

/// Base address of the FPB comparator array.
pub const FP_COMP_BASE: u32 = 0xE000_2008;

/// FPB revision-1 comparator encoding: word-aligned comparator address plus
/// a half-word replace selector. Only reaches code below `0x2000_0000`.
pub fn fp_rev1_comparator(address: u32) -> Option<u32> {
    if address >= 0x2000_0000 {
        return None;
    }
    let replace = if address & 0x2 == 0 { 0b01u32 } else { 0b10 };
    Some(replace << 30 | address & 0x1FFF_FFFC | 1)
}

/// FPB revision-2 comparator encoding: the address with the enable bit,
/// valid anywhere in the 4 GiB space.
pub fn fp_rev2_comparator(address: u32) -> u32 {
    address & !1 | 1
}

/// DWT unit registers.
pub mod dwt {
    /// DWT_CTRL.
    pub const CTRL: u32 = 0xE000_1000;
    /// First comparator; the block repeats every 16 bytes.
    pub const COMP_BASE: u32 = 0xE000_1020;
    /// Comparator stride.
    pub const STRIDE: u32 = 0x10;
    /// COMP register offset.
    pub const COMP: u32 = 0x0;
    /// MASK register offset.
    pub const MASK: u32 = 0x4;
    /// FUNCTION register offset.
    pub const FUNCTION: u32 = 0x8;

    /// FUNCTION value: watch reads.
    pub const FUNCTION_READ: u32 = 0b0101;
    /// FUNCTION value: watch writes.
    pub const FUNCTION_WRITE: u32 = 0b0110;
    /// FUNCTION value: watch any access.
    pub const FUNCTION_ACCESS: u32 = 0b0111;
    /// FUNCTION.MATCHED, set when the comparator fired.
    pub const FUNCTION_MATCHED: u32 = 1 << 24;
}

/// Media and FP Feature Register 0, used to detect an FPU.
#[derive(Debug, Copy, Clone)]
pub struct Mvfr0(pub u32);

impl Mvfr0 {
    /// Whether single-precision floating point is implemented.
    pub fn fp_present(&self) -> bool {
        self.0 & 0xF0 != 0
    }
}

impl From<u32> for Mvfr0 {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Mvfr0> for u32 {
    fn from(value: Mvfr0) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Mvfr0 {
    const ADDRESS: u32 = 0xE000_EF40;
    const NAME: &'static str = "MVFR0";
}

/// DCRSR register selectors for the Cortex-M register file.
pub mod registers {
    use super::RegisterId;

    /// General purpose register R0.
    pub const R0: RegisterId = RegisterId(0);
    /// Stack pointer (current).
    pub const SP: RegisterId = RegisterId(13);
    /// Link register.
    pub const LR: RegisterId = RegisterId(14);
    /// Program counter (DebugReturnAddress).
    pub const PC: RegisterId = RegisterId(15);
    /// Combined program status registers.
    pub const XPSR: RegisterId = RegisterId(16);
    /// Main stack pointer.
    pub const MSP: RegisterId = RegisterId(17);
    /// Process stack pointer.
    pub const PSP: RegisterId = RegisterId(18);
    /// CONTROL/FAULTMASK/BASEPRI/PRIMASK, packed one per byte.
    pub const SPECIAL: RegisterId = RegisterId(20);
    /// Floating-point status and control.
    pub const FPSCR: RegisterId = RegisterId(33);
    /// First single-precision register S0; S1..S31 follow.
    pub const S0: RegisterId = RegisterId(64);

    /// Rn for n in 0..=15.
    pub fn r(n: u16) -> RegisterId {
        debug_assert!(n <= 15);
        RegisterId(n)
    }

    /// Sn for n in 0..=31.
    pub fn s(n: u16) -> RegisterId {
        debug_assert!(n <= 31);
        RegisterId(S0.0 + n)
    }
}
