//! JTAG scan-chain enumeration and per-device register access.
//!
//! Enumeration walks the chain once: collect IDCODEs out of the
//! test-logic-reset DR, delimit the IR lengths out of the IR capture
//! pattern, then verify the device count against a BYPASS flush. The
//! resulting [`JtagDevice`] records are immutable; only the per-device
//! `current_ir` cache changes afterwards, so redundant IR shifts cost
//! nothing.

use bitvec::prelude::*;

use super::{DebugProbeError, IdCode, RawJtagIo};

/// The most devices we accept on one chain before declaring the scan wedged.
pub const MAX_CHAIN_DEVICES: usize = 8;

/// Upper bound on a single IR length. Anything longer means we are counting
/// our own shifted-in ones.
const MAX_IR_LENGTH: u8 = 32;

/// An error produced while interrogating the scan chain.
#[derive(Debug, thiserror::Error)]
pub enum ScanChainError {
    /// A captured IDCODE failed validation.
    #[error("invalid IDCODE 0x{0:08X} in scan chain")]
    InvalidIdCode(u32),
    /// The IR capture pattern could not be delimited into per-device IRs.
    #[error("invalid IR scan chain")]
    InvalidIr,
    /// A quirk entry's expected IR capture did not match the wire.
    #[error("IR capture for device {index} did not match its quirk pattern")]
    QuirkMismatch {
        /// Chain index of the offending device.
        index: usize,
    },
    /// More devices than [`MAX_CHAIN_DEVICES`] responded.
    #[error("more than {MAX_CHAIN_DEVICES} devices on the scan chain")]
    TooManyDevices,
    /// The BYPASS flush saw a different chain length than the IDCODE scan.
    #[error("chain length mismatch: IDCODE scan found {expected} devices, BYPASS flush counted {counted}")]
    LengthMismatch {
        /// Devices found by the IDCODE scan.
        expected: usize,
        /// Single-bit registers counted during the BYPASS flush.
        counted: usize,
    },
    /// The tap driver failed underneath the scan.
    #[error("probe error during scan")]
    Probe(#[from] DebugProbeError),
}

/// A fixed IR length and expected capture pattern for devices that violate
/// the IEEE 1149.1 `xx...01` IR capture rule.
#[derive(Debug, Clone, Copy)]
pub struct IrQuirk {
    /// IDCODE this quirk applies to, after masking.
    pub idcode: u32,
    /// Mask applied to the scanned IDCODE before comparison (version bits
    /// usually don't participate).
    pub idcode_mask: u32,
    /// The fixed IR length.
    pub ir_len: u8,
    /// Expected IR capture value, validated bit-by-bit during the scan.
    pub ir_capture: u32,
}

impl IrQuirk {
    fn matches(&self, idcode: Option<IdCode>) -> bool {
        idcode.is_some_and(|id| id.raw() & self.idcode_mask == self.idcode)
    }
}

/// Devices with known non-conforming IR captures.
///
/// Extend via [`JtagChain::scan_with_quirks`] for chains that need more.
pub const BUILTIN_IR_QUIRKS: &[IrQuirk] = &[];

/// One device on the scan chain, immutable after enumeration.
#[derive(Debug, Clone)]
pub struct JtagDevice {
    /// Position in the chain; index 0 is nearest TDO and reads out first.
    pub index: usize,
    /// The device's IDCODE, `None` for a device that came up in BYPASS.
    pub idcode: Option<IdCode>,
    /// Instruction register length in bits.
    pub ir_len: u8,
    /// Bits clocked before this device's IR payload (sum of the IR lengths
    /// of devices closer to TDO).
    pub ir_prescan: usize,
    /// Bits clocked after this device's IR payload.
    pub ir_postscan: usize,
    /// BYPASS bits clocked before this device's DR payload.
    pub dr_prescan: usize,
    /// BYPASS bits clocked after this device's DR payload.
    pub dr_postscan: usize,
    /// Last IR shifted into this device, used to elide redundant IR shifts.
    current_ir: Option<u32>,
}

/// An enumerated scan chain plus the tap driver it talks through.
#[derive(Debug)]
pub struct JtagChain<P> {
    probe: P,
    devices: Vec<JtagDevice>,
}

impl<P: RawJtagIo> JtagChain<P> {
    /// Enumerate the chain with the builtin quirk table.
    pub fn scan(probe: P) -> Result<Self, ScanChainError> {
        Self::scan_with_quirks(probe, BUILTIN_IR_QUIRKS)
    }

    /// Enumerate the chain, consulting `quirks` for devices whose IR capture
    /// violates the `1`-in-the-first-bit rule.
    pub fn scan_with_quirks(mut probe: P, quirks: &[IrQuirk]) -> Result<Self, ScanChainError> {
        probe.tap_reset()?;

        // Run-Test/Idle -> Select-DR-Scan -> Capture-DR -> Shift-DR.
        probe.tms_sequence(0b001, 3)?;
        let idcodes = Self::collect_idcodes(&mut probe)?;

        if idcodes.is_empty() {
            return Err(ScanChainError::LengthMismatch {
                expected: 0,
                counted: 0,
            });
        }

        // Shift-DR -> Exit1-DR -> Update-DR -> Select-DR -> Select-IR
        // -> Capture-IR -> Shift-IR.
        probe.tms_sequence(0b001111, 6)?;
        let ir_lens = Self::delimit_irs(&mut probe, &idcodes, quirks)?;

        // Shift-IR -> Exit1-IR -> Update-IR -> Select-DR -> Capture-DR
        // -> Shift-DR. Every IR is now all-ones, i.e. BYPASS.
        probe.tms_sequence(0b00111, 5)?;
        Self::verify_chain_length(&mut probe, idcodes.len())?;

        // Leave the TAPs in a defined state. This also reselects IDCODE,
        // invalidating every IR cache.
        probe.tap_reset()?;

        let total_ir: usize = ir_lens.iter().map(|&l| l as usize).sum();
        let count = idcodes.len();
        let mut prescan = 0usize;
        let devices = idcodes
            .into_iter()
            .zip(ir_lens)
            .enumerate()
            .map(|(index, (idcode, ir_len))| {
                let device = JtagDevice {
                    index,
                    idcode,
                    ir_len,
                    ir_prescan: prescan,
                    ir_postscan: total_ir - prescan - ir_len as usize,
                    dr_prescan: index,
                    dr_postscan: count - index - 1,
                    current_ir: None,
                };
                prescan += ir_len as usize;
                device
            })
            .collect::<Vec<_>>();

        for device in &devices {
            match device.idcode {
                Some(id) => tracing::info!("JTAG device {}: {}", device.index, id),
                None => tracing::info!("JTAG device {}: in BYPASS", device.index),
            }
        }

        Ok(Self { probe, devices })
    }

    fn collect_idcodes(probe: &mut P) -> Result<Vec<Option<IdCode>>, ScanChainError> {
        let mut idcodes = Vec::new();

        loop {
            // Shifting ones in: once the chain is drained we read our own
            // ones back as 0xFFFFFFFF.
            if !probe.jtag_next(false, true)? {
                // A single 0 is a device in BYPASS.
                if idcodes.len() == MAX_CHAIN_DEVICES {
                    return Err(ScanChainError::TooManyDevices);
                }
                tracing::debug!("found BYPASS TAP at index {}", idcodes.len());
                idcodes.push(None);
                continue;
            }

            let mut raw = 1u32;
            for bit in 1..32 {
                if probe.jtag_next(false, true)? {
                    raw |= 1 << bit;
                }
            }

            if raw == 0xFFFF_FFFF {
                break;
            }
            if idcodes.len() == MAX_CHAIN_DEVICES {
                return Err(ScanChainError::TooManyDevices);
            }

            let idcode = IdCode::from(raw);
            if !idcode.valid() {
                return Err(ScanChainError::InvalidIdCode(raw));
            }
            tracing::info!("found IDCODE: {idcode}");
            idcodes.push(Some(idcode));
        }

        Ok(idcodes)
    }

    /// Walk the IR capture, shifting ones in. A conforming device captures
    /// `1` in its first bit and `0` in its second; the next `1` therefore
    /// belongs to the following device (or is one of ours, for the last
    /// device). Quirk entries pin the length for devices that capture
    /// something else.
    fn delimit_irs(
        probe: &mut P,
        idcodes: &[Option<IdCode>],
        quirks: &[IrQuirk],
    ) -> Result<Vec<u8>, ScanChainError> {
        let mut lengths = Vec::with_capacity(idcodes.len());
        // Set when the previous device's scan already consumed this
        // device's leading 1.
        let mut carried_one = false;

        for (index, &idcode) in idcodes.iter().enumerate() {
            if let Some(quirk) = quirks.iter().find(|q| q.matches(idcode)) {
                tracing::debug!(
                    "device {index}: IR quirk, len {} capture 0x{:x}",
                    quirk.ir_len,
                    quirk.ir_capture
                );
                let start = if carried_one {
                    if quirk.ir_capture & 1 == 0 {
                        return Err(ScanChainError::QuirkMismatch { index });
                    }
                    1
                } else {
                    0
                };
                for bit in start..quirk.ir_len {
                    let expected = quirk.ir_capture >> bit & 1 == 1;
                    if probe.jtag_next(false, true)? != expected {
                        return Err(ScanChainError::QuirkMismatch { index });
                    }
                }
                carried_one = false;
                lengths.push(quirk.ir_len);
                continue;
            }

            if !carried_one && !probe.jtag_next(false, true)? {
                tracing::error!("device {index}: IR capture does not start with 1");
                return Err(ScanChainError::InvalidIr);
            }

            let mut len = 1u8;
            while !probe.jtag_next(false, true)? {
                len += 1;
                if len > MAX_IR_LENGTH {
                    return Err(ScanChainError::InvalidIr);
                }
            }
            // The terminating 1 is the next device's first capture bit.
            carried_one = true;
            tracing::debug!("device {index}: IR length {len}");
            lengths.push(len);
        }

        Ok(lengths)
    }

    /// With every device in BYPASS, a 1 presented at TDI appears at TDO
    /// after exactly one clock per device.
    fn verify_chain_length(probe: &mut P, expected: usize) -> Result<(), ScanChainError> {
        for _ in 0..expected + 2 {
            probe.jtag_next(false, false)?;
        }
        for counted in 0..=MAX_CHAIN_DEVICES + 1 {
            if probe.jtag_next(false, true)? {
                return if counted == expected {
                    Ok(())
                } else {
                    Err(ScanChainError::LengthMismatch { expected, counted })
                };
            }
        }
        Err(ScanChainError::LengthMismatch {
            expected,
            counted: MAX_CHAIN_DEVICES + 2,
        })
    }

    /// The enumerated devices, index 0 nearest TDO.
    pub fn devices(&self) -> &[JtagDevice] {
        &self.devices
    }

    /// Direct access to the tap driver, e.g. for protocol switch sequences.
    pub fn probe_mut(&mut self) -> &mut P {
        &mut self.probe
    }

    /// Release the tap driver.
    pub fn into_probe(self) -> P {
        self.probe
    }

    /// Shift `ir` into device `index`, putting every other device into
    /// BYPASS. Skipped entirely when the cache says the IR is current.
    pub fn shift_ir(&mut self, index: usize, ir: u32) -> Result<(), DebugProbeError> {
        if self.devices[index].current_ir == Some(ir) {
            return Ok(());
        }

        let device = &self.devices[index];
        let (prescan, postscan, ir_len) = (device.ir_prescan, device.ir_postscan, device.ir_len);

        // Run-Test/Idle -> Select-DR -> Select-IR -> Capture-IR -> Shift-IR.
        self.probe.tms_sequence(0b0011, 4)?;

        // Devices closer to TDO first, then the payload, then ones for the
        // rest of the chain; TMS rises on the very last bit.
        self.probe.jtag_cycle(false, true, prescan)?;
        let mut payload = BitVec::<u8>::new();
        for bit in 0..ir_len {
            payload.push(ir >> bit & 1 == 1);
        }
        if postscan == 0 {
            self.probe.tdi_sequence(&payload, true)?;
        } else {
            self.probe.tdi_sequence(&payload, false)?;
            self.probe.jtag_cycle(false, true, postscan - 1)?;
            self.probe.jtag_next(true, true)?;
        }

        // Exit1-IR -> Update-IR -> Run-Test/Idle.
        self.probe.tms_sequence(0b01, 2)?;

        for (i, device) in self.devices.iter_mut().enumerate() {
            device.current_ir = if i == index {
                Some(ir)
            } else {
                // Everything else got all-ones, i.e. BYPASS.
                Some((1u64.wrapping_shl(device.ir_len as u32) - 1) as u32)
            };
        }
        Ok(())
    }

    /// Shift `data` through device `index`'s DR, returning the captured
    /// bits. Every other device must already be in BYPASS (which
    /// [`Self::shift_ir`] guarantees).
    pub fn shift_dr(
        &mut self,
        index: usize,
        data: &BitSlice<u8>,
    ) -> Result<BitVec<u8>, DebugProbeError> {
        let device = &self.devices[index];
        let (prescan, postscan) = (device.dr_prescan, device.dr_postscan);

        // Run-Test/Idle -> Select-DR -> Capture-DR -> Shift-DR.
        self.probe.tms_sequence(0b001, 3)?;

        self.probe.jtag_cycle(false, true, prescan)?;
        let captured = self.probe.tdi_tdo_sequence(data, postscan == 0)?;
        if postscan > 0 {
            self.probe.jtag_cycle(false, true, postscan - 1)?;
            self.probe.jtag_next(true, true)?;
        }

        // Exit1-DR -> Update-DR -> Run-Test/Idle.
        self.probe.tms_sequence(0b01, 2)?;
        Ok(captured)
    }

    /// Forget the cached IRs, e.g. after an error recovery reset.
    pub fn invalidate_ir_cache(&mut self) {
        for device in &mut self.devices {
            device.current_ir = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake::ChainSim;

    #[test]
    fn scan_single_arm_tap() {
        let sim = ChainSim::new(vec![(0x4BA0_0477, 4)]);
        let chain = JtagChain::scan(sim).unwrap();

        let devices = chain.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].idcode.unwrap().raw(), 0x4BA0_0477);
        assert_eq!(devices[0].ir_len, 4);
        assert_eq!(devices[0].ir_prescan, 0);
        assert_eq!(devices[0].ir_postscan, 0);
    }

    #[test]
    fn scan_stm32f4_style_chain() {
        // Cortex-M4 debug TAP plus the 5-bit boundary-scan TAP.
        let sim = ChainSim::new(vec![(0x4BA0_0477, 4), (0x0641_3041, 5)]);
        let chain = JtagChain::scan(sim).unwrap();

        let devices = chain.devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].idcode.unwrap().raw(), 0x4BA0_0477);
        assert_eq!(devices[1].idcode.unwrap().raw(), 0x0641_3041);

        // Pre/post-scan bookkeeping: IR sums over the neighbours, DR counts
        // BYPASS bits.
        assert_eq!(devices[0].ir_prescan, 0);
        assert_eq!(devices[0].ir_postscan, 5);
        assert_eq!(devices[1].ir_prescan, 4);
        assert_eq!(devices[1].ir_postscan, 0);
        assert_eq!(devices[0].dr_prescan, 0);
        assert_eq!(devices[0].dr_postscan, 1);
        assert_eq!(devices[1].dr_prescan, 1);
        assert_eq!(devices[1].dr_postscan, 0);
    }

    #[test]
    fn scan_rejects_truncated_chain() {
        let mut sim = ChainSim::new(vec![(0x4BA0_0477, 4)]);
        // Pretend a second device exists during the BYPASS flush only.
        sim.extra_bypass_delay = 1;
        let result = JtagChain::scan(sim);
        assert!(matches!(
            result,
            Err(ScanChainError::LengthMismatch {
                expected: 1,
                counted: 2
            })
        ));
    }

    #[test]
    fn quirky_ir_capture_is_validated() {
        // Device captures 0b0101 in a 4-bit IR: without a quirk the scan
        // would mis-delimit at bit 2.
        let mut sim = ChainSim::new(vec![(0x4BA0_0477, 4)]);
        sim.devices[0].ir_capture = 0b0101;

        let quirks = [IrQuirk {
            idcode: 0x4BA0_0477,
            idcode_mask: 0xFFFF_FFFF,
            ir_len: 4,
            ir_capture: 0b0101,
        }];
        let chain = JtagChain::scan_with_quirks(sim, &quirks).unwrap();
        assert_eq!(chain.devices()[0].ir_len, 4);

        // Without the quirk the 1-after-a-0 rule mis-delimits the IR at the
        // second captured 1, which is why the quirk table exists.
        let mut sim = ChainSim::new(vec![(0x4BA0_0477, 4)]);
        sim.devices[0].ir_capture = 0b0101;
        let chain = JtagChain::scan(sim).unwrap();
        assert_eq!(chain.devices()[0].ir_len, 2);
    }

    #[test]
    fn shift_ir_skips_redundant_shifts() {
        let sim = ChainSim::new(vec![(0x4BA0_0477, 4)]);
        let mut chain = JtagChain::scan(sim).unwrap();

        chain.shift_ir(0, 0xA).unwrap();
        let clocks = chain.probe_mut().clocks;
        chain.shift_ir(0, 0xA).unwrap();
        assert_eq!(chain.probe_mut().clocks, clocks);

        chain.shift_ir(0, 0xB).unwrap();
        assert!(chain.probe_mut().clocks > clocks);
    }

    #[test]
    fn dr_shift_reaches_the_selected_device() {
        let sim = ChainSim::new(vec![(0x4BA0_0477, 4), (0x0641_3041, 5)]);
        let mut chain = JtagChain::scan(sim).unwrap();

        // Select IDCODE on device 1; device 0 drops into BYPASS, so the
        // DR path is one bypass bit followed by the 32-bit IDCODE.
        chain.shift_ir(1, 0b00010).unwrap();
        let out = bitvec![u8, Lsb0; 0; 32];
        let captured = chain.shift_dr(1, &out).unwrap();
        assert_eq!(captured.load_le::<u32>(), 0x0641_3041);
    }
}
