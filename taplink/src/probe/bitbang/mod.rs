//! Direct pin-toggling tap drivers.
//!
//! The platform hands us a pair of GPIO abstractions and we clock the
//! protocol out one edge at a time. This is the slowest driver but works on
//! anything that can wiggle two (SWD) or four (JTAG) pins.

use bitvec::prelude::*;

use super::{parity, DebugProbeError, LineDirection, RawJtagIo, RawSwdIo};

/// Platform pins for SWD.
///
/// `swdio_float`/`swdio_drive` reconfigure the shared data pin; the driver
/// guarantees it never reads SWDIO while driving it.
pub trait SwdPins {
    /// Set the SWCLK level.
    fn swclk(&mut self, high: bool);
    /// Set the SWDIO level. Only called while the pin is driven.
    fn swdio_out(&mut self, high: bool);
    /// Sample the SWDIO level. Only called while the pin floats.
    fn swdio_in(&mut self) -> bool;
    /// Release SWDIO so the target can drive it.
    fn swdio_float(&mut self);
    /// Take SWDIO back over.
    fn swdio_drive(&mut self);
}

/// Platform pins for JTAG.
pub trait JtagPins {
    /// Set the TCK level.
    fn tck(&mut self, high: bool);
    /// Set the TMS level.
    fn tms(&mut self, high: bool);
    /// Set the TDI level.
    fn tdi(&mut self, high: bool);
    /// Sample TDO.
    fn tdo(&mut self) -> bool;
}

/// Bit-banged SWD driver.
///
/// Tracks the SWDIO direction so redundant turnarounds are elided: two
/// same-direction sequences in a row cost zero extra cycles, a direction
/// change costs exactly one.
#[derive(Debug)]
pub struct BitbangSwd<P: SwdPins> {
    pins: P,
    direction: LineDirection,
}

impl<P: SwdPins> BitbangSwd<P> {
    /// Create the driver. The line starts floating, matching the state after
    /// a connect sequence where the target answered last.
    pub fn new(mut pins: P) -> Self {
        pins.swclk(false);
        pins.swdio_float();
        Self {
            pins,
            direction: LineDirection::Float,
        }
    }

    /// Reset the turnaround tracker, e.g. after an error recovery when the
    /// line state is unknown.
    pub fn reset_line_state(&mut self) {
        self.pins.swdio_float();
        self.direction = LineDirection::Float;
    }

    /// Consume the driver and hand the pins back to the platform.
    pub fn release(self) -> P {
        self.pins
    }

    fn clock_cycle(&mut self) {
        self.pins.swclk(true);
        self.pins.swclk(false);
    }

    fn turnaround(&mut self, target: LineDirection) {
        if self.direction == target {
            return;
        }

        tracing::trace!("turnaround to {:?}", target);
        if target == LineDirection::Float {
            self.pins.swdio_float();
        }
        self.clock_cycle();
        if target == LineDirection::Drive {
            self.pins.swdio_drive();
        }
        self.direction = target;
    }

    fn shift_in(&mut self, bits: u8) -> u32 {
        let mut value = 0;
        for index in 0..bits {
            if self.pins.swdio_in() {
                value |= 1 << index;
            }
            self.clock_cycle();
        }
        value
    }

    fn shift_out(&mut self, value: u32, bits: u8) {
        for index in 0..bits {
            self.pins.swdio_out(value >> index & 1 == 1);
            self.clock_cycle();
        }
    }
}

impl<P: SwdPins> RawSwdIo for BitbangSwd<P> {
    fn swd_seq_in(&mut self, bits: u8) -> Result<u32, DebugProbeError> {
        self.turnaround(LineDirection::Float);
        Ok(self.shift_in(bits))
    }

    fn swd_seq_in_parity(&mut self, bits: u8) -> Result<(u32, bool), DebugProbeError> {
        self.turnaround(LineDirection::Float);
        let value = self.shift_in(bits);
        let parity_bit = self.pins.swdio_in();
        self.clock_cycle();
        Ok((value, parity_bit == parity(value, bits)))
    }

    fn swd_seq_out(&mut self, value: u32, bits: u8) -> Result<(), DebugProbeError> {
        self.turnaround(LineDirection::Drive);
        self.shift_out(value, bits);
        Ok(())
    }

    fn swd_seq_out_parity(&mut self, value: u32, bits: u8) -> Result<(), DebugProbeError> {
        self.turnaround(LineDirection::Drive);
        self.shift_out(value, bits);
        self.pins.swdio_out(parity(value, bits));
        self.clock_cycle();
        Ok(())
    }
}

/// Bit-banged JTAG driver.
#[derive(Debug)]
pub struct BitbangJtag<P: JtagPins> {
    pins: P,
}

impl<P: JtagPins> BitbangJtag<P> {
    /// Create the driver with TCK low and TMS/TDI high.
    pub fn new(mut pins: P) -> Self {
        pins.tck(false);
        pins.tms(true);
        pins.tdi(true);
        Self { pins }
    }

    /// Consume the driver and hand the pins back to the platform.
    pub fn release(self) -> P {
        self.pins
    }

    fn clock(&mut self, tms: bool, tdi: bool) -> bool {
        self.pins.tms(tms);
        self.pins.tdi(tdi);
        self.pins.tck(true);
        let tdo = self.pins.tdo();
        self.pins.tck(false);
        tdo
    }
}

impl<P: JtagPins> RawJtagIo for BitbangJtag<P> {
    fn tap_reset(&mut self) -> Result<(), DebugProbeError> {
        // Five TMS-high cycles reach Test-Logic-Reset from any state, one
        // TMS-low cycle then lands in Run-Test/Idle.
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
            let tms = final_tms && index == last;
            tdo.push(self.clock(tms, bit));
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

#[cfg(test)]
mod tests {
    use super::*;

    /// Pins with SWDIO looped back onto itself: whatever was last driven is
    /// read back while floating, so `seq_out` followed by `seq_in` returns
    /// the original word.
    #[derive(Default)]
    struct LoopbackPins {
        swdio: bool,
        driven: bool,
        clocks: usize,
        turnaround_clocks: Vec<usize>,
        last_out: Vec<bool>,
    }

    impl SwdPins for LoopbackPins {
        fn swclk(&mut self, high: bool) {
            if high {
                self.clocks += 1;
            }
        }
        fn swdio_out(&mut self, high: bool) {
            self.swdio = high;
            self.last_out.push(high);
        }
        fn swdio_in(&mut self) -> bool {
            self.swdio
        }
        fn swdio_float(&mut self) {
            self.driven = false;
            self.turnaround_clocks.push(self.clocks);
        }
        fn swdio_drive(&mut self) {
            self.driven = true;
            self.turnaround_clocks.push(self.clocks);
        }
    }

    #[test]
    fn seq_out_shifts_lsb_first() {
        let mut swd = BitbangSwd::new(LoopbackPins::default());
        swd.swd_seq_out(0b1011, 4).unwrap();
        assert_eq!(swd.pins.last_out, vec![true, true, false, true]);
    }

    #[test]
    fn turnaround_elided_between_same_direction_sequences() {
        let mut swd = BitbangSwd::new(LoopbackPins::default());

        swd.swd_seq_out(0xAA, 8).unwrap();
        let first_drive = swd.pins.turnaround_clocks.len();
        swd.swd_seq_out(0x55, 8).unwrap();
        // No further direction change for the second output sequence.
        assert_eq!(swd.pins.turnaround_clocks.len(), first_drive);

        swd.swd_seq_in(8).unwrap();
        assert_eq!(swd.pins.turnaround_clocks.len(), first_drive + 1);
    }

    #[test]
    fn out_then_in_loops_back() {
        let mut swd = BitbangSwd::new(LoopbackPins::default());
        // A single driven bit is latched by the loopback; reading one bit
        // back yields it again after the turnaround.
        swd.swd_seq_out(1, 1).unwrap();
        assert_eq!(swd.swd_seq_in(1).unwrap(), 1);
    }

    #[test]
    fn parity_bit_appended_on_out_parity() {
        let mut swd = BitbangSwd::new(LoopbackPins::default());
        swd.swd_seq_out_parity(0b111, 3).unwrap();
        // Three data bits plus odd population -> parity bit set.
        assert_eq!(swd.pins.last_out, vec![true, true, true, true]);
    }

    /// TDI wired straight to TDO with a one-cycle delay of zero: the device
    /// is a plain wire, so TDO mirrors TDI.
    #[derive(Default)]
    struct WirePins {
        tdi: bool,
        tms_trace: Vec<bool>,
    }

    impl JtagPins for WirePins {
        fn tck(&mut self, _high: bool) {}
        fn tms(&mut self, high: bool) {
            self.tms_trace.push(high);
        }
        fn tdi(&mut self, high: bool) {
            self.tdi = high;
        }
        fn tdo(&mut self) -> bool {
            self.tdi
        }
    }

    #[test]
    fn tdi_tdo_sequence_mirrors_wire() {
        let mut jtag = BitbangJtag::new(WirePins::default());
        jtag.pins.tms_trace.clear();
        let tdi = bitvec![u8, Lsb0; 1, 0, 1, 1, 0];
        let tdo = jtag.tdi_tdo_sequence(&tdi, true).unwrap();
        assert_eq!(tdo, tdi);
        // Final TMS raised on the last bit only.
        let trace = &jtag.pins.tms_trace;
        assert!(trace[..trace.len() - 1].iter().all(|tms| !tms));
        assert!(trace[trace.len() - 1]);
    }

    #[test]
    fn tms_sequence_clocks_lsb_first() {
        let mut jtag = BitbangJtag::new(WirePins::default());
        jtag.pins.tms_trace.clear();
        jtag.tms_sequence(0b0011, 4).unwrap();
        assert_eq!(jtag.pins.tms_trace, vec![true, true, false, false]);
    }
}
