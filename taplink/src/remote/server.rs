//! The firmware half of the remote protocol: parse one request frame,
//! run it against the local drivers, encode one response frame.
//!
//! The link is a strict request/response oracle; there is no concurrency
//! and no state beyond what the backend keeps.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use super::protocol::{self, error_code, Adiv5Op, ProtocolVersion, ResponseCode};
use super::RemoteError;

/// Largest bulk transfer a single packet may request.
const MAX_MEM_TRANSFER: u32 = 0x1_0000;

/// A JTAG device record pushed by the host so accelerated ADIv5 packets
/// can address devices on the firmware's chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteJtagDevice {
    /// Chain index.
    pub index: u8,
    /// BYPASS bits before the DR payload.
    pub dr_prescan: u8,
    /// BYPASS bits after the DR payload.
    pub dr_postscan: u8,
    /// IR length in bits.
    pub ir_len: u8,
    /// IR bits before the payload.
    pub ir_prescan: u8,
    /// IR bits after the payload.
    pub ir_postscan: u8,
    /// The device's IDCODE.
    pub idcode: u32,
}

/// Everything a remote server can be asked to do.
///
/// Every method defaults to `NotSupported`, so a backend only implements
/// what its hardware has. Wire-level failures surface as
/// [`RemoteError::Remote`] with a protocol error code.
#[allow(unused_variables)]
pub trait RemoteBackend {
    /// Session start; the returned identity string goes to the host.
    fn start(&mut self) -> String {
        String::from("taplink remote")
    }

    /// Target supply voltage in millivolts, when measurable.
    fn target_voltage_mv(&mut self) -> Option<u32> {
        None
    }

    /// Drive or release the target reset line.
    fn set_nrst(&mut self, assert: bool) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Whether reset is currently asserted.
    fn nrst(&mut self) -> Result<bool, RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Switch target power.
    fn set_power(&mut self, on: bool) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Whether target power is on.
    fn power(&mut self) -> Result<bool, RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Set the interface clock frequency.
    fn set_frequency(&mut self, hz: u32) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// The interface clock frequency.
    fn frequency(&mut self) -> Result<u32, RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Tristate or drive the target clock.
    fn target_clk_output_enable(&mut self, enable: bool) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Acceleration bitmask for `!HA#`: bit 0 ADIv5, bit 1 RISC-V DMI.
    fn accel_bits(&mut self) -> u32 {
        0
    }

    /// Switch the wire to SWD mode.
    fn swd_init(&mut self) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// SWD sequence in.
    fn swd_seq_in(&mut self, bits: u8) -> Result<u32, RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// SWD sequence in with parity.
    fn swd_seq_in_parity(&mut self, bits: u8) -> Result<(u32, bool), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// SWD sequence out.
    fn swd_seq_out(&mut self, value: u32, bits: u8) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// SWD sequence out with parity.
    fn swd_seq_out_parity(&mut self, value: u32, bits: u8) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Switch the wire to JTAG mode.
    fn jtag_init(&mut self) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// TAP reset.
    fn jtag_reset(&mut self) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Clock out a TMS sequence.
    fn jtag_tms_sequence(&mut self, states: u32, cycles: u8) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Shift TDI while capturing TDO. Bits are packed LSB-first into
    /// bytes.
    fn jtag_tdi_tdo_sequence(
        &mut self,
        tdi: &[u8],
        cycles: u8,
        final_tms: bool,
    ) -> Result<Vec<u8>, RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// One TCK cycle; returns TDO.
    fn jtag_next(&mut self, tms: bool, tdi: bool) -> Result<bool, RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Clock several cycles with constant TMS/TDI.
    fn jtag_cycle(&mut self, tms: bool, tdi: bool, cycles: u16) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Record a JTAG device description from the host.
    fn add_jtag_device(&mut self, device: RemoteJtagDevice) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Accelerated DP register read.
    fn dp_read(&mut self, dev_index: u8, addr: u16) -> Result<u32, RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Accelerated AP register read.
    fn ap_read(&mut self, dev_index: u8, apsel: u8, addr: u8) -> Result<u32, RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Accelerated AP register write.
    fn ap_write(
        &mut self,
        dev_index: u8,
        apsel: u8,
        addr: u8,
        value: u32,
    ) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Raw low-level DP/AP access.
    fn raw_access(
        &mut self,
        dev_index: u8,
        rnw: bool,
        addr: u16,
        value: u32,
    ) -> Result<u32, RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Accelerated bulk memory read through the MEM-AP.
    fn mem_read(
        &mut self,
        dev_index: u8,
        apsel: u8,
        align: u8,
        address: u32,
        data: &mut [u8],
    ) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Accelerated bulk memory write through the MEM-AP.
    fn mem_write(
        &mut self,
        dev_index: u8,
        apsel: u8,
        align: u8,
        address: u32,
        data: &[u8],
    ) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Initialise the RISC-V debug transport.
    fn dmi_init(&mut self) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// DMI register read.
    fn dmi_read(&mut self, address: u32) -> Result<u32, RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// DMI register write.
    fn dmi_write(&mut self, address: u32, value: u32) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Bitmask of supported DTM protocols: bit 0 JTAG.
    fn dtm_protocols(&mut self) -> u8 {
        0
    }

    /// Take over the SPI bus.
    fn spi_begin(&mut self, bus: u8) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Release the SPI bus.
    fn spi_end(&mut self) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Drive the chip select.
    fn spi_chip_select(&mut self, select: u8) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Full-duplex byte transfer.
    fn spi_transfer(&mut self, out: u8) -> Result<u8, RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Read the JEDEC chip id of the attached flash.
    fn spi_chip_id(&mut self) -> Result<[u8; 3], RemoteError> {
        Err(RemoteError::NotSupported)
    }

    /// Run a single-byte flash command.
    fn spi_run_command(&mut self, command: u8) -> Result<(), RemoteError> {
        Err(RemoteError::NotSupported)
    }
}

enum Reply {
    Ok(Vec<u8>),
    Parity(Vec<u8>),
}

/// One protocol endpoint over a backend, speaking one dialect.
pub struct RemoteServer<B: RemoteBackend> {
    backend: B,
    version: ProtocolVersion,
}

impl<B: RemoteBackend> RemoteServer<B> {
    /// Serve `backend` in the given dialect.
    pub fn new(backend: B, version: ProtocolVersion) -> Self {
        Self { backend, version }
    }

    /// The backend, e.g. for test inspection.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Handle one request frame, producing one response frame.
    pub fn handle(&mut self, frame: &[u8]) -> Vec<u8> {
        match protocol::unframe_request(frame).and_then(|body| self.dispatch(body)) {
            Ok(Reply::Ok(payload)) => protocol::frame_response(ResponseCode::Ok, &payload),
            Ok(Reply::Parity(payload)) => {
                protocol::frame_response(ResponseCode::ParityError, &payload)
            }
            Err(RemoteError::NotSupported) => {
                protocol::frame_response(ResponseCode::NotSupported, &[])
            }
            Err(RemoteError::Remote(code)) => {
                let mut payload = Vec::new();
                protocol::push_hex(&mut payload, code as u32, 2);
                protocol::frame_response(ResponseCode::Error, &payload)
            }
            Err(_) => {
                let mut payload = Vec::new();
                protocol::push_hex(&mut payload, error_code::UNRECOGNISED as u32, 2);
                protocol::frame_response(ResponseCode::Error, &payload)
            }
        }
    }

    fn dispatch(&mut self, body: &[u8]) -> Result<Reply, RemoteError> {
        let (&family, rest) = body.split_first().ok_or(RemoteError::Protocol)?;
        let (&opcode, payload) = rest.split_first().ok_or(RemoteError::Protocol)?;

        match family {
            b'G' => self.dispatch_general(opcode, payload),
            b'S' => self.dispatch_swd(opcode, payload),
            b'J' => self.dispatch_jtag(opcode, payload),
            b'H' => self.dispatch_high_level(opcode, payload),
            b'A' => self.dispatch_adiv5(opcode, payload),
            b'R' => self.dispatch_riscv(opcode, payload),
            b's' => self.dispatch_spi(opcode, payload),
            _ => Err(RemoteError::NotSupported),
        }
    }

    fn dispatch_general(&mut self, opcode: u8, payload: &[u8]) -> Result<Reply, RemoteError> {
        match opcode {
            b'A' => Ok(Reply::Ok(self.backend.start().into_bytes())),
            b'V' => {
                let mv = self
                    .backend
                    .target_voltage_mv()
                    .ok_or(RemoteError::NotSupported)?;
                let mut out = Vec::new();
                protocol::push_hex(&mut out, mv, 4);
                Ok(Reply::Ok(out))
            }
            b'Z' => {
                self.backend
                    .set_nrst(protocol::parse_hex(payload, 1)? != 0)?;
                Ok(Reply::Ok(Vec::new()))
            }
            b'z' => {
                let asserted = self.backend.nrst()?;
                let mut out = Vec::new();
                protocol::push_hex(&mut out, asserted as u32, 1);
                Ok(Reply::Ok(out))
            }
            b'P' => {
                self.backend
                    .set_power(protocol::parse_hex(payload, 1)? != 0)?;
                Ok(Reply::Ok(Vec::new()))
            }
            b'p' => {
                let on = self.backend.power()?;
                let mut out = Vec::new();
                protocol::push_hex(&mut out, on as u32, 1);
                Ok(Reply::Ok(out))
            }
            b'F' if self.version.has_clock_control() => {
                self.backend.set_frequency(protocol::parse_hex(payload, 8)?)?;
                Ok(Reply::Ok(Vec::new()))
            }
            b'f' if self.version.has_clock_control() => {
                let hz = self.backend.frequency()?;
                let mut out = Vec::new();
                protocol::push_hex(&mut out, hz, 8);
                Ok(Reply::Ok(out))
            }
            b'E' if self.version.has_clock_control() => {
                self.backend
                    .target_clk_output_enable(protocol::parse_hex(payload, 1)? != 0)?;
                Ok(Reply::Ok(Vec::new()))
            }
            _ => Err(RemoteError::NotSupported),
        }
    }

    fn dispatch_swd(&mut self, opcode: u8, payload: &[u8]) -> Result<Reply, RemoteError> {
        match opcode {
            b'S' => {
                self.backend.swd_init()?;
                Ok(Reply::Ok(Vec::new()))
            }
            b'i' => {
                let bits = protocol::parse_hex(payload, 2)? as u8;
                let value = self.backend.swd_seq_in(bits)?;
                let mut out = Vec::new();
                protocol::push_word_le(&mut out, value);
                Ok(Reply::Ok(out))
            }
            b'I' => {
                let bits = protocol::parse_hex(payload, 2)? as u8;
                // The request carries total cycles including parity.
                let (value, parity_ok) = self.backend.swd_seq_in_parity(bits.saturating_sub(1))?;
                let mut out = Vec::new();
                protocol::push_hex(&mut out, crate::probe::parity(value, 32) as u32, 2);
                protocol::push_word_le(&mut out, value);
                if parity_ok {
                    Ok(Reply::Ok(out))
                } else {
                    Ok(Reply::Parity(out))
                }
            }
            b'o' => {
                let bits = protocol::parse_hex(payload, 2)? as u8;
                let value = protocol::parse_word_le(&payload[2..])?;
                self.backend.swd_seq_out(value, bits)?;
                Ok(Reply::Ok(Vec::new()))
            }
            b'O' => {
                let bits = protocol::parse_hex(payload, 2)? as u8;
                let value = protocol::parse_word_le(&payload[2..])?;
                self.backend.swd_seq_out_parity(value, bits)?;
                Ok(Reply::Ok(Vec::new()))
            }
            _ => Err(RemoteError::NotSupported),
        }
    }

    fn dispatch_jtag(&mut self, opcode: u8, payload: &[u8]) -> Result<Reply, RemoteError> {
        match opcode {
            b'S' => {
                self.backend.jtag_init()?;
                Ok(Reply::Ok(Vec::new()))
            }
            b'R' => {
                self.backend.jtag_reset()?;
                Ok(Reply::Ok(Vec::new()))
            }
            b'T' => {
                let cycles = protocol::parse_hex(payload, 2)? as u8;
                let states = protocol::parse_hex(&payload[2..], 8)?;
                self.backend.jtag_tms_sequence(states, cycles)?;
                Ok(Reply::Ok(Vec::new()))
            }
            b'N' => {
                let tms = protocol::parse_hex(payload, 1)? != 0;
                let tdi = protocol::parse_hex(&payload[1..], 1)? != 0;
                let tdo = self.backend.jtag_next(tms, tdi)?;
                let mut out = Vec::new();
                protocol::push_hex(&mut out, tdo as u32, 1);
                Ok(Reply::Ok(out))
            }
            b'C' => {
                let tms = protocol::parse_hex(payload, 1)? != 0;
                let tdi = protocol::parse_hex(&payload[1..], 1)? != 0;
                let cycles = protocol::parse_hex(&payload[2..], 4)? as u16;
                self.backend.jtag_cycle(tms, tdi, cycles)?;
                Ok(Reply::Ok(Vec::new()))
            }
            b'D' => {
                let final_tms = protocol::parse_hex(payload, 1)? != 0;
                let cycles = protocol::parse_hex(&payload[1..], 2)? as u8;
                let tdi = protocol::parse_bytes_hex(&payload[3..])?;
                if tdi.len() * 8 < cycles as usize {
                    return Err(RemoteError::Protocol);
                }
                let tdo = self.backend.jtag_tdi_tdo_sequence(&tdi, cycles, final_tms)?;
                let mut out = Vec::new();
                protocol::push_bytes_hex(&mut out, &tdo);
                Ok(Reply::Ok(out))
            }
            _ => Err(RemoteError::NotSupported),
        }
    }

    fn dispatch_high_level(&mut self, opcode: u8, payload: &[u8]) -> Result<Reply, RemoteError> {
        match opcode {
            b'C' => {
                let mut out = Vec::new();
                protocol::push_hex(&mut out, self.version.as_byte() as u32, 2);
                Ok(Reply::Ok(out))
            }
            b'A' => {
                let mut out = Vec::new();
                protocol::push_hex(&mut out, self.backend.accel_bits(), 8);
                Ok(Reply::Ok(out))
            }
            b'J' => {
                let device = RemoteJtagDevice {
                    index: protocol::parse_hex(payload, 2)? as u8,
                    dr_prescan: protocol::parse_hex(&payload[2..], 2)? as u8,
                    dr_postscan: protocol::parse_hex(&payload[4..], 2)? as u8,
                    ir_len: protocol::parse_hex(&payload[6..], 2)? as u8,
                    ir_prescan: protocol::parse_hex(&payload[8..], 2)? as u8,
                    ir_postscan: protocol::parse_hex(&payload[10..], 2)? as u8,
                    idcode: protocol::parse_hex(&payload[12..], 8)?,
                };
                self.backend.add_jtag_device(device)?;
                Ok(Reply::Ok(Vec::new()))
            }
            _ => Err(RemoteError::NotSupported),
        }
    }

    fn dispatch_adiv5(&mut self, opcode: u8, payload: &[u8]) -> Result<Reply, RemoteError> {
        let op = self
            .version
            .adiv5_op_from(opcode)
            .ok_or(RemoteError::NotSupported)?;

        let (dev_index, payload) = if self.version.adiv5_has_dev_index() {
            let index = protocol::parse_hex(payload, 2)? as u8;
            (index, &payload[2..])
        } else {
            (0, payload)
        };

        let mut out = Vec::new();
        match op {
            Adiv5Op::DpRead => {
                let addr = protocol::parse_hex(payload, 4)? as u16;
                let value = self.backend.dp_read(dev_index, addr)?;
                protocol::push_hex(&mut out, value, 8);
            }
            Adiv5Op::ApRead => {
                let apsel = protocol::parse_hex(payload, 2)? as u8;
                let addr = protocol::parse_hex(&payload[2..], 2)? as u8;
                let value = self.backend.ap_read(dev_index, apsel, addr)?;
                protocol::push_hex(&mut out, value, 8);
            }
            Adiv5Op::ApWrite => {
                let apsel = protocol::parse_hex(payload, 2)? as u8;
                let addr = protocol::parse_hex(&payload[2..], 2)? as u8;
                let value = protocol::parse_hex(&payload[4..], 8)?;
                self.backend.ap_write(dev_index, apsel, addr, value)?;
            }
            Adiv5Op::RawAccess => {
                let rnw = protocol::parse_hex(payload, 1)? != 0;
                let addr = protocol::parse_hex(&payload[1..], 4)? as u16;
                let value = protocol::parse_hex(&payload[5..], 8)?;
                let result = self.backend.raw_access(dev_index, rnw, addr, value)?;
                protocol::push_hex(&mut out, result, 8);
            }
            Adiv5Op::MemRead => {
                let apsel = protocol::parse_hex(payload, 2)? as u8;
                let align = protocol::parse_hex(&payload[2..], 1)? as u8;
                let address = protocol::parse_hex(&payload[3..], 8)?;
                let count = protocol::parse_hex(&payload[11..], 8)?;
                if count > MAX_MEM_TRANSFER {
                    return Err(RemoteError::Remote(error_code::PARAMETER));
                }
                let mut data = vec![0u8; count as usize];
                self.backend
                    .mem_read(dev_index, apsel, align, address, &mut data)?;
                protocol::push_bytes_hex(&mut out, &data);
            }
            Adiv5Op::MemWrite => {
                let apsel = protocol::parse_hex(payload, 2)? as u8;
                let align = protocol::parse_hex(&payload[2..], 1)? as u8;
                let address = protocol::parse_hex(&payload[3..], 8)?;
                let count = protocol::parse_hex(&payload[11..], 8)?;
                if count > MAX_MEM_TRANSFER {
                    return Err(RemoteError::Remote(error_code::PARAMETER));
                }
                let raw = &payload[19..];
                let data = if self.version.mem_write_base64() {
                    BASE64
                        .decode(raw)
                        .map_err(|_| RemoteError::Protocol)?
                } else {
                    protocol::parse_bytes_hex(raw)?
                };
                if data.len() != count as usize {
                    return Err(RemoteError::Protocol);
                }
                self.backend
                    .mem_write(dev_index, apsel, align, address, &data)?;
            }
        }
        Ok(Reply::Ok(out))
    }

    fn dispatch_riscv(&mut self, opcode: u8, payload: &[u8]) -> Result<Reply, RemoteError> {
        match opcode {
            b'I' => {
                self.backend.dmi_init()?;
                Ok(Reply::Ok(Vec::new()))
            }
            b'r' => {
                let address = protocol::parse_hex(payload, 8)?;
                let value = self.backend.dmi_read(address)?;
                let mut out = Vec::new();
                protocol::push_hex(&mut out, value, 8);
                Ok(Reply::Ok(out))
            }
            b'w' => {
                let address = protocol::parse_hex(payload, 8)?;
                let value = protocol::parse_hex(&payload[8..], 8)?;
                self.backend.dmi_write(address, value)?;
                Ok(Reply::Ok(Vec::new()))
            }
            b'P' => {
                let mut out = Vec::new();
                protocol::push_hex(&mut out, self.backend.dtm_protocols() as u32, 2);
                Ok(Reply::Ok(out))
            }
            _ => Err(RemoteError::NotSupported),
        }
    }

    fn dispatch_spi(&mut self, opcode: u8, payload: &[u8]) -> Result<Reply, RemoteError> {
        match opcode {
            b'b' => {
                self.backend.spi_begin(protocol::parse_hex(payload, 2)? as u8)?;
                Ok(Reply::Ok(Vec::new()))
            }
            b'e' => {
                self.backend.spi_end()?;
                Ok(Reply::Ok(Vec::new()))
            }
            b'c' => {
                self.backend
                    .spi_chip_select(protocol::parse_hex(payload, 2)? as u8)?;
                Ok(Reply::Ok(Vec::new()))
            }
            b't' => {
                let out_byte = protocol::parse_hex(payload, 2)? as u8;
                let in_byte = self.backend.spi_transfer(out_byte)?;
                let mut out = Vec::new();
                protocol::push_hex(&mut out, in_byte as u32, 2);
                Ok(Reply::Ok(out))
            }
            b'r' => {
                let count = protocol::parse_hex(payload, 4)?;
                if count > MAX_MEM_TRANSFER {
                    return Err(RemoteError::Remote(error_code::PARAMETER));
                }
                let mut data = vec![0u8; count as usize];
                for byte in data.iter_mut() {
                    *byte = self.backend.spi_transfer(0xFF)?;
                }
                let mut out = Vec::new();
                protocol::push_bytes_hex(&mut out, &data);
                Ok(Reply::Ok(out))
            }
            b'w' => {
                let data = protocol::parse_bytes_hex(payload)?;
                for byte in data {
                    self.backend.spi_transfer(byte)?;
                }
                Ok(Reply::Ok(Vec::new()))
            }
            b'i' => {
                let id = self.backend.spi_chip_id()?;
                let mut out = Vec::new();
                protocol::push_bytes_hex(&mut out, &id);
                Ok(Reply::Ok(out))
            }
            b'x' => {
                self.backend
                    .spi_run_command(protocol::parse_hex(payload, 2)? as u8)?;
                Ok(Reply::Ok(Vec::new()))
            }
            _ => Err(RemoteError::NotSupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct TestBackend {
        seq_in_value: u32,
        parity_ok: bool,
        seq_out_log: Vec<(u32, u8)>,
        nrst: bool,
        frequency: u32,
        dp_regs: HashMap<u16, u32>,
        dmi_regs: HashMap<u32, u32>,
        mem: HashMap<u32, u8>,
        mem_writes: Vec<(u32, Vec<u8>)>,
        devices: Vec<RemoteJtagDevice>,
    }

    impl RemoteBackend for TestBackend {
        fn swd_init(&mut self) -> Result<(), RemoteError> {
            Ok(())
        }
        fn swd_seq_in(&mut self, _bits: u8) -> Result<u32, RemoteError> {
            Ok(self.seq_in_value)
        }
        fn swd_seq_in_parity(&mut self, _bits: u8) -> Result<(u32, bool), RemoteError> {
            Ok((self.seq_in_value, self.parity_ok))
        }
        fn swd_seq_out(&mut self, value: u32, bits: u8) -> Result<(), RemoteError> {
            self.seq_out_log.push((value, bits));
            Ok(())
        }
        fn swd_seq_out_parity(&mut self, value: u32, bits: u8) -> Result<(), RemoteError> {
            self.seq_out_log.push((value, bits));
            Ok(())
        }
        fn set_nrst(&mut self, assert: bool) -> Result<(), RemoteError> {
            self.nrst = assert;
            Ok(())
        }
        fn nrst(&mut self) -> Result<bool, RemoteError> {
            Ok(self.nrst)
        }
        fn set_frequency(&mut self, hz: u32) -> Result<(), RemoteError> {
            self.frequency = hz;
            Ok(())
        }
        fn frequency(&mut self) -> Result<u32, RemoteError> {
            Ok(self.frequency)
        }
        fn dp_read(&mut self, _dev_index: u8, addr: u16) -> Result<u32, RemoteError> {
            self.dp_regs
                .get(&addr)
                .copied()
                .ok_or(RemoteError::Remote(error_code::WIRE_FAULT))
        }
        fn mem_read(
            &mut self,
            _dev_index: u8,
            _apsel: u8,
            _align: u8,
            address: u32,
            data: &mut [u8],
        ) -> Result<(), RemoteError> {
            for (index, byte) in data.iter_mut().enumerate() {
                *byte = self
                    .mem
                    .get(&(address + index as u32))
                    .copied()
                    .unwrap_or(0);
            }
            Ok(())
        }
        fn mem_write(
            &mut self,
            _dev_index: u8,
            _apsel: u8,
            _align: u8,
            address: u32,
            data: &[u8],
        ) -> Result<(), RemoteError> {
            self.mem_writes.push((address, data.to_vec()));
            Ok(())
        }
        fn dmi_read(&mut self, address: u32) -> Result<u32, RemoteError> {
            Ok(self.dmi_regs.get(&address).copied().unwrap_or(0))
        }
        fn dmi_write(&mut self, address: u32, value: u32) -> Result<(), RemoteError> {
            self.dmi_regs.insert(address, value);
            Ok(())
        }
        fn dtm_protocols(&mut self) -> u8 {
            0b01
        }
        fn add_jtag_device(&mut self, device: RemoteJtagDevice) -> Result<(), RemoteError> {
            self.devices.push(device);
            Ok(())
        }
    }

    fn server(version: ProtocolVersion) -> RemoteServer<TestBackend> {
        RemoteServer::new(TestBackend::default(), version)
    }

    #[test]
    fn swd_seq_in_parity_reply_framing() {
        let mut server = server(ProtocolVersion::V3);
        server.backend_mut().seq_in_value = 0xDEAD_BEEF;
        server.backend_mut().parity_ok = true;

        // 33 cycles: 32 data plus parity; the word comes back in wire
        // (little-endian byte) order with the parity bit up front.
        let response = server.handle(b"!SI21#");
        assert_eq!(response, b"&K00efbeadde#");
    }

    #[test]
    fn parity_failure_uses_the_p_sentinel() {
        let mut server = server(ProtocolVersion::V3);
        server.backend_mut().seq_in_value = 0xDEAD_BEEF;
        server.backend_mut().parity_ok = false;

        let response = server.handle(b"!SI21#");
        assert_eq!(response, b"&P00efbeadde#");
    }

    #[test]
    fn seq_out_carries_wire_order_words() {
        let mut server = server(ProtocolVersion::V3);
        let response = server.handle(b"!So20efbeadde#");
        assert_eq!(response, b"&K#");
        assert_eq!(server.backend_mut().seq_out_log, vec![(0xDEAD_BEEF, 0x20)]);
    }

    #[test]
    fn version_check_and_unknown_commands() {
        let mut server = server(ProtocolVersion::V2);
        assert_eq!(server.handle(b"!HC#"), b"&K02#");
        // Unknown family.
        assert_eq!(server.handle(b"!Qx#"), b"&N#");
        // Garbage framing.
        assert_eq!(server.handle(b"SI21#"), b"&E01#");
    }

    #[test]
    fn clock_control_needs_v2() {
        let mut old = server(ProtocolVersion::V1);
        assert_eq!(old.handle(b"!GF00989680#"), b"&N#");

        let mut new = server(ProtocolVersion::V2);
        assert_eq!(new.handle(b"!GF00989680#"), b"&K#");
        assert_eq!(new.backend_mut().frequency, 10_000_000);
        assert_eq!(new.handle(b"!Gf#"), b"&K00989680#");
    }

    #[test]
    fn nrst_set_and_get() {
        let mut server = server(ProtocolVersion::V0);
        assert_eq!(server.handle(b"!GZ1#"), b"&K#");
        assert!(server.backend_mut().nrst);
        assert_eq!(server.handle(b"!Gz#"), b"&K1#");
    }

    #[test]
    fn adiv5_dp_read_with_and_without_dev_index() {
        let mut v0 = server(ProtocolVersion::V0);
        v0.backend_mut().dp_regs.insert(0x4, 0xF000_0040);
        assert_eq!(v0.handle(b"!Ad0004#"), b"&Kf0000040#");

        let mut v1 = server(ProtocolVersion::V1);
        v1.backend_mut().dp_regs.insert(0x4, 0xF000_0040);
        // Same request now carries the device index first.
        assert_eq!(v1.handle(b"!Ad000004#"), b"&Kf0000040#");

        // A faulting access maps to the error response.
        assert_eq!(v1.handle(b"!Ad000008#"), b"&E02#");
    }

    #[test]
    fn v3_mem_write_is_base64() {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;

        let mut server = server(ProtocolVersion::V3);
        let data = [0x11u8, 0x22, 0x33, 0x44];
        // dev 0, apsel 0, word align, address, count, then base64 data.
        let mut body = b"AW".to_vec();
        protocol::push_hex(&mut body, 0, 2);
        protocol::push_hex(&mut body, 0, 2);
        protocol::push_hex(&mut body, 2, 1);
        protocol::push_hex(&mut body, 0x0801_0000, 8);
        protocol::push_hex(&mut body, data.len() as u32, 8);
        body.extend_from_slice(STANDARD.encode(data).as_bytes());
        let frame = protocol::frame_request(&body);

        assert_eq!(server.handle(&frame), b"&K#");
        assert_eq!(
            server.backend_mut().mem_writes,
            vec![(0x0801_0000, data.to_vec())]
        );
    }

    #[test]
    fn v0_mem_roundtrip_is_hex() {
        let mut server1 = server(ProtocolVersion::V0);
        assert_eq!(server1.handle(b"!AM00220000100000000000211223344#"), b"&E01#");

        let mut server2 = server(ProtocolVersion::V0);
        assert_eq!(
            server2.handle(b"!AM002200001000000000041122334! oops"),
            b"&E01#"
        );

        let mut server = server(ProtocolVersion::V0);
        assert_eq!(server.handle(b"!AM0022000010000000000411223344#"), b"&K#");
        assert_eq!(
            server.backend_mut().mem_writes,
            vec![(0x2000_0010, vec![0x11, 0x22, 0x33, 0x44])]
        );

        server.backend_mut().mem.insert(0x2000_0000, 0xAB);
        let response = server.handle(b"!Am00220000000000000001#");
        assert_eq!(response, b"&Kab#");
    }

    #[test]
    fn riscv_dmi_round_trip() {
        let mut server = server(ProtocolVersion::V3);
        assert_eq!(server.handle(b"!Rw00000010cafef00d#"), b"&K#");
        assert_eq!(server.handle(b"!Rr00000010#"), b"&Kcafef00d#");
        assert_eq!(server.handle(b"!RP#"), b"&K01#");
    }

    #[test]
    fn jtag_device_descriptor_is_recorded() {
        let mut server = server(ProtocolVersion::V1);
        let response = server.handle(b"!HJ0100010402054ba00477#");
        assert_eq!(response, b"&K#");
        assert_eq!(
            server.backend_mut().devices,
            vec![RemoteJtagDevice {
                index: 1,
                dr_prescan: 0,
                dr_postscan: 1,
                ir_len: 4,
                ir_prescan: 2,
                ir_postscan: 5,
                idcode: 0x4BA0_0477,
            }]
        );
    }

    #[test]
    fn spi_transfers_fall_back_to_not_supported() {
        let mut server = server(ProtocolVersion::V3);
        assert_eq!(server.handle(b"!st5a#"), b"&N#");
    }
}
