//! The hosted half of the remote protocol: a tap driver that forwards
//! every operation across a serial link.
//!
//! [`RemoteProbe`] implements [`RawSwdIo`] and [`RawJtagIo`], so the whole
//! ADI stack runs on the host with only bit sequences crossing the wire;
//! when the far side advertises acceleration, the high-level ADIv5 and DMI
//! calls skip the bit-level round trips entirely.

use bitvec::prelude::*;

use super::protocol::{self, Adiv5Op, ProtocolVersion, ResponseCode};
use super::server::RemoteJtagDevice;
use super::RemoteError;
use crate::probe::{DebugProbeError, RawJtagIo, RawSwdIo};

/// Acceleration bit: ADIv5 packets supported.
pub const ACCEL_ADIV5: u32 = 1 << 0;
/// Acceleration bit: RISC-V DMI packets supported.
pub const ACCEL_RISCV: u32 = 1 << 1;

/// TMS bits per remote primitive.
const TMS_CHUNK: u8 = 7;
/// TDI/TDO cycles per packet.
const TDI_CHUNK: usize = 64;

/// One request/response transport, e.g. a CDC-ACM character device.
///
/// `receive` blocks until a full response frame or the transport's own
/// timeout, which it reports as [`RemoteError::Timeout`].
pub trait RemoteLink {
    /// Send one request frame.
    fn send(&mut self, frame: &[u8]) -> Result<(), RemoteError>;

    /// Receive one response frame.
    fn receive(&mut self) -> Result<Vec<u8>, RemoteError>;
}

/// The host-side driver for a remote probe.
pub struct RemoteProbe<L: RemoteLink> {
    link: L,
    version: ProtocolVersion,
    accel: u32,
    identity: String,
}

impl<L: RemoteLink> RemoteProbe<L> {
    /// Open the session: send the start preamble, negotiate the protocol
    /// version, query the acceleration set.
    pub fn connect(mut link: L) -> Result<Self, RemoteError> {
        link.send(&protocol::frame_request(b"GA"))?;
        let frame = link.receive()?;
        let (code, identity) = protocol::unframe_response(&frame)?;
        if code != ResponseCode::Ok {
            return Err(RemoteError::Protocol);
        }
        let identity = String::from_utf8_lossy(identity).into_owned();

        link.send(&protocol::frame_request(b"HC"))?;
        let frame = link.receive()?;
        let version = match protocol::unframe_response(&frame)? {
            (ResponseCode::Ok, payload) => ProtocolVersion::from_hl_check(payload)?,
            // A server from before version negotiation speaks v0.
            (ResponseCode::NotSupported, _) => ProtocolVersion::V0,
            _ => return Err(RemoteError::Protocol),
        };

        let mut probe = Self {
            link,
            version,
            accel: 0,
            identity,
        };
        if version >= ProtocolVersion::V1 {
            probe.accel = match probe.request(b"HA") {
                Ok((_, payload)) => protocol::parse_hex(&payload, 8)?,
                Err(RemoteError::NotSupported) => 0,
                Err(e) => return Err(e),
            };
        }

        tracing::info!(
            "remote probe '{}', protocol {:?}, accel {:#x}",
            probe.identity,
            probe.version,
            probe.accel
        );
        Ok(probe)
    }

    /// The negotiated dialect.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// The identity string the remote sent at session start.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether ADIv5 packets are accelerated on the far side.
    pub fn has_adiv5_accel(&self) -> bool {
        self.accel & ACCEL_ADIV5 != 0
    }

    /// Whether DMI packets are accelerated on the far side.
    pub fn has_riscv_accel(&self) -> bool {
        self.accel & ACCEL_RISCV != 0
    }

    /// One request/response round trip. A transport timeout resets the
    /// line state with the session preamble and retries once.
    fn request(&mut self, body: &[u8]) -> Result<(ResponseCode, Vec<u8>), RemoteError> {
        self.link.send(&protocol::frame_request(body))?;
        let frame = match self.link.receive() {
            Ok(frame) => frame,
            Err(RemoteError::Timeout) => {
                tracing::warn!("remote link timed out, resetting line state");
                self.link.send(&protocol::frame_request(b"GA"))?;
                self.link.receive()?;
                self.link.send(&protocol::frame_request(body))?;
                self.link.receive()?
            }
            Err(e) => return Err(e),
        };

        let (code, payload) = protocol::unframe_response(&frame)?;
        match code {
            ResponseCode::Error => Err(RemoteError::Remote(protocol::parse_hex(payload, 2)? as u8)),
            ResponseCode::NotSupported => Err(RemoteError::NotSupported),
            _ => Ok((code, payload.to_vec())),
        }
    }

    fn request_ok(&mut self, body: &[u8]) -> Result<Vec<u8>, RemoteError> {
        let (code, payload) = self.request(body)?;
        if code != ResponseCode::Ok {
            return Err(RemoteError::Protocol);
        }
        Ok(payload)
    }

    /// Switch the remote's wire to SWD mode.
    pub fn swd_init(&mut self) -> Result<(), RemoteError> {
        self.request_ok(b"SS").map(|_| ())
    }

    /// Switch the remote's wire to JTAG mode.
    pub fn jtag_init(&mut self) -> Result<(), RemoteError> {
        self.request_ok(b"JS").map(|_| ())
    }

    /// Target supply voltage in millivolts.
    pub fn target_voltage_mv(&mut self) -> Result<u32, RemoteError> {
        let payload = self.request_ok(b"GV")?;
        protocol::parse_hex(&payload, 4)
    }

    /// Drive or release target reset.
    pub fn set_nrst(&mut self, assert: bool) -> Result<(), RemoteError> {
        let mut body = b"GZ".to_vec();
        protocol::push_hex(&mut body, assert as u32, 1);
        self.request_ok(&body).map(|_| ())
    }

    /// Whether reset is asserted.
    pub fn nrst(&mut self) -> Result<bool, RemoteError> {
        let payload = self.request_ok(b"Gz")?;
        Ok(protocol::parse_hex(&payload, 1)? != 0)
    }

    /// Switch target power.
    pub fn set_power(&mut self, on: bool) -> Result<(), RemoteError> {
        let mut body = b"GP".to_vec();
        protocol::push_hex(&mut body, on as u32, 1);
        self.request_ok(&body).map(|_| ())
    }

    /// Set the interface clock frequency. Needs a v2 remote.
    pub fn set_frequency(&mut self, hz: u32) -> Result<(), RemoteError> {
        if !self.version.has_clock_control() {
            return Err(RemoteError::NotSupported);
        }
        let mut body = b"GF".to_vec();
        protocol::push_hex(&mut body, hz, 8);
        self.request_ok(&body).map(|_| ())
    }

    /// Enable or tristate the target clock. Needs a v2 remote.
    pub fn target_clk_output_enable(&mut self, enable: bool) -> Result<(), RemoteError> {
        if !self.version.has_clock_control() {
            return Err(RemoteError::NotSupported);
        }
        let mut body = b"GE".to_vec();
        protocol::push_hex(&mut body, enable as u32, 1);
        self.request_ok(&body).map(|_| ())
    }

    /// Describe a scanned JTAG device to the remote so accelerated packets
    /// can reach it.
    pub fn add_jtag_device(&mut self, device: &RemoteJtagDevice) -> Result<(), RemoteError> {
        let mut body = b"HJ".to_vec();
        protocol::push_hex(&mut body, device.index as u32, 2);
        protocol::push_hex(&mut body, device.dr_prescan as u32, 2);
        protocol::push_hex(&mut body, device.dr_postscan as u32, 2);
        protocol::push_hex(&mut body, device.ir_len as u32, 2);
        protocol::push_hex(&mut body, device.ir_prescan as u32, 2);
        protocol::push_hex(&mut body, device.ir_postscan as u32, 2);
        protocol::push_hex(&mut body, device.idcode, 8);
        self.request_ok(&body).map(|_| ())
    }

    fn adiv5_body(&self, op: Adiv5Op, dev_index: u8) -> Vec<u8> {
        let mut body = vec![b'A', self.version.adiv5_opcode(op)];
        if self.version.adiv5_has_dev_index() {
            protocol::push_hex(&mut body, dev_index as u32, 2);
        }
        body
    }

    /// Accelerated DP register read.
    pub fn dp_read(&mut self, dev_index: u8, addr: u16) -> Result<u32, RemoteError> {
        let mut body = self.adiv5_body(Adiv5Op::DpRead, dev_index);
        protocol::push_hex(&mut body, addr as u32, 4);
        let payload = self.request_ok(&body)?;
        protocol::parse_hex(&payload, 8)
    }

    /// Accelerated AP register read.
    pub fn ap_read(&mut self, dev_index: u8, apsel: u8, addr: u8) -> Result<u32, RemoteError> {
        let mut body = self.adiv5_body(Adiv5Op::ApRead, dev_index);
        protocol::push_hex(&mut body, apsel as u32, 2);
        protocol::push_hex(&mut body, addr as u32, 2);
        let payload = self.request_ok(&body)?;
        protocol::parse_hex(&payload, 8)
    }

    /// Accelerated AP register write.
    pub fn ap_write(
        &mut self,
        dev_index: u8,
        apsel: u8,
        addr: u8,
        value: u32,
    ) -> Result<(), RemoteError> {
        let mut body = self.adiv5_body(Adiv5Op::ApWrite, dev_index);
        protocol::push_hex(&mut body, apsel as u32, 2);
        protocol::push_hex(&mut body, addr as u32, 2);
        protocol::push_hex(&mut body, value, 8);
        self.request_ok(&body).map(|_| ())
    }

    /// Raw low-level DP/AP access.
    pub fn raw_access(
        &mut self,
        dev_index: u8,
        rnw: bool,
        addr: u16,
        value: u32,
    ) -> Result<u32, RemoteError> {
        let mut body = self.adiv5_body(Adiv5Op::RawAccess, dev_index);
        protocol::push_hex(&mut body, rnw as u32, 1);
        protocol::push_hex(&mut body, addr as u32, 4);
        protocol::push_hex(&mut body, value, 8);
        let payload = self.request_ok(&body)?;
        protocol::parse_hex(&payload, 8)
    }

    /// Accelerated bulk memory read.
    pub fn mem_read(
        &mut self,
        dev_index: u8,
        apsel: u8,
        align: u8,
        address: u32,
        data: &mut [u8],
    ) -> Result<(), RemoteError> {
        let mut body = self.adiv5_body(Adiv5Op::MemRead, dev_index);
        protocol::push_hex(&mut body, apsel as u32, 2);
        protocol::push_hex(&mut body, align as u32, 1);
        protocol::push_hex(&mut body, address, 8);
        protocol::push_hex(&mut body, data.len() as u32, 8);
        let payload = self.request_ok(&body)?;
        let bytes = protocol::parse_bytes_hex(&payload)?;
        if bytes.len() != data.len() {
            return Err(RemoteError::Protocol);
        }
        data.copy_from_slice(&bytes);
        Ok(())
    }

    /// Accelerated bulk memory write.
    pub fn mem_write(
        &mut self,
        dev_index: u8,
        apsel: u8,
        align: u8,
        address: u32,
        data: &[u8],
    ) -> Result<(), RemoteError> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;

        let mut body = self.adiv5_body(Adiv5Op::MemWrite, dev_index);
        protocol::push_hex(&mut body, apsel as u32, 2);
        protocol::push_hex(&mut body, align as u32, 1);
        protocol::push_hex(&mut body, address, 8);
        protocol::push_hex(&mut body, data.len() as u32, 8);
        if self.version.mem_write_base64() {
            body.extend_from_slice(STANDARD.encode(data).as_bytes());
        } else {
            protocol::push_bytes_hex(&mut body, data);
        }
        self.request_ok(&body).map(|_| ())
    }

    /// Initialise the remote's RISC-V transport.
    pub fn dmi_init(&mut self) -> Result<(), RemoteError> {
        self.request_ok(b"RI").map(|_| ())
    }

    /// Remote DMI read.
    pub fn dmi_read(&mut self, address: u32) -> Result<u32, RemoteError> {
        let mut body = b"Rr".to_vec();
        protocol::push_hex(&mut body, address, 8);
        let payload = self.request_ok(&body)?;
        protocol::parse_hex(&payload, 8)
    }

    /// Remote DMI write.
    pub fn dmi_write(&mut self, address: u32, value: u32) -> Result<(), RemoteError> {
        let mut body = b"Rw".to_vec();
        protocol::push_hex(&mut body, address, 8);
        protocol::push_hex(&mut body, value, 8);
        self.request_ok(&body).map(|_| ())
    }
}

impl<L: RemoteLink> RawSwdIo for RemoteProbe<L> {
    fn swd_seq_in(&mut self, bits: u8) -> Result<u32, DebugProbeError> {
        let mut body = b"Si".to_vec();
        protocol::push_hex(&mut body, bits as u32, 2);
        let payload = self.request_ok(&body)?;
        Ok(protocol::parse_word_le(&payload)?)
    }

    fn swd_seq_in_parity(&mut self, bits: u8) -> Result<(u32, bool), DebugProbeError> {
        let mut body = b"SI".to_vec();
        // The wire counts total cycles, parity included.
        protocol::push_hex(&mut body, bits as u32 + 1, 2);
        let (code, payload) = self.request(&body)?;
        let value = protocol::parse_word_le(payload.get(2..).ok_or(RemoteError::Protocol)?)?;
        Ok((value, code == ResponseCode::Ok))
    }

    fn swd_seq_out(&mut self, value: u32, bits: u8) -> Result<(), DebugProbeError> {
        let mut body = b"So".to_vec();
        protocol::push_hex(&mut body, bits as u32, 2);
        protocol::push_word_le(&mut body, value);
        self.request_ok(&body)?;
        Ok(())
    }

    fn swd_seq_out_parity(&mut self, value: u32, bits: u8) -> Result<(), DebugProbeError> {
        let mut body = b"SO".to_vec();
        protocol::push_hex(&mut body, bits as u32, 2);
        protocol::push_word_le(&mut body, value);
        self.request_ok(&body)?;
        Ok(())
    }
}

impl<L: RemoteLink> RawJtagIo for RemoteProbe<L> {
    fn tap_reset(&mut self) -> Result<(), DebugProbeError> {
        self.request_ok(b"JR")?;
        Ok(())
    }

    fn jtag_next(&mut self, tms: bool, tdi: bool) -> Result<bool, DebugProbeError> {
        let mut body = b"JN".to_vec();
        protocol::push_hex(&mut body, tms as u32, 1);
        protocol::push_hex(&mut body, tdi as u32, 1);
        let payload = self.request_ok(&body)?;
        Ok(protocol::parse_hex(&payload, 1)? != 0)
    }

    fn tms_sequence(&mut self, mut states: u32, mut cycles: u8) -> Result<(), DebugProbeError> {
        // The far side's pin primitive takes at most seven TMS bits.
        while cycles > 0 {
            let chunk = cycles.min(TMS_CHUNK);
            let mut body = b"JT".to_vec();
            protocol::push_hex(&mut body, chunk as u32, 2);
            protocol::push_hex(&mut body, states & ((1 << chunk) - 1), 8);
            self.request_ok(&body)?;
            states >>= chunk;
            cycles -= chunk;
        }
        Ok(())
    }

    fn tdi_tdo_sequence(
        &mut self,
        tdi: &BitSlice<u8>,
        final_tms: bool,
    ) -> Result<BitVec<u8>, DebugProbeError> {
        let mut tdo = BitVec::with_capacity(tdi.len());

        let mut offset = 0;
        while offset < tdi.len() {
            let chunk = (tdi.len() - offset).min(TDI_CHUNK);
            let last = offset + chunk == tdi.len();

            let mut bytes = vec![0u8; chunk.div_ceil(8)];
            for (index, bit) in tdi[offset..offset + chunk].iter().by_vals().enumerate() {
                if bit {
                    bytes[index / 8] |= 1 << (index % 8);
                }
            }

            let mut body = b"JD".to_vec();
            protocol::push_hex(&mut body, (final_tms && last) as u32, 1);
            protocol::push_hex(&mut body, chunk as u32, 2);
            protocol::push_bytes_hex(&mut body, &bytes);
            let payload = self.request_ok(&body)?;
            let captured = protocol::parse_bytes_hex(&payload).map_err(DebugProbeError::from)?;
            if captured.len() * 8 < chunk {
                return Err(DebugProbeError::Remote(RemoteError::Protocol));
            }
            for index in 0..chunk {
                tdo.push(captured[index / 8] >> (index % 8) & 1 == 1);
            }

            offset += chunk;
        }
        Ok(tdo)
    }

    fn jtag_cycle(&mut self, tms: bool, tdi: bool, cycles: usize) -> Result<(), DebugProbeError> {
        let mut remaining = cycles;
        while remaining > 0 {
            let chunk = remaining.min(0xFFFF);
            let mut body = b"JC".to_vec();
            protocol::push_hex(&mut body, tms as u32, 1);
            protocol::push_hex(&mut body, tdi as u32, 1);
            protocol::push_hex(&mut body, chunk as u32, 4);
            self.request_ok(&body)?;
            remaining -= chunk;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::arm::dap::SwdDapInterface;
    use crate::architecture::arm::{DpAddress, PortType, RawDapAccess};
    use crate::probe::fake::{SimDap, SwdTargetSim};
    use crate::remote::server::{RemoteBackend, RemoteServer};

    /// A backend forwarding the SWD family into the simulated target.
    struct SimBackend {
        swd: SwdTargetSim,
        voltage_mv: u32,
    }

    impl SimBackend {
        fn new() -> Self {
            Self {
                swd: SwdTargetSim::new(SimDap::new()),
                voltage_mv: 3300,
            }
        }
    }

    fn io_error(e: crate::probe::DebugProbeError) -> RemoteError {
        RemoteError::Io(e.to_string())
    }

    impl RemoteBackend for SimBackend {
        fn target_voltage_mv(&mut self) -> Option<u32> {
            Some(self.voltage_mv)
        }
        fn swd_init(&mut self) -> Result<(), RemoteError> {
            Ok(())
        }
        fn swd_seq_in(&mut self, bits: u8) -> Result<u32, RemoteError> {
            self.swd.swd_seq_in(bits).map_err(io_error)
        }
        fn swd_seq_in_parity(&mut self, bits: u8) -> Result<(u32, bool), RemoteError> {
            self.swd.swd_seq_in_parity(bits).map_err(io_error)
        }
        fn swd_seq_out(&mut self, value: u32, bits: u8) -> Result<(), RemoteError> {
            self.swd.swd_seq_out(value, bits).map_err(io_error)
        }
        fn swd_seq_out_parity(&mut self, value: u32, bits: u8) -> Result<(), RemoteError> {
            self.swd.swd_seq_out_parity(value, bits).map_err(io_error)
        }
    }

    /// A link wired straight into an in-process server.
    struct LocalLink {
        server: RemoteServer<SimBackend>,
        pending: Option<Vec<u8>>,
        /// Swallow this many responses, reporting a timeout instead.
        drop_responses: usize,
        log: Vec<Vec<u8>>,
    }

    impl LocalLink {
        fn new(version: ProtocolVersion) -> Self {
            Self {
                server: RemoteServer::new(SimBackend::new(), version),
                pending: None,
                drop_responses: 0,
                log: Vec::new(),
            }
        }
    }

    impl RemoteLink for LocalLink {
        fn send(&mut self, frame: &[u8]) -> Result<(), RemoteError> {
            self.log.push(frame.to_vec());
            self.pending = Some(self.server.handle(frame));
            Ok(())
        }

        fn receive(&mut self) -> Result<Vec<u8>, RemoteError> {
            let response = self.pending.take().ok_or(RemoteError::Timeout)?;
            if self.drop_responses > 0 {
                self.drop_responses -= 1;
                return Err(RemoteError::Timeout);
            }
            Ok(response)
        }
    }

    #[test]
    fn connect_negotiates_the_version() {
        let probe = RemoteProbe::connect(LocalLink::new(ProtocolVersion::V3)).unwrap();
        assert_eq!(probe.version(), ProtocolVersion::V3);
        assert_eq!(probe.identity(), "taplink remote");

        let probe = RemoteProbe::connect(LocalLink::new(ProtocolVersion::V0)).unwrap();
        assert_eq!(probe.version(), ProtocolVersion::V0);
    }

    #[test]
    fn voltage_is_read_over_the_wire() {
        let mut probe = RemoteProbe::connect(LocalLink::new(ProtocolVersion::V2)).unwrap();
        assert_eq!(probe.target_voltage_mv().unwrap(), 3300);
    }

    #[test]
    fn clock_control_is_client_gated_by_version() {
        let mut probe = RemoteProbe::connect(LocalLink::new(ProtocolVersion::V1)).unwrap();
        assert!(matches!(
            probe.set_frequency(4_000_000),
            Err(RemoteError::NotSupported)
        ));
    }

    #[test]
    fn timeout_resets_line_state_and_retries() {
        let mut probe = RemoteProbe::connect(LocalLink::new(ProtocolVersion::V3)).unwrap();
        probe.link.drop_responses = 1;

        probe.swd_init().unwrap();
        // The retry resent the session preamble before the command.
        let log = &probe.link.log;
        let preambles: Vec<usize> = log
            .iter()
            .enumerate()
            .filter(|(_, frame)| frame.as_slice() == b"!GA#")
            .map(|(index, _)| index)
            .collect();
        assert_eq!(preambles.len(), 2);
        assert_eq!(log.last().unwrap().as_slice(), b"!SS#");
    }

    #[test]
    fn full_adi_stack_runs_over_the_remote_link() {
        // Host-side DP layer -> remote protocol -> simulated SWD target.
        let probe = RemoteProbe::connect(LocalLink::new(ProtocolVersion::V3)).unwrap();
        let mut dap = SwdDapInterface::new(probe);

        let dpidr = dap.connect(DpAddress::Default).unwrap();
        assert_eq!(dpidr, 0x2BA0_1477);

        // And a posted AP read drains correctly across the wire.
        dap.raw_write_register(PortType::DebugPort, 0x8, 0xF0).unwrap();
        let idr = dap.raw_read_register(PortType::AccessPort, 0xC).unwrap();
        assert_eq!(idr, 0x2477_0011);
    }
}
