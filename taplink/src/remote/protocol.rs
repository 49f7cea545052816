//! Wire format of the remote protocol.
//!
//! Requests are `!` + a two-character command tag + a command-specific
//! payload + `#`. Responses are `&` + a status character + payload + `#`.
//! Scalars (bit counts, addresses, lengths, register values) travel as
//! fixed-width zero-padded lowercase hex; SWD data words travel as their
//! little-endian byte dump, matching the LSB-first order they had on the
//! physical wire; bulk memory is a hex dump, or base64 for v3 writes.

use super::RemoteError;

/// Start-of-message marker.
pub const SOM: u8 = b'!';
/// End-of-message marker.
pub const EOM: u8 = b'#';
/// Response marker.
pub const RESP: u8 = b'&';

/// Status character of a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    /// Success; payload follows.
    Ok,
    /// SWD read parity failed; the payload data is still carried.
    ParityError,
    /// Failure; payload is a two-digit error code.
    Error,
    /// The command is not implemented on this remote.
    NotSupported,
}

impl ResponseCode {
    /// The status character on the wire.
    pub fn as_char(self) -> u8 {
        match self {
            ResponseCode::Ok => b'K',
            ResponseCode::ParityError => b'P',
            ResponseCode::Error => b'E',
            ResponseCode::NotSupported => b'N',
        }
    }

    /// Parse a status character.
    pub fn from_char(c: u8) -> Result<Self, RemoteError> {
        match c {
            b'K' => Ok(ResponseCode::Ok),
            b'P' => Ok(ResponseCode::ParityError),
            b'E' => Ok(ResponseCode::Error),
            b'N' => Ok(ResponseCode::NotSupported),
            _ => Err(RemoteError::Protocol),
        }
    }
}

/// Error codes carried in `&E` responses.
pub mod error_code {
    /// The packet was not understood.
    pub const UNRECOGNISED: u8 = 0x01;
    /// The wire transaction failed (SWD FAULT, JTAG bad ACK).
    pub const WIRE_FAULT: u8 = 0x02;
    /// v3 only: the operation raised a fault/exception on the remote.
    pub const EXCEPTION: u8 = 0x03;
    /// The parameters were out of range.
    pub const PARAMETER: u8 = 0x04;
}

/// The negotiated protocol dialect.
///
/// Discovered once at link-up through `!HC#`; clients start at the newest
/// version they speak and fall back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    /// The original dialect.
    V0,
    /// Adds the JTAG device index to ADIv5 packets.
    V1,
    /// Adds clock-frequency control and TCK output enable.
    V2,
    /// Reworks the ADIv5 opcodes, adds fault/exception error codes and
    /// base64 bulk writes.
    V3,
}

/// The ADIv5 operations re-exported over the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adiv5Op {
    /// DP register read.
    DpRead,
    /// AP register read.
    ApRead,
    /// AP register write.
    ApWrite,
    /// Raw low-level access.
    RawAccess,
    /// Bulk memory read.
    MemRead,
    /// Bulk memory write.
    MemWrite,
}

impl ProtocolVersion {
    /// Decode the `!HC#` reply payload.
    pub fn from_hl_check(payload: &[u8]) -> Result<Self, RemoteError> {
        match parse_hex(payload, 2)? {
            0 => Ok(ProtocolVersion::V0),
            1 => Ok(ProtocolVersion::V1),
            2 => Ok(ProtocolVersion::V2),
            3 => Ok(ProtocolVersion::V3),
            _ => Err(RemoteError::Protocol),
        }
    }

    /// The version byte for the `!HC#` reply.
    pub fn as_byte(self) -> u8 {
        match self {
            ProtocolVersion::V0 => 0,
            ProtocolVersion::V1 => 1,
            ProtocolVersion::V2 => 2,
            ProtocolVersion::V3 => 3,
        }
    }

    /// Whether ADIv5 packets carry the JTAG device index.
    pub fn adiv5_has_dev_index(self) -> bool {
        self >= ProtocolVersion::V1
    }

    /// Whether the clock frequency and TCK output-enable commands exist.
    pub fn has_clock_control(self) -> bool {
        self >= ProtocolVersion::V2
    }

    /// Whether bulk memory writes are base64 instead of hex.
    pub fn mem_write_base64(self) -> bool {
        self >= ProtocolVersion::V3
    }

    /// The opcode character of an ADIv5 operation in this dialect.
    pub fn adiv5_opcode(self, op: Adiv5Op) -> u8 {
        if self >= ProtocolVersion::V3 {
            match op {
                Adiv5Op::DpRead => b'D',
                Adiv5Op::ApRead => b'r',
                Adiv5Op::ApWrite => b'w',
                Adiv5Op::RawAccess => b'L',
                Adiv5Op::MemRead => b'M',
                Adiv5Op::MemWrite => b'W',
            }
        } else {
            match op {
                Adiv5Op::DpRead => b'd',
                Adiv5Op::ApRead => b'a',
                Adiv5Op::ApWrite => b'A',
                Adiv5Op::RawAccess => b'R',
                Adiv5Op::MemRead => b'm',
                Adiv5Op::MemWrite => b'M',
            }
        }
    }

    /// Reverse-map an ADIv5 opcode character.
    pub fn adiv5_op_from(self, opcode: u8) -> Option<Adiv5Op> {
        use Adiv5Op::*;
        for op in [DpRead, ApRead, ApWrite, RawAccess, MemRead, MemWrite] {
            if self.adiv5_opcode(op) == opcode {
                return Some(op);
            }
        }
        None
    }
}

/// Frame a request body.
pub fn frame_request(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + 2);
    frame.push(SOM);
    frame.extend_from_slice(body);
    frame.push(EOM);
    frame
}

/// Frame a response.
pub fn frame_response(code: ResponseCode, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 3);
    frame.push(RESP);
    frame.push(code.as_char());
    frame.extend_from_slice(payload);
    frame.push(EOM);
    frame
}

/// Strip the framing off a request, returning the body.
pub fn unframe_request(frame: &[u8]) -> Result<&[u8], RemoteError> {
    if frame.len() < 2 || frame[0] != SOM || *frame.last().expect("len checked") != EOM {
        return Err(RemoteError::Protocol);
    }
    Ok(&frame[1..frame.len() - 1])
}

/// Strip the framing off a response, returning the code and payload.
pub fn unframe_response(frame: &[u8]) -> Result<(ResponseCode, &[u8]), RemoteError> {
    if frame.len() < 3 || frame[0] != RESP || *frame.last().expect("len checked") != EOM {
        return Err(RemoteError::Protocol);
    }
    let code = ResponseCode::from_char(frame[1])?;
    Ok((code, &frame[2..frame.len() - 1]))
}

fn hex_nibble(value: u8) -> u8 {
    match value {
        0..=9 => b'0' + value,
        _ => b'a' + value - 10,
    }
}

fn nibble_value(c: u8) -> Result<u32, RemoteError> {
    match c {
        b'0'..=b'9' => Ok((c - b'0') as u32),
        b'a'..=b'f' => Ok((c - b'a' + 10) as u32),
        b'A'..=b'F' => Ok((c - b'A' + 10) as u32),
        _ => Err(RemoteError::Protocol),
    }
}

/// Append `value` as `digits` fixed-width lowercase hex characters.
pub fn push_hex(out: &mut Vec<u8>, value: u32, digits: usize) {
    for index in (0..digits).rev() {
        out.push(hex_nibble((value >> (index * 4) & 0xF) as u8));
    }
}

/// Parse exactly `digits` leading hex characters.
pub fn parse_hex(input: &[u8], digits: usize) -> Result<u32, RemoteError> {
    if input.len() < digits {
        return Err(RemoteError::Protocol);
    }
    let mut value = 0;
    for &c in &input[..digits] {
        value = value << 4 | nibble_value(c)?;
    }
    Ok(value)
}

/// Append a 32-bit data word as its little-endian byte dump, the order the
/// bits had on the SWD wire.
pub fn push_word_le(out: &mut Vec<u8>, value: u32) {
    for byte in value.to_le_bytes() {
        push_hex(out, byte as u32, 2);
    }
}

/// Parse a little-endian 32-bit data word dump.
pub fn parse_word_le(input: &[u8]) -> Result<u32, RemoteError> {
    if input.len() < 8 {
        return Err(RemoteError::Protocol);
    }
    let mut bytes = [0u8; 4];
    for (index, byte) in bytes.iter_mut().enumerate() {
        *byte = parse_hex(&input[index * 2..], 2)? as u8;
    }
    Ok(u32::from_le_bytes(bytes))
}

/// Append a byte slice as a hex dump.
pub fn push_bytes_hex(out: &mut Vec<u8>, data: &[u8]) {
    for &byte in data {
        push_hex(out, byte as u32, 2);
    }
}

/// Parse a hex dump into bytes.
pub fn parse_bytes_hex(input: &[u8]) -> Result<Vec<u8>, RemoteError> {
    if input.len() % 2 != 0 {
        return Err(RemoteError::Protocol);
    }
    input
        .chunks_exact(2)
        .map(|pair| parse_hex(pair, 2).map(|v| v as u8))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_round_trip() {
        let frame = frame_request(b"SI21");
        assert_eq!(frame, b"!SI21#");
        assert_eq!(unframe_request(&frame).unwrap(), b"SI21");

        let response = frame_response(ResponseCode::Ok, b"00efbeadde");
        assert_eq!(response, b"&K00efbeadde#");
        let (code, payload) = unframe_response(&response).unwrap();
        assert_eq!(code, ResponseCode::Ok);
        assert_eq!(payload, b"00efbeadde");
    }

    #[test]
    fn words_travel_in_wire_order() {
        let mut out = Vec::new();
        push_word_le(&mut out, 0xDEAD_BEEF);
        assert_eq!(out, b"efbeadde");
        assert_eq!(parse_word_le(&out).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn scalars_are_fixed_width_natural_order(){
        let mut out = Vec::new();
        push_hex(&mut out, 0x21, 2);
        push_hex(&mut out, 0x0801_0000, 8);
        assert_eq!(out, b"2108010000");
        assert_eq!(parse_hex(&out, 2).unwrap(), 0x21);
        assert_eq!(parse_hex(&out[2..], 8).unwrap(), 0x0801_0000);
    }

    #[test]
    fn v3_reworks_adiv5_opcodes() {
        assert_eq!(ProtocolVersion::V0.adiv5_opcode(Adiv5Op::DpRead), b'd');
        assert_eq!(ProtocolVersion::V3.adiv5_opcode(Adiv5Op::DpRead), b'D');
        for version in [ProtocolVersion::V0, ProtocolVersion::V3] {
            for op in [
                Adiv5Op::DpRead,
                Adiv5Op::ApRead,
                Adiv5Op::ApWrite,
                Adiv5Op::RawAccess,
                Adiv5Op::MemRead,
                Adiv5Op::MemWrite,
            ] {
                assert_eq!(version.adiv5_op_from(version.adiv5_opcode(op)), Some(op));
            }
        }
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(unframe_request(b"SI21#").is_err());
        assert!(unframe_request(b"!SI21").is_err());
        assert!(unframe_response(b"&Q#").is_err());
        assert!(parse_hex(b"zz", 2).is_err());
        assert!(parse_bytes_hex(b"abc").is_err());
    }
}
