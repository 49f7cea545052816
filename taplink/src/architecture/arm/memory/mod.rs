//! MEM-AP memory access.
//!
//! Bursts are framed by the TAR auto-increment wrap (1 KiB on everything we
//! care about): TAR is written once per frame and DRW does the rest. Packed
//! transfers lane sub-word elements into DRW words when the AP advertises
//! them; a trailing partial word falls back to single increments so no lane
//! beyond the requested span is ever touched.

pub mod romtable;

use super::ap::{Csw, Drw, MemoryAp, Tar};
use super::communication_interface::{ArmCommunicationInterface, DapAccess};
use super::{ArmError, RawDapAccess};
use crate::memory::MemoryInterface;
use crate::Error;

/// The span TAR auto-increment is guaranteed to cover without wrapping.
const TAR_WRAP: u32 = 0x400;

/// Memory access through one MEM-AP.
#[derive(Debug)]
pub struct AdiMemoryInterface<'iface, P: RawDapAccess> {
    iface: &'iface mut ArmCommunicationInterface<P>,
    ap: MemoryAp,
}

impl<'iface, P: RawDapAccess> AdiMemoryInterface<'iface, P> {
    /// Access memory behind `ap`.
    pub fn new(iface: &'iface mut ArmCommunicationInterface<P>, ap: MemoryAp) -> Self {
        Self { iface, ap }
    }

    /// The MEM-AP this interface drives.
    pub fn ap(&self) -> &MemoryAp {
        &self.ap
    }

    /// Hand back the MEM-AP record with its CSW cache intact.
    pub fn into_ap(self) -> MemoryAp {
        self.ap
    }

    fn check_alignment(address: u32, alignment: usize) -> Result<(), ArmError> {
        if address as usize % alignment != 0 {
            return Err(ArmError::BadAlignment { address, alignment });
        }
        Ok(())
    }

    /// Program CSW for a transfer, skipping the write when nothing changed.
    fn set_csw(&mut self, size: u8, addr_inc: u8) -> Result<(), ArmError> {
        let mut csw = self.ap.template_csw;
        csw.set_dbg_sw_enable(true);
        csw.set_size(size);
        csw.set_addr_inc(addr_inc);

        if self.ap.cached_csw != Some(csw) {
            self.iface.write_ap_register(&self.ap.address, csw)?;
            self.ap.cached_csw = Some(csw);
        }
        Ok(())
    }

    fn set_tar(&mut self, address: u32) -> Result<(), ArmError> {
        self.iface
            .write_ap_register(&self.ap.address, Tar(address))
    }

    /// Word bursts, re-framing TAR at every auto-increment wrap.
    fn read_words(&mut self, mut address: u32, mut data: &mut [u32]) -> Result<(), ArmError> {
        self.set_csw(Csw::SIZE_32, Csw::ADDR_INC_SINGLE)?;
        while !data.is_empty() {
            let in_frame = ((TAR_WRAP - (address & (TAR_WRAP - 1))) / 4) as usize;
            let chunk = in_frame.min(data.len());
            self.set_tar(address)?;
            let rest = data;
            let (head, tail) = rest.split_at_mut(chunk);
            self.iface
                .read_ap_register_repeated::<Drw>(&self.ap.address, head)?;
            address += chunk as u32 * 4;
            data = tail;
        }
        Ok(())
    }

    fn write_words(&mut self, mut address: u32, mut data: &[u32]) -> Result<(), ArmError> {
        self.set_csw(Csw::SIZE_32, Csw::ADDR_INC_SINGLE)?;
        while !data.is_empty() {
            let in_frame = ((TAR_WRAP - (address & (TAR_WRAP - 1))) / 4) as usize;
            let chunk = in_frame.min(data.len());
            self.set_tar(address)?;
            let (head, tail) = data.split_at(chunk);
            self.iface
                .write_ap_register_repeated::<Drw>(&self.ap.address, head)?;
            address += chunk as u32 * 4;
            data = tail;
        }
        Ok(())
    }

    /// Split a byte span into a packed head (ending word-aligned) and a
    /// single-increment tail, so packed DRW accesses never cover lanes
    /// outside the span.
    fn packed_split(address: u32, len: usize, element: u32) -> (usize, usize) {
        let end = address + len as u32;
        let tail = (end & 3) as usize;
        // A span entirely inside one word may not even reach alignment.
        if (len as u32) < element || len < tail {
            return (0, len);
        }
        (len - tail, tail)
    }

    /// One packed frame: DRW accesses covering `address..address + len`
    /// where `address + len` is word-aligned.
    fn packed_frame_accesses(address: u32, len: usize) -> usize {
        ((address as usize & 3) + len + 3) / 4
    }

    fn read_packed(
        &mut self,
        size: u8,
        element: u32,
        mut address: u32,
        data: &mut [u8],
    ) -> Result<(), ArmError> {
        self.set_csw(size, Csw::ADDR_INC_PACKED)?;

        let mut cursor = 0usize;
        let mut remaining = data.len();
        while remaining > 0 {
            let in_frame = (TAR_WRAP - (address & (TAR_WRAP - 1))) as usize;
            let chunk = in_frame.min(remaining);
            self.set_tar(address)?;

            let mut words = vec![0u32; Self::packed_frame_accesses(address, chunk)];
            self.iface
                .read_ap_register_repeated::<Drw>(&self.ap.address, &mut words)?;

            // Unpack the lanes: the first word starts at the address lane,
            // every further word at lane zero.
            let frame_base = cursor;
            let mut lane = (address & 3) as usize;
            for word in words {
                while lane < 4 && cursor - frame_base < chunk {
                    for b in 0..element as usize {
                        data[cursor] = (word >> ((lane + b) * 8)) as u8;
                        cursor += 1;
                    }
                    lane += element as usize;
                }
                lane = 0;
            }

            address += chunk as u32;
            remaining -= chunk;
        }
        Ok(())
    }

    fn write_packed(
        &mut self,
        size: u8,
        element: u32,
        mut address: u32,
        data: &[u8],
    ) -> Result<(), ArmError> {
        self.set_csw(size, Csw::ADDR_INC_PACKED)?;

        let mut cursor = 0usize;
        let mut remaining = data.len();
        while remaining > 0 {
            let in_frame = (TAR_WRAP - (address & (TAR_WRAP - 1))) as usize;
            let chunk = in_frame.min(remaining);
            self.set_tar(address)?;

            let mut words = Vec::with_capacity(Self::packed_frame_accesses(address, chunk));
            let mut lane = (address & 3) as usize;
            let chunk_end = cursor + chunk;
            while cursor < chunk_end {
                let mut word = 0u32;
                while lane < 4 && cursor < chunk_end {
                    for b in 0..element as usize {
                        word |= (data[cursor] as u32) << ((lane + b) * 8);
                        cursor += 1;
                    }
                    lane += element as usize;
                }
                words.push(word);
                lane = 0;
            }
            self.iface
                .write_ap_register_repeated::<Drw>(&self.ap.address, &words)?;

            address += chunk as u32;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Sub-word accesses one element at a time, for APs without packed
    /// support and for span tails.
    fn read_single(
        &mut self,
        size: u8,
        element: u32,
        address: u32,
        data: &mut [u8],
    ) -> Result<(), ArmError> {
        self.set_csw(size, Csw::ADDR_INC_SINGLE)?;
        let mut addr = address;
        for chunk in data.chunks_mut(element as usize) {
            self.set_tar(addr)?;
            let word: Drw = self.iface.read_ap_register(&self.ap.address)?;
            let lane = (addr & 3) * 8;
            for (b, byte) in chunk.iter_mut().enumerate() {
                *byte = (word.0 >> (lane + b as u32 * 8)) as u8;
            }
            addr += element;
        }
        Ok(())
    }

    fn write_single(
        &mut self,
        size: u8,
        element: u32,
        address: u32,
        data: &[u8],
    ) -> Result<(), ArmError> {
        self.set_csw(size, Csw::ADDR_INC_SINGLE)?;
        let mut addr = address;
        for chunk in data.chunks(element as usize) {
            self.set_tar(addr)?;
            let lane = (addr & 3) * 8;
            let mut word = 0u32;
            for (b, byte) in chunk.iter().enumerate() {
                word |= (*byte as u32) << (lane + b as u32 * 8);
            }
            self.iface.write_ap_register(&self.ap.address, Drw(word))?;
            addr += element;
        }
        Ok(())
    }

    fn read_sized(
        &mut self,
        size: u8,
        element: u32,
        address: u32,
        data: &mut [u8],
    ) -> Result<(), ArmError> {
        if data.is_empty() {
            return Ok(());
        }
        if self.ap.supports_packed {
            let (head, tail) = Self::packed_split(address, data.len(), element);
            if head > 0 {
                self.read_packed(size, element, address, &mut data[..head])?;
            }
            if tail > 0 {
                self.read_single(size, element, address + head as u32, &mut data[head..])?;
            }
            return Ok(());
        }
        self.read_single(size, element, address, data)
    }

    fn write_sized(
        &mut self,
        size: u8,
        element: u32,
        address: u32,
        data: &[u8],
    ) -> Result<(), ArmError> {
        if data.is_empty() {
            return Ok(());
        }
        if self.ap.supports_packed {
            let (head, tail) = Self::packed_split(address, data.len(), element);
            if head > 0 {
                self.write_packed(size, element, address, &data[..head])?;
            }
            if tail > 0 {
                self.write_single(size, element, address + head as u32, &data[head..])?;
            }
            return Ok(());
        }
        self.write_single(size, element, address, data)
    }
}

impl<P: RawDapAccess> MemoryInterface for AdiMemoryInterface<'_, P> {
    fn read_word_32(&mut self, address: u32) -> Result<u32, Error> {
        let mut word = [0u32];
        self.read_32(address, &mut word)?;
        Ok(word[0])
    }

    fn read_word_16(&mut self, address: u32) -> Result<u16, Error> {
        Self::check_alignment(address, 2)?;
        let mut bytes = [0u8; 2];
        self.read_sized(Csw::SIZE_16, 2, address, &mut bytes)?;
        Ok(u16::from_le_bytes(bytes))
    }

    fn read_word_8(&mut self, address: u32) -> Result<u8, Error> {
        let mut byte = [0u8];
        self.read_sized(Csw::SIZE_8, 1, address, &mut byte)?;
        Ok(byte[0])
    }

    fn read_32(&mut self, address: u32, data: &mut [u32]) -> Result<(), Error> {
        Self::check_alignment(address, 4)?;
        self.read_words(address, data)?;
        Ok(())
    }

    fn read_16(&mut self, address: u32, data: &mut [u16]) -> Result<(), Error> {
        Self::check_alignment(address, 2)?;
        let mut bytes = vec![0u8; data.len() * 2];
        self.read_sized(Csw::SIZE_16, 2, address, &mut bytes)?;
        for (value, pair) in data.iter_mut().zip(bytes.chunks_exact(2)) {
            *value = u16::from_le_bytes([pair[0], pair[1]]);
        }
        Ok(())
    }

    fn read_8(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error> {
        self.read_sized(Csw::SIZE_8, 1, address, data)?;
        Ok(())
    }

    fn write_word_32(&mut self, address: u32, data: u32) -> Result<(), Error> {
        self.write_32(address, &[data])
    }

    fn write_word_16(&mut self, address: u32, data: u16) -> Result<(), Error> {
        Self::check_alignment(address, 2)?;
        self.write_sized(Csw::SIZE_16, 2, address, &data.to_le_bytes())?;
        Ok(())
    }

    fn write_word_8(&mut self, address: u32, data: u8) -> Result<(), Error> {
        self.write_sized(Csw::SIZE_8, 1, address, &[data])?;
        Ok(())
    }

    fn write_32(&mut self, address: u32, data: &[u32]) -> Result<(), Error> {
        Self::check_alignment(address, 4)?;
        self.write_words(address, data)?;
        Ok(())
    }

    fn write_16(&mut self, address: u32, data: &[u16]) -> Result<(), Error> {
        Self::check_alignment(address, 2)?;
        let mut bytes = Vec::with_capacity(data.len() * 2);
        for value in data {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        self.write_sized(Csw::SIZE_16, 2, address, &bytes)?;
        Ok(())
    }

    fn write_8(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        self.write_sized(Csw::SIZE_8, 1, address, data)?;
        Ok(())
    }
}
