//! Generic memory access into the target's address space.

use crate::Error;

/// Byte/halfword/word access into target memory.
///
/// Width-specific methods enforce their natural alignment; a misaligned
/// address is an error, never a silent rounding.
pub trait MemoryInterface {
    /// Read a 32-bit word from an aligned address.
    fn read_word_32(&mut self, address: u32) -> Result<u32, Error>;

    /// Read a 16-bit halfword from an aligned address.
    fn read_word_16(&mut self, address: u32) -> Result<u16, Error>;

    /// Read one byte.
    fn read_word_8(&mut self, address: u32) -> Result<u8, Error>;

    /// Read a block of aligned words.
    fn read_32(&mut self, address: u32, data: &mut [u32]) -> Result<(), Error>;

    /// Read a block of aligned halfwords.
    fn read_16(&mut self, address: u32, data: &mut [u16]) -> Result<(), Error>;

    /// Read a block of bytes.
    fn read_8(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error>;

    /// Write a 32-bit word to an aligned address.
    fn write_word_32(&mut self, address: u32, data: u32) -> Result<(), Error>;

    /// Write a 16-bit halfword to an aligned address.
    fn write_word_16(&mut self, address: u32, data: u16) -> Result<(), Error>;

    /// Write one byte.
    fn write_word_8(&mut self, address: u32, data: u8) -> Result<(), Error>;

    /// Write a block of aligned words.
    fn write_32(&mut self, address: u32, data: &[u32]) -> Result<(), Error>;

    /// Write a block of aligned halfwords.
    fn write_16(&mut self, address: u32, data: &[u16]) -> Result<(), Error>;

    /// Write a block of bytes.
    fn write_8(&mut self, address: u32, data: &[u8]) -> Result<(), Error>;

    /// Read arbitrary bytes.
    fn read(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error> {
        self.read_8(address, data)
    }

    /// Write arbitrary bytes.
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        self.write_8(address, data)
    }

    /// Push out anything the implementation batches.
    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}
