use crate::consts::arch::Endianness;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum MemViewError {
    #[error("address {addr:#x} was further than stream length")]
    EndOfStream { addr: u64 },
    #[error("data at {addr:#x} was unable to be read (os error {os_code})")]
    ReadAccessDenied { addr: u64, os_code: i32 },
    #[error("data at {addr:#x} was unable to be written (os error {os_code})")]
    WriteAccessDenied { addr: u64, os_code: i32 },
}

// addresses are u64 regardless of host pointer width. reads and writes
// advance `addr` past the bytes that were transferred.
pub trait MemView {
    fn read_bytes(&self, addr: &mut u64, out_data: &mut [u8]) -> Result<(), MemViewError>;
    fn write_bytes(&mut self, addr: &mut u64, value: &[u8]) -> Result<(), MemViewError>;

    fn read_u8(&self, addr: &mut u64) -> Result<u8, MemViewError> {
        let mut bytes = [0u8; 1];
        self.read_bytes(addr, &mut bytes)?;
        Ok(bytes[0])
    }

    fn read_u16(&self, addr: &mut u64, endian: Endianness) -> Result<u16, MemViewError> {
        let mut bytes = [0u8; 2];
        self.read_bytes(addr, &mut bytes)?;
        if endian == Endianness::LittleEndian {
            Ok(u16::from_le_bytes(bytes))
        } else {
            Ok(u16::from_be_bytes(bytes))
        }
    }

    fn read_u32(&self, addr: &mut u64, endian: Endianness) -> Result<u32, MemViewError> {
        let mut bytes = [0u8; 4];
        self.read_bytes(addr, &mut bytes)?;
        if endian == Endianness::LittleEndian {
            Ok(u32::from_le_bytes(bytes))
        } else {
            Ok(u32::from_be_bytes(bytes))
        }
    }

    fn read_u64(&self, addr: &mut u64, endian: Endianness) -> Result<u64, MemViewError> {
        let mut bytes = [0u8; 8];
        self.read_bytes(addr, &mut bytes)?;
        if endian == Endianness::LittleEndian {
            Ok(u64::from_le_bytes(bytes))
        } else {
            Ok(u64::from_be_bytes(bytes))
        }
    }
}

// a flat buffer addressed from zero. used for parsing files that
// were read into memory and as scratch memory in tests.
pub struct StaticMemView {
    data: Vec<u8>,
}

impl StaticMemView {
    pub fn new(data: Vec<u8>) -> StaticMemView {
        StaticMemView { data }
    }

    // borrows `count` bytes at `addr` without copying them out
    pub fn bytes(&self, addr: u64, count: usize) -> Result<&[u8], MemViewError> {
        let range = self.checked_range(addr, count)?;
        Ok(&self.data[range])
    }

    fn checked_range(&self, addr: u64, count: usize) -> Result<std::ops::Range<usize>, MemViewError> {
        let start = usize::try_from(addr).map_err(|_| MemViewError::EndOfStream { addr })?;
        let end = start.checked_add(count).ok_or(MemViewError::EndOfStream { addr })?;
        if end > self.data.len() {
            return Err(MemViewError::EndOfStream { addr });
        }
        Ok(start..end)
    }
}

impl MemView for StaticMemView {
    fn read_bytes(&self, addr: &mut u64, out_data: &mut [u8]) -> Result<(), MemViewError> {
        let range = self.checked_range(*addr, out_data.len())?;
        out_data.copy_from_slice(&self.data[range]);
        *addr += out_data.len() as u64;
        Ok(())
    }

    fn write_bytes(&mut self, addr: &mut u64, value: &[u8]) -> Result<(), MemViewError> {
        let range = self.checked_range(*addr, value.len())?;
        self.data[range].copy_from_slice(value);
        *addr += value.len() as u64;
        Ok(())
    }
}
