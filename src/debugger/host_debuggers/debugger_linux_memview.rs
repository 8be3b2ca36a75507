use super::debugger_linux_superpt as superpt;
use crate::memory::memview::{MemView, MemViewError};
use libc::c_long;
use log::debug;
use std::{fs::File, io, mem, os::unix::fs::FileExt};

const WRDSZ: usize = mem::size_of::<c_long>();

// memory of a stopped, ptrace-attached process. goes through /proc/<pid>/mem
// when it can be opened and falls back to PEEKDATA/POKEDATA a word at a time.
pub struct LinuxMemView {
    pid: i32,
    proc_mem: Option<File>,
}

impl LinuxMemView {
    pub fn new(pid: i32) -> Self {
        let proc_mem = match File::options().read(true).write(true).open(format!("/proc/{}/mem", pid)) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!("can't open /proc/{}/mem ({}), using PEEKDATA", pid, e);
                None
            }
        };

        LinuxMemView { pid, proc_mem }
    }

    fn io_code(e: &io::Error) -> i32 {
        e.raw_os_error().unwrap_or(libc::EIO)
    }

    fn peek_words(&self, addr: u64, out_data: &mut [u8]) -> Result<(), MemViewError> {
        let mut pos = 0usize;
        while pos < out_data.len() {
            let word_addr = addr + pos as u64;
            let word = superpt::peekdata(self.pid, word_addr)
                .map_err(|os_code| MemViewError::ReadAccessDenied { addr: word_addr, os_code })?;
            let bytes = word.to_ne_bytes();
            let count = (out_data.len() - pos).min(WRDSZ);
            out_data[pos..pos + count].copy_from_slice(&bytes[..count]);
            pos += count;
        }
        Ok(())
    }

    fn poke_words(&self, addr: u64, value: &[u8]) -> Result<(), MemViewError> {
        let mut pos = 0usize;
        while pos < value.len() {
            let word_addr = addr + pos as u64;
            let count = (value.len() - pos).min(WRDSZ);
            let mut bytes = [0u8; WRDSZ];
            if count < WRDSZ {
                // partial word, keep the bytes past the end of `value`
                let orig = superpt::peekdata(self.pid, word_addr)
                    .map_err(|os_code| MemViewError::ReadAccessDenied { addr: word_addr, os_code })?;
                bytes = orig.to_ne_bytes();
            }
            bytes[..count].copy_from_slice(&value[pos..pos + count]);
            superpt::pokedata(self.pid, word_addr, c_long::from_ne_bytes(bytes))
                .map_err(|os_code| MemViewError::WriteAccessDenied { addr: word_addr, os_code })?;
            pos += count;
        }
        Ok(())
    }
}

impl MemView for LinuxMemView {
    fn read_bytes(&self, addr: &mut u64, out_data: &mut [u8]) -> Result<(), MemViewError> {
        match &self.proc_mem {
            Some(file) => file
                .read_exact_at(out_data, *addr)
                .map_err(|e| MemViewError::ReadAccessDenied { addr: *addr, os_code: Self::io_code(&e) })?,
            None => self.peek_words(*addr, out_data)?,
        }
        *addr += out_data.len() as u64;
        Ok(())
    }

    fn write_bytes(&mut self, addr: &mut u64, value: &[u8]) -> Result<(), MemViewError> {
        match &self.proc_mem {
            Some(file) => file
                .write_all_at(value, *addr)
                .map_err(|e| MemViewError::WriteAccessDenied { addr: *addr, os_code: Self::io_code(&e) })?,
            None => self.poke_words(*addr, value)?,
        }
        *addr += value.len() as u64;
        Ok(())
    }
}
