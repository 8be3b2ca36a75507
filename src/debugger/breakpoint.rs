use super::debugger::{BreakpointCallback, BreakpointInfo, Result, TraceError};
use crate::consts::arch::TRAP_BYTES;
use smallvec::SmallVec;
use std::collections::HashMap;

pub type TrapBytes = SmallVec<u8, 8>;

pub struct BreakpointEntry {
    id: u32,
    addr: u64,
    description: String,
    armed: bool,
    hits: u64,
    bp_bytes: TrapBytes,
    orig_bytes: TrapBytes,
    callback: BreakpointCallback,
}

pub struct BreakpointContainer {
    // sorted by address for binary searching. addresses are unique.
    bps_sorted: Vec<BreakpointEntry>,
    // breakpoint id to address in bps_sorted
    bps_by_id: HashMap<u32, u64>,
    // next breakpoint id, ids are never reused within a session
    bp_id: u32,
}

impl BreakpointEntry {
    // `orig_bytes` is what the trap instruction covers, read before arming
    pub fn new(addr: u64, description: String, orig_bytes: &[u8], callback: BreakpointCallback) -> BreakpointEntry {
        BreakpointEntry {
            id: 0,
            addr,
            description,
            armed: false,
            hits: 0,
            bp_bytes: TRAP_BYTES.iter().copied().collect(),
            orig_bytes: orig_bytes.iter().copied().collect(),
            callback,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn armed(&self) -> bool {
        self.armed
    }

    pub fn set_armed(&mut self, armed: bool) {
        self.armed = armed;
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn bp_bytes(&self) -> &[u8] {
        &self.bp_bytes
    }

    pub fn orig_bytes(&self) -> &[u8] {
        &self.orig_bytes
    }

    pub fn callback_mut(&mut self) -> &mut BreakpointCallback {
        &mut self.callback
    }

    fn end_addr(&self) -> u64 {
        self.addr + self.bp_bytes.len() as u64
    }

    pub fn info(&self) -> BreakpointInfo {
        BreakpointInfo {
            id: self.id,
            address: self.addr,
            description: self.description.clone(),
            armed: self.armed,
            hits: self.hits,
        }
    }
}

impl Default for BreakpointContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakpointContainer {
    pub fn new() -> BreakpointContainer {
        BreakpointContainer {
            bps_sorted: Vec::new(),
            bps_by_id: HashMap::new(),
            bp_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.bps_sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bps_sorted.is_empty()
    }

    pub fn contains_addr(&self, addr: u64) -> bool {
        self.find_idx(addr).is_ok()
    }

    // assigns the entry its id. a second breakpoint at the same address is
    // rejected and the table is left as it was.
    pub fn add_breakpoint(&mut self, mut entry: BreakpointEntry) -> Result<u32> {
        let insert_idx = match self.find_idx(entry.addr) {
            Ok(_) => return Err(TraceError::AlreadyArmed(entry.addr)),
            Err(i) => i,
        };

        let id = self.bp_id;
        self.bp_id += 1;
        entry.id = id;
        self.bps_by_id.insert(id, entry.addr);
        self.bps_sorted.insert(insert_idx, entry);
        Ok(id)
    }

    pub fn remove_breakpoint(&mut self, id: u32) -> Result<BreakpointEntry> {
        let addr = self.bps_by_id.remove(&id).ok_or(TraceError::UnknownBreakpoint(id))?;
        match self.find_idx(addr) {
            Ok(idx) => Ok(self.bps_sorted.remove(idx)),
            Err(_) => Err(TraceError::UnknownBreakpoint(id)),
        }
    }

    pub fn get_breakpoint(&self, addr: u64) -> Option<&BreakpointEntry> {
        self.find_idx(addr).ok().map(|idx| &self.bps_sorted[idx])
    }

    pub fn get_breakpoint_mut(&mut self, addr: u64) -> Option<&mut BreakpointEntry> {
        match self.find_idx(addr) {
            Ok(idx) => Some(&mut self.bps_sorted[idx]),
            Err(_) => None,
        }
    }

    pub fn get_by_id(&self, id: u32) -> Option<&BreakpointEntry> {
        self.bps_by_id.get(&id).and_then(|addr| self.get_breakpoint(*addr))
    }

    // ordered by id, which is creation order
    pub fn infos(&self) -> Vec<BreakpointInfo> {
        let mut infos: Vec<BreakpointInfo> = self.bps_sorted.iter().map(|bp| bp.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn drain(&mut self) -> Vec<BreakpointEntry> {
        self.bps_by_id.clear();
        std::mem::take(&mut self.bps_sorted)
    }

    // replaces trap bytes in `data` (read from `data_addr`) with the bytes
    // each armed breakpoint covers. handles traps that straddle either edge.
    pub fn fixup_bp_memory(&self, data: &mut [u8], data_addr: u64) {
        let mem_start = data_addr;
        let mem_end = data_addr.saturating_add(data.len() as u64);
        let first_idx = self.bps_sorted.partition_point(|e| e.end_addr() <= mem_start);
        for bp in self.bps_sorted[first_idx..].iter().take_while(|e| e.addr < mem_end) {
            if !bp.armed {
                continue;
            }

            let overlap_start = bp.addr.max(mem_start);
            let overlap_end = bp.end_addr().min(mem_end);
            let src = (overlap_start - bp.addr) as usize;
            let dst = (overlap_start - mem_start) as usize;
            let count = (overlap_end - overlap_start) as usize;
            data[dst..dst + count].copy_from_slice(&bp.orig_bytes[src..src + count]);
        }
    }

    fn find_idx(&self, addr: u64) -> std::result::Result<usize, usize> {
        self.bps_sorted.binary_search_by(|e| e.addr.cmp(&addr))
    }
}
