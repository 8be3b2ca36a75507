use bitflags::bitflags;
use log::debug;
use std::{
    fs,
    path::{Path, PathBuf},
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MapPerms: u8 {
        const Read = 1 << 0;
        const Write = 1 << 1;
        const Exec = 1 << 2;
        const Shared = 1 << 3;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub perms: MapPerms,
    pub offset: u64,
    pub path: Option<PathBuf>,
}

impl MapPerms {
    fn parse(text: &str) -> MapPerms {
        let mut perms = MapPerms::empty();
        for (i, c) in text.chars().enumerate() {
            match (i, c) {
                (0, 'r') => perms |= MapPerms::Read,
                (1, 'w') => perms |= MapPerms::Write,
                (2, 'x') => perms |= MapPerms::Exec,
                (3, 's') => perms |= MapPerms::Shared,
                _ => (),
            }
        }
        perms
    }
}

impl MemoryMapping {
    // one line of /proc/<pid>/maps:
    // start-end perms offset dev inode [path]
    pub fn parse_line(line: &str) -> Option<MemoryMapping> {
        let mut fields = line.splitn(6, char::is_whitespace);
        let range = fields.next()?;
        let perms = fields.next()?;
        let offset = fields.next()?;
        let _dev = fields.next()?;
        let _inode = fields.next()?;
        let path = fields.next().map(str::trim).filter(|p| !p.is_empty());

        let (start, end) = range.split_once('-')?;
        Some(MemoryMapping {
            start: u64::from_str_radix(start, 16).ok()?,
            end: u64::from_str_radix(end, 16).ok()?,
            perms: MapPerms::parse(perms),
            offset: u64::from_str_radix(offset, 16).ok()?,
            path: path.map(PathBuf::from),
        })
    }
}

pub fn parse_maps(text: &str) -> Vec<MemoryMapping> {
    text.lines().filter_map(MemoryMapping::parse_line).collect()
}

pub fn read_maps(pid: i32) -> std::io::Result<Vec<MemoryMapping>> {
    Ok(parse_maps(&fs::read_to_string(format!("/proc/{}/maps", pid))?))
}

// what the kernel appends to the path of a file unlinked while mapped
const DELETED_SUFFIX: &str = " (deleted)";

fn strip_deleted(path: &Path) -> &Path {
    path.to_str().and_then(|p| p.strip_suffix(DELETED_SUFFIX)).map_or(path, Path::new)
}

// a symlink like /proc/<pid>/exe can't be canonicalized once its target is
// gone, but it still names where the file used to be
fn resolve_exe(exe: &Path) -> PathBuf {
    if let Ok(path) = fs::canonicalize(exe) {
        return path;
    }
    match fs::read_link(exe) {
        Ok(target) => strip_deleted(&target).to_owned(),
        Err(_) => exe.to_owned(),
    }
}

// address the executable's first page was mapped at, if it is mapped at all
pub fn image_base(maps: &[MemoryMapping], exe: &Path) -> Option<u64> {
    let exe = resolve_exe(exe);
    let base = maps
        .iter()
        .filter(|m| m.offset == 0 && m.path.as_deref().map(strip_deleted) == Some(exe.as_path()))
        .map(|m| m.start)
        .min();
    if base.is_none() {
        debug!("no zero-offset mapping of {:?} among {} mappings", exe, maps.len());
    }
    base
}
