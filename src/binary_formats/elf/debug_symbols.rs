use super::file::{ElfFile, ElfReadError, ElfSection, ImageLayout};
use crate::{
    consts::arch::Endianness,
    debugger::debugger::{Result, TraceError},
};
use log::{debug, trace, warn};
use std::{borrow::Cow, collections::HashMap, fs, path::Path};

type DwarfSlice<'a> = gimli::EndianSlice<'a, gimli::RunTimeEndian>;

// how many specification/abstract_origin hops we follow to find a name
const MAX_ORIGIN_DEPTH: u32 = 4;

#[derive(Default)]
struct ScanStats {
    subprograms: usize,
    no_low_pc: usize,
    no_name: usize,
    duplicates: usize,
    bad_entries: usize,
}

/// Function name to link-time entry address, built once from an executable's
/// DWARF subprogram entries. Immutable after construction.
pub struct SymbolTable {
    layout: ImageLayout,
    symbols: HashMap<String, u64>,
}

impl SymbolTable {
    pub fn resolve<P: AsRef<Path>>(path: P) -> Result<SymbolTable> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| TraceError::BinaryFormat {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;
        Self::from_bytes(path, data)
    }

    pub fn from_bytes<P: AsRef<Path>>(path: P, data: Vec<u8>) -> Result<SymbolTable> {
        let path = path.as_ref();
        let format_err = |e: ElfReadError| TraceError::BinaryFormat {
            path: path.to_owned(),
            reason: e.to_string(),
        };

        let elf = ElfFile::parse(data).map_err(format_err)?;
        let layout = elf.image_layout().map_err(format_err)?;
        match Self::dwarf_section(&elf, gimli::SectionId::DebugInfo.name()) {
            Some(section) if section.header.size > 0 => (),
            _ => return Err(TraceError::DebugInfoMissing(path.to_owned())),
        }

        let endian = match elf.endianness() {
            Endianness::LittleEndian => gimli::RunTimeEndian::Little,
            Endianness::BigEndian => gimli::RunTimeEndian::Big,
        };
        let load_section = |id: gimli::SectionId| -> std::result::Result<Cow<[u8]>, ElfReadError> {
            match Self::dwarf_section(&elf, id.name()) {
                Some(section) => elf.section_data(section),
                None => Ok(Cow::Borrowed(&[][..])),
            }
        };
        let dwarf_cow = gimli::Dwarf::load(&load_section).map_err(format_err)?;
        let dwarf = dwarf_cow.borrow(|section| gimli::EndianSlice::new(section, endian));

        let mut stats = ScanStats::default();
        let symbols = Self::collect_subprograms(&dwarf, &mut stats);
        debug!(
            "resolved {} symbols from {:?} ({} subprograms, {} without low_pc, {} unnamed, {} duplicate names, {} bad entries)",
            symbols.len(),
            path,
            stats.subprograms,
            stats.no_low_pc,
            stats.no_name,
            stats.duplicates,
            stats.bad_entries
        );

        Ok(SymbolTable { layout, symbols })
    }

    // older toolchains compress into .zdebug_* instead of flagging the section
    fn dwarf_section<'a>(elf: &'a ElfFile, name: &str) -> Option<&'a ElfSection> {
        elf.section_by_name(name).or_else(|| match name.strip_prefix(".debug_") {
            Some(rest) => elf.section_by_name(&format!(".zdebug_{}", rest)),
            None => None,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_entries(layout: ImageLayout, entries: &[(&str, u64)]) -> SymbolTable {
        SymbolTable {
            layout,
            symbols: entries.iter().map(|(name, addr)| (name.to_string(), *addr)).collect(),
        }
    }

    pub fn lookup(&self, name: &str) -> Result<u64> {
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| TraceError::SymbolNotFound(name.to_owned()))
    }

    pub fn layout(&self) -> ImageLayout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    fn collect_subprograms(dwarf: &gimli::Dwarf<DwarfSlice<'_>>, stats: &mut ScanStats) -> HashMap<String, u64> {
        let mut symbols = HashMap::new();
        let mut units = dwarf.units();
        loop {
            let header = match units.next() {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(e) => {
                    // unit lengths chain the headers together, so we can't skip past this one
                    warn!("stopping debug info scan at a malformed unit header: {}", e);
                    break;
                }
            };
            let unit = match dwarf.unit(header) {
                Ok(unit) => unit,
                Err(e) => {
                    warn!("skipping unreadable compilation unit: {}", e);
                    continue;
                }
            };
            if let Err(e) = Self::collect_unit(dwarf, &unit, &mut symbols, stats) {
                warn!("skipping the rest of a compilation unit: {}", e);
            }
        }
        symbols
    }

    fn collect_unit(
        dwarf: &gimli::Dwarf<DwarfSlice<'_>>,
        unit: &gimli::Unit<DwarfSlice<'_>>,
        symbols: &mut HashMap<String, u64>,
        stats: &mut ScanStats,
    ) -> gimli::Result<()> {
        let mut entries = unit.entries();
        while let Some((_, entry)) = entries.next_dfs()? {
            if entry.tag() != gimli::DW_TAG_subprogram {
                continue;
            }
            stats.subprograms += 1;

            let low_pc = match entry.attr_value(gimli::DW_AT_low_pc) {
                Ok(Some(value)) => value,
                Ok(None) => {
                    // declarations and abstract instances land here
                    trace!("subprogram at {:?} has no low_pc, skipping", entry.offset());
                    stats.no_low_pc += 1;
                    continue;
                }
                Err(e) => {
                    debug!("bad low_pc on subprogram at {:?}: {}", entry.offset(), e);
                    stats.bad_entries += 1;
                    continue;
                }
            };
            let addr = match dwarf.attr_address(unit, low_pc) {
                Ok(Some(addr)) if addr != 0 => addr,
                Ok(Some(_)) => {
                    // the linker discarded this function
                    stats.no_low_pc += 1;
                    continue;
                }
                Ok(None) | Err(_) => {
                    debug!("unresolvable low_pc on subprogram at {:?}", entry.offset());
                    stats.bad_entries += 1;
                    continue;
                }
            };

            let mut names = Vec::with_capacity(2);
            Self::entry_names(dwarf, unit, entry, 0, &mut names);
            if names.is_empty() {
                stats.no_name += 1;
                continue;
            }
            for name in names {
                if symbols.contains_key(&name) {
                    stats.duplicates += 1;
                    continue;
                }
                symbols.insert(name, addr);
            }
        }
        Ok(())
    }

    // the name of a concrete out-of-line instance often lives on the
    // declaration it points at instead of on the entry itself
    fn entry_names(
        dwarf: &gimli::Dwarf<DwarfSlice<'_>>,
        unit: &gimli::Unit<DwarfSlice<'_>>,
        entry: &gimli::DebuggingInformationEntry<'_, '_, DwarfSlice<'_>>,
        depth: u32,
        names: &mut Vec<String>,
    ) {
        let name = Self::attr_string(dwarf, unit, entry, gimli::DW_AT_name);
        let linkage_name = Self::attr_string(dwarf, unit, entry, gimli::DW_AT_linkage_name)
            .or_else(|| Self::attr_string(dwarf, unit, entry, gimli::DW_AT_MIPS_linkage_name));

        let found_name = name.is_some();
        names.extend(name);
        names.extend(linkage_name);
        if found_name || depth >= MAX_ORIGIN_DEPTH {
            return;
        }

        for origin_attr in [gimli::DW_AT_specification, gimli::DW_AT_abstract_origin] {
            if let Ok(Some(gimli::AttributeValue::UnitRef(offset))) = entry.attr_value(origin_attr) {
                if let Ok(origin) = unit.entry(offset) {
                    Self::entry_names(dwarf, unit, &origin, depth + 1, names);
                    return;
                }
            }
        }
    }

    fn attr_string(
        dwarf: &gimli::Dwarf<DwarfSlice<'_>>,
        unit: &gimli::Unit<DwarfSlice<'_>>,
        entry: &gimli::DebuggingInformationEntry<'_, '_, DwarfSlice<'_>>,
        attr: gimli::DwAt,
    ) -> Option<String> {
        let value = entry.attr_value(attr).ok()??;
        let string = dwarf.attr_string(unit, value).ok()?;
        Some(string.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary_formats::elf::file::tests::{build_elf64, build_elf64_with_sections, zlib, TestSection};
    use std::hint::black_box;

    #[no_mangle]
    #[inline(never)]
    pub extern "C" fn livetrace_symbol_target(x: u64) -> u64 {
        black_box(x).wrapping_mul(3)
    }

    fn self_table() -> SymbolTable {
        let exe = std::env::current_exe().unwrap();
        SymbolTable::resolve(&exe).unwrap()
    }

    #[test]
    fn resolves_a_function_in_this_executable() {
        assert_eq!(black_box(livetrace_symbol_target(2)), 6);
        let table = self_table();
        let addr = table.lookup("livetrace_symbol_target").unwrap();
        assert_ne!(addr, 0);
    }

    #[test]
    fn resolution_is_deterministic() {
        let first = self_table().lookup("livetrace_symbol_target").unwrap();
        let second = self_table().lookup("livetrace_symbol_target").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn absent_names_are_not_found() {
        let table = self_table();
        match table.lookup("no_such_function_anywhere") {
            Err(TraceError::SymbolNotFound(name)) => assert_eq!(name, "no_such_function_anywhere"),
            other => panic!("unexpected result {:?}", other.map(|a| format!("{:#x}", a))),
        }
    }

    #[test]
    fn non_elf_files_are_a_format_error() {
        let result = SymbolTable::from_bytes("script.sh", b"#!/bin/sh\nexit 0\n".to_vec());
        assert!(matches!(result, Err(TraceError::BinaryFormat { .. })));
    }

    #[test]
    fn missing_files_are_a_format_error() {
        let result = SymbolTable::resolve("/nonexistent/livetrace/binary");
        assert!(matches!(result, Err(TraceError::BinaryFormat { .. })));
    }

    #[test]
    fn elf_without_debug_info_is_reported() {
        let result = SymbolTable::from_bytes("stripped", build_elf64(2, &[]));
        match result {
            Err(TraceError::DebugInfoMissing(path)) => assert_eq!(path, Path::new("stripped")),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("resolved symbols from an image without debug info"),
        }
    }

    // a unit header with a zero length, which ends the scan straight away
    const EMPTY_DEBUG_INFO: [u8; 4] = [0; 4];

    #[test]
    fn debug_info_without_functions_gives_an_empty_table() {
        let data = build_elf64_with_sections(
            3,
            &[0x0],
            &[TestSection::progbits(".debug_info", EMPTY_DEBUG_INFO.to_vec())],
        );
        let table = SymbolTable::from_bytes("empty", data).unwrap();
        assert!(table.is_empty());
        assert!(table.layout().position_independent);
    }

    #[test]
    fn zdebug_sections_stand_in_for_debug_sections() {
        let mut compressed = b"ZLIB".to_vec();
        compressed.extend_from_slice(&(EMPTY_DEBUG_INFO.len() as u64).to_be_bytes());
        compressed.extend_from_slice(&zlib(&EMPTY_DEBUG_INFO));
        let data = build_elf64_with_sections(3, &[0x0], &[TestSection::progbits(".zdebug_info", compressed)]);
        let table = SymbolTable::from_bytes("zdebug", data).unwrap();
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn undecodable_debug_sections_are_a_format_error() {
        let mut garbage = b"ZLIB".to_vec();
        garbage.extend_from_slice(&64u64.to_be_bytes());
        garbage.extend_from_slice(b"definitely not deflate");
        let data = build_elf64_with_sections(3, &[0x0], &[TestSection::progbits(".zdebug_info", garbage)]);
        match SymbolTable::from_bytes("corrupt", data) {
            Err(TraceError::BinaryFormat { path, reason }) => {
                assert_eq!(path, Path::new("corrupt"));
                assert!(reason.contains(".zdebug_info"), "{}", reason);
            }
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("resolved symbols from corrupt debug info"),
        }
    }
}
