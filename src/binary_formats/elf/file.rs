use crate::{
    consts::arch::{Bitness, Endianness},
    memory::memview::{MemView, MemViewError, StaticMemView},
};
use flate2::read::ZlibDecoder;
use num_traits::FromPrimitive;
use std::{borrow::Cow, io::Read};
use thiserror::Error;

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const PT_LOAD: u32 = 1;
const PAGE_MASK: u64 = 0xfff;

const SHT_NOBITS: u32 = 8;
const SHF_COMPRESSED: u64 = 0x800;
const ELFCOMPRESS_ZLIB: u32 = 1;
// shstrndx doesn't fit, the real index is in section 0's sh_link
const SHN_XINDEX: u16 = 0xffff;
// .zdebug_* sections start with this, then the inflated size as a big endian u64
const GNU_ZLIB_MAGIC: [u8; 4] = *b"ZLIB";
const GNU_ZLIB_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, FromPrimitive)]
pub enum ElfFileType {
    None = 0,
    Relocatable = 1,
    Executable = 2,
    SharedObject = 3,
    Core = 4,
}

pub struct ElfHeaderIdent {
    pub magic: [u8; 4],
    pub class: u8,
    pub data: u8,
    pub version: u8,
    pub osabi: u8,
    pub abiversion: u8,
}

pub struct ElfHeader {
    pub ident: ElfHeaderIdent,
    pub bitness: Bitness,
    pub endianness: Endianness,
    pub file_type: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u64, // u32 on 32-bit
    pub phoff: u64, // u32 on 32-bit
    pub shoff: u64, // u32 on 32-bit
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

pub struct ElfProgramHeader {
    pub seg_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
}

#[derive(Clone)]
pub struct ElfSectionHeader {
    pub name: u32,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub addralign: u64,
    pub entsize: u64,
}

pub struct ElfSection {
    pub name: String,
    pub header: ElfSectionHeader,
}

#[derive(Debug, Error)]
pub enum ElfReadError {
    #[error("not an elf file")]
    BadMagic,
    #[error("truncated elf file: {0}")]
    IOError(#[from] MemViewError),
    #[error("bad section {name:?}: {reason}")]
    BadSection { name: String, reason: String },
}

impl ElfReadError {
    fn bad_section(name: &str, reason: impl Into<String>) -> ElfReadError {
        ElfReadError::BadSection {
            name: name.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Where an image expects to be loaded, as far as breakpoint placement cares.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageLayout {
    /// `ET_DYN` images are relocated at load time and need a load bias.
    pub position_independent: bool,
    /// page-aligned link-time address of the lowest `PT_LOAD` segment.
    pub link_base: u64,
}

impl ElfHeaderIdent {
    pub fn new(mv: &dyn MemView, addr: &mut u64) -> Result<ElfHeaderIdent, ElfReadError> {
        let mut magic = [0u8; 4];
        mv.read_bytes(addr, &mut magic)?;
        if magic != ELF_MAGIC {
            return Err(ElfReadError::BadMagic);
        }
        let class = mv.read_u8(addr)?;
        let data = mv.read_u8(addr)?;
        let version = mv.read_u8(addr)?;
        let osabi = mv.read_u8(addr)?;
        let abiversion = mv.read_u8(addr)?;
        // padding
        *addr += 7;
        Ok(ElfHeaderIdent {
            magic,
            class,
            data,
            version,
            osabi,
            abiversion,
        })
    }
}

impl ElfHeader {
    pub fn new(mv: &dyn MemView, addr: &mut u64) -> Result<ElfHeader, ElfReadError> {
        let ident = ElfHeaderIdent::new(mv, addr)?;
        let (bitness, endianness) = Self::get_endianness_and_bitness(ident.class, ident.data);

        let file_type = mv.read_u16(addr, endianness)?;
        let machine = mv.read_u16(addr, endianness)?;
        let version = mv.read_u32(addr, endianness)?;

        let entry: u64;
        let phoff: u64;
        let shoff: u64;
        if bitness == Bitness::Bit64 {
            entry = mv.read_u64(addr, endianness)?;
            phoff = mv.read_u64(addr, endianness)?;
            shoff = mv.read_u64(addr, endianness)?;
        } else {
            entry = mv.read_u32(addr, endianness)? as u64;
            phoff = mv.read_u32(addr, endianness)? as u64;
            shoff = mv.read_u32(addr, endianness)? as u64;
        }

        Ok(ElfHeader {
            ident,
            bitness,
            endianness,
            file_type,
            machine,
            version,
            entry,
            phoff,
            shoff,
            flags: mv.read_u32(addr, endianness)?,
            ehsize: mv.read_u16(addr, endianness)?,
            phentsize: mv.read_u16(addr, endianness)?,
            phnum: mv.read_u16(addr, endianness)?,
            shentsize: mv.read_u16(addr, endianness)?,
            shnum: mv.read_u16(addr, endianness)?,
            shstrndx: mv.read_u16(addr, endianness)?,
        })
    }

    pub fn get_endianness_and_bitness(class: u8, data: u8) -> (Bitness, Endianness) {
        let bitness = if class == 2 { Bitness::Bit64 } else { Bitness::Bit32 };
        let endianness = if data == 2 {
            Endianness::BigEndian
        } else {
            Endianness::LittleEndian
        };
        (bitness, endianness)
    }

    pub fn elf_file_type(&self) -> Option<ElfFileType> {
        ElfFileType::from_u16(self.file_type)
    }

    pub fn read_program_headers(&self, mv: &dyn MemView) -> Result<Vec<ElfProgramHeader>, ElfReadError> {
        let mut headers = Vec::with_capacity(self.phnum as usize);
        for i in 0..self.phnum as u64 {
            let mut addr = self.phoff + i * self.phentsize as u64;
            headers.push(ElfProgramHeader::new(mv, &mut addr, self.bitness, self.endianness)?);
        }
        Ok(headers)
    }

    pub fn read_section_headers(&self, mv: &dyn MemView) -> Result<Vec<ElfSectionHeader>, ElfReadError> {
        if self.shoff == 0 {
            return Ok(Vec::new());
        }
        let min_entsize = if self.bitness == Bitness::Bit64 { 64 } else { 40 };
        if self.shentsize < min_entsize {
            return Err(ElfReadError::bad_section(
                "<section headers>",
                format!("entry size {} is smaller than {}", self.shentsize, min_entsize),
            ));
        }

        // with extended numbering section 0 carries the real count
        let first = ElfSectionHeader::new(mv, &mut self.shoff.clone(), self.bitness, self.endianness)?;
        let count = if self.shnum == 0 { first.size } else { self.shnum as u64 };
        let mut headers = vec![first];
        for i in 1..count {
            let mut addr = i
                .checked_mul(self.shentsize as u64)
                .and_then(|rel| rel.checked_add(self.shoff))
                .ok_or(MemViewError::EndOfStream { addr: self.shoff })?;
            headers.push(ElfSectionHeader::new(mv, &mut addr, self.bitness, self.endianness)?);
        }
        Ok(headers)
    }

    pub fn image_layout(&self, mv: &dyn MemView) -> Result<ImageLayout, ElfReadError> {
        let link_base = self
            .read_program_headers(mv)?
            .iter()
            .filter(|ph| ph.seg_type == PT_LOAD)
            .map(|ph| ph.vaddr & !PAGE_MASK)
            .min()
            .unwrap_or(0);

        Ok(ImageLayout {
            position_independent: self.elf_file_type() == Some(ElfFileType::SharedObject),
            link_base,
        })
    }
}

impl ElfProgramHeader {
    // field order differs between the 32 and 64 bit layouts
    pub fn new(
        mv: &dyn MemView,
        addr: &mut u64,
        bitness: Bitness,
        endianness: Endianness,
    ) -> Result<ElfProgramHeader, ElfReadError> {
        if bitness == Bitness::Bit64 {
            let seg_type = mv.read_u32(addr, endianness)?;
            let flags = mv.read_u32(addr, endianness)?;
            let offset = mv.read_u64(addr, endianness)?;
            let vaddr = mv.read_u64(addr, endianness)?;
            let _paddr = mv.read_u64(addr, endianness)?;
            let filesz = mv.read_u64(addr, endianness)?;
            let memsz = mv.read_u64(addr, endianness)?;
            Ok(ElfProgramHeader {
                seg_type,
                flags,
                offset,
                vaddr,
                filesz,
                memsz,
            })
        } else {
            let seg_type = mv.read_u32(addr, endianness)?;
            let offset = mv.read_u32(addr, endianness)? as u64;
            let vaddr = mv.read_u32(addr, endianness)? as u64;
            let _paddr = mv.read_u32(addr, endianness)?;
            let filesz = mv.read_u32(addr, endianness)? as u64;
            let memsz = mv.read_u32(addr, endianness)? as u64;
            let flags = mv.read_u32(addr, endianness)?;
            Ok(ElfProgramHeader {
                seg_type,
                flags,
                offset,
                vaddr,
                filesz,
                memsz,
            })
        }
    }
}

impl ElfSectionHeader {
    pub fn new(
        mv: &dyn MemView,
        addr: &mut u64,
        bitness: Bitness,
        endianness: Endianness,
    ) -> Result<ElfSectionHeader, ElfReadError> {
        let name = mv.read_u32(addr, endianness)?;
        let sh_type = mv.read_u32(addr, endianness)?;
        if bitness == Bitness::Bit64 {
            Ok(ElfSectionHeader {
                name,
                sh_type,
                flags: mv.read_u64(addr, endianness)?,
                addr: mv.read_u64(addr, endianness)?,
                offset: mv.read_u64(addr, endianness)?,
                size: mv.read_u64(addr, endianness)?,
                link: mv.read_u32(addr, endianness)?,
                info: mv.read_u32(addr, endianness)?,
                addralign: mv.read_u64(addr, endianness)?,
                entsize: mv.read_u64(addr, endianness)?,
            })
        } else {
            Ok(ElfSectionHeader {
                name,
                sh_type,
                flags: mv.read_u32(addr, endianness)? as u64,
                addr: mv.read_u32(addr, endianness)? as u64,
                offset: mv.read_u32(addr, endianness)? as u64,
                size: mv.read_u32(addr, endianness)? as u64,
                link: mv.read_u32(addr, endianness)?,
                info: mv.read_u32(addr, endianness)?,
                addralign: mv.read_u32(addr, endianness)? as u64,
                entsize: mv.read_u32(addr, endianness)? as u64,
            })
        }
    }
}

/// An ELF image read into memory, with its sections named.
pub struct ElfFile {
    mv: StaticMemView,
    header: ElfHeader,
    sections: Vec<ElfSection>,
}

impl ElfFile {
    pub fn parse(data: Vec<u8>) -> Result<ElfFile, ElfReadError> {
        let mv = StaticMemView::new(data);
        let header = ElfHeader::new(&mv, &mut 0)?;
        let section_headers = header.read_section_headers(&mv)?;

        let strtab_index = match (header.shstrndx, section_headers.first()) {
            (SHN_XINDEX, Some(first)) => first.link as usize,
            (index, _) => index as usize,
        };
        // index 0 is the null section, so no names
        let strtab = section_headers.get(strtab_index).filter(|_| strtab_index != 0).cloned();

        let mut sections = Vec::with_capacity(section_headers.len());
        for section_header in section_headers {
            let name = match &strtab {
                Some(strtab) => Self::read_name(&mv, strtab, section_header.name)?,
                None => String::new(),
            };
            sections.push(ElfSection {
                name,
                header: section_header,
            });
        }

        Ok(ElfFile { mv, header, sections })
    }

    fn read_name(mv: &StaticMemView, strtab: &ElfSectionHeader, name_offset: u32) -> Result<String, ElfReadError> {
        if name_offset as u64 >= strtab.size {
            return Err(ElfReadError::bad_section(
                "<section names>",
                format!("name offset {:#x} is past the end of the string table", name_offset),
            ));
        }
        let mut addr = strtab.offset + name_offset as u64;
        let end = strtab.offset + strtab.size;
        let mut bytes = Vec::new();
        while addr < end {
            match mv.read_u8(&mut addr)? {
                0 => break,
                c => bytes.push(c),
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn endianness(&self) -> Endianness {
        self.header.endianness
    }

    pub fn image_layout(&self) -> Result<ImageLayout, ElfReadError> {
        self.header.image_layout(&self.mv)
    }

    pub fn section_by_name(&self, name: &str) -> Option<&ElfSection> {
        self.sections.iter().find(|section| section.name == name)
    }

    /// Contents of `section`, inflated if it was stored compressed.
    pub fn section_data(&self, section: &ElfSection) -> Result<Cow<'_, [u8]>, ElfReadError> {
        let header = &section.header;
        if header.sh_type == SHT_NOBITS || header.size == 0 {
            return Ok(Cow::Borrowed(&[]));
        }
        let size = usize::try_from(header.size)
            .map_err(|_| ElfReadError::bad_section(&section.name, "size doesn't fit in memory"))?;

        if header.flags & SHF_COMPRESSED != 0 {
            return self.read_compressed(section).map(Cow::Owned);
        }
        let raw = self.mv.bytes(header.offset, size)?;
        if section.name.starts_with(".zdebug") && raw.starts_with(&GNU_ZLIB_MAGIC) {
            if raw.len() < GNU_ZLIB_HEADER_SIZE {
                return Err(ElfReadError::bad_section(&section.name, "truncated compression header"));
            }
            let mut addr = header.offset + GNU_ZLIB_MAGIC.len() as u64;
            let inflated_size = self.mv.read_u64(&mut addr, Endianness::BigEndian)?;
            return Self::inflate(section, &raw[GNU_ZLIB_HEADER_SIZE..], inflated_size).map(Cow::Owned);
        }
        Ok(Cow::Borrowed(raw))
    }

    // SHF_COMPRESSED sections start with an Elf32_Chdr/Elf64_Chdr
    fn read_compressed(&self, section: &ElfSection) -> Result<Vec<u8>, ElfReadError> {
        let endianness = self.header.endianness;
        let mut addr = section.header.offset;
        let ch_type = self.mv.read_u32(&mut addr, endianness)?;
        let inflated_size = if self.header.bitness == Bitness::Bit64 {
            let _reserved = self.mv.read_u32(&mut addr, endianness)?;
            let size = self.mv.read_u64(&mut addr, endianness)?;
            let _addralign = self.mv.read_u64(&mut addr, endianness)?;
            size
        } else {
            let size = self.mv.read_u32(&mut addr, endianness)? as u64;
            let _addralign = self.mv.read_u32(&mut addr, endianness)?;
            size
        };
        if ch_type != ELFCOMPRESS_ZLIB {
            return Err(ElfReadError::bad_section(
                &section.name,
                format!("unsupported compression type {}", ch_type),
            ));
        }

        let chdr_size = addr - section.header.offset;
        let payload_size = section
            .header
            .size
            .checked_sub(chdr_size)
            .and_then(|size| usize::try_from(size).ok())
            .ok_or_else(|| ElfReadError::bad_section(&section.name, "smaller than its compression header"))?;
        let payload = self.mv.bytes(addr, payload_size)?;
        Self::inflate(section, payload, inflated_size)
    }

    fn inflate(section: &ElfSection, payload: &[u8], inflated_size: u64) -> Result<Vec<u8>, ElfReadError> {
        let mut decoder = ZlibDecoder::new(payload);
        let mut buf: Vec<u8> = Vec::new();
        decoder
            .read_to_end(&mut buf)
            .map_err(|e| ElfReadError::bad_section(&section.name, format!("zlib decode failed: {}", e)))?;
        if buf.len() as u64 != inflated_size {
            return Err(ElfReadError::bad_section(
                &section.name,
                format!("inflated to {} bytes, expected {}", buf.len(), inflated_size),
            ));
        }
        Ok(buf)
    }
}
