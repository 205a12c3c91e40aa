//! Positioned-read ELF parsing: identification, section headers, program
//! headers, and `.eh_frame` extraction.
//!
//! The two word-size variants share one code path. A small layout trait
//! describes how to decode each header structure; the concrete layout is
//! picked once at open time from the file's class byte, and everything
//! downstream works on width-independent structs with `u64` fields.

use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::error::ModuleError;
use crate::reader::Reader;

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub const EI_NIDENT: usize = 16;
pub const EI_CLASS: usize = 4;
pub const ELFCLASS32: u8 = 1;
pub const ELFCLASS64: u8 = 2;

pub const PT_LOAD: u32 = 1;
pub const PF_X: u32 = 1;

/// Fields of the ELF header this crate consumes, widened to `u64`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ElfHeader {
    pub phoff: u64,
    pub shoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

#[derive(Clone, Copy, Debug)]
pub struct SectionHeader {
    pub name_offset: u32,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct ProgramHeader {
    pub segment_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub file_size: u64,
}

/// Decoding of the three header structures for one word-size variant.
pub trait ElfLayout {
    const CLASS: u8;
    const EHDR_SIZE: usize;
    const SHDR_SIZE: usize;
    const PHDR_SIZE: usize;

    fn header(r: &mut Reader<'_>) -> Option<ElfHeader>;
    fn section_header(r: &mut Reader<'_>) -> Option<SectionHeader>;
    fn program_header(r: &mut Reader<'_>) -> Option<ProgramHeader>;
}

pub struct Elf32Layout;
pub struct Elf64Layout;

impl ElfLayout for Elf32Layout {
    const CLASS: u8 = ELFCLASS32;
    const EHDR_SIZE: usize = 52;
    const SHDR_SIZE: usize = 40;
    const PHDR_SIZE: usize = 32;

    fn header(r: &mut Reader<'_>) -> Option<ElfHeader> {
        r.skip(EI_NIDENT).ok()?;
        r.skip(2 + 2 + 4).ok()?; // e_type, e_machine, e_version
        r.skip(4).ok()?; // e_entry
        let phoff = u64::from(r.read_u32().ok()?);
        let shoff = u64::from(r.read_u32().ok()?);
        r.skip(4 + 2).ok()?; // e_flags, e_ehsize
        Some(ElfHeader {
            phoff,
            shoff,
            phentsize: r.read_u16().ok()?,
            phnum: r.read_u16().ok()?,
            shentsize: r.read_u16().ok()?,
            shnum: r.read_u16().ok()?,
            shstrndx: r.read_u16().ok()?,
        })
    }

    fn section_header(r: &mut Reader<'_>) -> Option<SectionHeader> {
        let name_offset = r.read_u32().ok()?;
        r.skip(4 + 4).ok()?; // sh_type, sh_flags
        let addr = u64::from(r.read_u32().ok()?);
        let offset = u64::from(r.read_u32().ok()?);
        let size = u64::from(r.read_u32().ok()?);
        Some(SectionHeader {
            name_offset,
            addr,
            offset,
            size,
        })
    }

    fn program_header(r: &mut Reader<'_>) -> Option<ProgramHeader> {
        let segment_type = r.read_u32().ok()?;
        let offset = u64::from(r.read_u32().ok()?);
        let vaddr = u64::from(r.read_u32().ok()?);
        r.skip(4).ok()?; // p_paddr
        let file_size = u64::from(r.read_u32().ok()?);
        r.skip(4).ok()?; // p_memsz
        let flags = r.read_u32().ok()?;
        Some(ProgramHeader {
            segment_type,
            flags,
            offset,
            vaddr,
            file_size,
        })
    }
}

impl ElfLayout for Elf64Layout {
    const CLASS: u8 = ELFCLASS64;
    const EHDR_SIZE: usize = 64;
    const SHDR_SIZE: usize = 64;
    const PHDR_SIZE: usize = 56;

    fn header(r: &mut Reader<'_>) -> Option<ElfHeader> {
        r.skip(EI_NIDENT).ok()?;
        r.skip(2 + 2 + 4).ok()?; // e_type, e_machine, e_version
        r.skip(8).ok()?; // e_entry
        let phoff = r.read_u64().ok()?;
        let shoff = r.read_u64().ok()?;
        r.skip(4 + 2).ok()?; // e_flags, e_ehsize
        Some(ElfHeader {
            phoff,
            shoff,
            phentsize: r.read_u16().ok()?,
            phnum: r.read_u16().ok()?,
            shentsize: r.read_u16().ok()?,
            shnum: r.read_u16().ok()?,
            shstrndx: r.read_u16().ok()?,
        })
    }

    fn section_header(r: &mut Reader<'_>) -> Option<SectionHeader> {
        let name_offset = r.read_u32().ok()?;
        r.skip(4 + 8).ok()?; // sh_type, sh_flags
        let addr = r.read_u64().ok()?;
        let offset = r.read_u64().ok()?;
        let size = r.read_u64().ok()?;
        Some(SectionHeader {
            name_offset,
            addr,
            offset,
            size,
        })
    }

    fn program_header(r: &mut Reader<'_>) -> Option<ProgramHeader> {
        let segment_type = r.read_u32().ok()?;
        let flags = r.read_u32().ok()?;
        let offset = r.read_u64().ok()?;
        let vaddr = r.read_u64().ok()?;
        r.skip(8).ok()?; // p_paddr
        let file_size = r.read_u64().ok()?;
        Some(ProgramHeader {
            segment_type,
            flags,
            offset,
            vaddr,
            file_size,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

impl ElfClass {
    pub fn address_size(self) -> u8 {
        match self {
            ElfClass::Elf32 => 4,
            ElfClass::Elf64 => 8,
        }
    }
}

/// One parsed on-disk ELF binary. Owns the open file handle; all reads are
/// positioned, so no read depends on a shared cursor.
pub struct ElfModule {
    path: PathBuf,
    file: File,
    class: ElfClass,
    sections: BTreeMap<String, SectionHeader>,
    program_headers: Vec<ProgramHeader>,
    min_exec_vaddr: u64,
}

impl ElfModule {
    /// Opens and fully parses a module's headers.
    ///
    /// The class byte in the identification selects the 32-bit or 64-bit
    /// layout; everything else is shared.
    pub fn open(path: &Path) -> Result<Self, ModuleError> {
        let file = File::open(path).map_err(|e| ModuleError::from_io(path, &e))?;
        let mut ident = [0u8; EI_NIDENT];
        read_fully(&file, &mut ident, 0)?;
        if ident[..4] != ELF_MAGIC {
            return Err(ModuleError::BadMagic);
        }
        match ident[EI_CLASS] {
            ELFCLASS32 => Self::parse::<Elf32Layout>(file, path, ElfClass::Elf32),
            ELFCLASS64 => Self::parse::<Elf64Layout>(file, path, ElfClass::Elf64),
            found => Err(ModuleError::ClassMismatch { found }),
        }
    }

    fn parse<L: ElfLayout>(file: File, path: &Path, class: ElfClass) -> Result<Self, ModuleError> {
        let header = read_header::<L>(&file)?;
        let sections = read_section_headers::<L>(&file, &header)?;
        let program_headers = read_program_headers::<L>(&file, &header)?;
        let min_exec_vaddr = min_virtual_address(&program_headers);
        trace!(
            path = %path.display(),
            sections = sections.len(),
            segments = program_headers.len(),
            min_exec_vaddr,
            "parsed ELF module"
        );
        Ok(Self {
            path: path.to_owned(),
            file,
            class,
            sections,
            program_headers,
            min_exec_vaddr,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn class(&self) -> ElfClass {
        self.class
    }

    pub fn section(&self, name: &str) -> Option<&SectionHeader> {
        self.sections.get(name)
    }

    pub fn program_headers(&self) -> &[ProgramHeader] {
        &self.program_headers
    }

    /// Minimum `p_vaddr` among executable `PT_LOAD` segments, used to
    /// compute the load bias of position-independent binaries. `u64::MAX`
    /// when no such segment exists.
    pub fn min_exec_vaddr(&self) -> u64 {
        self.min_exec_vaddr
    }

    /// Reads the raw `.eh_frame` section and returns its bytes together
    /// with the section's virtual address.
    ///
    /// A module without unwind info is not an exceptional case for the
    /// driver, which treats [`ModuleError::NoUnwindInfo`] as "no frames
    /// resolvable in this module".
    pub fn read_eh_frame(&self) -> Result<(Vec<u8>, u64), ModuleError> {
        let section = self
            .section(".eh_frame")
            .copied()
            .ok_or(ModuleError::NoUnwindInfo)?;
        let data = self.read_section(&section)?;
        Ok((data, section.addr))
    }

    pub fn read_section(&self, section: &SectionHeader) -> Result<Vec<u8>, ModuleError> {
        let mut data = vec![0u8; section.size as usize];
        read_fully(&self.file, &mut data, section.offset)?;
        Ok(data)
    }
}

impl std::fmt::Debug for ElfModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElfModule")
            .field("path", &self.path)
            .field("class", &self.class)
            .field("sections", &self.sections.len())
            .finish()
    }
}

fn read_fully(file: &File, buf: &mut [u8], offset: u64) -> Result<(), ModuleError> {
    file.read_exact_at(buf, offset)
        .map_err(|_| ModuleError::TruncatedRead {
            offset,
            size: buf.len() as u64,
        })
}

fn read_struct<T>(
    file: &File,
    offset: u64,
    size: usize,
    decode: impl FnOnce(&mut Reader<'_>) -> Option<T>,
) -> Result<T, ModuleError> {
    let mut buf = vec![0u8; size];
    read_fully(file, &mut buf, offset)?;
    decode(&mut Reader::new(&buf)).ok_or(ModuleError::TruncatedRead {
        offset,
        size: size as u64,
    })
}

fn read_header<L: ElfLayout>(file: &File) -> Result<ElfHeader, ModuleError> {
    let mut buf = vec![0u8; L::EHDR_SIZE];
    read_fully(file, &mut buf, 0)?;
    let mut r = Reader::new(&buf);
    let header = L::header(&mut r).ok_or(ModuleError::TruncatedRead {
        offset: 0,
        size: L::EHDR_SIZE as u64,
    })?;
    Ok(header)
}

fn read_section_headers<L: ElfLayout>(
    file: &File,
    header: &ElfHeader,
) -> Result<BTreeMap<String, SectionHeader>, ModuleError> {
    if header.shstrndx == 0 {
        return Err(ModuleError::MissingStringTable);
    }
    let entsize = u64::from(header.shentsize);
    let strtab_offset = header.shoff + u64::from(header.shstrndx) * entsize;
    let strtab_header =
        read_struct(file, strtab_offset, L::SHDR_SIZE, L::section_header)?;
    let mut strtab = vec![0u8; strtab_header.size as usize];
    read_fully(file, &mut strtab, strtab_header.offset)?;

    let mut sections = BTreeMap::new();
    for i in 0..header.shnum {
        let offset = header.shoff + u64::from(i) * entsize;
        let section = read_struct(file, offset, L::SHDR_SIZE, L::section_header)?;
        let name = section_name(&strtab, section.name_offset);
        // Unnamed sections (including the initial NULL section) are not
        // addressable by name and get skipped.
        if name.is_empty() {
            continue;
        }
        trace!(
            name,
            addr = section.addr,
            offset = section.offset,
            size = section.size,
            "section"
        );
        sections.insert(name.to_owned(), section);
    }
    Ok(sections)
}

fn section_name(strtab: &[u8], name_offset: u32) -> &str {
    let start = name_offset as usize;
    if start >= strtab.len() {
        return "";
    }
    let rest = &strtab[start..];
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    std::str::from_utf8(&rest[..end]).unwrap_or("")
}

fn read_program_headers<L: ElfLayout>(
    file: &File,
    header: &ElfHeader,
) -> Result<Vec<ProgramHeader>, ModuleError> {
    let mut headers = Vec::with_capacity(usize::from(header.phnum));
    for i in 0..header.phnum {
        let offset = header.phoff + u64::from(i) * u64::from(header.phentsize);
        let ph = read_struct(file, offset, L::PHDR_SIZE, L::program_header)?;
        trace!(
            segment_type = ph.segment_type,
            flags = ph.flags,
            vaddr = ph.vaddr,
            "program header"
        );
        headers.push(ph);
    }
    Ok(headers)
}

fn min_virtual_address(program_headers: &[ProgramHeader]) -> u64 {
    program_headers
        .iter()
        .filter(|ph| ph.segment_type == PT_LOAD && ph.flags & PF_X != 0)
        .map(|ph| ph.vaddr)
        .min()
        .unwrap_or(u64::MAX)
}
