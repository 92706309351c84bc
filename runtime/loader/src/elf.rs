//! # ELF64 Module Parser
//!
//! Validates one module file and indexes its layout: header, loadable
//! segments, dynamic section and the tables the dynamic section points at.
//!
//! ## Addressing
//!
//! Modules are position independent and their lowest loadable address is 0,
//! so a virtual address inside a module is also its offset into the loaded
//! image. Every table location recorded here is such an image offset, already
//! checked against the image size computed from the program headers.

use alloc::vec::Vec;
use core::mem::size_of;

use bitflags::bitflags;

use crate::error::ElfError;

// =============================================================================
// ELF Types
// =============================================================================

/// ELF magic number.
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// ELF class: 64-bit.
pub const ELFCLASS64: u8 = 2;

/// ELF data: little-endian.
pub const ELFDATA2LSB: u8 = 1;

/// Identification and file version.
pub const EV_CURRENT: u8 = 1;

/// OS ABI: System V.
pub const ELFOSABI_SYSV: u8 = 0;

/// ELF type: executable.
pub const ET_EXEC: u16 = 2;

/// ELF type: shared object.
pub const ET_DYN: u16 = 3;

/// Machine type: x86_64.
pub const EM_X86_64: u16 = 62;

/// Machine type: AArch64.
pub const EM_AARCH64: u16 = 183;

/// Loadable segment.
pub const PT_LOAD: u32 = 1;

/// Dynamic linking info.
pub const PT_DYNAMIC: u32 = 2;

/// Maximum number of loadable segments per module.
pub const MAX_SEGMENTS: usize = 16;

/// ELF64 header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Header {
    /// Magic number and identification.
    pub e_ident: [u8; 16],
    /// Object file type.
    pub e_type: u16,
    /// Machine architecture.
    pub e_machine: u16,
    /// Object file version.
    pub e_version: u32,
    /// Entry point virtual address.
    pub e_entry: u64,
    /// Program header table file offset.
    pub e_phoff: u64,
    /// Section header table file offset.
    pub e_shoff: u64,
    /// Processor-specific flags.
    pub e_flags: u32,
    /// ELF header size.
    pub e_ehsize: u16,
    /// Program header entry size.
    pub e_phentsize: u16,
    /// Number of program headers.
    pub e_phnum: u16,
    /// Section header entry size.
    pub e_shentsize: u16,
    /// Number of section headers.
    pub e_shnum: u16,
    /// Section name string table index.
    pub e_shstrndx: u16,
}

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;
const EI_OSABI: usize = 7;
const EI_ABIVERSION: usize = 8;

/// Program header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

/// Section header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

/// Symbol table entry.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Sym {
    /// Symbol name (string table index).
    pub st_name: u32,
    /// Symbol info (type and binding).
    pub st_info: u8,
    /// Symbol visibility.
    pub st_other: u8,
    /// Section index.
    pub st_shndx: u16,
    /// Symbol value.
    pub st_value: u64,
    /// Symbol size.
    pub st_size: u64,
}

impl Elf64Sym {
    /// Get symbol binding.
    pub fn sym_bind(&self) -> u8 {
        self.st_info >> 4
    }
}

/// Symbol types.
pub const STT_NOTYPE: u8 = 0;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;

/// Symbol bindings.
pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;

/// Undefined symbol index, also the end of a hash chain.
pub const STN_UNDEF: u32 = 0;

/// Relocation entry with addend.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Rela {
    /// Address to relocate.
    pub r_offset: u64,
    /// Relocation type and symbol index.
    pub r_info: u64,
    /// Addend.
    pub r_addend: i64,
}

impl Elf64Rela {
    /// Get relocation type.
    pub fn r_type(&self) -> u32 {
        (self.r_info & 0xffffffff) as u32
    }

    /// Get symbol index.
    pub fn r_sym(&self) -> u32 {
        (self.r_info >> 32) as u32
    }
}

/// Dynamic entry.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Dyn {
    /// Entry tag.
    pub d_tag: i64,
    /// Entry value.
    pub d_val: u64,
}

/// Dynamic tags.
pub const DT_NULL: i64 = 0;
pub const DT_PLTRELSZ: i64 = 2;
pub const DT_HASH: i64 = 4;
pub const DT_STRTAB: i64 = 5;
pub const DT_SYMTAB: i64 = 6;
pub const DT_RELA: i64 = 7;
pub const DT_RELASZ: i64 = 8;
pub const DT_RELAENT: i64 = 9;
pub const DT_STRSZ: i64 = 10;
pub const DT_SYMENT: i64 = 11;
pub const DT_INIT: i64 = 12;
pub const DT_FINI: i64 = 13;
pub const DT_PLTREL: i64 = 20;
pub const DT_JMPREL: i64 = 23;
pub const DT_INIT_ARRAY: i64 = 25;
pub const DT_FINI_ARRAY: i64 = 26;
pub const DT_INIT_ARRAYSZ: i64 = 27;
pub const DT_FINI_ARRAYSZ: i64 = 28;

// =============================================================================
// Raw Reads
// =============================================================================

/// Plain-old-data types that may be read from any byte pattern.
///
/// # Safety
///
/// Implementors must be `repr(C)` (or primitive) and valid for every bit
/// pattern of their size.
pub(crate) unsafe trait Plain: Copy {}

unsafe impl Plain for u32 {}
unsafe impl Plain for u64 {}
unsafe impl Plain for Elf64Header {}
unsafe impl Plain for Elf64Phdr {}
unsafe impl Plain for Elf64Shdr {}
unsafe impl Plain for Elf64Sym {}
unsafe impl Plain for Elf64Rela {}
unsafe impl Plain for Elf64Dyn {}

/// Reads a `T` at `offset`, or `None` if it does not fit in `bytes`.
pub(crate) fn read<T: Plain>(bytes: &[u8], offset: usize) -> Option<T> {
    let end = offset.checked_add(size_of::<T>())?;
    if end > bytes.len() {
        return None;
    }

    // SAFETY: bounds checked above and `T: Plain` accepts any bit pattern.
    Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr().add(offset) as *const T) })
}

/// Returns the NUL-terminated string starting at `offset`, without the NUL.
pub(crate) fn c_str(bytes: &[u8], offset: usize) -> Option<&[u8]> {
    let tail = bytes.get(offset..)?;
    let len = tail.iter().position(|&b| b == 0)?;
    Some(&tail[..len])
}

// =============================================================================
// Module Layout
// =============================================================================

/// Instruction set a module is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Machine {
    X86_64,
    Aarch64,
}

impl Machine {
    /// The machine this crate was compiled for.
    pub const fn native() -> Self {
        #[cfg(target_arch = "aarch64")]
        return Machine::Aarch64;
        #[cfg(not(target_arch = "aarch64"))]
        return Machine::X86_64;
    }

    pub const fn e_machine(self) -> u16 {
        match self {
            Machine::X86_64 => EM_X86_64,
            Machine::Aarch64 => EM_AARCH64,
        }
    }
}

bitflags! {
    /// Program header permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const EXECUTE = 1 << 0;
        const WRITE = 1 << 1;
        const READ = 1 << 2;
    }
}

/// A loadable segment, located both in the file and in the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSegment {
    pub flags: SegmentFlags,
    pub file_offset: usize,
    pub mem_offset: usize,
    pub filesz: usize,
    pub memsz: usize,
}

/// A byte range inside the loaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub offset: usize,
    pub len: usize,
}

impl Span {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Location and geometry of the SysV hash table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashTable {
    pub offset: usize,
    pub nbucket: u32,
    pub nchain: u32,
}

/// Validated dynamic-section contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DynamicInfo {
    pub strtab: Option<Span>,
    pub symtab: Option<Span>,
    pub hash: Option<HashTable>,
    pub rela: Option<Span>,
    pub jmprel: Option<Span>,
    pub init: Option<usize>,
    pub fini: Option<usize>,
    pub init_array: Option<Span>,
    pub fini_array: Option<Span>,
}

impl DynamicInfo {
    /// Number of entries in the dynamic symbol table.
    pub fn symbol_count(&self) -> usize {
        self.symtab.map_or(0, |s| s.len / size_of::<Elf64Sym>())
    }

    /// Number of entries in the general relocation table.
    pub fn rela_count(&self) -> usize {
        self.rela.map_or(0, |s| s.len / size_of::<Elf64Rela>())
    }

    /// Number of entries in the PLT relocation table.
    pub fn plt_count(&self) -> usize {
        self.jmprel.map_or(0, |s| s.len / size_of::<Elf64Rela>())
    }
}

/// Dynamic-section values before validation.
#[derive(Default)]
struct RawDynamic {
    strtab: Option<u64>,
    strsz: Option<u64>,
    symtab: Option<u64>,
    syment: Option<u64>,
    hash: Option<u64>,
    rela: Option<u64>,
    relasz: u64,
    relaent: Option<u64>,
    jmprel: Option<u64>,
    pltrelsz: u64,
    pltrel: Option<u64>,
    init: Option<u64>,
    fini: Option<u64>,
    init_array: Option<u64>,
    init_arraysz: u64,
    fini_array: Option<u64>,
    fini_arraysz: u64,
}

// =============================================================================
// ELF File
// =============================================================================

/// A validated module file.
///
/// Borrows the caller's bytes; nothing is copied until [`ElfFile::load_into`].
#[derive(Debug, Clone)]
pub struct ElfFile<'a> {
    bytes: &'a [u8],
    header: Elf64Header,
    machine: Machine,
    segments: Vec<LoadSegment>,
    image_size: usize,
    dynamic: DynamicInfo,
    eh_frame: Option<Span>,
}

impl<'a> ElfFile<'a> {
    /// Parses and validates `bytes` as a module for `machine`.
    pub fn parse(bytes: &'a [u8], machine: Machine) -> Result<Self, ElfError> {
        if bytes.len() < size_of::<Elf64Header>() {
            return Err(ElfError::InvalidArg);
        }

        if bytes[..4] != ELF_MAGIC {
            return Err(ElfError::InvalidSignature);
        }

        let header: Elf64Header = read(bytes, 0).ok_or(ElfError::InvalidArg)?;
        check_support(&header, machine)?;

        let (segments, dynamic_phdr) = parse_program_headers(bytes, &header)?;

        let mut image_size = 0usize;
        for seg in &segments {
            image_size = image_size.max(seg.mem_offset + seg.memsz);
        }

        let mut dynamic = match dynamic_phdr {
            Some(phdr) => parse_dynamic(bytes, &segments, &phdr, image_size)?,
            None => DynamicInfo::default(),
        };

        let eh_frame = parse_sections(bytes, &header, image_size, &mut dynamic)?;

        Ok(Self {
            bytes,
            header,
            machine,
            segments,
            image_size,
            dynamic,
            eh_frame,
        })
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn header(&self) -> &Elf64Header {
        &self.header
    }

    pub fn machine(&self) -> Machine {
        self.machine
    }

    pub fn segments(&self) -> &[LoadSegment] {
        &self.segments
    }

    /// Bytes of memory the loaded image occupies.
    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn dynamic(&self) -> &DynamicInfo {
        &self.dynamic
    }

    pub fn eh_frame(&self) -> Option<Span> {
        self.eh_frame
    }

    /// Copies every loadable segment into `dst` and zero-fills the rest.
    ///
    /// `dst` must be at least [`ElfFile::image_size`] bytes.
    pub fn load_into(&self, dst: &mut [u8]) -> Result<(), ElfError> {
        if dst.len() < self.image_size {
            return Err(ElfError::InvalidArg);
        }

        dst.fill(0);

        for seg in &self.segments {
            let src = self
                .bytes
                .get(seg.file_offset..seg.file_offset + seg.filesz)
                .ok_or(ElfError::InvalidSegment)?;
            dst[seg.mem_offset..seg.mem_offset + seg.filesz].copy_from_slice(src);
        }

        Ok(())
    }
}

// =========================================================================
// Internal parsing helpers
// =========================================================================

fn check_support(header: &Elf64Header, machine: Machine) -> Result<(), ElfError> {
    let ident = &header.e_ident;

    let supported = ident[EI_CLASS] == ELFCLASS64
        && ident[EI_DATA] == ELFDATA2LSB
        && ident[EI_VERSION] == EV_CURRENT
        && ident[EI_OSABI] == ELFOSABI_SYSV
        && ident[EI_ABIVERSION] == 0
        && (header.e_type == ET_DYN || header.e_type == ET_EXEC)
        && header.e_machine == machine.e_machine()
        && header.e_version == EV_CURRENT as u32
        && header.e_flags == 0;

    if !supported {
        log::debug!(
            "unsupported module: class={} data={} type={} machine={}",
            ident[EI_CLASS],
            ident[EI_DATA],
            header.e_type,
            header.e_machine
        );
        return Err(ElfError::UnsupportedFile);
    }

    Ok(())
}

fn to_usize(value: u64, err: ElfError) -> Result<usize, ElfError> {
    usize::try_from(value).map_err(|_| err)
}

fn parse_program_headers(
    bytes: &[u8],
    header: &Elf64Header,
) -> Result<(Vec<LoadSegment>, Option<Elf64Phdr>), ElfError> {
    let phdr_size = size_of::<Elf64Phdr>();
    let phnum = header.e_phnum as usize;

    if phnum > 0 && header.e_phentsize as usize != phdr_size {
        return Err(ElfError::InvalidSegment);
    }

    let phoff = to_usize(header.e_phoff, ElfError::InvalidSegment)?;

    let mut segments = Vec::new();
    let mut dynamic = None;

    for i in 0..phnum {
        let offset = phoff
            .checked_add(i * phdr_size)
            .ok_or(ElfError::InvalidSegment)?;
        let phdr: Elf64Phdr = read(bytes, offset).ok_or(ElfError::InvalidSegment)?;

        match phdr.p_type {
            PT_LOAD => {
                if segments.len() == MAX_SEGMENTS {
                    return Err(ElfError::InvalidSegment);
                }

                if segments.is_empty() && phdr.p_vaddr != 0 {
                    return Err(ElfError::UnsupportedFile);
                }

                if phdr.p_filesz > phdr.p_memsz {
                    return Err(ElfError::InvalidSegment);
                }

                let seg = LoadSegment {
                    flags: SegmentFlags::from_bits_truncate(phdr.p_flags),
                    file_offset: to_usize(phdr.p_offset, ElfError::InvalidSegment)?,
                    mem_offset: to_usize(phdr.p_vaddr, ElfError::InvalidSegment)?,
                    filesz: to_usize(phdr.p_filesz, ElfError::InvalidSegment)?,
                    memsz: to_usize(phdr.p_memsz, ElfError::InvalidSegment)?,
                };

                let file_end = seg
                    .file_offset
                    .checked_add(seg.filesz)
                    .ok_or(ElfError::InvalidSegment)?;
                if file_end > bytes.len() {
                    return Err(ElfError::InvalidSegment);
                }

                seg.mem_offset
                    .checked_add(seg.memsz)
                    .ok_or(ElfError::InvalidSegment)?;

                segments.push(seg);
            }
            PT_DYNAMIC => dynamic = Some(phdr),
            _ => {}
        }
    }

    if segments.is_empty() {
        return Err(ElfError::InvalidSegment);
    }

    Ok((segments, dynamic))
}

/// Translates an image offset to the file offset backing it.
fn file_offset_of(segments: &[LoadSegment], offset: usize, len: usize) -> Option<usize> {
    segments.iter().find_map(|seg| {
        let delta = offset.checked_sub(seg.mem_offset)?;
        if delta.checked_add(len)? <= seg.filesz {
            Some(seg.file_offset + delta)
        } else {
            None
        }
    })
}

/// Builds a span from a dynamic-section address and size, rejecting anything
/// that does not fit in the image.
fn image_span(addr: u64, len: u64, image_size: usize) -> Result<Span, ElfError> {
    let offset = to_usize(addr, ElfError::InvalidSection)?;
    let len = to_usize(len, ElfError::InvalidSection)?;

    match offset.checked_add(len) {
        Some(end) if end <= image_size => Ok(Span { offset, len }),
        _ => Err(ElfError::InvalidSection),
    }
}

fn parse_dynamic(
    bytes: &[u8],
    segments: &[LoadSegment],
    phdr: &Elf64Phdr,
    image_size: usize,
) -> Result<DynamicInfo, ElfError> {
    let dyn_start = to_usize(phdr.p_offset, ElfError::InvalidSegment)?;
    let dyn_len = to_usize(phdr.p_filesz, ElfError::InvalidSegment)?;
    match dyn_start.checked_add(dyn_len) {
        Some(end) if end <= bytes.len() => {}
        _ => return Err(ElfError::InvalidSegment),
    }

    let dyn_size = size_of::<Elf64Dyn>();
    let mut raw = RawDynamic::default();

    for i in 0..dyn_len / dyn_size {
        let entry: Elf64Dyn =
            read(bytes, dyn_start + i * dyn_size).ok_or(ElfError::InvalidSegment)?;

        match entry.d_tag {
            DT_NULL => break,
            DT_STRTAB => raw.strtab = Some(entry.d_val),
            DT_STRSZ => raw.strsz = Some(entry.d_val),
            DT_SYMTAB => raw.symtab = Some(entry.d_val),
            DT_SYMENT => raw.syment = Some(entry.d_val),
            DT_HASH => raw.hash = Some(entry.d_val),
            DT_RELA => raw.rela = Some(entry.d_val),
            DT_RELASZ => raw.relasz = entry.d_val,
            DT_RELAENT => raw.relaent = Some(entry.d_val),
            DT_JMPREL => raw.jmprel = Some(entry.d_val),
            DT_PLTRELSZ => raw.pltrelsz = entry.d_val,
            DT_PLTREL => raw.pltrel = Some(entry.d_val),
            DT_INIT => raw.init = Some(entry.d_val),
            DT_FINI => raw.fini = Some(entry.d_val),
            DT_INIT_ARRAY => raw.init_array = Some(entry.d_val),
            DT_INIT_ARRAYSZ => raw.init_arraysz = entry.d_val,
            DT_FINI_ARRAY => raw.fini_array = Some(entry.d_val),
            DT_FINI_ARRAYSZ => raw.fini_arraysz = entry.d_val,
            _ => {}
        }
    }

    validate_dynamic(bytes, segments, &raw, image_size)
}

fn validate_dynamic(
    bytes: &[u8],
    segments: &[LoadSegment],
    raw: &RawDynamic,
    image_size: usize,
) -> Result<DynamicInfo, ElfError> {
    let sym_size = size_of::<Elf64Sym>() as u64;
    let rela_size = size_of::<Elf64Rela>() as u64;

    if raw.syment.is_some_and(|ent| ent != sym_size) {
        return Err(ElfError::InvalidSection);
    }
    if raw.relaent.is_some_and(|ent| ent != rela_size) {
        return Err(ElfError::InvalidSection);
    }
    if raw.pltrel.is_some_and(|kind| kind != DT_RELA as u64) {
        return Err(ElfError::InvalidSection);
    }

    let mut info = DynamicInfo {
        ..DynamicInfo::default()
    };

    if let Some(strtab) = raw.strtab {
        let offset = to_usize(strtab, ElfError::InvalidSection)?;
        let len = match raw.strsz {
            Some(strsz) => strsz,
            None => image_size.checked_sub(offset).ok_or(ElfError::InvalidSection)? as u64,
        };
        info.strtab = Some(image_span(strtab, len, image_size)?);
    }

    if let Some(hash) = raw.hash {
        let offset = to_usize(hash, ElfError::InvalidSection)?;
        let file_offset = file_offset_of(segments, offset, 8).ok_or(ElfError::InvalidSection)?;
        let nbucket: u32 = read(bytes, file_offset).ok_or(ElfError::InvalidSection)?;
        let nchain: u32 = read(bytes, file_offset + 4).ok_or(ElfError::InvalidSection)?;

        if nbucket == 0 {
            return Err(ElfError::InvalidSection);
        }

        let words = 2 + nbucket as u64 + nchain as u64;
        image_span(hash, words * 4, image_size)?;

        info.hash = Some(HashTable {
            offset,
            nbucket,
            nchain,
        });
    }

    if let Some(symtab) = raw.symtab {
        if info.strtab.is_none() {
            return Err(ElfError::InvalidSection);
        }

        // Without a hash table the symbol count is inferred from the string
        // table that conventionally follows the symbol table.
        let count = match (info.hash, raw.strtab) {
            (Some(hash), _) => hash.nchain as u64,
            (None, Some(strtab)) if strtab > symtab => (strtab - symtab) / sym_size,
            _ => 0,
        };

        info.symtab = Some(image_span(symtab, count * sym_size, image_size)?);
    }

    if let Some(rela) = raw.rela {
        let count = raw.relasz / rela_size;
        info.rela = Some(image_span(rela, count * rela_size, image_size)?);
    }

    if let Some(jmprel) = raw.jmprel {
        let count = raw.pltrelsz / rela_size;
        info.jmprel = Some(image_span(jmprel, count * rela_size, image_size)?);
    }

    if let Some(init) = raw.init {
        info.init = Some(image_span(init, 1, image_size)?.offset);
    }

    if let Some(fini) = raw.fini {
        info.fini = Some(image_span(fini, 1, image_size)?.offset);
    }

    if let Some(init_array) = raw.init_array {
        info.init_array = Some(image_span(init_array, raw.init_arraysz, image_size)?);
    }

    if let Some(fini_array) = raw.fini_array {
        info.fini_array = Some(image_span(fini_array, raw.fini_arraysz, image_size)?);
    }

    Ok(info)
}

/// Scans section headers for the unwind table and legacy constructor lists.
///
/// Section headers are optional; a module stripped of them is accepted.
fn parse_sections(
    bytes: &[u8],
    header: &Elf64Header,
    image_size: usize,
    dynamic: &mut DynamicInfo,
) -> Result<Option<Span>, ElfError> {
    let shnum = header.e_shnum as usize;
    if shnum == 0 || header.e_shoff == 0 {
        return Ok(None);
    }

    let shdr_size = size_of::<Elf64Shdr>();
    if header.e_shentsize as usize != shdr_size {
        return Err(ElfError::InvalidSection);
    }

    let shoff = to_usize(header.e_shoff, ElfError::InvalidSection)?;
    let shdr_at = |index: usize| -> Result<Elf64Shdr, ElfError> {
        let offset = shoff
            .checked_add(index * shdr_size)
            .ok_or(ElfError::InvalidSection)?;
        read(bytes, offset).ok_or(ElfError::InvalidSection)
    };

    let shstrndx = header.e_shstrndx as usize;
    if shstrndx >= shnum {
        return Err(ElfError::InvalidSection);
    }
    let names = shdr_at(shstrndx)?;
    let names_offset = to_usize(names.sh_offset, ElfError::InvalidSection)?;

    let mut eh_frame = None;

    for index in 0..shnum {
        let shdr = shdr_at(index)?;
        let name_offset = names_offset
            .checked_add(shdr.sh_name as usize)
            .ok_or(ElfError::InvalidSection)?;
        let name = c_str(bytes, name_offset).ok_or(ElfError::InvalidSection)?;

        match name {
            b".eh_frame" => {
                eh_frame = Some(image_span(shdr.sh_addr, shdr.sh_size, image_size)?);
            }
            b".ctors" if dynamic.init_array.is_none() => {
                dynamic.init_array = Some(image_span(shdr.sh_addr, shdr.sh_size, image_size)?);
            }
            b".dtors" if dynamic.fini_array.is_none() => {
                dynamic.fini_array = Some(image_span(shdr.sh_addr, shdr.sh_size, image_size)?);
            }
            _ => {}
        }
    }

    Ok(eh_frame)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{put_u32, put_u64, ModuleBuilder};

    #[test]
    fn test_parse_minimal_module() {
        let module = ModuleBuilder::new().function("start_vmm", 0).build();
        let file = ElfFile::parse(&module.bytes, Machine::X86_64).unwrap();

        assert_eq!(file.machine(), Machine::X86_64);
        assert_eq!(file.segments().len(), 1);
        assert_eq!(file.image_size(), module.bytes.len());
        assert_eq!(file.dynamic().symbol_count(), 2);
        assert!(file.dynamic().hash.is_some());
        assert!(file.eh_frame().is_none());
    }

    #[test]
    fn test_rejects_short_buffer() {
        assert_eq!(ElfFile::parse(&[], Machine::X86_64).unwrap_err(), ElfError::InvalidArg);
        assert_eq!(
            ElfFile::parse(&[0x7F, b'E', b'L', b'F'], Machine::X86_64).unwrap_err(),
            ElfError::InvalidArg
        );
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut module = ModuleBuilder::new().build();
        module.bytes[1] = b'X';

        assert_eq!(
            ElfFile::parse(&module.bytes, Machine::X86_64).unwrap_err(),
            ElfError::InvalidSignature
        );
    }

    #[test]
    fn test_rejects_unsupported_header_fields() {
        let module = ModuleBuilder::new().build();

        // 32-bit class, big-endian data, non-SysV ABI, relocatable type.
        for (offset, value) in [(4usize, 1u8), (5, 2), (7, 3), (16, 1)] {
            let mut bytes = module.bytes.clone();
            bytes[offset] = value;
            assert_eq!(
                ElfFile::parse(&bytes, Machine::X86_64).unwrap_err(),
                ElfError::UnsupportedFile
            );
        }

        let mut bytes = module.bytes.clone();
        put_u32(&mut bytes, 48, 1);
        assert_eq!(
            ElfFile::parse(&bytes, Machine::X86_64).unwrap_err(),
            ElfError::UnsupportedFile
        );
    }

    #[test]
    fn test_rejects_foreign_machine() {
        let module = ModuleBuilder::new().machine(EM_AARCH64).build();

        assert_eq!(
            ElfFile::parse(&module.bytes, Machine::X86_64).unwrap_err(),
            ElfError::UnsupportedFile
        );
        assert!(ElfFile::parse(&module.bytes, Machine::Aarch64).is_ok());
    }

    #[test]
    fn test_rejects_segment_past_end_of_file() {
        let mut module = ModuleBuilder::new().build();
        // p_filesz of the first program header.
        put_u64(&mut module.bytes, 64 + 32, 0x10_0000);
        put_u64(&mut module.bytes, 64 + 40, 0x10_0000);

        assert_eq!(
            ElfFile::parse(&module.bytes, Machine::X86_64).unwrap_err(),
            ElfError::InvalidSegment
        );
    }

    #[test]
    fn test_rejects_nonzero_load_base() {
        let mut module = ModuleBuilder::new().build();
        put_u64(&mut module.bytes, 64 + 16, 0x40_0000);

        assert_eq!(
            ElfFile::parse(&module.bytes, Machine::X86_64).unwrap_err(),
            ElfError::UnsupportedFile
        );
    }

    #[test]
    fn test_rejects_table_outside_image() {
        let mut module = ModuleBuilder::new().function("start_vmm", 0).build();
        let entry = module.dynamic_entry(DT_SYMTAB).unwrap();
        put_u64(&mut module.bytes, entry + 8, 0xFFFF_0000);

        assert_eq!(
            ElfFile::parse(&module.bytes, Machine::X86_64).unwrap_err(),
            ElfError::InvalidSection
        );
    }

    #[test]
    fn test_rejects_wrong_entry_size() {
        let mut module = ModuleBuilder::new().function("start_vmm", 0).build();
        let entry = module.dynamic_entry(DT_SYMENT).unwrap();
        put_u64(&mut module.bytes, entry + 8, 16);

        assert_eq!(
            ElfFile::parse(&module.bytes, Machine::X86_64).unwrap_err(),
            ElfError::InvalidSection
        );
    }

    #[test]
    fn test_module_without_dynamic_section() {
        let module = ModuleBuilder::new().without_dynamic().build();
        let file = ElfFile::parse(&module.bytes, Machine::X86_64).unwrap();

        assert_eq!(file.dynamic(), &DynamicInfo::default());
        assert_eq!(file.dynamic().symbol_count(), 0);
    }

    #[test]
    fn test_symbol_count_without_hash() {
        let module = ModuleBuilder::new()
            .function("a", 0)
            .function("b", 0)
            .without_hash()
            .build();
        let file = ElfFile::parse(&module.bytes, Machine::X86_64).unwrap();

        assert!(file.dynamic().hash.is_none());
        assert_eq!(file.dynamic().symbol_count(), 3);
    }

    #[test]
    fn test_load_zero_fills_bss() {
        let module = ModuleBuilder::new().function("f", 7).bss(64).build();
        let file = ElfFile::parse(&module.bytes, Machine::X86_64).unwrap();
        assert_eq!(file.image_size(), module.bytes.len() + 64);

        let mut image = alloc::vec![0xAAu8; file.image_size()];
        file.load_into(&mut image).unwrap();

        assert_eq!(&image[..module.bytes.len()], &module.bytes[..]);
        assert!(image[module.bytes.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_load_into_short_buffer() {
        let module = ModuleBuilder::new().build();
        let file = ElfFile::parse(&module.bytes, Machine::X86_64).unwrap();
        let mut image = alloc::vec![0u8; file.image_size() - 1];

        assert_eq!(file.load_into(&mut image).unwrap_err(), ElfError::InvalidArg);
    }

    #[test]
    fn test_c_str() {
        let bytes = b"\0abc\0def";
        assert_eq!(c_str(bytes, 1), Some(&b"abc"[..]));
        assert_eq!(c_str(bytes, 0), Some(&b""[..]));
        assert_eq!(c_str(bytes, 5), None);
        assert_eq!(c_str(bytes, 64), None);
    }
}
