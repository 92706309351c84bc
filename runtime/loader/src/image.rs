//! Loaded module images and the executable regions that back them.

use alloc::vec::Vec;
use core::mem::size_of;
use core::ptr::NonNull;

use crate::elf::{read, Elf64Rela, ElfFile, SegmentFlags, Span};
use crate::error::ElfError;
use crate::platform::{MemoryDescriptor, MemoryType, Platform};
use crate::symbol::SymbolTable;

// =============================================================================
// Executable Region
// =============================================================================

/// Read-write-execute memory owned by one module image.
///
/// Regions are released explicitly through the [`Platform`] that allocated
/// them; dropping one without [`ExecRegion::release`] leaks it.
#[derive(Debug)]
pub struct ExecRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is exclusively owned and only accessed through `&self`
// or `&mut self`.
unsafe impl Send for ExecRegion {}

impl ExecRegion {
    /// Allocates `len` bytes of RWE memory from `platform`.
    pub fn allocate<P: Platform>(platform: &mut P, len: usize) -> Result<Self, ElfError> {
        if len == 0 {
            return Err(ElfError::InvalidArg);
        }

        let ptr = platform.alloc_rwe(len).ok_or(ElfError::OutOfMemory)?;
        Ok(Self { ptr, len })
    }

    /// Wraps memory obtained elsewhere.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes and must not be
    /// accessed by anything else until the region is released.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn start(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn end(&self) -> u64 {
        self.start() + self.len as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` bytes and exclusively owned.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees unique access.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Returns the memory to `platform`.
    pub fn release<P: Platform>(self, platform: &mut P) {
        // SAFETY: the region came from this platform and is consumed here.
        unsafe { platform.free(self.ptr, self.len) }
    }
}

// =============================================================================
// Section Info
// =============================================================================

/// Addresses handed to a module's `local_init` and `local_fini` routines.
///
/// Absent entries are zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionInfo {
    pub init_addr: u64,
    pub fini_addr: u64,
    pub init_array_addr: u64,
    pub init_array_size: u64,
    pub fini_array_addr: u64,
    pub fini_array_size: u64,
    pub eh_frame_addr: u64,
    pub eh_frame_size: u64,
}

// =============================================================================
// Module Image
// =============================================================================

/// Which relocation table to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaTable {
    /// `.rela.dyn`
    Dynamic,
    /// `.rela.plt`
    Plt,
}

/// A module copied into its executable region.
#[derive(Debug)]
pub struct ModuleImage<'a> {
    file: ElfFile<'a>,
    exec: ExecRegion,
    virt_base: u64,
}

impl<'a> ModuleImage<'a> {
    /// Pairs a parsed file with the region it was loaded into.
    ///
    /// On failure the region is handed back so the caller can release it.
    pub fn new(
        file: ElfFile<'a>,
        exec: ExecRegion,
        virt_base: u64,
    ) -> Result<Self, (ElfError, ExecRegion)> {
        if exec.is_empty() || exec.len() < file.image_size() {
            return Err((ElfError::InvalidArg, exec));
        }

        Ok(Self {
            file,
            exec,
            virt_base,
        })
    }

    pub fn file(&self) -> &ElfFile<'a> {
        &self.file
    }

    pub fn region(&self) -> &ExecRegion {
        &self.exec
    }

    /// Address the image is linked against at run time.
    pub fn virt_base(&self) -> u64 {
        self.virt_base
    }

    /// Loaded image contents.
    pub fn bytes(&self) -> &[u8] {
        self.exec.as_slice()
    }

    pub fn symbols(&self) -> SymbolTable<'_> {
        SymbolTable::new(self.exec.as_slice(), self.file.dynamic())
    }

    fn table(&self, table: RelaTable) -> Option<Span> {
        match table {
            RelaTable::Dynamic => self.file.dynamic().rela,
            RelaTable::Plt => self.file.dynamic().jmprel,
        }
    }

    pub fn rela_count(&self, table: RelaTable) -> usize {
        self.table(table)
            .map_or(0, |span| span.len / size_of::<Elf64Rela>())
    }

    pub fn rela(&self, table: RelaTable, index: usize) -> Result<Elf64Rela, ElfError> {
        let span = self.table(table).ok_or(ElfError::InvalidSection)?;
        if index >= self.rela_count(table) {
            return Err(ElfError::InvalidSection);
        }

        read(self.bytes(), span.offset + index * size_of::<Elf64Rela>())
            .ok_or(ElfError::InvalidSection)
    }

    /// Checks that an 8-byte write at `offset` stays inside the image.
    pub fn check_target(&self, offset: u64) -> Result<usize, ElfError> {
        let offset = usize::try_from(offset).map_err(|_| ElfError::InvalidSegment)?;
        match offset.checked_add(size_of::<u64>()) {
            Some(end) if end <= self.exec.len() => Ok(offset),
            _ => Err(ElfError::InvalidSegment),
        }
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64, ElfError> {
        let offset = self.check_target(offset)?;
        read(self.bytes(), offset).ok_or(ElfError::InvalidSegment)
    }

    pub(crate) fn write_u64(&mut self, offset: u64, value: u64) -> Result<(), ElfError> {
        let offset = self.check_target(offset)?;
        self.exec.as_mut_slice()[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn address_of(&self, span: Option<Span>) -> (u64, u64) {
        span.map_or((0, 0), |s| (self.virt_base + s.offset as u64, s.len as u64))
    }

    pub fn section_info(&self) -> SectionInfo {
        let dynamic = self.file.dynamic();
        let (init_array_addr, init_array_size) = self.address_of(dynamic.init_array);
        let (fini_array_addr, fini_array_size) = self.address_of(dynamic.fini_array);
        let (eh_frame_addr, eh_frame_size) = self.address_of(self.file.eh_frame());

        SectionInfo {
            init_addr: dynamic.init.map_or(0, |o| self.virt_base + o as u64),
            fini_addr: dynamic.fini.map_or(0, |o| self.virt_base + o as u64),
            init_array_addr,
            init_array_size,
            fini_array_addr,
            fini_array_size,
            eh_frame_addr,
            eh_frame_size,
        }
    }

    /// One descriptor per page touched by each load segment.
    ///
    /// `page_size` must be a power of two. The region need not be page
    /// aligned: a page that starts before the region is described from the
    /// region's first byte.
    pub fn memory_descriptors<P: Platform>(
        &self,
        platform: &P,
        page_size: usize,
    ) -> Vec<MemoryDescriptor> {
        let mask = !(page_size as u64 - 1);
        let base = self.exec.start();
        let mut list = Vec::new();

        for seg in self.file.segments() {
            if seg.memsz == 0 {
                continue;
            }

            let mem_type = if seg.flags.contains(SegmentFlags::EXECUTE) {
                MemoryType::READ | MemoryType::EXECUTE
            } else {
                MemoryType::READ | MemoryType::WRITE
            };

            let start = (base + seg.mem_offset as u64) & mask;
            let end = base + (seg.mem_offset + seg.memsz) as u64;

            let mut page = start;
            while page < end {
                let addr = page.max(base);
                list.push(MemoryDescriptor::new(
                    self.virt_base + (addr - base),
                    platform.virt_to_phys(addr),
                    mem_type,
                ));
                page += page_size as u64;
            }
        }

        list
    }

    /// Releases the backing region.
    pub fn release<P: Platform>(self, platform: &mut P) {
        self.exec.release(platform);
    }
}
