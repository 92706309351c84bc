//! # Test Support
//!
//! [`ModuleBuilder`] assembles small but well-formed ELF64 modules in memory,
//! and [`MockPlatform`] backs the [`Platform`] trait with the global heap.
//!
//! Module routines built here are not code. Each defined function owns an
//! 8-byte slot holding its return value, and [`MockPlatform::call`] reads that
//! slot instead of jumping to it, so lifecycle tests can run on any host.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::elf::*;
use crate::platform::Platform;
use crate::symbol::elf_hash;

pub fn put_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn put_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

// =============================================================================
// Module Builder
// =============================================================================

const HEADER_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const DYN_SIZE: usize = 16;
const SYM_SIZE: usize = 24;
const RELA_SIZE: usize = 24;
const NBUCKET: u32 = 3;

struct SymbolSpec {
    name: String,
    info: u8,
    /// Slot contents for defined symbols, `None` for imports.
    value: Option<u64>,
}

struct RelocationSpec {
    plt: bool,
    r_type: u32,
    symbol: Option<String>,
    addend: i64,
    target: Option<u64>,
}

/// A module image produced by [`ModuleBuilder::build`].
pub struct TestModule {
    pub bytes: Vec<u8>,
    /// Image offset written by each relocation, in declaration order.
    pub targets: Vec<u64>,
    symbols: Vec<(String, u64)>,
    dynamic: Vec<(i64, usize)>,
}

impl TestModule {
    /// Image offset of a defined symbol's slot.
    pub fn symbol_offset(&self, name: &str) -> Option<u64> {
        self.symbols
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, offset)| *offset)
    }

    /// File offset of the dynamic entry carrying `tag`.
    pub fn dynamic_entry(&self, tag: i64) -> Option<usize> {
        self.dynamic
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, offset)| *offset)
    }
}

/// Builder for in-memory ELF64 modules.
///
/// The image is a single RWX `PT_LOAD` segment mapped at address 0, followed
/// by an optional `PT_DYNAMIC` segment pointing back into it.
pub struct ModuleBuilder {
    machine: u16,
    symbols: Vec<SymbolSpec>,
    relocations: Vec<RelocationSpec>,
    hash: bool,
    dynamic: bool,
    bss: usize,
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self {
            machine: EM_X86_64,
            symbols: Vec::new(),
            relocations: Vec::new(),
            hash: true,
            dynamic: true,
            bss: 0,
        }
    }

    pub fn machine(mut self, e_machine: u16) -> Self {
        self.machine = e_machine;
        self
    }

    pub fn without_hash(mut self) -> Self {
        self.hash = false;
        self
    }

    pub fn without_dynamic(mut self) -> Self {
        self.dynamic = false;
        self
    }

    pub fn bss(mut self, len: usize) -> Self {
        self.bss = len;
        self
    }

    fn symbol(mut self, name: &str, bind: u8, kind: u8, value: Option<u64>) -> Self {
        self.symbols.push(SymbolSpec {
            name: name.to_string(),
            info: (bind << 4) | kind,
            value,
        });
        self
    }

    /// Global function returning `ret`.
    pub fn function(self, name: &str, ret: i64) -> Self {
        self.symbol(name, STB_GLOBAL, STT_FUNC, Some(ret as u64))
    }

    pub fn weak_function(self, name: &str, ret: i64) -> Self {
        self.symbol(name, STB_WEAK, STT_FUNC, Some(ret as u64))
    }

    pub fn local_function(self, name: &str, ret: i64) -> Self {
        self.symbol(name, STB_LOCAL, STT_FUNC, Some(ret as u64))
    }

    /// Undefined global symbol.
    pub fn import(self, name: &str) -> Self {
        self.symbol(name, STB_GLOBAL, STT_NOTYPE, None)
    }

    /// Undefined weak symbol.
    pub fn weak_import(self, name: &str) -> Self {
        self.symbol(name, STB_WEAK, STT_NOTYPE, None)
    }

    /// General relocation writing a fresh slot.
    pub fn rela(mut self, r_type: u32, symbol: Option<&str>, addend: i64) -> Self {
        self.relocations.push(RelocationSpec {
            plt: false,
            r_type,
            symbol: symbol.map(|s| s.to_string()),
            addend,
            target: None,
        });
        self
    }

    /// PLT relocation writing a fresh slot.
    pub fn plt(mut self, r_type: u32, symbol: &str) -> Self {
        self.relocations.push(RelocationSpec {
            plt: true,
            r_type,
            symbol: Some(symbol.to_string()),
            addend: 0,
            target: None,
        });
        self
    }

    /// General relocation writing an explicit image offset.
    pub fn rela_at(mut self, target: u64, r_type: u32, symbol: Option<&str>, addend: i64) -> Self {
        self.relocations.push(RelocationSpec {
            plt: false,
            r_type,
            symbol: symbol.map(|s| s.to_string()),
            addend,
            target: Some(target),
        });
        self
    }

    fn symbol_index(&self, name: &str) -> u64 {
        let pos = self
            .symbols
            .iter()
            .position(|s| s.name == name)
            .expect("relocation references an undeclared symbol");
        pos as u64 + 1
    }

    pub fn build(&self) -> TestModule {
        let nsym = self.symbols.len() + 1;
        let general: Vec<&RelocationSpec> = self.relocations.iter().filter(|r| !r.plt).collect();
        let plt: Vec<&RelocationSpec> = self.relocations.iter().filter(|r| r.plt).collect();

        // String table: leading NUL, then each name.
        let mut strtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for sym in &self.symbols {
            name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
        }

        let mut tags: Vec<(i64, u64)> = Vec::new();
        let phnum = if self.dynamic { 2 } else { 1 };

        let align8 = |v: usize| (v + 7) & !7;
        let mut off = HEADER_SIZE + phnum * PHDR_SIZE;

        // Placeholder count; tag values are filled in once the layout is known.
        let ndyn = if self.dynamic {
            5 + usize::from(self.hash)
                + if general.is_empty() { 0 } else { 3 }
                + if plt.is_empty() { 0 } else { 3 }
        } else {
            0
        };
        let dynamic_offset = off;
        off += ndyn * DYN_SIZE;

        let symtab_offset = off;
        off += nsym * SYM_SIZE;

        let strtab_offset = off;
        off = align8(off + strtab.len());

        let hash_offset = off;
        if self.hash {
            off = align8(off + (2 + NBUCKET as usize + nsym) * 4);
        }

        let rela_offset = off;
        off += general.len() * RELA_SIZE;

        let plt_offset = off;
        off += plt.len() * RELA_SIZE;

        let mut symbols = Vec::new();
        let mut sym_values = vec![0u64; nsym];
        for (i, sym) in self.symbols.iter().enumerate() {
            if sym.value.is_some() {
                sym_values[i + 1] = off as u64;
                symbols.push((sym.name.clone(), off as u64));
                off += 8;
            }
        }

        let mut targets = Vec::new();
        for reloc in self.relocations.iter() {
            match reloc.target {
                Some(target) => targets.push(target),
                None => {
                    targets.push(off as u64);
                    off += 8;
                }
            }
        }

        let file_len = off;
        let mut bytes = vec![0u8; file_len];

        // ELF header
        bytes[..4].copy_from_slice(&ELF_MAGIC);
        bytes[4] = ELFCLASS64;
        bytes[5] = ELFDATA2LSB;
        bytes[6] = EV_CURRENT;
        put_u16(&mut bytes, 16, ET_DYN);
        put_u16(&mut bytes, 18, self.machine);
        put_u32(&mut bytes, 20, 1);
        put_u64(&mut bytes, 32, HEADER_SIZE as u64);
        put_u16(&mut bytes, 52, HEADER_SIZE as u16);
        put_u16(&mut bytes, 54, PHDR_SIZE as u16);
        put_u16(&mut bytes, 56, phnum as u16);
        put_u16(&mut bytes, 58, 64);

        // PT_LOAD covering the whole file
        let ph = HEADER_SIZE;
        put_u32(&mut bytes, ph, PT_LOAD);
        put_u32(&mut bytes, ph + 4, 7);
        put_u64(&mut bytes, ph + 32, file_len as u64);
        put_u64(&mut bytes, ph + 40, (file_len + self.bss) as u64);
        put_u64(&mut bytes, ph + 48, 0x1000);

        let mut dynamic = Vec::new();
        if self.dynamic {
            let ph = HEADER_SIZE + PHDR_SIZE;
            put_u32(&mut bytes, ph, PT_DYNAMIC);
            put_u32(&mut bytes, ph + 4, 6);
            put_u64(&mut bytes, ph + 8, dynamic_offset as u64);
            put_u64(&mut bytes, ph + 16, dynamic_offset as u64);
            put_u64(&mut bytes, ph + 32, (ndyn * DYN_SIZE) as u64);
            put_u64(&mut bytes, ph + 40, (ndyn * DYN_SIZE) as u64);
            put_u64(&mut bytes, ph + 48, 8);

            tags.push((DT_STRTAB, strtab_offset as u64));
            tags.push((DT_STRSZ, strtab.len() as u64));
            tags.push((DT_SYMTAB, symtab_offset as u64));
            tags.push((DT_SYMENT, SYM_SIZE as u64));
            if self.hash {
                tags.push((DT_HASH, hash_offset as u64));
            }
            if !general.is_empty() {
                tags.push((DT_RELA, rela_offset as u64));
                tags.push((DT_RELASZ, (general.len() * RELA_SIZE) as u64));
                tags.push((DT_RELAENT, RELA_SIZE as u64));
            }
            if !plt.is_empty() {
                tags.push((DT_JMPREL, plt_offset as u64));
                tags.push((DT_PLTRELSZ, (plt.len() * RELA_SIZE) as u64));
                tags.push((DT_PLTREL, DT_RELA as u64));
            }
            tags.push((DT_NULL, 0));

            for (i, (tag, value)) in tags.iter().enumerate() {
                let entry = dynamic_offset + i * DYN_SIZE;
                put_u64(&mut bytes, entry, *tag as u64);
                put_u64(&mut bytes, entry + 8, *value);
                dynamic.push((*tag, entry));
            }
        }

        // Symbol table, entry 0 stays null
        for (i, sym) in self.symbols.iter().enumerate() {
            let entry = symtab_offset + (i + 1) * SYM_SIZE;
            put_u32(&mut bytes, entry, name_offsets[i]);
            bytes[entry + 4] = sym.info;
            if sym.value.is_some() {
                put_u16(&mut bytes, entry + 6, 1);
                put_u64(&mut bytes, entry + 16, 8);
            }
            put_u64(&mut bytes, entry + 8, sym_values[i + 1]);
        }

        bytes[strtab_offset..strtab_offset + strtab.len()].copy_from_slice(&strtab);

        if self.hash {
            let mut buckets = vec![0u32; NBUCKET as usize];
            let mut chains = vec![0u32; nsym];
            for (i, sym) in self.symbols.iter().enumerate() {
                let index = i + 1;
                let bucket = (elf_hash(sym.name.as_bytes()) % NBUCKET) as usize;
                chains[index] = buckets[bucket];
                buckets[bucket] = index as u32;
            }

            put_u32(&mut bytes, hash_offset, NBUCKET);
            put_u32(&mut bytes, hash_offset + 4, nsym as u32);
            for (i, b) in buckets.iter().chain(chains.iter()).enumerate() {
                put_u32(&mut bytes, hash_offset + 8 + i * 4, *b);
            }
        }

        let mut general_i = 0;
        let mut plt_i = 0;
        for (reloc, target) in self.relocations.iter().zip(targets.iter()) {
            let entry = if reloc.plt {
                plt_i += 1;
                plt_offset + (plt_i - 1) * RELA_SIZE
            } else {
                general_i += 1;
                rela_offset + (general_i - 1) * RELA_SIZE
            };
            let sym = reloc.symbol.as_deref().map_or(0, |name| self.symbol_index(name));

            put_u64(&mut bytes, entry, *target);
            put_u64(&mut bytes, entry + 8, (sym << 32) | reloc.r_type as u64);
            put_u64(&mut bytes, entry + 16, reloc.addend as u64);
        }

        for (i, sym) in self.symbols.iter().enumerate() {
            if let Some(value) = sym.value {
                put_u64(&mut bytes, sym_values[i + 1] as usize, value);
            }
        }

        TestModule {
            bytes,
            targets,
            symbols,
            dynamic,
        }
    }
}

// =============================================================================
// Mock Platform
// =============================================================================

/// Offset added to a virtual address to form its fake physical address.
pub const PHYS_OFFSET: u64 = 0x1_0000_0000;

const PAGE_ALIGN: usize = 0x1000;

/// One recorded call into a module routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryCall {
    pub entry: u64,
    pub arg0: u64,
    pub arg1: u64,
}

/// Heap-backed [`Platform`] that records every routine call.
#[derive(Debug, Default)]
pub struct MockPlatform {
    pub calls: Vec<EntryCall>,
    pub live_allocations: usize,
    pub fail_alloc: bool,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self, len: usize) -> Option<NonNull<u8>> {
        if self.fail_alloc || len == 0 {
            return None;
        }

        let layout = Layout::from_size_align(len, PAGE_ALIGN).ok()?;
        // SAFETY: layout has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        self.live_allocations += 1;
        Some(ptr)
    }

    /// Entries called so far, in call order.
    pub fn called(&self) -> Vec<u64> {
        self.calls.iter().map(|c| c.entry).collect()
    }
}

impl Platform for MockPlatform {
    fn alloc_rw(&mut self, len: usize) -> Option<NonNull<u8>> {
        self.allocate(len)
    }

    fn alloc_rwe(&mut self, len: usize) -> Option<NonNull<u8>> {
        self.allocate(len)
    }

    unsafe fn free(&mut self, addr: NonNull<u8>, len: usize) {
        if let Ok(layout) = Layout::from_size_align(len, PAGE_ALIGN) {
            dealloc(addr.as_ptr(), layout);
            self.live_allocations -= 1;
        }
    }

    fn virt_to_phys(&self, virt: u64) -> u64 {
        virt.wrapping_add(PHYS_OFFSET)
    }

    unsafe fn call(&mut self, entry: u64, arg0: u64, arg1: u64) -> i64 {
        self.calls.push(EntryCall { entry, arg0, arg1 });
        core::ptr::read_unaligned(entry as *const i64)
    }
}
