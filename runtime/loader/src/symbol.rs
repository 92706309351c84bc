//! # Symbol Resolver
//!
//! Looks symbols up by name, first within one module's dynamic symbol table
//! and then across every registered module in registration order.
//!
//! A symbol is a candidate when it is defined (non-zero value), visible
//! outside its module (not `STB_LOCAL`) and its name matches exactly. The
//! first global definition wins, within a module and across modules. A weak definition is only used when no
//! module provides a global one.

use core::mem::size_of;

use crate::elf::{c_str, read, DynamicInfo, Elf64Sym, HashTable, Span, STB_LOCAL, STB_WEAK, STN_UNDEF};
use crate::error::ElfError;
use crate::registry::{ModuleId, Registry};

/// SysV ELF hash of a symbol name.
pub fn elf_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;

    for &c in name {
        h = (h << 4).wrapping_add(c as u32);
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }

    h
}

/// Read-only view over one image's dynamic symbol table.
#[derive(Debug, Clone, Copy)]
pub struct SymbolTable<'i> {
    image: &'i [u8],
    symtab: Option<Span>,
    strtab: Option<Span>,
    hash: Option<HashTable>,
}

impl<'i> SymbolTable<'i> {
    pub fn new(image: &'i [u8], dynamic: &DynamicInfo) -> Self {
        Self {
            image,
            symtab: dynamic.symtab,
            strtab: dynamic.strtab,
            hash: dynamic.hash,
        }
    }

    pub fn len(&self) -> usize {
        self.symtab.map_or(0, |s| s.len / size_of::<Elf64Sym>())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Symbol at `index`.
    pub fn get(&self, index: usize) -> Result<Elf64Sym, ElfError> {
        let symtab = self.symtab.ok_or(ElfError::InvalidSection)?;
        if index >= self.len() {
            return Err(ElfError::InvalidSection);
        }

        read(self.image, symtab.offset + index * size_of::<Elf64Sym>())
            .ok_or(ElfError::InvalidSection)
    }

    /// Name of `sym` from the string table.
    pub fn name(&self, sym: &Elf64Sym) -> Result<&'i [u8], ElfError> {
        let strtab = self.strtab.ok_or(ElfError::InvalidSection)?;
        let table = self
            .image
            .get(strtab.offset..strtab.end())
            .ok_or(ElfError::InvalidSection)?;

        c_str(table, sym.st_name as usize).ok_or(ElfError::InvalidSection)
    }

    /// Candidate named `name`, with its index.
    ///
    /// A global definition is preferred over a weak one of the same name.
    pub fn lookup(&self, name: &[u8]) -> Option<(usize, Elf64Sym)> {
        match self.hash {
            Some(hash) => self.best(self.chain(&hash, name), name),
            None => self.best(0..self.len(), name),
        }
    }

    /// Indices on the hash chain for `name`.
    fn chain(&self, hash: &HashTable, name: &[u8]) -> impl Iterator<Item = usize> + 'i {
        let image = self.image;
        let nchain = hash.nchain;
        let buckets = hash.offset + 8;
        let chains = buckets + hash.nbucket as usize * 4;

        let bucket = elf_hash(name) % hash.nbucket;
        let first: Option<u32> = read(image, buckets + bucket as usize * 4);

        // A chain never visits more entries than the table holds.
        core::iter::successors(first, move |&index| read(image, chains + index as usize * 4))
            .take_while(move |&index| index != STN_UNDEF && index < nchain)
            .take(nchain as usize)
            .map(|index| index as usize)
    }

    fn best(&self, indices: impl Iterator<Item = usize>, name: &[u8]) -> Option<(usize, Elf64Sym)> {
        let mut weak = None;

        for index in indices {
            let Some(found) = self.accept(index, name) else {
                continue;
            };

            if found.1.sym_bind() != STB_WEAK {
                return Some(found);
            }
            weak.get_or_insert(found);
        }

        weak
    }

    fn accept(&self, index: usize, name: &[u8]) -> Option<(usize, Elf64Sym)> {
        let sym = self.get(index).ok()?;

        if sym.st_value == 0 || sym.sym_bind() == STB_LOCAL {
            return None;
        }

        (self.name(&sym).ok()? == name).then_some((index, sym))
    }
}

/// A symbol found in a registered module.
#[derive(Debug, Clone, Copy)]
pub struct SymbolMatch {
    pub module: ModuleId,
    pub index: usize,
    pub symbol: Elf64Sym,
    /// Run-time address: the defining module's base plus the symbol value.
    pub address: u64,
}

impl SymbolMatch {
    pub fn is_weak(&self) -> bool {
        self.symbol.sym_bind() == STB_WEAK
    }
}

/// Finds `name` across the registry.
pub fn find(registry: &Registry<'_>, name: &[u8]) -> Option<SymbolMatch> {
    let mut weak = None;

    for (module, image) in registry.iter() {
        let Some((index, symbol)) = image.symbols().lookup(name) else {
            continue;
        };

        let found = SymbolMatch {
            module,
            index,
            symbol,
            address: image.virt_base().wrapping_add(symbol.st_value),
        };

        if !found.is_weak() {
            return Some(found);
        }

        if weak.is_none() {
            weak = Some(found);
        }
    }

    weak
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{ElfFile, Machine, STB_GLOBAL};
    use crate::testing::{MockPlatform, ModuleBuilder, TestModule};

    #[test]
    fn test_elf_hash() {
        assert_eq!(elf_hash(b""), 0);
        assert_eq!(elf_hash(b"printf"), 0x077905a6);
        assert_eq!(elf_hash(b"start_vmm"), 0x089a179d);
    }

    fn table_lookup(module: &TestModule, name: &str) -> Option<u64> {
        let file = ElfFile::parse(&module.bytes, Machine::X86_64).unwrap();
        let table = SymbolTable::new(&module.bytes, file.dynamic());
        table.lookup(name.as_bytes()).map(|(_, sym)| sym.st_value)
    }

    #[test]
    fn test_lookup_hashed_and_linear_agree() {
        let names = ["alpha", "beta", "gamma", "delta", "epsilon"];
        let hashed = names.iter().fold(ModuleBuilder::new(), |b, n| b.function(n, 0));
        let linear = names
            .iter()
            .fold(ModuleBuilder::new().without_hash(), |b, n| b.function(n, 0));

        let hashed_module = hashed.build();
        let linear_module = linear.build();

        for name in names {
            let expected = hashed_module.symbol_offset(name);
            assert!(expected.is_some());
            assert_eq!(table_lookup(&hashed_module, name), expected);
            assert_eq!(table_lookup(&linear_module, name), linear_module.symbol_offset(name));
        }
    }

    #[test]
    fn test_lookup_rejects_local_and_undefined() {
        let module = ModuleBuilder::new()
            .local_function("hidden", 0)
            .import("extern_fn")
            .function("start", 0)
            .build();

        assert!(table_lookup(&module, "hidden").is_none());
        assert!(table_lookup(&module, "extern_fn").is_none());
        assert!(table_lookup(&module, "sta").is_none());
        assert!(table_lookup(&module, "start_vmm").is_none());
        assert!(table_lookup(&module, "start").is_some());
    }

    #[test]
    fn test_symbol_name_and_binding() {
        let module = ModuleBuilder::new()
            .function("exported", 0)
            .weak_function("fallback", 0)
            .build();
        let file = ElfFile::parse(&module.bytes, Machine::X86_64).unwrap();
        let table = SymbolTable::new(&module.bytes, file.dynamic());

        assert_eq!(table.len(), 3);
        let first = table.get(1).unwrap();
        assert_eq!(table.name(&first).unwrap(), b"exported");
        assert_eq!(first.sym_bind(), STB_GLOBAL);
        assert_eq!(table.get(2).unwrap().sym_bind(), STB_WEAK);
        assert_eq!(table.get(3).unwrap_err(), ElfError::InvalidSection);
    }

    fn bind_of(module: &TestModule, name: &str) -> Option<u8> {
        let file = ElfFile::parse(&module.bytes, Machine::X86_64).unwrap();
        let table = SymbolTable::new(&module.bytes, file.dynamic());
        table.lookup(name.as_bytes()).map(|(_, sym)| sym.sym_bind())
    }

    #[test]
    fn test_lookup_prefers_global_within_module() {
        // Hash chains visit later symbols first, the linear scan earlier ones.
        let hashed = ModuleBuilder::new()
            .function("hook", 0)
            .weak_function("hook", 0)
            .build();
        let linear = ModuleBuilder::new()
            .without_hash()
            .weak_function("hook", 0)
            .function("hook", 0)
            .build();
        let weak_only = ModuleBuilder::new().weak_function("hook", 0).build();

        assert_eq!(bind_of(&hashed, "hook"), Some(STB_GLOBAL));
        assert_eq!(bind_of(&linear, "hook"), Some(STB_GLOBAL));
        assert_eq!(bind_of(&weak_only, "hook"), Some(STB_WEAK));
    }

    #[test]
    fn test_find_keeps_global_from_earlier_module() {
        let mixed = ModuleBuilder::new()
            .function("hook", 0)
            .weak_function("hook", 0)
            .build();
        let later = ModuleBuilder::new().function("hook", 0).build();
        let mut platform = MockPlatform::new();
        let mut registry = Registry::new();
        registry.load(&mut platform, &mixed.bytes, Machine::X86_64).unwrap();
        registry.load(&mut platform, &later.bytes, Machine::X86_64).unwrap();

        let found = find(&registry, b"hook").unwrap();
        assert_eq!(found.module, ModuleId(0));
        assert!(!found.is_weak());

        registry.release_all(&mut platform);
    }
}
