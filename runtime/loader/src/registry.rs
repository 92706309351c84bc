//! # Module Registry
//!
//! Fixed-capacity, ordered collection of loaded module images. Registration
//! order is resolution order, and modules are addressed by [`ModuleId`]
//! (their slot index) rather than by pointer.

use alloc::vec::Vec;
use core::fmt;

use log::debug;

use crate::elf::{ElfFile, Machine};
use crate::error::ElfError;
use crate::image::{ExecRegion, ModuleImage, SectionInfo};
use crate::platform::Platform;
use crate::reloc;
use crate::symbol;

/// Compile-time upper bound on registered modules.
pub const MAX_NUM_MODULES: usize = 100;

/// Slot index of a registered module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(pub usize);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Ordered set of loaded modules.
///
/// The registry owns every image's executable region. Regions go back to the
/// platform through [`Registry::release_all`]; dropping a non-empty registry
/// leaks them.
#[derive(Debug)]
pub struct Registry<'a> {
    slots: Vec<Option<ModuleImage<'a>>>,
    count: usize,
    relocated: bool,
}

impl Default for Registry<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Registry<'a> {
    pub fn new() -> Self {
        Self::with_capacity(MAX_NUM_MODULES)
    }

    /// Creates a registry holding at most `min(capacity, MAX_NUM_MODULES)` modules.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_NUM_MODULES);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Self {
            slots,
            count: 0,
            relocated: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    /// Whether [`Registry::relocate_all`] has completed since the last change.
    pub fn is_relocated(&self) -> bool {
        self.relocated
    }

    /// Whether this exact file buffer is already registered.
    pub fn contains_buffer(&self, bytes: &[u8]) -> bool {
        self.iter().any(|(_, image)| {
            let file = image.file().bytes();
            core::ptr::eq(file.as_ptr(), bytes.as_ptr()) && file.len() == bytes.len()
        })
    }

    /// Registers a loaded image.
    ///
    /// On failure the region is handed back so the caller can release it.
    pub fn add(
        &mut self,
        file: ElfFile<'a>,
        exec: ExecRegion,
        virt_base: u64,
    ) -> Result<ModuleId, (ElfError, ExecRegion)> {
        if exec.is_empty() || exec.len() < file.image_size() {
            return Err((ElfError::InvalidArg, exec));
        }
        if self.is_full() {
            return Err((ElfError::LoaderFull, exec));
        }
        if self.contains_buffer(file.bytes()) {
            return Err((ElfError::InvalidArg, exec));
        }

        let image = ModuleImage::new(file, exec, virt_base)?;
        let id = ModuleId(self.count);

        debug!(
            "module {}: [{:#x}, {:#x}) base {:#x}",
            id,
            image.region().start(),
            image.region().end(),
            virt_base
        );

        self.slots[self.count] = Some(image);
        self.count += 1;
        self.relocated = false;

        Ok(id)
    }

    /// Parses `bytes`, copies it into fresh RWE memory and registers it.
    ///
    /// The image is linked to run where it was allocated. Nothing is leaked
    /// on failure.
    pub fn load<P: Platform>(
        &mut self,
        platform: &mut P,
        bytes: &'a [u8],
        machine: Machine,
    ) -> Result<ModuleId, ElfError> {
        if bytes.is_empty() {
            return Err(ElfError::InvalidArg);
        }
        if self.is_full() {
            return Err(ElfError::LoaderFull);
        }
        if self.contains_buffer(bytes) {
            return Err(ElfError::InvalidArg);
        }

        let file = ElfFile::parse(bytes, machine)?;
        let mut exec = ExecRegion::allocate(platform, file.image_size())?;

        if let Err(err) = file.load_into(exec.as_mut_slice()) {
            exec.release(platform);
            return Err(err);
        }

        let virt_base = exec.start();
        self.add(file, exec, virt_base).map_err(|(err, exec)| {
            exec.release(platform);
            err
        })
    }

    pub fn image(&self, id: ModuleId) -> Result<&ModuleImage<'a>, ElfError> {
        self.slots
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(ElfError::InvalidArg)
    }

    pub(crate) fn image_mut(&mut self, id: ModuleId) -> Result<&mut ModuleImage<'a>, ElfError> {
        self.slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(ElfError::InvalidArg)
    }

    /// Registered modules in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (ModuleId, &ModuleImage<'a>)> + '_ {
        self.slots[..self.count]
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|image| (ModuleId(i), image)))
    }

    /// Relocates every module in registration order, stopping at the first
    /// failure.
    pub fn relocate_all(&mut self) -> Result<(), ElfError> {
        self.relocated = false;

        for i in 0..self.count {
            reloc::relocate(self, ModuleId(i))?;
        }

        self.relocated = true;
        Ok(())
    }

    /// Run-time address of `name`, searched across all modules.
    pub fn resolve_symbol(&self, name: &str) -> Result<u64, ElfError> {
        symbol::find(self, name.as_bytes())
            .map(|found| found.address)
            .ok_or(ElfError::NoSuchSymbol)
    }

    /// Run-time address of `name`, searched in module `id` only.
    pub fn resolve_in(&self, id: ModuleId, name: &str) -> Result<u64, ElfError> {
        let image = self.image(id)?;
        let (_, sym) = image
            .symbols()
            .lookup(name.as_bytes())
            .ok_or(ElfError::NoSuchSymbol)?;

        Ok(image.virt_base().wrapping_add(sym.st_value))
    }

    pub fn section_info(&self, id: ModuleId) -> Result<SectionInfo, ElfError> {
        Ok(self.image(id)?.section_info())
    }

    /// Returns every region to `platform` and empties the registry.
    pub fn release_all<P: Platform>(&mut self, platform: &mut P) {
        for slot in self.slots.iter_mut() {
            if let Some(image) = slot.take() {
                image.release(platform);
            }
        }

        self.count = 0;
        self.relocated = false;
    }
}
