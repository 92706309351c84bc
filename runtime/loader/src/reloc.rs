//! # Relocation Engine
//!
//! Applies a module's `.rela.dyn` and `.rela.plt` entries to its loaded
//! image. Every write is an absolute 64-bit value, so relocating the same
//! module twice produces the same image.

use log::{error, trace};

use crate::elf::{Elf64Rela, Machine, STB_WEAK};
use crate::error::ElfError;
use crate::image::{ModuleImage, RelaTable};
use crate::registry::{ModuleId, Registry};
use crate::symbol;

/// x86_64 relocation types.
pub mod r_x86_64 {
    pub const R_X86_64_NONE: u32 = 0;
    pub const R_X86_64_64: u32 = 1;
    pub const R_X86_64_PC32: u32 = 2;
    pub const R_X86_64_GLOB_DAT: u32 = 6;
    pub const R_X86_64_JUMP_SLOT: u32 = 7;
    pub const R_X86_64_RELATIVE: u32 = 8;
}

/// AArch64 relocation types.
pub mod r_aarch64 {
    pub const R_AARCH64_NONE: u32 = 0;
    pub const R_AARCH64_ABS64: u32 = 257;
    pub const R_AARCH64_GLOB_DAT: u32 = 1025;
    pub const R_AARCH64_JUMP_SLOT: u32 = 1026;
    pub const R_AARCH64_RELATIVE: u32 = 1027;
}

/// Relocation kinds the engine understands, independent of machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// `S + A`
    Absolute64,
    /// `S`
    GlobalData,
    /// `S`
    JumpSlot,
    /// `B + A`
    Relative,
}

impl RelocKind {
    pub fn decode(machine: Machine, r_type: u32) -> Result<Self, ElfError> {
        use r_aarch64::*;
        use r_x86_64::*;

        let kind = match (machine, r_type) {
            (Machine::X86_64, R_X86_64_64) => RelocKind::Absolute64,
            (Machine::X86_64, R_X86_64_GLOB_DAT) => RelocKind::GlobalData,
            (Machine::X86_64, R_X86_64_JUMP_SLOT) => RelocKind::JumpSlot,
            (Machine::X86_64, R_X86_64_RELATIVE) => RelocKind::Relative,
            (Machine::Aarch64, R_AARCH64_ABS64) => RelocKind::Absolute64,
            (Machine::Aarch64, R_AARCH64_GLOB_DAT) => RelocKind::GlobalData,
            (Machine::Aarch64, R_AARCH64_JUMP_SLOT) => RelocKind::JumpSlot,
            (Machine::Aarch64, R_AARCH64_RELATIVE) => RelocKind::Relative,
            _ => return Err(ElfError::UnsupportedRela),
        };

        Ok(kind)
    }
}

/// Relocates module `id`, returning the number of entries applied.
pub fn relocate(registry: &mut Registry<'_>, id: ModuleId) -> Result<usize, ElfError> {
    let mut applied = 0;

    for table in [RelaTable::Dynamic, RelaTable::Plt] {
        let count = registry.image(id)?.rela_count(table);

        for index in 0..count {
            let (offset, value) = {
                let image = registry.image(id)?;
                let rela = image.rela(table, index)?;
                image.check_target(rela.r_offset)?;
                (rela.r_offset, target_value(registry, image, &rela)?)
            };

            registry.image_mut(id)?.write_u64(offset, value)?;
            applied += 1;
        }
    }

    trace!("module {}: applied {} relocations", id, applied);
    Ok(applied)
}

fn target_value(
    registry: &Registry<'_>,
    image: &ModuleImage<'_>,
    rela: &Elf64Rela,
) -> Result<u64, ElfError> {
    let addend = rela.r_addend as u64;

    match RelocKind::decode(image.file().machine(), rela.r_type())? {
        RelocKind::Relative => Ok(image.virt_base().wrapping_add(addend)),
        RelocKind::Absolute64 => Ok(symbol_base(registry, image, rela.r_sym())?.wrapping_add(addend)),
        RelocKind::GlobalData | RelocKind::JumpSlot => symbol_base(registry, image, rela.r_sym()),
    }
}

/// Run-time address of the symbol a relocation refers to.
///
/// Strong definitions in the relocating module bind locally. Weak and
/// undefined symbols are looked up across the registry, so a later global
/// definition overrides a weak one.
fn symbol_base(registry: &Registry<'_>, image: &ModuleImage<'_>, index: u32) -> Result<u64, ElfError> {
    let symbols = image.symbols();
    let sym = symbols.get(index as usize)?;

    if sym.sym_bind() != STB_WEAK && sym.st_value != 0 {
        return Ok(image.virt_base().wrapping_add(sym.st_value));
    }

    let name = symbols.name(&sym)?;
    match symbol::find(registry, name) {
        Some(found) => Ok(found.address),
        None => {
            error!(
                "unable to resolve symbol: {}",
                core::str::from_utf8(name).unwrap_or("<invalid>")
            );
            Err(ElfError::NoSuchSymbol)
        }
    }
}
