//! # hvlink loader: ELF64 Module Linker
//!
//! Turns position-independent ELF64 modules into runnable images for the
//! hypervisor runtime. Modules are parsed, copied into executable memory
//! obtained from the host, and linked against each other in registration
//! order.
//!
//! ## Pipeline
//!
//! 1. [`ElfFile::parse`] validates a file buffer and indexes its tables
//! 2. [`Registry::load`] copies it into an [`ExecRegion`] and registers it
//! 3. [`Registry::relocate_all`] applies every module's RELA entries
//! 4. [`Registry::resolve_symbol`] finds entry points for the caller to run
//!
//! ## Supported Input
//!
//! - 64-bit little-endian System V objects (`ET_DYN` or `ET_EXEC`)
//! - x86_64 and AArch64
//! - `RELATIVE`, `ABS64`, `GLOB_DAT` and `JUMP_SLOT` relocations
//!
//! Anything that touches the host (allocation, address translation, calling
//! into a module) goes through the [`Platform`] trait.

#![no_std]

extern crate alloc;

pub mod elf;
pub mod error;
pub mod image;
pub mod platform;
pub mod registry;
pub mod reloc;
pub mod symbol;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use elf::{ElfFile, Machine};
pub use error::ElfError;
pub use image::{ExecRegion, ModuleImage, RelaTable, SectionInfo};
pub use platform::{MemoryDescriptor, MemoryType, Platform, ENTRY_SUCCESS};
pub use registry::{ModuleId, Registry, MAX_NUM_MODULES};
pub use symbol::{elf_hash, SymbolMatch};
