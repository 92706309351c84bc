//! Loader error taxonomy.

use core::fmt;

/// Errors raised while parsing, registering, resolving or relocating modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// Empty, truncated or otherwise malformed argument.
    InvalidArg,
    /// The buffer does not start with the ELF magic.
    InvalidSignature,
    /// Valid ELF, but not a file this loader can run.
    UnsupportedFile,
    /// A program header or relocation target lies outside the image.
    InvalidSegment,
    /// A dynamic-section table lies outside the image or is malformed.
    InvalidSection,
    /// The registry already holds its maximum number of modules.
    LoaderFull,
    /// No registered module defines the requested symbol.
    NoSuchSymbol,
    /// Relocation kind not handled by the relocation engine.
    UnsupportedRela,
    /// The platform allocator could not satisfy a request.
    OutOfMemory,
}

impl ElfError {
    /// Numeric code reported across the management interface.
    pub const fn code(self) -> i64 {
        match self {
            ElfError::InvalidArg => -1,
            ElfError::InvalidSignature => -2,
            ElfError::UnsupportedFile => -3,
            ElfError::InvalidSegment => -4,
            ElfError::InvalidSection => -5,
            ElfError::LoaderFull => -6,
            ElfError::NoSuchSymbol => -7,
            ElfError::UnsupportedRela => -8,
            ElfError::OutOfMemory => -9,
        }
    }

    /// Inverse of [`ElfError::code`].
    pub const fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            -1 => ElfError::InvalidArg,
            -2 => ElfError::InvalidSignature,
            -3 => ElfError::UnsupportedFile,
            -4 => ElfError::InvalidSegment,
            -5 => ElfError::InvalidSection,
            -6 => ElfError::LoaderFull,
            -7 => ElfError::NoSuchSymbol,
            -8 => ElfError::UnsupportedRela,
            -9 => ElfError::OutOfMemory,
            _ => return None,
        })
    }
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElfError::InvalidArg => write!(f, "Invalid argument"),
            ElfError::InvalidSignature => write!(f, "Invalid ELF signature"),
            ElfError::UnsupportedFile => write!(f, "Unsupported ELF file"),
            ElfError::InvalidSegment => write!(f, "Invalid segment"),
            ElfError::InvalidSection => write!(f, "Invalid section"),
            ElfError::LoaderFull => write!(f, "Loader is full"),
            ElfError::NoSuchSymbol => write!(f, "Unable to find symbol"),
            ElfError::UnsupportedRela => write!(f, "Unsupported relocation type"),
            ElfError::OutOfMemory => write!(f, "Out of memory"),
        }
    }
}
