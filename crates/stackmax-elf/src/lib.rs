//! ELF parser for ARM Cortex-M binaries.

mod constants;
mod file;
mod image;

pub use constants::*;
pub use file::*;
pub use image::*;

use thiserror::Error;

/// ELF parsing errors.
#[derive(Error, Debug)]
pub enum ElfError {
    #[error("ELF data too small")]
    TooSmall,
    #[error("Invalid ELF magic number")]
    InvalidMagic,
    #[error("Only little-endian ELF supported")]
    NotLittleEndian,
    #[error("Only 32-bit ELF supported, got class {0}")]
    UnsupportedClass(u8),
    #[error("Not an ARM ELF: machine type {0}")]
    NotArm(u16),
    #[error("Not an executable ELF: type {0}")]
    NotExecutable(u16),
    #[error("Section header out of bounds")]
    SectionOutOfBounds,
    #[error("Symbol table entry out of bounds")]
    SymbolOutOfBounds,
    #[error("No symbol table (.symtab) section; the binary appears to be stripped")]
    MissingSymbolTable,
    #[error("No .text section")]
    MissingTextSection,
    #[error("No vector table section (tried {0})")]
    MissingVectorTable(String),
    #[error("Multiple vector table sections found")]
    AmbiguousVectorTable,
    #[error("Vector table has {0} bytes, expected a multiple of 4 covering 16..=48 words")]
    BadVectorTableSize(usize),
    #[error("Thumb bit not set on function symbol `{name}` at {address:#06x}")]
    MissingThumbBit { name: String, address: u32 },
    #[error("Thumb bit not set on vector #{index} ({address:#06x}); this would HardFault")]
    VectorMissingThumbBit { index: usize, address: u32 },
    #[error("Unaligned mapping symbol at {0:#06x}")]
    UnalignedMarker(u32),
    #[error("Duplicate mapping symbol at {0:#06x}")]
    DuplicateMarker(u32),
    #[error("Symbol size mismatch at {0:#06x}")]
    SymbolSizeMismatch(u32),
    #[error("Function at {0:#06x} (size {1}) overlaps the next function at {2:#06x}")]
    OverlappingFunctions(u32, u32, u32),
    #[error("Duplicate function name `{0}`")]
    DuplicateFunctionName(String),
    #[error("Function `{name}` at {address:#06x} does not start with a code region")]
    FunctionStartsWithData { name: String, address: u32 },
}

pub type Result<T> = std::result::Result<T, ElfError>;
