//! Call graph assembly, entrypoint/priority model, and preemption-aware
//! worst-case stack composition.

mod compose;
mod config;
mod entrypoints;
mod graph;

pub use compose::*;
pub use config::*;
pub use entrypoints::*;
pub use graph::*;

use thiserror::Error;

/// Configuration errors (schema violations and unknown symbols in hints).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported config version {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("priority group {0} out of range 0..=3")]
    BadPriorityGroup(i64),
    #[error("interrupt number {0} out of range 0..32")]
    BadInterruptNumber(i64),
    #[error("interrupt number {0} configured twice")]
    DuplicateInterrupt(u32),
    #[error("dynamic call site `{0}` is neither `0x<hex>` nor `<symbol>+<offset>`")]
    BadCallSite(String),
    #[error("dynamic call site `{0}` has no targets")]
    EmptyTargets(String),
    #[error("dynamic call site `{0}` configured twice")]
    DuplicateCallSite(String),
    #[error("unknown symbol `{0}` in config")]
    UnknownSymbol(String),
}

/// Entrypoint extraction errors: the vector table disagrees with the symbol
/// table or with the config.
#[derive(Error, Debug)]
pub enum EntrypointError {
    #[error(transparent)]
    Elf(#[from] stackmax_elf::ElfError),
    #[error("missing vector table entry for `{0}`")]
    MissingVector(&'static str),
    #[error("vector #{index} points to {address:#06x}, which is not a function")]
    VectorNotAFunction { index: usize, address: u32 },
}
