//! Thumbv6-m (ARMv6-M) instruction decoder.
//!
//! Decodes the complete 16/32-bit Thumb instruction set implemented by the
//! Cortex-M0. Every encoding defined by the architecture decodes to an
//! [`Op`] plus an argument pattern; reserved and unpredictable encodings are
//! rejected.

mod decode;
mod registers;

pub use decode::*;
pub use registers::*;

use thiserror::Error;

/// Decoding errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Instruction truncated at {0:#06x}")]
    Truncated(u32),
    #[error("Undefined encoding {opcode:#06x} at {address:#06x}")]
    Undefined { opcode: u32, address: u32 },
    #[error("Unpredictable encoding {opcode:#06x} at {address:#06x}")]
    Unpredictable { opcode: u32, address: u32 },
}

pub type Result<T> = std::result::Result<T, DecodeError>;
