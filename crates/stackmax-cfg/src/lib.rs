//! Per-function control-flow and worst-case stack-depth analysis.

mod analyzer;
mod effects;

pub use analyzer::*;
pub use effects::*;

use stackmax_isa::DecodeError;
use thiserror::Error;

/// How a basic block hands off control.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Terminator {
    /// Falls into the next block (no control-transfer instruction).
    FallThrough,
    /// Conditional branch: taken edge plus fall-through.
    BranchConditional,
    /// Unconditional branch, including resolved jump tables.
    Branch,
    /// Call; execution resumes after the call site.
    Call,
    /// Function return.
    Return,
    /// No successor: UDF, a no-return call, or a tail jump out of the
    /// function.
    Terminal,
}

/// Call target as seen by the function analyzer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetSpec {
    /// Direct or locally resolved call target address.
    Resolved(u32),
    /// Indirect call/branch that needs a configuration hint.
    Indirect,
}

/// One call site inside a function.
#[derive(Clone, Debug)]
pub struct CallSite {
    /// Address of the calling instruction.
    pub address: u32,
    /// Bytes of stack the caller occupies when control transfers.
    pub depth_at_call: u32,
    pub target: TargetSpec,
    /// Tail-position transfer: the caller never regains control.
    pub tail: bool,
}

/// Basic block: `[start, end)` of linearly executed instructions.
#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub start: u32,
    pub end: u32,
    /// Net stack-depth change in bytes (positive = deeper).
    pub delta: i64,
    /// Deepest point inside the block, relative to block entry.
    pub max_inner_depth: i64,
    /// Successor block start addresses (within the function).
    pub successors: Vec<u32>,
    pub terminator: Terminator,
}

/// Analyzed function: worst-case local depth plus outgoing calls.
#[derive(Clone, Debug)]
pub struct FunctionInfo {
    pub address: u32,
    pub size: u32,
    pub names: Vec<String>,
    /// Worst-case intra-function stack depth in bytes, over all paths
    /// reachable from the entry.
    pub prologue_cost: u32,
    pub call_sites: Vec<CallSite>,
    /// Whether any reachable block returns.
    pub returns: bool,
    pub blocks: Vec<BasicBlock>,
}

impl FunctionInfo {
    pub fn display_name(&self) -> String {
        self.names.join(" / ")
    }
}

/// Why a function could not be analyzed.
#[derive(Error, Debug, Clone)]
pub enum AnalyzeError {
    #[error("decode failed: {source}")]
    Decode {
        #[from]
        source: DecodeError,
    },
    #[error("unanalyzable control flow at {address:#06x}: {reason}")]
    Unanalyzable { address: u32, reason: String },
    #[error("stack pointer written from a non-constant source at {address:#06x}")]
    StackClobber { address: u32 },
    #[error("loop through {address:#06x} does not restore the stack before iterating")]
    LoopInvariant { address: u32 },
}

impl AnalyzeError {
    /// Whether this failure means the stack depth is indeterminate (as
    /// opposed to the function being undecodable).
    pub fn is_stack_indeterminate(&self) -> bool {
        matches!(
            self,
            AnalyzeError::StackClobber { .. } | AnalyzeError::LoopInvariant { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AnalyzeError>;
