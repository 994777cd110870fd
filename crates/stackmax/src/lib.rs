//! Static worst-case stack usage analysis of embedded executables.
//!
//! Library surface behind the `stackmax` CLI: the pipeline that loads a
//! binary, analyzes every function, composes per-entrypoint depths, and the
//! report renderer.

pub mod pipeline;
pub mod report;
pub mod terminal;
