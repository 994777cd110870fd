//! Analysis pipeline: load, analyze per function, build the graph, compose.

use std::path::Path;

use rayon::prelude::*;
use rustc_hash::FxHashSet;
use thiserror::Error;
use tracing::{debug, warn};

use stackmax_cfg::analyze_function;
use stackmax_elf::{ElfError, Image};
use stackmax_graph::{
    resolve_default_handler, resolve_entrypoints, CallGraph, Composer, Config, ConfigError,
    Entrypoint, EntrypointError, EntrypointResult,
};

/// Exit code for config or usage errors.
pub const EXIT_USAGE: i32 = 2;
/// Exit code for analysis failures (no numeric verdict for some entrypoint).
pub const EXIT_ANALYSIS: i32 = 3;
/// Exit code for malformed binaries.
pub const EXIT_BINARY: i32 = 4;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("cannot read `{path}`: {source}")]
    ReadBinary {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot read config `{path}`: {source}")]
    ReadConfig {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed binary: {0}")]
    Elf(#[from] ElfError),
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),
    #[error("bad vector table: {0}")]
    Entrypoints(#[from] EntrypointError),
}

impl PipelineError {
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::ReadBinary { .. }
            | PipelineError::Elf(_)
            | PipelineError::Entrypoints(_) => EXIT_BINARY,
            PipelineError::ReadConfig { .. } | PipelineError::Config(_) => EXIT_USAGE,
        }
    }
}

/// Finished analysis, ready for the report layer.
#[derive(Debug)]
pub struct Analysis {
    pub graph: CallGraph,
    pub entrypoints: Vec<Entrypoint>,
    pub results: Vec<EntrypointResult>,
    /// Cumulative call-graph depth per function; `None` when the function
    /// has no verdict.
    pub function_totals: std::collections::BTreeMap<u32, Option<u32>>,
}

impl Analysis {
    /// Worst total over the entrypoints that got a verdict.
    pub fn global_max(&self) -> Option<u32> {
        self.results
            .iter()
            .filter_map(|result| result.outcome.as_ref().ok())
            .map(|report| report.total)
            .max()
    }

    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|result| result.outcome.is_err())
    }
}

/// Run the whole pipeline for one binary and optional config file.
///
/// # Errors
///
/// Fails on unreadable or malformed inputs; per-function analysis failures
/// do not abort the pipeline and surface in the per-entrypoint results.
pub fn analyze(binary_path: &Path, config_path: Option<&Path>) -> Result<Analysis, PipelineError> {
    let data = std::fs::read(binary_path).map_err(|source| PipelineError::ReadBinary {
        path: binary_path.display().to_string(),
        source,
    })?;

    let config_json = match config_path {
        Some(path) => Some(std::fs::read_to_string(path).map_err(|source| {
            PipelineError::ReadConfig {
                path: path.display().to_string(),
                source,
            }
        })?),
        None => None,
    };

    analyze_bytes(&data, config_json.as_deref())
}

/// Run the pipeline on in-memory binary and config contents.
///
/// # Errors
///
/// Same failure classes as [`analyze`], minus the file I/O.
pub fn analyze_bytes(data: &[u8], config_json: Option<&str>) -> Result<Analysis, PipelineError> {
    let image = Image::parse(data)?;

    let config = match config_json {
        Some(json) => Config::from_json(json)?,
        None => Config::default(),
    };

    let hints = config.resolve_hints(&image)?;
    let vector_table = image.vector_table()?;
    let default_handler = resolve_default_handler(&image, &config.entrypoints)?;

    // per-function analysis is pure; fan out, then collect back in address
    // order so the rest of the pipeline is deterministic
    let analyses: Vec<_> = image
        .functions
        .par_iter()
        .map(|func| (func.clone(), analyze_function(&image, func)))
        .collect();

    debug!(functions = analyses.len(), "function analysis done");

    let graph = CallGraph::build(&image, analyses, &hints);
    let entrypoints = resolve_entrypoints(
        &image,
        &vector_table,
        &config.entrypoints,
        default_handler,
    )?;

    let referenced: FxHashSet<u32> = entrypoints
        .iter()
        .map(|entrypoint| entrypoint.handler)
        .collect();
    for address in graph.uncalled(&referenced) {
        if let Some(node) = graph.node(address) {
            warn!(
                function = %node.display_name(),
                address = format_args!("{address:#06x}"),
                "function is never called; check the entrypoint config"
            );
        }
    }

    let mut composer = Composer::new(&graph);
    let results = composer.compose(&entrypoints);

    let function_totals = graph
        .nodes
        .keys()
        .map(|&address| (address, composer.function_total(address)))
        .collect();

    Ok(Analysis {
        graph,
        entrypoints,
        results,
        function_totals,
    })
}
