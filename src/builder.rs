//! Top-level façade (§5/§6): cache check → window split → parallel workers
//! → sequential merge.

use crate::config::BuilderConfig;
use crate::error::BuildError;
use crate::graph::ProvenanceGraph;
use crate::merge;
use crate::store::GraphFile;
use crate::trace::InstructionRecord;
use crate::worker;

/// Build the provenance graph for `records`, honoring `config`'s cache path,
/// worker count, and window-splitting strategy.
pub fn build(records: &[InstructionRecord], config: &BuilderConfig) -> Result<ProvenanceGraph, BuildError> {
    if let Some(cache_path) = &config.cache_path {
        if cache_path.exists() {
            tracing::info!(path = %cache_path.display(), "loading cached graph");
            return Ok(GraphFile::load(cache_path)?.graph);
        }
    }

    let windows = worker::split_windows(records, config.workers as usize, config.window_split);
    tracing::info!(windows = windows.len(), records = records.len(), "split trace into windows");

    let results = worker::run_windows(records, &windows)?;
    let graph = merge::merge(&results)?;

    if let Some(cache_path) = &config.cache_path {
        GraphFile::new(graph.clone()).save(cache_path)?;
    }

    Ok(graph)
}
