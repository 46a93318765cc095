//! Graph file persistence (§6).
//!
//! An opaque-schema container around `graph::ProvenanceGraph`, saved and
//! loaded via `serde_json` — ground: the teacher's pervasive use of
//! `serde`/`serde_json` for on-disk structures (e.g. `SolverInitializer`,
//! `Visualizer`'s JSON snapshots).

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::BuildError;
use crate::graph::ProvenanceGraph;

/// Schema version tag, bumped if `ProvenanceGraph`'s on-disk shape changes.
const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphFile {
    pub schema_version: u32,
    pub graph: ProvenanceGraph,
}

impl GraphFile {
    pub fn new(graph: ProvenanceGraph) -> Self {
        Self { schema_version: SCHEMA_VERSION, graph }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), BuildError> {
        let file = File::create(path.as_ref())
            .map_err(|e| BuildError::unexpected(0, format!("creating {}: {e}", path.as_ref().display())))?;
        serde_json::to_writer(BufWriter::new(file), self)
            .map_err(|e| BuildError::unexpected(0, format!("serializing graph file: {e}")))?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, BuildError> {
        let file = File::open(path.as_ref())
            .map_err(|e| BuildError::unexpected(0, format!("opening {}: {e}", path.as_ref().display())))?;
        let file: GraphFile = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| BuildError::unexpected(0, format!("deserializing graph file: {e}")))?;
        Ok(file)
    }
}
