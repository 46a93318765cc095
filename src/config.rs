//! Builder configuration (§6).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use crate::worker::WindowSplit;

/// Top-level knobs for `builder::build`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Number of parallel windows (and, in turn, worker threads `rayon` is
    /// asked to use — ground: teacher's `dual_module_parallel.rs` takes a
    /// `thread_pool_size` knob of the same shape).
    pub workers: u32,
    /// When set and a graph file already exists at this path, `builder::build`
    /// loads and returns it instead of reprocessing the trace.
    pub cache_path: Option<PathBuf>,
    pub window_split: WindowSplit,
}

impl BuilderConfig {
    pub fn new(workers: u32, window_split: WindowSplit) -> Self {
        Self { workers, cache_path: None, window_split }
    }

    pub fn with_cache_path(mut self, path: PathBuf) -> Self {
        self.cache_path = Some(path);
        self
    }
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self { workers: 1, cache_path: None, window_split: WindowSplit::InstructionCount }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_single_threaded_instruction_count_split() {
        let config = BuilderConfig::default();
        assert_eq!(config.workers, 1);
        assert_eq!(config.window_split, WindowSplit::InstructionCount);
        assert!(config.cache_path.is_none());
    }

    #[test]
    fn with_cache_path_sets_the_path() {
        let config = BuilderConfig::new(4, WindowSplit::ByteRange).with_cache_path(PathBuf::from("/tmp/graph.json"));
        assert_eq!(config.cache_path, Some(PathBuf::from("/tmp/graph.json")));
    }
}
