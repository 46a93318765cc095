//! Command-line driver (§6.1).
//!
//! Ground: teacher's `Cli`/`Commands` clap-derive shape in the original
//! `cli.rs` — a single top-level `Cli` wrapping a `Subcommand` enum, with
//! `#[clap(...)]` metadata on the derived struct rather than a builder.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::builder;
use crate::config::BuilderConfig;
use crate::store::GraphFile;
use crate::trace::InstructionRecord;
use crate::worker::WindowSplit;

#[derive(Parser, Clone)]
#[clap(author = clap::crate_authors!(", "))]
#[clap(version = env!("CARGO_PKG_VERSION"))]
#[clap(about = "Reconstructs a CHERI capability-provenance graph from an instruction trace")]
#[clap(color = clap::ColorChoice::Auto)]
#[clap(propagate_version = true)]
#[clap(subcommand_required = true)]
#[clap(arg_required_else_help = true)]
pub struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// build the provenance graph for a trace of decoded instruction records
    Build(BuildParameters),
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum WindowSplitArg {
    ByteRange,
    InstructionCount,
}

impl From<WindowSplitArg> for WindowSplit {
    fn from(arg: WindowSplitArg) -> Self {
        match arg {
            WindowSplitArg::ByteRange => WindowSplit::ByteRange,
            WindowSplitArg::InstructionCount => WindowSplit::InstructionCount,
        }
    }
}

#[derive(Parser, Clone)]
pub struct BuildParameters {
    /// path to a JSON array of `trace::InstructionRecord`
    #[clap(value_parser)]
    trace: PathBuf,
    /// number of parallel windows (and worker threads)
    #[clap(short = 'w', long, default_value_t = 1)]
    workers: u32,
    /// reuse (or populate) a cached graph at this path instead of rebuilding
    #[clap(long)]
    cache_path: Option<PathBuf>,
    /// how the trace is cut into per-worker windows
    #[clap(long, value_enum, default_value_t = WindowSplitArg::InstructionCount)]
    window_split: WindowSplitArg,
    /// where to write the resulting `store::GraphFile`
    #[clap(short = 'o', long)]
    output: PathBuf,
}

impl Cli {
    pub fn run(self) -> Result<(), anyhow::Error> {
        match self.command {
            Commands::Build(params) => params.run(),
        }
    }
}

impl BuildParameters {
    fn run(self) -> Result<(), anyhow::Error> {
        tracing::info!(trace = %self.trace.display(), workers = self.workers, "reading trace");
        let file = File::open(&self.trace)?;
        let records: Vec<InstructionRecord> = serde_json::from_reader(BufReader::new(file))?;

        let mut config = BuilderConfig::new(self.workers, self.window_split.into());
        if let Some(cache_path) = self.cache_path {
            config = config.with_cache_path(cache_path);
        }

        let graph = builder::build(&records, &config)?;
        tracing::info!(vertices = graph.vertex_count(), edges = graph.edge_count(), "built provenance graph");

        GraphFile::new(graph).save(&self.output)?;
        tracing::info!(output = %self.output.display(), "wrote graph file");
        Ok(())
    }
}
