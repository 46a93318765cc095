extern crate serde;
extern crate serde_json;
extern crate clap;
extern crate parking_lot;
extern crate rayon;
extern crate petgraph;
extern crate hashbrown;
extern crate bitflags;
extern crate thiserror;
extern crate tracing;

pub mod capability;
pub mod vertex;
pub mod error;
pub mod graph;
pub mod trace;
pub mod regset;
pub mod memmap;
pub mod branch;
pub mod syscall;
pub mod dispatch;
pub mod worker;
pub mod merge;
pub mod config;
pub mod store;
pub mod builder;

#[cfg(feature = "cli")]
pub mod cli;
