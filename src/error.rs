//! Fatal errors surfaced at the builder boundary (§6/§7).
//!
//! Local, recoverable cases (missing memory-map entry on load, unseen
//! register on store of a valid capability, unseen special-register read)
//! are not represented here: they are handled silently by synthesizing a
//! `Root` vertex and logged at `debug` level.

use thiserror::Error;

/// A fatal error, tagged with the trace cycle at which it occurred.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("cycle {cycle}: missing parent for derivation ({detail})")]
    MissingParent { cycle: u64, detail: String },

    #[error("cycle {cycle}: dereference through an unknown capability register ({detail})")]
    DereferenceUnknown { cycle: u64, detail: String },

    #[error("cycle {cycle}: unexpected state ({detail})")]
    Unexpected { cycle: u64, detail: String },

    #[error("subgraph merge failed at window {window} ({detail})")]
    SubgraphMerge { window: usize, detail: String },
}

impl BuildError {
    pub fn missing_parent(cycle: u64, detail: impl Into<String>) -> Self {
        let err = BuildError::MissingParent { cycle, detail: detail.into() };
        tracing::error!(%err, cycle, "missing parent");
        err
    }

    pub fn dereference_unknown(cycle: u64, detail: impl Into<String>) -> Self {
        let err = BuildError::DereferenceUnknown { cycle, detail: detail.into() };
        tracing::error!(%err, cycle, "dereference of unknown capability");
        err
    }

    pub fn unexpected(cycle: u64, detail: impl Into<String>) -> Self {
        let err = BuildError::Unexpected { cycle, detail: detail.into() };
        tracing::error!(%err, cycle, "unexpected state");
        err
    }

    pub fn subgraph_merge(window: usize, detail: impl Into<String>) -> Self {
        let err = BuildError::SubgraphMerge { window, detail: detail.into() };
        tracing::error!(%err, window, "subgraph merge failed");
        err
    }
}
