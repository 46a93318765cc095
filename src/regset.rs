//! Register model (C4)
//!
//! Maps each of the 32 capability registers plus PCC to a vertex handle.
//! Grounded on the original `RegisterSet` in `parser.py`: the dispatcher
//! (C6) is the only writer: every `set`/`move`/`pcc` mutation funnels through
//! here so a future merge step can replay the same structure (see `merge`).

use crate::graph::VHandle;
use crate::graph::ProvenanceGraph;
use crate::vertex::VertexOrigin;

pub const NUM_REGS: usize = 32;

#[derive(Debug, Clone)]
pub struct RegisterSet {
    regs: [Option<VHandle>; NUM_REGS],
    pcc: Option<VHandle>,
}

impl RegisterSet {
    pub fn new() -> Self {
        Self { regs: [None; NUM_REGS], pcc: None }
    }

    /// Build a register set where every slot (and pcc) holds a fresh
    /// `Partial` placeholder vertex, created in `graph`. Used by workers that
    /// don't start at the beginning of the trace (§4.6/§9).
    pub fn with_placeholders(graph: &mut ProvenanceGraph, placeholder: impl Fn() -> crate::vertex::VertexData) -> Self {
        let mut set = Self::new();
        for i in 0..NUM_REGS {
            set.regs[i] = Some(graph.add_vertex(placeholder()));
        }
        set.pcc = Some(graph.add_vertex(placeholder()));
        set
    }

    pub fn get(&self, i: usize) -> Option<VHandle> {
        assert!(i < NUM_REGS, "register index out of bounds: {i}");
        self.regs[i]
    }

    pub fn set(&mut self, i: usize, value: Option<VHandle>) {
        assert!(i < NUM_REGS, "register index out of bounds: {i}");
        self.regs[i] = value;
    }

    pub fn pcc(&self) -> Option<VHandle> {
        self.pcc
    }

    pub fn set_pcc(&mut self, value: Option<VHandle>) {
        self.pcc = value;
    }

    /// Propagate the handle from `src` to `dst` (bounds-preserving move).
    pub fn move_reg(&mut self, src: usize, dst: usize) {
        self.regs[dst] = self.regs[src];
    }

    /// True iff the slot is non-null and, when `allow_root` is false, the
    /// held vertex is not `Partial` (a `Partial`-held slot is "unknown
    /// predecessor": derivations may not use it as a parent).
    pub fn has(&self, i: usize, allow_root: bool, graph: &ProvenanceGraph) -> bool {
        match self.regs[i] {
            None => false,
            Some(handle) => allow_root || !graph.data(handle).origin.is_partial(),
        }
    }

    pub fn has_pcc(&self, allow_root: bool, graph: &ProvenanceGraph) -> bool {
        match self.pcc {
            None => false,
            Some(handle) => allow_root || !graph.data(handle).origin.is_partial(),
        }
    }

    pub fn all_slots(&self) -> impl Iterator<Item = (usize, Option<VHandle>)> + '_ {
        self.regs.iter().copied().enumerate()
    }

    /// Index of `handle` among the 32 general registers, if present.
    pub fn index_of(&self, handle: VHandle) -> Option<usize> {
        self.regs.iter().position(|slot| *slot == Some(handle))
    }

    pub fn is_pcc(&self, handle: VHandle) -> bool {
        self.pcc == Some(handle)
    }
}

impl Default for RegisterSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Placeholder vertex factory, shared by `with_placeholders` and test code.
pub fn partial_vertex_data() -> crate::vertex::VertexData {
    use crate::capability::{Capability, Permissions};
    crate::vertex::VertexData::new(
        Capability::new(0, 0, 0, Permissions::empty(), 0, false),
        VertexOrigin::Partial,
        0,
        false,
    )
}
