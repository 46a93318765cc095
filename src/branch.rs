//! Branch/exception sub-state (C7)
//!
//! Handles capability branch + exception replay: recovers the pre-branch PCC
//! if a `cjr`/`cjalr` that took an exception did not actually commit.
//! Grounded on `CapabilityBranchSubparser` in `parser.py`.

use crate::graph::{ProvenanceGraph, VHandle};

#[derive(Debug, Clone, Default)]
pub struct BranchState {
    /// PCC just before a `cj[al]r` that took an exception.
    saved_pcc: Option<VHandle>,
    /// PC of the instruction that saved `saved_pcc`.
    saved_addr: Option<u64>,
    /// Out-degree of the (possibly wrongly installed) branch target at the
    /// time it was saved, for the integrity check.
    saved_target_children_count: Option<usize>,
    /// Target vertex installed by the branch, tracked for the integrity check.
    saved_target: Option<VHandle>,

    first_mfc_seen: bool,
    /// Epcc captured at the first `badvaddr` read, before any branch
    /// snapshot occurred. Used by the merge step's boundary fix-up.
    initial_epcc: Option<VHandle>,
    initial_badvaddr: Option<u64>,
}

impl BranchState {
    pub fn new() -> Self {
        Self { first_mfc_seen: false, ..Default::default() }
    }

    /// Record a capability branch that took an exception, before installing
    /// `target` into `pcc`.
    pub fn save_branch(
        &mut self,
        instruction_pc: u64,
        old_pcc: VHandle,
        target: VHandle,
        graph: &ProvenanceGraph,
    ) {
        self.first_mfc_seen = true;
        self.saved_pcc = Some(old_pcc);
        self.saved_addr = Some(instruction_pc);
        self.saved_target = Some(target);
        self.saved_target_children_count = Some(graph.out_degree(target));
    }

    /// Handle a read of `badvaddr` via a system-register move (`mfc0`).
    /// Returns `Some(saved_pcc)` if the branch did not commit and `pcc`
    /// should be restored to it.
    pub fn observe_badvaddr(
        &mut self,
        badvaddr: u64,
        epcc_slot: VHandle,
        graph: &ProvenanceGraph,
        cycle: u64,
    ) -> Result<Option<VHandle>, crate::error::BuildError> {
        if let Some(saved_addr) = self.saved_addr {
            self.first_mfc_seen = true;
            let result = if badvaddr == saved_addr || badvaddr == saved_addr + 4 {
                let target = self.saved_target.expect("saved_addr implies saved_target");
                let expected = self.saved_target_children_count.unwrap_or(0);
                if graph.out_degree(target) != expected {
                    return Err(crate::error::BuildError::unexpected(
                        cycle,
                        "branch target gained out-neighbours before badvaddr was read",
                    ));
                }
                Some(self.saved_pcc.expect("saved_addr implies saved_pcc"))
            } else {
                None
            };
            self.saved_addr = None;
            self.saved_pcc = None;
            self.saved_target = None;
            self.saved_target_children_count = None;
            Ok(result)
        } else {
            if !self.first_mfc_seen {
                self.first_mfc_seen = true;
                self.initial_badvaddr = Some(badvaddr);
                self.initial_epcc = Some(epcc_slot);
            }
            Ok(None)
        }
    }

    pub fn mark_eret_seen(&mut self) {
        self.first_mfc_seen = true;
    }

    pub fn initial_epcc(&self) -> Option<VHandle> {
        self.initial_epcc
    }

    pub fn initial_badvaddr(&self) -> Option<u64> {
        self.initial_badvaddr
    }

    pub fn saved_pcc(&self) -> Option<VHandle> {
        self.saved_pcc
    }

    pub fn saved_addr(&self) -> Option<u64> {
        self.saved_addr
    }

    /// Translate vertex handles held by this state through `translate`
    /// (used when crossing from a worker's subgraph space into the merged
    /// graph's space at a window boundary).
    pub fn translate(&self, translate: impl Fn(VHandle) -> Option<VHandle>) -> Self {
        Self {
            saved_pcc: self.saved_pcc.and_then(&translate),
            saved_addr: self.saved_addr,
            saved_target_children_count: self.saved_target_children_count,
            saved_target: self.saved_target.and_then(&translate),
            first_mfc_seen: self.first_mfc_seen,
            initial_epcc: self.initial_epcc.and_then(&translate),
            initial_badvaddr: self.initial_badvaddr,
        }
    }
}
