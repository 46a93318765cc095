//! Partial-graph merge (C9)
//!
//! The hardest part of the crate: fuses each window's private `WorkerResult`
//! into one graph, strictly in window order, by resolving every `Partial`
//! placeholder a window started with against whatever vertex the *previous*
//! window actually left in that register, memory address, or special slot.
//! Grounded on `MergePartialSubgraphContext`/`MergePartialSubgraph` in
//! `parser.py`, restructured around owned `petgraph` indices rather than
//! `graph-tool` vertex descriptors.

use hashbrown::{HashMap, HashSet};

use crate::error::BuildError;
use crate::graph::{ProvenanceGraph, VHandle};
use crate::regset::{RegisterSet, NUM_REGS};
use crate::vertex::VertexOrigin;
use crate::worker::WorkerResult;

/// The resolved (merged-graph-space) view of everything a window's
/// placeholders might need to be translated against: the previous window's
/// final register file, special registers, and memory map, all expressed as
/// handles into the merged graph being built.
#[derive(Debug, Clone, Default)]
struct BoundaryState {
    gp: [Option<VHandle>; NUM_REGS],
    pcc: Option<VHandle>,
    epcc: Option<VHandle>,
    kcc: Option<VHandle>,
    kdc: Option<VHandle>,
    default: Option<VHandle>,
    memvmap: HashMap<u64, VHandle>,
    /// Set when the previous window ended with a capability branch that took
    /// an exception but was never resolved (no local `badvaddr` read saw it
    /// commit or not) — carries `(pc, pre_branch_pcc)`.
    unresolved_branch: Option<(u64, VHandle)>,
    /// Set when the previous window ended mid-syscall (armed `in_syscall`,
    /// waiting for the matching `eret`) — carries `(pc_eret, syscall_code)`.
    unresolved_syscall: Option<(u64, i32)>,
}

/// Fuse every window's result into a single graph, in window order.
pub fn merge(results: &[WorkerResult]) -> Result<ProvenanceGraph, BuildError> {
    let mut merged = ProvenanceGraph::new();
    let mut windows = results.iter();
    let Some(first) = windows.next() else {
        return Ok(merged);
    };

    let mut translation: HashMap<VHandle, VHandle> = HashMap::new();
    copy_window(first, &mut merged, &mut translation, &HashSet::new(), &HashSet::new())?;
    let mut boundary = boundary_after(first, &translation);

    for window in windows {
        let mut local_translation: HashMap<VHandle, VHandle> = HashMap::new();
        let mut force_root: HashSet<VHandle> = HashSet::new();
        let mut drop: HashSet<VHandle> = HashSet::new();

        seed_register_placeholders(window, &boundary, &mut merged, &mut local_translation, &mut force_root, &mut drop)?;
        seed_special_placeholders(window, &boundary, &mut merged, &mut local_translation, &mut force_root, &mut drop)?;
        apply_branch_boundary_fixup(window, &boundary, &mut local_translation);
        apply_syscall_boundary_fixup(window, &boundary, &local_translation, &mut merged);
        reconcile_memory(window, &boundary, &mut merged, &mut local_translation)?;

        copy_window(window, &mut merged, &mut local_translation, &force_root, &drop)?;

        boundary = boundary_after(window, &local_translation);
    }

    Ok(merged)
}

/// Copy every vertex/edge of `window.graph` not already present in
/// `translation` into `merged`. Relies on `petgraph::NodeIndex` allocation
/// order matching creation order, so a vertex's parent (always created
/// earlier) is already translated by the time the vertex itself is visited.
fn copy_window(
    window: &WorkerResult,
    merged: &mut ProvenanceGraph,
    translation: &mut HashMap<VHandle, VHandle>,
    force_root: &HashSet<VHandle>,
    drop: &HashSet<VHandle>,
) -> Result<(), BuildError> {
    for local in window.graph.vertices() {
        if translation.contains_key(&local) {
            continue;
        }
        if drop.contains(&local) {
            continue;
        }
        let mut data = window.graph.data(local).clone();
        if force_root.contains(&local) {
            data.origin = VertexOrigin::Root;
        }
        let new_handle = merged.add_vertex(data);
        translation.insert(local, new_handle);
    }
    for (src, dst) in window.graph.edges() {
        if drop.contains(&src) || drop.contains(&dst) {
            continue;
        }
        let (Some(&new_src), Some(&new_dst)) = (translation.get(&src), translation.get(&dst)) else {
            return Err(BuildError::subgraph_merge(
                window.window_index,
                "edge endpoint missing from the translation table",
            ));
        };
        if new_src != new_dst {
            merged.add_edge(new_src, new_dst);
        }
    }
    Ok(())
}

/// What to do with a placeholder a window started with that no predecessor
/// window resolved.
enum UnresolvedDisposition {
    /// Nothing in the window hung a derivation or an event off it: drop it
    /// entirely rather than materialize it. Materializing every untouched
    /// register would manufacture a Root per unused slot on every window
    /// after the first and make the graph's shape depend on the
    /// partitioning.
    Unused,
    /// Something in the window derived from it: promote it to a standalone
    /// Root so that derivation still has a parent.
    Used,
    /// Nothing derived from it, but it was dereferenced (loaded/stored
    /// through) with no predecessor to attribute that access to — the
    /// access can't be attached to anything real.
    DereferencedWithoutPredecessor,
}

fn classify_unresolved_placeholder(window: &WorkerResult, ph: VHandle) -> UnresolvedDisposition {
    if window.graph.out_degree(ph) > 0 {
        UnresolvedDisposition::Used
    } else if window.graph.data(ph).events.is_empty() {
        UnresolvedDisposition::Unused
    } else {
        UnresolvedDisposition::DereferencedWithoutPredecessor
    }
}

fn resolve_unresolved_placeholder(
    window: &WorkerResult,
    ph: VHandle,
    force_root: &mut HashSet<VHandle>,
    drop: &mut HashSet<VHandle>,
) -> Result<(), BuildError> {
    match classify_unresolved_placeholder(window, ph) {
        UnresolvedDisposition::Unused => {
            drop.insert(ph);
            Ok(())
        }
        UnresolvedDisposition::Used => {
            force_root.insert(ph);
            Ok(())
        }
        UnresolvedDisposition::DereferencedWithoutPredecessor => Err(BuildError::subgraph_merge(
            window.window_index,
            "dereferenced placeholder without predecessor",
        )),
    }
}

fn seed_register_placeholders(
    window: &WorkerResult,
    boundary: &BoundaryState,
    merged: &mut ProvenanceGraph,
    translation: &mut HashMap<VHandle, VHandle>,
    force_root: &mut HashSet<VHandle>,
    drop: &mut HashSet<VHandle>,
) -> Result<(), BuildError> {
    for (idx, slot) in window.initial_regs.all_slots() {
        let Some(ph) = slot else { continue };
        match boundary.gp[idx] {
            Some(target) => {
                translation.insert(ph, target);
                merged.data_mut(target).absorb_events(window.graph.data(ph));
            }
            None => resolve_unresolved_placeholder(window, ph, force_root, drop)?,
        }
    }
    let Some(ph_pcc) = window.initial_regs.pcc() else { return Ok(()) };
    match boundary.pcc {
        Some(target) => {
            translation.insert(ph_pcc, target);
            merged.data_mut(target).absorb_events(window.graph.data(ph_pcc));
        }
        None => resolve_unresolved_placeholder(window, ph_pcc, force_root, drop)?,
    }
    Ok(())
}

fn seed_special_placeholders(
    window: &WorkerResult,
    boundary: &BoundaryState,
    merged: &mut ProvenanceGraph,
    translation: &mut HashMap<VHandle, VHandle>,
    force_root: &mut HashSet<VHandle>,
    drop: &mut HashSet<VHandle>,
) -> Result<(), BuildError> {
    let pairs = [
        (window.initial_special.epcc, boundary.epcc),
        (window.initial_special.kcc, boundary.kcc),
        (window.initial_special.kdc, boundary.kdc),
        (window.initial_special.default, boundary.default),
    ];
    for (ph, target) in pairs {
        let Some(ph) = ph else { continue };
        match target {
            Some(target) => {
                translation.insert(ph, target);
                merged.data_mut(target).absorb_events(window.graph.data(ph));
            }
            None => resolve_unresolved_placeholder(window, ph, force_root, drop)?,
        }
    }
    Ok(())
}

/// If the previous window ended with a capability branch that took an
/// exception but never got its commit/no-commit answer locally, and this
/// window's first `badvaddr` read is the answer, override the pcc
/// resolution: the branch never committed, so pcc should resolve to the
/// pre-branch capability instead of whatever the previous window otherwise
/// left in pcc.
fn apply_branch_boundary_fixup(
    window: &WorkerResult,
    boundary: &BoundaryState,
    translation: &mut HashMap<VHandle, VHandle>,
) {
    let Some((saved_pc, saved_pcc)) = boundary.unresolved_branch else { return };
    let Some(observed) = window.final_branch.initial_badvaddr() else { return };
    if observed == saved_pc || observed == saved_pc + 4 {
        if let Some(ph_pcc) = window.initial_regs.pcc() {
            translation.insert(ph_pcc, saved_pcc);
        }
    }
}

/// If the previous window ended mid-syscall and this window's first `eret`
/// is the matching return, the local dispatcher had no way to know a syscall
/// was in flight, so it never appended the `syscall_ret` event; append it now
/// that the return-capability placeholder has a merged-graph identity.
///
/// Unlike the branch fixup, this can't cross-check against the trace's own
/// `pc`: `initial_eret_addr` is read off the local `epcc` placeholder's
/// capability, which is still zeroed at the time the window ran (its real
/// value only exists once `seed_special_placeholders` resolves it against
/// the merged graph, which happens after dispatch). The signal this relies
/// on instead is `exception_depth` going negative at the window's own first
/// `eret` — i.e. the window opened already inside an exception — which is
/// exactly the condition the previous window's unresolved in-flight syscall
/// implies.
fn apply_syscall_boundary_fixup(
    window: &WorkerResult,
    boundary: &BoundaryState,
    translation: &HashMap<VHandle, VHandle>,
    merged: &mut ProvenanceGraph,
) {
    let Some((pc_eret, code)) = boundary.unresolved_syscall else { return };
    let Some(cycle) = window.final_syscall.initial_eret_time() else { return };
    let Some(ph) = window.initial_regs.get(crate::syscall::RETURN_CAP_REGISTER) else { return };
    let Some(&target) = translation.get(&ph) else { return };
    merged.data_mut(target).push_event(crate::vertex::VertexEvent::syscall_ret(cycle, code));
    tracing::debug!(window = window.window_index, pc_eret, "syscall return crossed a window boundary");
}

fn reconcile_memory(
    window: &WorkerResult,
    boundary: &BoundaryState,
    merged: &mut ProvenanceGraph,
    translation: &mut HashMap<VHandle, VHandle>,
) -> Result<(), BuildError> {
    for (addr, handle) in window.initial_memvmap.initial_entries() {
        if translation.contains_key(&handle) {
            continue;
        }
        let Some(&prev_handle) = boundary.memvmap.get(&addr) else { continue };
        let compatible = merged.data(prev_handle).cap.compatible(&window.graph.data(handle).cap);
        if !compatible {
            return Err(BuildError::subgraph_merge(
                window.window_index,
                format!("incompatible capabilities at memory placeholder 0x{addr:x}"),
            ));
        }
        translation.insert(handle, prev_handle);
        merged.data_mut(prev_handle).absorb_events(window.graph.data(handle));
    }
    Ok(())
}

fn boundary_after(window: &WorkerResult, translation: &HashMap<VHandle, VHandle>) -> BoundaryState {
    let resolve = |h: VHandle| translation.get(&h).copied();
    let mut gp = [None; NUM_REGS];
    for i in 0..NUM_REGS {
        gp[i] = window.final_regs.get(i).and_then(resolve);
    }
    let memvmap = window.final_memvmap.current().iter().filter_map(|(addr, h)| resolve(h).map(|t| (addr, t))).collect();

    let unresolved_branch = match (window.final_branch.saved_addr(), window.final_branch.saved_pcc()) {
        (Some(pc), Some(pcc)) => resolve(pcc).map(|t| (pc, t)),
        _ => None,
    };
    let unresolved_syscall =
        if window.final_syscall.in_syscall() { window.final_syscall.pc_eret().zip(window.final_syscall.syscall_code()) } else { None };

    BoundaryState {
        gp,
        pcc: window.final_regs.pcc().and_then(resolve),
        epcc: window.final_special.epcc.and_then(resolve),
        kcc: window.final_special.kcc.and_then(resolve),
        kdc: window.final_special.kdc.and_then(resolve),
        default: window.final_special.default.and_then(resolve),
        memvmap,
        unresolved_branch,
        unresolved_syscall,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchState;
    use crate::capability::{Capability, Permissions};
    use crate::dispatch::{Dispatcher, SpecialRegisters};
    use crate::memmap::InitialMemoryVertexMap;
    use crate::syscall::SyscallState;
    use crate::vertex::VertexData;

    fn cap(base: u64, length: u64) -> Capability {
        Capability::new(base, length, 0, Permissions::LOAD | Permissions::STORE, 0, true)
    }

    fn window0_with_root_in_reg(reg: usize) -> (WorkerResult, VHandle) {
        let mut d = Dispatcher::new_first_window();
        let root = d.graph.add_vertex(VertexData::new(cap(0x1000, 0x1000), VertexOrigin::Root, 0, false));
        d.regs.set(reg, Some(root));
        d.regs.set_pcc(Some(root));
        let result = WorkerResult {
            window_index: 0,
            graph: d.graph,
            initial_regs: RegisterSet::new(),
            final_regs: d.regs,
            initial_memvmap: InitialMemoryVertexMap::new(),
            final_memvmap: d.memvmap,
            initial_branch: BranchState::new(),
            final_branch: d.branch,
            initial_syscall: SyscallState::new(),
            final_syscall: d.syscall,
            initial_special: SpecialRegisters::default(),
            final_special: d.special,
        };
        (result, root)
    }

    #[test]
    fn single_window_merge_is_a_verbatim_copy() {
        let (w0, _root) = window0_with_root_in_reg(4);
        let expected_vertices = w0.graph.vertex_count();
        let merged = merge(&[w0]).unwrap();
        assert_eq!(merged.vertex_count(), expected_vertices);
    }

    #[test]
    fn second_window_placeholder_resolves_to_first_windows_final_register() {
        let (w0, _root) = window0_with_root_in_reg(4);

        let mut d1 = Dispatcher::new_with_placeholders();
        let placeholder4 = d1.regs.get(4).unwrap();
        let child_cap = cap(0x1000, 0x800);
        let child = d1.graph.add_vertex(VertexData::new(child_cap, VertexOrigin::Setbounds, 10, false));
        d1.graph.add_edge(placeholder4, child);
        let w1 = WorkerResult {
            window_index: 1,
            graph: d1.graph,
            initial_regs: d1.regs.clone(),
            final_regs: d1.regs,
            initial_memvmap: d1.memvmap.clone(),
            final_memvmap: d1.memvmap,
            initial_branch: d1.branch.clone(),
            final_branch: d1.branch,
            initial_syscall: d1.syscall.clone(),
            final_syscall: d1.syscall,
            initial_special: d1.special.clone(),
            final_special: d1.special,
        };

        let merged = merge(&[w0, w1]).unwrap();
        // one vertex for window 0's root, one for window 1's child; every
        // other window-1 placeholder was never touched and is dropped.
        let roots = merged.vertices().filter(|&v| merged.data(v).origin == VertexOrigin::Root).count();
        let setbounds = merged.vertices().filter(|&v| merged.data(v).origin == VertexOrigin::Setbounds).count();
        assert_eq!(setbounds, 1);
        assert!(roots >= 1);

        let child_merged = merged.vertices().find(|&v| merged.data(v).origin == VertexOrigin::Setbounds).unwrap();
        let parent = merged.parent(child_merged).unwrap();
        assert_eq!(merged.data(parent).cap.base, 0x1000);
    }

    #[test]
    fn unused_unresolved_register_placeholder_is_dropped_not_a_partial() {
        let d0 = Dispatcher::new_first_window();
        // bootstrap nothing: final_regs stays entirely empty.
        let w0 = WorkerResult {
            window_index: 0,
            graph: d0.graph.clone(),
            initial_regs: RegisterSet::new(),
            final_regs: d0.regs.clone(),
            initial_memvmap: InitialMemoryVertexMap::new(),
            final_memvmap: d0.memvmap.clone(),
            initial_branch: BranchState::new(),
            final_branch: d0.branch.clone(),
            initial_syscall: SyscallState::new(),
            final_syscall: d0.syscall.clone(),
            initial_special: SpecialRegisters::default(),
            final_special: d0.special.clone(),
        };
        let d1 = Dispatcher::new_with_placeholders();
        let w1 = WorkerResult {
            window_index: 1,
            graph: d1.graph,
            initial_regs: d1.regs.clone(),
            final_regs: d1.regs,
            initial_memvmap: d1.memvmap.clone(),
            final_memvmap: d1.memvmap,
            initial_branch: d1.branch.clone(),
            final_branch: d1.branch,
            initial_syscall: d1.syscall.clone(),
            final_syscall: d1.syscall,
            initial_special: d1.special.clone(),
            final_special: d1.special,
        };

        let merged = merge(&[w0, w1]).unwrap();
        assert!(merged.vertices().all(|v| merged.data(v).origin != VertexOrigin::Partial));
        // nothing in either window ever referenced a register: no vertex at all.
        assert_eq!(merged.vertex_count(), 0);
    }

    #[test]
    fn unresolved_register_placeholder_used_as_a_parent_becomes_a_root() {
        let d0 = Dispatcher::new_first_window();
        let w0 = WorkerResult {
            window_index: 0,
            graph: d0.graph.clone(),
            initial_regs: RegisterSet::new(),
            final_regs: d0.regs.clone(),
            initial_memvmap: InitialMemoryVertexMap::new(),
            final_memvmap: d0.memvmap.clone(),
            initial_branch: BranchState::new(),
            final_branch: d0.branch.clone(),
            initial_syscall: SyscallState::new(),
            final_syscall: d0.syscall.clone(),
            initial_special: SpecialRegisters::default(),
            final_special: d0.special.clone(),
        };

        let mut d1 = Dispatcher::new_with_placeholders();
        let placeholder4 = d1.regs.get(4).unwrap();
        let child = d1.graph.add_vertex(VertexData::new(cap(0x2000, 0x100), VertexOrigin::Setbounds, 3, false));
        d1.graph.add_edge(placeholder4, child);
        let w1 = WorkerResult {
            window_index: 1,
            graph: d1.graph,
            initial_regs: d1.regs.clone(),
            final_regs: d1.regs,
            initial_memvmap: d1.memvmap.clone(),
            final_memvmap: d1.memvmap,
            initial_branch: d1.branch.clone(),
            final_branch: d1.branch,
            initial_syscall: d1.syscall.clone(),
            final_syscall: d1.syscall,
            initial_special: d1.special.clone(),
            final_special: d1.special,
        };

        let merged = merge(&[w0, w1]).unwrap();
        // register 4 was never set upstream but window 1 derived from it
        // anyway, so its placeholder is promoted to a standalone root.
        assert_eq!(merged.vertex_count(), 2);
        let child_merged = merged.vertices().find(|&v| merged.data(v).origin == VertexOrigin::Setbounds).unwrap();
        let parent = merged.parent(child_merged).unwrap();
        assert_eq!(merged.data(parent).origin, VertexOrigin::Root);
    }
}
