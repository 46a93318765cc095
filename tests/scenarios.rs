//! Concrete end-to-end scenarios driving `builder::build` directly, mirroring
//! individual dispatcher/merge unit tests but through the public entry point.

use cheri_provenance::builder;
use cheri_provenance::capability::{Capability, Permissions};
use cheri_provenance::config::BuilderConfig;
use cheri_provenance::dispatch::Dispatcher;
use cheri_provenance::trace::{InstructionRecord, Opcode, RegisterFileSnapshot, COP0_BADVADDR};
use cheri_provenance::vertex::VertexOrigin;
use cheri_provenance::worker::WindowSplit;

fn rec(cycle: u64, pc: u64, opcode: Opcode, operands: Vec<u8>) -> InstructionRecord {
    InstructionRecord {
        cycle,
        pc,
        opcode,
        operands,
        pre_regs: RegisterFileSnapshot::empty(),
        post_regs: RegisterFileSnapshot::empty(),
        memory_address: None,
        exception_code: None,
        is_load: false,
        is_store: false,
        is_kernel: false,
    }
}

fn cap(base: u64, length: u64, perms: Permissions) -> Capability {
    Capability::new(base, length, 0, perms, 0, true)
}

fn eret_bootstrap(regs: Vec<(usize, Capability)>, pcc: Capability) -> InstructionRecord {
    let mut r = rec(0, 0x1000, Opcode::Eret, vec![]);
    let mut caps = [None; 32];
    for (i, c) in regs {
        caps[i] = Some(c);
    }
    r.post_regs = RegisterFileSnapshot { caps, pcc: Some(pcc) };
    r
}

fn default_config() -> BuilderConfig {
    BuilderConfig::new(1, WindowSplit::InstructionCount)
}

/// S1 — single root derivation.
#[test]
fn s1_single_root_derivation() {
    let root_cap = cap(0x1000, 0x1000, Permissions::LOAD | Permissions::STORE);
    let mut csb = rec(1, 0x1004, Opcode::Csetbounds, vec![4, 3]);
    csb.post_regs.caps[4] = Some(cap(0x1000, 0x800, Permissions::LOAD));
    let records = vec![eret_bootstrap(vec![(3, root_cap)], root_cap), csb];

    let graph = builder::build(&records, &default_config()).unwrap();
    assert_eq!(graph.vertex_count(), 2);
    assert_eq!(graph.edge_count(), 1);

    let derived = graph.vertices().find(|&v| graph.data(v).origin == VertexOrigin::Setbounds).unwrap();
    assert_eq!(graph.data(derived).cap.length, 0x800);
    let root = graph.parent(derived).unwrap();
    assert_eq!(graph.data(root).origin, VertexOrigin::Root);
}

/// S2 — fromptr then setbounds *into a different register* does not collapse:
/// three vertices survive, in a root -> fromptr -> setbounds chain.
#[test]
fn s2_fromptr_then_setbounds_chain() {
    let root_cap = cap(0x1000, 0x1000, Permissions::LOAD);
    let mut fp = rec(1, 0x1004, Opcode::Cfromptr, vec![4, 3]);
    fp.post_regs.caps[4] = Some(cap(0x1020, 0x1000, Permissions::LOAD));
    let mut csb = rec(2, 0x1008, Opcode::Csetbounds, vec![5, 4]);
    csb.post_regs.caps[5] = Some(cap(0x1020, 0x40, Permissions::LOAD));
    let records = vec![eret_bootstrap(vec![(3, root_cap)], root_cap), fp, csb];

    let graph = builder::build(&records, &default_config()).unwrap();
    assert_eq!(graph.vertex_count(), 3);
    assert_eq!(graph.edge_count(), 2);

    let v5 = graph.vertices().find(|&v| graph.data(v).origin == VertexOrigin::Setbounds).unwrap();
    let v4 = graph.parent(v5).unwrap();
    assert_eq!(graph.data(v4).origin, VertexOrigin::Fromptr);
    let root = graph.parent(v4).unwrap();
    assert_eq!(graph.data(root).origin, VertexOrigin::Root);
}

/// S3 — store/load round trip: the loaded register recovers the same vertex
/// that was stored, with both events recorded against it.
#[test]
fn s3_store_load_round_trip() {
    let stored_cap = cap(0x9000, 0x100, Permissions::LOAD | Permissions::STORE);
    let mut store = rec(1, 0x1004, Opcode::Csc, vec![4]);
    store.memory_address = Some(0x2000);
    store.pre_regs.caps[4] = Some(stored_cap);

    let mut load = rec(2, 0x1008, Opcode::Clc, vec![6]);
    load.memory_address = Some(0x2000);
    load.post_regs.caps[6] = Some(stored_cap);

    let records = vec![eret_bootstrap(vec![(4, stored_cap)], stored_cap), store, load];
    let graph = builder::build(&records, &default_config()).unwrap();

    assert_eq!(graph.vertex_count(), 1, "store+load round trip creates no new vertex");
    let v = graph.vertices().next().unwrap();
    assert_eq!(graph.data(v).events.len(), 2);
    assert!(graph.data(v).events.iter().any(|e| e.kind == cheri_provenance::vertex::EventKind::MemStore));
    assert!(graph.data(v).events.iter().any(|e| e.kind == cheri_provenance::vertex::EventKind::MemLoad));
    assert!(graph.data(v).events.iter().all(|e| e.address == Some(0x2000)));
}

/// S4 — a branch that takes an exception and never commits restores pcc to
/// its pre-branch value once the badvaddr readout confirms non-commit.
#[test]
fn s4_branch_exception_that_did_not_commit() {
    let pcc0 = cap(0x400000, 0x10000, Permissions::EXEC);
    let target_cap = cap(0x500000, 0x10000, Permissions::EXEC);

    let branch_pc = 0x401000u64;
    let mut cjalr = rec(5, branch_pc, Opcode::Cjalr, vec![25, 24]);
    cjalr.exception_code = Some(5);

    let mut badvaddr = rec(6, 0x2000, Opcode::Mfc0 { dest_gpr: 2, cop0_reg: COP0_BADVADDR }, vec![]);
    badvaddr.memory_address = Some(branch_pc);

    let mut d = Dispatcher::new_first_window();
    d.step(&eret_bootstrap(vec![(25, target_cap)], pcc0)).unwrap();
    let pcc_before_branch = d.regs.pcc().unwrap();
    assert_eq!(d.graph.data(pcc_before_branch).cap.base, pcc0.base);

    d.step(&cjalr).unwrap();
    let target_vertex = d.regs.get(25).unwrap();
    assert_eq!(d.regs.pcc(), Some(target_vertex), "pcc provisionally follows the branch target");

    d.step(&badvaddr).unwrap();
    assert_eq!(d.regs.pcc(), Some(pcc_before_branch), "an uncommitted branch restores the pre-branch pcc");
}

/// S5 — splitting S1's trace between `eret` and `csetbounds` and merging the
/// two windows back together reproduces S1's graph exactly.
#[test]
fn s5_worker_boundary_reconciliation_matches_unsplit() {
    let root_cap = cap(0x1000, 0x1000, Permissions::LOAD | Permissions::STORE);
    let mut csb = rec(1, 0x1004, Opcode::Csetbounds, vec![4, 3]);
    csb.post_regs.caps[4] = Some(cap(0x1000, 0x800, Permissions::LOAD));
    let records = vec![eret_bootstrap(vec![(3, root_cap)], root_cap), csb];

    let config = BuilderConfig::new(2, WindowSplit::InstructionCount);
    let split_graph = builder::build(&records, &config).unwrap();

    assert_eq!(split_graph.vertex_count(), 2);
    assert_eq!(split_graph.edge_count(), 1);
    let derived = split_graph.vertices().find(|&v| split_graph.data(v).origin == VertexOrigin::Setbounds).unwrap();
    assert_eq!(split_graph.data(derived).cap.length, 0x800);
    let root = split_graph.parent(derived).unwrap();
    assert_eq!(split_graph.data(root).cap.base, 0x1000);
}

/// S6 — a syscall return that spans a window boundary still gets its
/// `syscall_ret` event recorded against the right vertex.
#[test]
fn s6_syscall_return_across_boundary() {
    let pcc0 = cap(0x400000, 0x10000, Permissions::EXEC);
    let ret_cap = cap(0xA000, 0x1000, Permissions::LOAD | Permissions::STORE);

    let mut sys = rec(1, 0x1004, Opcode::Syscall { code: 447 }, vec![]);
    sys.exception_code = Some(5);

    let mut eret = rec(2, 0x2000, Opcode::Eret, vec![]);
    eret.post_regs.pcc = Some(pcc0);

    let records = vec![eret_bootstrap(vec![(3, ret_cap)], pcc0), sys, eret];
    let config = BuilderConfig::new(2, WindowSplit::InstructionCount);
    let graph = builder::build(&records, &config).unwrap();

    let ret_vertex = graph.vertices().find(|&v| graph.data(v).cap.base == 0xA000).unwrap();
    assert!(graph
        .data(ret_vertex)
        .events
        .iter()
        .any(|e| e.kind == cheri_provenance::vertex::EventKind::SyscallRet && e.syscall_code == Some(447)));
}
