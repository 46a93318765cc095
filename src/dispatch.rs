//! Instruction dispatcher (C6)
//!
//! The central per-instruction state machine. `Dispatcher::step` consumes one
//! `InstructionRecord` at a time and mutates the register model, memory-vertex
//! map, and graph store in lockstep, delegating branch/exception and syscall
//! bookkeeping to `branch`/`syscall`. Grounded on the `scan_*` handler table
//! of `PointerProvenanceParser` in `parser.py`.

use crate::branch::BranchState;
use crate::capability::Capability;
use crate::error::BuildError;
use crate::graph::{ProvenanceGraph, VHandle};
use crate::memmap::InitialMemoryVertexMap;
use crate::regset::{partial_vertex_data, RegisterSet, NUM_REGS};
use crate::syscall::{self, SyscallState};
use crate::trace::{InstructionRecord, Opcode, RegisterFileSnapshot, COP0_BADVADDR};
use crate::vertex::{VertexData, VertexEvent, VertexOrigin};

/// The four special capability registers addressed individually by
/// `cget<x>`/`cset<x>`, tracked outside the 32-register file (ground:
/// `_handle_cpreg_get`/`_handle_cpreg_set`'s `regnum`-keyed special-register
/// table in `parser.py`, which is disjoint from the general-purpose bank).
#[derive(Debug, Clone, Default)]
pub(crate) struct SpecialRegisters {
    pub(crate) epcc: Option<VHandle>,
    pub(crate) kcc: Option<VHandle>,
    pub(crate) kdc: Option<VHandle>,
    pub(crate) default: Option<VHandle>,
}

/// Everything one worker mutates while walking its window of the trace.
pub struct Dispatcher {
    pub graph: ProvenanceGraph,
    pub regs: RegisterSet,
    pub memvmap: InitialMemoryVertexMap,
    pub branch: BranchState,
    pub syscall: SyscallState,
    pub(crate) special: SpecialRegisters,
    /// Only meaningful for the trace's first window: `false` until the first
    /// `eret` is observed, during which every instruction is a no-op (the
    /// window starts before the traced program reaches user code).
    bootstrapped: bool,
    is_first_window: bool,
    /// `cfromptr` awaiting a following `csetbounds` on the same register, so
    /// the pair collapses into a single `PtrSetbounds` vertex instead of two
    /// (ground: the `PtrSetbounds` origin tag exists precisely for this).
    pending_fromptr: Option<(usize, VHandle, u64)>,
}

impl Dispatcher {
    /// A dispatcher for the window containing cycle 0: starts with an empty
    /// register file and waits for the first `eret` before tracking anything.
    pub fn new_first_window() -> Self {
        Self {
            graph: ProvenanceGraph::new(),
            regs: RegisterSet::new(),
            memvmap: InitialMemoryVertexMap::new(),
            branch: BranchState::new(),
            syscall: SyscallState::new(),
            special: SpecialRegisters::default(),
            bootstrapped: false,
            is_first_window: true,
            pending_fromptr: None,
        }
    }

    /// A dispatcher for a window that does not start at the beginning of the
    /// trace: every register (and pcc) starts holding a fresh `Partial`
    /// placeholder vertex, a boundary contract resolved later by `merge`.
    pub fn new_with_placeholders() -> Self {
        let mut graph = ProvenanceGraph::new();
        let regs = RegisterSet::with_placeholders(&mut graph, partial_vertex_data);
        let epcc = Some(graph.add_vertex(partial_vertex_data()));
        let kcc = Some(graph.add_vertex(partial_vertex_data()));
        let kdc = Some(graph.add_vertex(partial_vertex_data()));
        let default = Some(graph.add_vertex(partial_vertex_data()));
        Self {
            graph,
            regs,
            memvmap: InitialMemoryVertexMap::new(),
            branch: BranchState::new(),
            syscall: SyscallState::new(),
            special: SpecialRegisters { epcc, kcc, kdc, default },
            bootstrapped: true,
            is_first_window: false,
            pending_fromptr: None,
        }
    }

    /// Advance the state machine by one instruction.
    pub fn step(&mut self, rec: &InstructionRecord) -> Result<(), BuildError> {
        if self.is_first_window && !self.bootstrapped {
            if matches!(rec.opcode, Opcode::Eret) {
                self.bootstrap_from(&rec.post_regs, rec.pc);
                self.bootstrapped = true;
            }
            return Ok(());
        }

        // Captured before a same-instruction exception redirects `pcc` to
        // `kcc` below, so a branch that faults still saves the pcc it had
        // *before* the jump, not the kernel vector it was just redirected to.
        let pre_exception_pcc = self.regs.pcc();
        if !matches!(rec.opcode, Opcode::Eret) && rec.has_exception() {
            self.special.epcc = pre_exception_pcc;
            self.regs.set_pcc(self.special.kcc);
            self.syscall.enter_exception();
        }

        if !matches!(rec.opcode, Opcode::Csetbounds | Opcode::Csetboundsexact) {
            self.pending_fromptr = None;
        }

        match rec.opcode {
            Opcode::Csetbounds | Opcode::Csetboundsexact => self.handle_setbounds(rec)?,
            Opcode::Cfromptr => self.handle_fromptr(rec)?,
            Opcode::Candperm => self.handle_derive(rec, VertexOrigin::Andperm)?,
            Opcode::CapMove => self.handle_move(rec),
            Opcode::Clc => self.handle_clc(rec)?,
            Opcode::Csc => self.handle_csc(rec)?,
            Opcode::DataLoadThroughCap { ptr_reg } => self.handle_deref(rec, ptr_reg, false)?,
            Opcode::DataStoreThroughCap { ptr_reg } => self.handle_deref(rec, ptr_reg, true)?,
            Opcode::Cgetepcc => self.handle_cget(rec, |s| s.epcc),
            Opcode::Csetepcc => self.handle_cset(rec, |s, h| s.epcc = h),
            Opcode::Cgetkcc => self.handle_cget(rec, |s| s.kcc),
            Opcode::Csetkcc => self.handle_cset(rec, |s, h| s.kcc = h),
            Opcode::Cgetkdc => self.handle_cget(rec, |s| s.kdc),
            Opcode::Csetkdc => self.handle_cset(rec, |s, h| s.kdc = h),
            Opcode::Cgetdefault => self.handle_cget(rec, |s| s.default),
            Opcode::Csetdefault => self.handle_cset(rec, |s, h| s.default = h),
            Opcode::Cgetpcc | Opcode::Cgetpccsetoffset => self.handle_cgetpcc(rec),
            Opcode::Cjr => self.handle_branch(rec, None, pre_exception_pcc)?,
            Opcode::Cjalr => self.handle_branch(rec, rec.operands.get(1).copied(), pre_exception_pcc)?,
            Opcode::Cclearregs => return Err(BuildError::unexpected(rec.cycle, "cclearregs is unsupported")),
            Opcode::Ccall => return Err(BuildError::unexpected(rec.cycle, "ccall is unsupported")),
            Opcode::Creturn => return Err(BuildError::unexpected(rec.cycle, "creturn is unsupported")),
            Opcode::Mfc0 { cop0_reg, .. } if cop0_reg == COP0_BADVADDR => self.handle_badvaddr(rec)?,
            Opcode::Mfc0 { .. } => {}
            Opcode::Eret => self.handle_eret(rec)?,
            Opcode::Syscall { code } => self.handle_syscall(rec, code),
            Opcode::Other => {}
        }
        Ok(())
    }

    fn bootstrap_from(&mut self, snapshot: &RegisterFileSnapshot, pc: u64) {
        for i in 0..NUM_REGS {
            if let Some(cap) = snapshot.caps[i] {
                if cap.valid {
                    let handle = self.graph.add_vertex(VertexData::new(cap, VertexOrigin::Root, pc, false));
                    self.regs.set(i, Some(handle));
                }
            }
        }
        if let Some(cap) = snapshot.pcc {
            let handle = self.graph.add_vertex(VertexData::new(cap, VertexOrigin::Root, pc, false));
            self.regs.set_pcc(Some(handle));
        }
        self.branch.mark_eret_seen();
        tracing::debug!(pc, "bootstrapped register file from the trace's first eret");
    }

    fn dst_src(rec: &InstructionRecord) -> (usize, usize) {
        (rec.operands[0] as usize, rec.operands[1] as usize)
    }

    fn post_cap(rec: &InstructionRecord, reg: usize) -> Option<Capability> {
        rec.post_regs.caps[reg]
    }

    /// Stamp a freshly derived capability's allocation time with the creating
    /// instruction's cycle (§3.1: `t_alloc` is best-effort metadata, not an
    /// invariant-bearing field, so this never touches `Root`/`Partial` caps).
    fn stamp_t_alloc(mut cap: Capability, cycle: u64) -> Capability {
        cap.t_alloc = cycle;
        cap
    }

    fn handle_setbounds(&mut self, rec: &InstructionRecord) -> Result<(), BuildError> {
        let (dst, src) = Self::dst_src(rec);
        let parent = self.regs.get(src).ok_or_else(|| {
            BuildError::missing_parent(rec.cycle, format!("csetbounds: c{src} holds no capability"))
        })?;
        let cap = Self::post_cap(rec, dst)
            .ok_or_else(|| BuildError::missing_parent(rec.cycle, "csetbounds: no post-instruction value"))?;
        let cap = Self::stamp_t_alloc(cap, rec.cycle);

        if let Some((fp_reg, fp_handle, fp_cycle)) = self.pending_fromptr {
            if dst == src
                && fp_reg == src
                && fp_handle == parent
                && rec.cycle == fp_cycle + 1
                && self.graph.out_degree(fp_handle) == 0
            {
                let data = self.graph.data_mut(fp_handle);
                data.cap = cap;
                data.origin = VertexOrigin::PtrSetbounds;
                self.regs.set(dst, Some(fp_handle));
                self.pending_fromptr = None;
                return Ok(());
            }
        }

        let handle = self.graph.add_vertex(VertexData::new(cap, VertexOrigin::Setbounds, rec.pc, rec.is_kernel));
        self.graph.add_edge(parent, handle);
        self.regs.set(dst, Some(handle));
        self.pending_fromptr = None;
        Ok(())
    }

    fn handle_fromptr(&mut self, rec: &InstructionRecord) -> Result<(), BuildError> {
        let (dst, src) = Self::dst_src(rec);
        let parent = self
            .regs
            .get(src)
            .ok_or_else(|| BuildError::missing_parent(rec.cycle, format!("cfromptr: c{src} holds no capability")))?;
        let cap = Self::post_cap(rec, dst)
            .ok_or_else(|| BuildError::missing_parent(rec.cycle, "cfromptr: no post-instruction value"))?;
        let cap = Self::stamp_t_alloc(cap, rec.cycle);
        let handle = self.graph.add_vertex(VertexData::new(cap, VertexOrigin::Fromptr, rec.pc, rec.is_kernel));
        self.graph.add_edge(parent, handle);
        self.regs.set(dst, Some(handle));
        self.pending_fromptr = Some((dst, handle, rec.cycle));
        Ok(())
    }

    fn handle_derive(&mut self, rec: &InstructionRecord, origin: VertexOrigin) -> Result<(), BuildError> {
        let (dst, src) = Self::dst_src(rec);
        let parent = self
            .regs
            .get(src)
            .ok_or_else(|| BuildError::missing_parent(rec.cycle, format!("c{src} holds no capability")))?;
        let cap =
            Self::post_cap(rec, dst).ok_or_else(|| BuildError::missing_parent(rec.cycle, "no post-instruction value"))?;
        let cap = Self::stamp_t_alloc(cap, rec.cycle);
        let handle = self.graph.add_vertex(VertexData::new(cap, origin, rec.pc, rec.is_kernel));
        self.graph.add_edge(parent, handle);
        self.regs.set(dst, Some(handle));
        Ok(())
    }

    fn handle_move(&mut self, rec: &InstructionRecord) {
        let (dst, src) = Self::dst_src(rec);
        self.regs.move_reg(src, dst);
    }

    fn handle_clc(&mut self, rec: &InstructionRecord) -> Result<(), BuildError> {
        let dst = rec.operands[0] as usize;
        let addr = rec
            .memory_address
            .ok_or_else(|| BuildError::unexpected(rec.cycle, "clc without a memory address"))?;
        let post_valid = Self::post_cap(rec, dst).map(|c| c.valid).unwrap_or(false);
        if !post_valid {
            self.regs.set(dst, None);
            self.memvmap.clear(addr);
            return Ok(());
        }
        if let Some(handle) = self.memvmap.current().load(addr) {
            self.regs.set(dst, Some(handle));
            self.graph.data_mut(handle).push_event(VertexEvent::mem_load(rec.cycle, addr));
        } else {
            let cap = Self::post_cap(rec, dst).expect("post_valid implies Some");
            let mut data = VertexData::new(cap, VertexOrigin::Root, rec.pc, rec.is_kernel);
            data.push_event(VertexEvent::mem_load(rec.cycle, addr));
            let handle = self.graph.add_vertex(data);
            self.regs.set(dst, Some(handle));
            self.memvmap.load(addr, Some(handle));
            tracing::debug!(cycle = rec.cycle, addr, "synthesized root for unobserved memory load");
        }
        Ok(())
    }

    fn handle_csc(&mut self, rec: &InstructionRecord) -> Result<(), BuildError> {
        let src = rec.operands[0] as usize;
        let addr = rec
            .memory_address
            .ok_or_else(|| BuildError::unexpected(rec.cycle, "csc without a memory address"))?;
        let pre_valid = rec.pre_regs.caps[src].map(|c| c.valid).unwrap_or(false);
        if !pre_valid {
            self.memvmap.clear(addr);
            return Ok(());
        }
        let handle = match self.regs.get(src) {
            Some(h) => h,
            None => {
                let cap = rec.pre_regs.caps[src].expect("pre_valid implies Some");
                let handle = self.graph.add_vertex(VertexData::new(cap, VertexOrigin::Root, rec.pc, rec.is_kernel));
                self.regs.set(src, Some(handle));
                tracing::debug!(cycle = rec.cycle, addr, "synthesized root for unobserved stored capability");
                handle
            }
        };
        self.graph.data_mut(handle).push_event(VertexEvent::mem_store(rec.cycle, addr));
        self.memvmap.store(addr, handle);
        Ok(())
    }

    fn handle_deref(&mut self, rec: &InstructionRecord, ptr_reg: u8, is_store: bool) -> Result<(), BuildError> {
        let handle = self.regs.get(ptr_reg as usize).ok_or_else(|| {
            BuildError::dereference_unknown(rec.cycle, format!("c{ptr_reg} holds no tracked capability"))
        })?;
        let addr = rec.memory_address.unwrap_or(0);
        let event = if is_store {
            VertexEvent::deref_store(rec.cycle, addr, false)
        } else {
            VertexEvent::deref_load(rec.cycle, addr, false)
        };
        self.graph.data_mut(handle).push_event(event);
        Ok(())
    }

    /// Synthesize a root from `cap` if `current` is unset. `cap` is the
    /// destination/source GPR's own post-value — the special register's
    /// actual capability, not a stand-in borrowed from `pcc` — matching
    /// `_handle_cpreg_get`/`_handle_cpreg_set`'s root-from-`inst.op0.value`.
    fn ensure_special(&mut self, rec: &InstructionRecord, current: Option<VHandle>, cap: Option<Capability>, label: &str) -> VHandle {
        match current {
            Some(h) => h,
            None => {
                let cap = cap.unwrap_or_else(|| Capability::new(0, 0, 0, crate::capability::Permissions::empty(), 0, false));
                let handle = self.graph.add_vertex(VertexData::new(cap, VertexOrigin::Root, rec.pc, rec.is_kernel));
                tracing::debug!(cycle = rec.cycle, label, "synthesized root for unobserved special register");
                handle
            }
        }
    }

    fn handle_cget(&mut self, rec: &InstructionRecord, select: impl Fn(&SpecialRegisters) -> Option<VHandle>) {
        let dst = rec.operands[0] as usize;
        let current = select(&self.special);
        let cap = rec.post_regs.caps[dst];
        let handle = self.ensure_special(rec, current, cap, "cget");
        self.regs.set(dst, Some(handle));
    }

    fn handle_cset(&mut self, rec: &InstructionRecord, write: impl FnOnce(&mut SpecialRegisters, Option<VHandle>)) {
        let src = rec.operands[0] as usize;
        let current = self.regs.get(src);
        let cap = rec.pre_regs.caps[src];
        let handle = self.ensure_special(rec, current, cap, "cset");
        write(&mut self.special, Some(handle));
    }

    fn handle_cgetpcc(&mut self, rec: &InstructionRecord) {
        let dst = rec.operands[0] as usize;
        let cap = rec.post_regs.pcc;
        let pcc = self.ensure_special(rec, self.regs.pcc(), cap, "cgetpcc");
        self.regs.set(dst, Some(pcc));
    }

    fn handle_branch(
        &mut self,
        rec: &InstructionRecord,
        link_reg: Option<u8>,
        old_pcc: Option<VHandle>,
    ) -> Result<(), BuildError> {
        let target_reg = rec.operands[0] as usize;
        let target = self
            .regs
            .get(target_reg)
            .ok_or_else(|| BuildError::dereference_unknown(rec.cycle, format!("branch target c{target_reg} is unknown")))?;
        if !self.graph.data(target).cap.has_perm(crate::capability::Permissions::EXEC) {
            return Err(BuildError::unexpected(rec.cycle, format!("branch target c{target_reg} lacks EXEC permission")));
        }
        if let Some(link) = link_reg {
            if let Some(pcc) = old_pcc {
                self.regs.set(link as usize, Some(pcc));
            }
        }
        if rec.has_exception() {
            if let Some(pcc) = old_pcc {
                self.branch.save_branch(rec.pc, pcc, target, &self.graph);
            }
        }
        self.regs.set_pcc(Some(target));
        Ok(())
    }

    fn handle_badvaddr(&mut self, rec: &InstructionRecord) -> Result<(), BuildError> {
        // `parser.py`'s `scan_dmfc0` never synthesizes a root here: if `epcc`
        // hasn't been observed locally yet, there's nothing to restore pcc
        // against, so this read is simply a no-op for branch bookkeeping.
        let Some(epcc) = self.special.epcc else { return Ok(()) };
        let badvaddr = rec.memory_address.unwrap_or(0);
        if let Some(restored) = self.branch.observe_badvaddr(badvaddr, epcc, &self.graph, rec.cycle)? {
            self.regs.set_pcc(Some(restored));
        }
        Ok(())
    }

    fn handle_eret(&mut self, rec: &InstructionRecord) -> Result<(), BuildError> {
        let cap = rec.post_regs.pcc;
        let epcc = self.ensure_special(rec, self.special.epcc, cap, "eret-epcc");
        let epcc_cap = self.graph.data(epcc).cap;
        if !epcc_cap.has_perm(crate::capability::Permissions::EXEC) {
            return Err(BuildError::unexpected(rec.cycle, "epcc lacks EXEC permission"));
        }
        let epcc_addr = epcc_cap.base + epcc_cap.offset;
        let return_cap = self.regs.get(syscall::RETURN_CAP_REGISTER);
        if let Some(code) = self.syscall.leave_exception(epcc_addr, rec.cycle, return_cap) {
            if let Some(handle) = return_cap {
                self.graph.data_mut(handle).push_event(VertexEvent::syscall_ret(rec.cycle, code));
            }
        }
        self.branch.mark_eret_seen();
        self.regs.set_pcc(Some(epcc));
        Ok(())
    }

    fn handle_syscall(&mut self, rec: &InstructionRecord, code: i64) {
        let slot = self.syscall.observe_syscall(code as i32, rec.pc);
        if let Some(syscall::SyscallSlot::Argument(reg)) = slot {
            if let Some(handle) = self.regs.get(reg) {
                self.graph
                    .data_mut(handle)
                    .push_event(VertexEvent::syscall_arg(rec.cycle, code as i32));
            }
        }
    }
}
