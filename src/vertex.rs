//! Vertex data
//!
//! Per-vertex record attached to every node of the provenance graph store
//! (`graph::ProvenanceGraph`).

use serde::{Deserialize, Serialize};

use crate::capability::Capability;

/// Tag identifying how a vertex's capability was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VertexOrigin {
    /// Capability existed before we started observing the trace.
    Root,
    Setbounds,
    Fromptr,
    Andperm,
    /// Merged `cfromptr` → `csetbounds` pair.
    PtrSetbounds,
    /// Window-boundary placeholder. Must not survive the global merge.
    Partial,
}

impl VertexOrigin {
    pub fn is_root(&self) -> bool {
        matches!(self, VertexOrigin::Root)
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, VertexOrigin::Partial)
    }
}

/// A single recorded use of a capability: a load/store through it
/// (dereference), a load/store of it (memory), or a syscall argument/return.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    DerefLoad,
    DerefStore,
    MemLoad,
    MemStore,
    SyscallArg,
    SyscallRet,
}

impl EventKind {
    pub fn is_dereference(&self) -> bool {
        matches!(self, EventKind::DerefLoad | EventKind::DerefStore)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VertexEvent {
    pub cycle: u64,
    pub kind: EventKind,
    pub address: Option<u64>,
    pub syscall_code: Option<i32>,
    pub is_cap_valued: Option<bool>,
}

impl VertexEvent {
    pub fn deref_load(cycle: u64, address: u64, is_cap_valued: bool) -> Self {
        Self {
            cycle,
            kind: EventKind::DerefLoad,
            address: Some(address),
            syscall_code: None,
            is_cap_valued: Some(is_cap_valued),
        }
    }

    pub fn deref_store(cycle: u64, address: u64, is_cap_valued: bool) -> Self {
        Self {
            cycle,
            kind: EventKind::DerefStore,
            address: Some(address),
            syscall_code: None,
            is_cap_valued: Some(is_cap_valued),
        }
    }

    pub fn mem_load(cycle: u64, address: u64) -> Self {
        Self {
            cycle,
            kind: EventKind::MemLoad,
            address: Some(address),
            syscall_code: None,
            is_cap_valued: None,
        }
    }

    pub fn mem_store(cycle: u64, address: u64) -> Self {
        Self {
            cycle,
            kind: EventKind::MemStore,
            address: Some(address),
            syscall_code: None,
            is_cap_valued: None,
        }
    }

    pub fn syscall_arg(cycle: u64, code: i32) -> Self {
        Self {
            cycle,
            kind: EventKind::SyscallArg,
            address: None,
            syscall_code: Some(code),
            is_cap_valued: None,
        }
    }

    pub fn syscall_ret(cycle: u64, code: i32) -> Self {
        Self {
            cycle,
            kind: EventKind::SyscallRet,
            address: None,
            syscall_code: Some(code),
            is_cap_valued: None,
        }
    }
}

/// Per-vertex record: the capability, its origin, and its full history of use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VertexData {
    pub cap: Capability,
    pub origin: VertexOrigin,
    pub pc_created: u64,
    pub is_kernel: bool,
    pub events: Vec<VertexEvent>,
    /// Downstream-filter visibility mask (§3 Lifecycle). The builder never
    /// sets this; it exists so persisted graphs have somewhere to record it.
    pub hidden: bool,
}

impl VertexData {
    pub fn new(cap: Capability, origin: VertexOrigin, pc_created: u64, is_kernel: bool) -> Self {
        Self {
            cap,
            origin,
            pc_created,
            is_kernel,
            events: Vec::new(),
            hidden: false,
        }
    }

    /// Append an event, preserving invariant 5 (non-decreasing cycles) by
    /// construction: callers append in cycle order, and this only asserts it
    /// in debug builds to catch dispatcher bugs early.
    pub fn push_event(&mut self, event: VertexEvent) {
        debug_assert!(
            self.events.last().map(|e| e.cycle <= event.cycle).unwrap_or(true),
            "event cycles must be non-decreasing"
        );
        self.events.push(event);
    }

    /// Concatenate another vertex's events into this one, in arrival order
    /// (used when a merge-time placeholder or suppressed root is folded in).
    pub fn absorb_events(&mut self, other: &VertexData) {
        self.events.extend(other.events.iter().copied());
    }

    pub fn n_dereferences(&self) -> usize {
        self.events.iter().filter(|e| e.kind.is_dereference()).count()
    }
}
