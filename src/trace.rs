//! Trace ingestion types (§6 external interface).
//!
//! The decoded-instruction source is an external collaborator; this module
//! only specifies the record shape the core consumes.

use serde::{Deserialize, Serialize};

use crate::capability::Capability;

/// Opcode classes the dispatcher (C6) recognizes. Anything not listed here
/// falls through to the generic "bounds-preserving move" handler, mirroring
/// the original parser's `scan_cap` catch-all for capability instructions
/// without custom register-set handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    Csetbounds,
    Csetboundsexact,
    Cfromptr,
    Candperm,
    /// Bounds-preserving capability move or arithmetic (e.g. `cmove`,
    /// register-to-register copies that don't change bounds).
    CapMove,
    /// Capability load (`clc`/`clcr`/`clci`).
    Clc,
    /// Capability store (`csc`/`cscr`/`csci`).
    Csc,
    /// Load of data through a capability (dereference, not of the cap itself).
    DataLoadThroughCap { ptr_reg: u8 },
    /// Store of data through a capability.
    DataStoreThroughCap { ptr_reg: u8 },
    Cgetepcc,
    Csetepcc,
    Cgetkcc,
    Csetkcc,
    Cgetkdc,
    Csetkdc,
    Cgetdefault,
    Csetdefault,
    Cgetpcc,
    Cgetpccsetoffset,
    Cjr,
    Cjalr,
    Cclearregs,
    Ccall,
    Creturn,
    /// `mfc0`-style move from a system coprocessor register.
    Mfc0 { dest_gpr: u8, cop0_reg: u8 },
    /// Exception/interrupt return.
    Eret,
    /// A syscall trap instruction, carrying the already-resolved effective
    /// syscall code (the indirect-code convention — reading the real code
    /// from a general-purpose argument register when the primary code is 0
    /// or 198 — is resolved by the decoded instruction source upstream of
    /// this crate; see `syscall::effective_syscall_code` for the rule it
    /// follows).
    Syscall { code: i64 },
    /// Any other instruction not affecting capability provenance tracking.
    Other,
}

/// Coprocessor-0 register number that carries the faulting address, read via
/// `mfc0 $dest, $8` on a MIPS/CHERI exception.
pub const COP0_BADVADDR: u8 = 8;

/// A single instruction record as produced by the (external) decoded
/// instruction source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionRecord {
    pub cycle: u64,
    pub pc: u64,
    pub opcode: Opcode,
    /// `operands[0]` is conventionally the destination register index,
    /// `operands[1]` the source, when the opcode needs one.
    pub operands: Vec<u8>,
    pub pre_regs: RegisterFileSnapshot,
    pub post_regs: RegisterFileSnapshot,
    pub memory_address: Option<u64>,
    /// `None` means no exception; `Some(31)` is the conventional
    /// no-exception code used by some traces (mirrored in `branch`/`syscall`
    /// via `has_exception`).
    pub exception_code: Option<u8>,
    pub is_load: bool,
    pub is_store: bool,
    pub is_kernel: bool,
}

impl InstructionRecord {
    pub fn has_exception(&self) -> bool {
        matches!(self.exception_code, Some(code) if code != 31)
    }
}

/// Snapshot of the 32 capability registers plus PCC, as seen either just
/// before or just after an instruction executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterFileSnapshot {
    pub caps: [Option<Capability>; 32],
    pub pcc: Option<Capability>,
}

impl RegisterFileSnapshot {
    pub fn empty() -> Self {
        Self { caps: [None; 32], pcc: None }
    }
}
