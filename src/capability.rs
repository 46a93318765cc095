//! Capability value
//!
//! The immutable descriptor attached to every provenance graph vertex.

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Architectural capability permission bits.
    ///
    /// Only the permissions relevant to provenance tracking are named here;
    /// unnamed bits still round-trip through `bits()`/`from_bits_truncate`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Permissions: u32 {
        const LOAD = 1 << 0;
        const STORE = 1 << 1;
        const EXEC = 1 << 2;
        const LOAD_CAP = 1 << 3;
        const STORE_CAP = 1 << 4;
        const SEAL = 1 << 5;
        const SYSTEM = 1 << 6;
    }
}

impl Permissions {
    /// `derived.permissions ⊆ parent.permissions` (invariant 4).
    pub fn is_subset_of(&self, parent: &Permissions) -> bool {
        self.bits() & !parent.bits() == 0
    }
}

/// Immutable capability descriptor.
///
/// `bound = base + length` is a convenience, not stored separately.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub base: u64,
    pub length: u64,
    pub offset: u64,
    pub permissions: Permissions,
    pub object_type: u32,
    pub valid: bool,
    pub t_alloc: u64,
}

impl Capability {
    pub fn new(
        base: u64,
        length: u64,
        offset: u64,
        permissions: Permissions,
        object_type: u32,
        valid: bool,
    ) -> Self {
        Self {
            base,
            length,
            offset,
            permissions,
            object_type,
            valid,
            t_alloc: 0,
        }
    }

    pub fn bound(&self) -> u64 {
        self.base + self.length
    }

    pub fn has_perm(&self, perm: Permissions) -> bool {
        self.permissions.contains(perm)
    }

    /// True iff `self` could have been derived from `parent` per invariant 4:
    /// bounds only narrow and permissions only shrink.
    pub fn narrows(&self, parent: &Capability) -> bool {
        self.base >= parent.base
            && self.bound() <= parent.bound()
            && self.permissions.is_subset_of(&parent.permissions)
    }

    /// Two roots/placeholders are compatible for merge-time coalescing when
    /// base, length, permissions and object type agree (t_alloc/offset/valid
    /// are allowed to differ across workers' views).
    pub fn compatible(&self, other: &Capability) -> bool {
        self.base == other.base
            && self.length == other.length
            && self.permissions == other.permissions
            && self.object_type == other.object_type
    }
}
