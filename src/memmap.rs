//! Memory-vertex map (C5)
//!
//! Tracks which vertex (if any) is currently resident at a memory address.
//! Grounded on `VertexMemoryMap`/`MPVertexMemoryMap` in `parser.py`.

use hashbrown::HashMap;

use crate::graph::VHandle;

#[derive(Debug, Clone, Default)]
pub struct MemoryVertexMap {
    map: HashMap<u64, VHandle>,
}

impl MemoryVertexMap {
    pub fn new() -> Self {
        Self { map: HashMap::new() }
    }

    pub fn load(&self, addr: u64) -> Option<VHandle> {
        self.map.get(&addr).copied()
    }

    pub fn store(&mut self, addr: u64, handle: VHandle) {
        self.map.insert(addr, handle);
    }

    pub fn clear(&mut self, addr: u64) {
        self.map.remove(&addr);
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, VHandle)> + '_ {
        self.map.iter().map(|(&addr, &handle)| (addr, handle))
    }
}

/// Worker-side variant that additionally records the first observation at
/// each address, so a later merge step can reconcile the window boundary.
#[derive(Debug, Clone, Default)]
pub struct InitialMemoryVertexMap {
    current: MemoryVertexMap,
    initial: HashMap<u64, VHandle>,
}

impl InitialMemoryVertexMap {
    pub fn new() -> Self {
        Self { current: MemoryVertexMap::new(), initial: HashMap::new() }
    }

    /// Record a load at `addr`. If `handle` is given (the load delivered a
    /// vertex), remember it, and record the first-ever observation of `addr`.
    pub fn load(&mut self, addr: u64, handle: Option<VHandle>) -> Option<VHandle> {
        if let Some(handle) = handle {
            self.initial.entry(addr).or_insert(handle);
            self.current.store(addr, handle);
        }
        self.current.load(addr)
    }

    pub fn store(&mut self, addr: u64, handle: VHandle) {
        self.initial.entry(addr).or_insert(handle);
        self.current.store(addr, handle);
    }

    pub fn clear(&mut self, addr: u64) {
        self.current.clear(addr);
    }

    pub fn current(&self) -> &MemoryVertexMap {
        &self.current
    }

    pub fn initial_handle_for(&self, handle: VHandle) -> Option<u64> {
        self.initial.iter().find(|(_, &v)| v == handle).map(|(&addr, _)| addr)
    }

    pub fn initial_entries(&self) -> impl Iterator<Item = (u64, VHandle)> + '_ {
        self.initial.iter().map(|(&addr, &handle)| (addr, handle))
    }
}
