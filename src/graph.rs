//! Graph store (C3)
//!
//! A directed graph of provenance vertices, backed by `petgraph`. Edges carry
//! no payload: an edge `u -> v` asserts "`v` was derived from `u`".

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::vertex::VertexData;

/// Handle to a vertex. Cheap to copy; stable for the lifetime of the graph
/// (the builder never removes vertices, per the Lifecycle note in §3).
pub type VHandle = NodeIndex<u32>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvenanceGraph {
    graph: DiGraph<VertexData, (), u32>,
}

impl ProvenanceGraph {
    pub fn new() -> Self {
        Self { graph: DiGraph::default() }
    }

    pub fn add_vertex(&mut self, data: VertexData) -> VHandle {
        self.graph.add_node(data)
    }

    pub fn add_edge(&mut self, parent: VHandle, child: VHandle) {
        self.graph.add_edge(parent, child, ());
    }

    pub fn data(&self, handle: VHandle) -> &VertexData {
        &self.graph[handle]
    }

    pub fn data_mut(&mut self, handle: VHandle) -> &mut VertexData {
        &mut self.graph[handle]
    }

    pub fn vertex_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn vertices(&self) -> impl Iterator<Item = VHandle> + '_ {
        self.graph.node_indices()
    }

    pub fn edges(&self) -> impl Iterator<Item = (VHandle, VHandle)> + '_ {
        self.graph.edge_references().map(|e| (e.source(), e.target()))
    }

    /// Parent of a vertex, if any. Invariant 1 guarantees at most one for
    /// any non-`Root`, non-`Partial` vertex; this does not itself enforce it.
    pub fn parent(&self, handle: VHandle) -> Option<VHandle> {
        self.graph.neighbors_directed(handle, Direction::Incoming).next()
    }

    pub fn parents(&self, handle: VHandle) -> impl Iterator<Item = VHandle> + '_ {
        self.graph.neighbors_directed(handle, Direction::Incoming)
    }

    pub fn children(&self, handle: VHandle) -> impl Iterator<Item = VHandle> + '_ {
        self.graph.neighbors_directed(handle, Direction::Outgoing)
    }

    pub fn in_degree(&self, handle: VHandle) -> usize {
        self.graph.neighbors_directed(handle, Direction::Incoming).count()
    }

    pub fn out_degree(&self, handle: VHandle) -> usize {
        self.graph.neighbors_directed(handle, Direction::Outgoing).count()
    }

    pub fn inner(&self) -> &DiGraph<VertexData, (), u32> {
        &self.graph
    }
}
