//! Graph store.
//!
//! A directed multigraph kept as an arena: nodes and edges live in slot vectors indexed by stable handles.
//! A [`NodeId`] survives any change of the node's operator payload ([`Graph::replace_obj`]); removed slots are
//! never reused, so a stale handle can always be detected with [`Graph::contains`].
//!
//! Iteration (nodes, in-edges, out-edges) follows insertion order, which keeps pattern matching and sorting
//! deterministic across runs.

mod edge;
mod outputs;
mod query;

use std::collections::HashMap;
use std::fmt;

use itertools::Itertools;
use smallvec::SmallVec;
use snafu::{OptionExt, ensure};

pub use edge::{EdgeAttr, EdgeRef};

use crate::error::{EdgeExistsSnafu, NodeNotFoundSnafu, Result};
use crate::op::{Attrs, Op, OpType};
use edge::Edge;

/// Stable node handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Source model format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[derive(strum::Display, strum::EnumString, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Framework {
    #[default]
    Onnx,
    Tflite,
    Caffe,
    Tensorflow,
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    op: Option<Op>,
    in_edges: SmallVec<[usize; 4]>,
    out_edges: SmallVec<[usize; 4]>,
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub name: String,
    pub framework: Framework,
    pub quantize: bool,
    nodes: Vec<Option<Node>>,
    edges: Vec<Option<Edge>>,
    names: HashMap<String, NodeId>,
    output_names: Vec<NodeId>,
    live_nodes: usize,
    live_edges: usize,
}

impl Graph {
    pub fn new(name: impl Into<String>, framework: Framework) -> Self {
        Self { name: name.into(), framework, ..Self::default() }
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.live_nodes
    }

    pub fn is_empty(&self) -> bool {
        self.live_nodes == 0
    }

    pub fn edge_count(&self) -> usize {
        self.live_edges
    }

    /// Live nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().enumerate().filter(|(_, n)| n.is_some()).map(|(i, _)| NodeId(i as u32))
    }

    /// Live edges in insertion order.
    pub fn edges(&self) -> impl Iterator<Item = EdgeRef> + '_ {
        self.edges.iter().flatten().map(Edge::snapshot)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    pub fn id(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    /// Resolve a node name, failing with `NodeNotFound`.
    pub fn lookup(&self, name: &str) -> Result<NodeId> {
        self.id(name).context(NodeNotFoundSnafu { node: name })
    }

    /// Name of a live node, empty for a removed one.
    pub fn name(&self, id: NodeId) -> &str {
        self.node(id).map(|n| n.name.as_str()).unwrap_or_default()
    }

    /// Create an uninitialized node, or return the existing one with this name.
    pub fn add_node(&mut self, name: impl Into<String>) -> NodeId {
        let name = name.into();
        if let Some(id) = self.id(&name) {
            return id;
        }
        let id = NodeId(self.nodes.len() as u32);
        self.names.insert(name.clone(), id);
        self.nodes.push(Some(Node { name, op: None, in_edges: SmallVec::new(), out_edges: SmallVec::new() }));
        self.live_nodes += 1;
        id
    }

    pub fn add_op_node(&mut self, name: impl Into<String>, op: impl Into<Op>) -> NodeId {
        let id = self.add_node(name);
        self.set_op(id, op);
        id
    }

    /// Operator payload, `None` for an uninitialized or invalid node.
    pub fn op(&self, id: NodeId) -> Option<&Op> {
        self.node(id).and_then(|n| n.op.as_ref())
    }

    pub fn op_mut(&mut self, id: NodeId) -> Option<&mut Op> {
        self.node_mut(id).and_then(|n| n.op.as_mut())
    }

    pub fn op_type(&self, id: NodeId) -> Option<OpType> {
        self.op(id).map(Op::op_type)
    }

    pub fn set_op(&mut self, id: NodeId, op: impl Into<Op>) {
        if let Some(node) = self.node_mut(id) {
            node.op = Some(op.into());
        }
    }

    /// Swap the payload of `id` for a new kind built from `attrs`. Edges are untouched.
    ///
    /// The node keeps its previous payload when `attrs` does not satisfy the new kind's schema.
    pub fn replace_obj(&mut self, id: NodeId, op_type: OpType, attrs: &Attrs) -> Result<()> {
        ensure!(self.contains(id), NodeNotFoundSnafu { node: id.to_string() });
        let op = Op::from_attrs(op_type, attrs)?;
        tracing::trace!(node = %self.name(id), from = ?self.op_type(id), to = %op_type, "replace_obj");
        self.set_op(id, op);
        Ok(())
    }

    /// `base` if free, else the first free `base_1`, `base_2`, ...
    pub fn get_valid_node_name(&self, base: &str) -> String {
        if !self.names.contains_key(base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{base}_{i}"))
            .find(|candidate| !self.names.contains_key(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    /// Insert an edge with the next free key of the `(src, dst)` pair.
    pub fn add_edge(&mut self, src: NodeId, dst: NodeId, attr: EdgeAttr) -> Result<u32> {
        self.require(src)?;
        self.require(dst)?;
        let key = self.next_key(src, dst);
        self.insert_edge(Edge { src, dst, key, attr });
        Ok(key)
    }

    /// Insert an edge with an explicit key, failing with `EdgeExists` on a collision.
    pub fn add_edge_with_key(&mut self, src: NodeId, dst: NodeId, key: u32, attr: EdgeAttr) -> Result<()> {
        self.require(src)?;
        self.require(dst)?;
        ensure!(
            !self.edge_indices_between(src, dst).any(|ix| self.edge_at(ix).key == key),
            EdgeExistsSnafu { src, dst, key }
        );
        self.insert_edge(Edge { src, dst, key, attr });
        Ok(())
    }

    /// Name-based insertion; missing endpoints are created as uninitialized nodes.
    pub fn add_named_edge(&mut self, src: &str, dst: &str, attr: EdgeAttr) -> (NodeId, NodeId, u32) {
        let src = self.add_node(src);
        let dst = self.add_node(dst);
        let key = self.next_key(src, dst);
        self.insert_edge(Edge { src, dst, key, attr });
        (src, dst, key)
    }

    /// Remove one edge. With `key = None` the most recently inserted edge of the pair goes.
    ///
    /// Absent edges are ignored; returns whether an edge was removed.
    pub fn remove_edge(&mut self, src: NodeId, dst: NodeId, key: Option<u32>) -> bool {
        let target = match key {
            Some(key) => self.edge_indices_between(src, dst).find(|&ix| self.edge_at(ix).key == key),
            None => self.edge_indices_between(src, dst).max(),
        };
        match target {
            Some(ix) => {
                self.detach_edge(ix);
                true
            }
            None => false,
        }
    }

    pub fn remove_edges_from<I>(&mut self, edges: I)
    where
        I: IntoIterator<Item = (NodeId, NodeId, Option<u32>)>,
    {
        for (src, dst, key) in edges {
            self.remove_edge(src, dst, key);
        }
    }

    /// Delete a node together with its incident edges. Neighbours and `output_names` are untouched.
    pub fn remove_node(&mut self, id: NodeId) -> bool {
        let Some(node) = self.nodes.get_mut(id.index()).and_then(Option::take) else {
            return false;
        };
        for ix in node.in_edges.iter().chain(node.out_edges.iter()).copied() {
            self.detach_edge(ix);
        }
        self.names.remove(&node.name);
        self.live_nodes -= 1;
        true
    }

    pub fn remove_nodes_from<I: IntoIterator<Item = NodeId>>(&mut self, ids: I) {
        for id in ids {
            self.remove_node(id);
        }
    }

    /// In-edges ordered by `dst_in_port`; ties keep insertion order.
    pub fn sorted_in_edges(&self, id: NodeId) -> Vec<EdgeRef> {
        let Some(node) = self.node(id) else {
            return Vec::new();
        };
        let mut edges: Vec<EdgeRef> = node.in_edges.iter().map(|&ix| self.edge_at(ix).snapshot()).collect();
        edges.sort_by_key(|e| e.attr.dst_in_port);
        edges
    }

    /// Out-edges ordered by `src_out_port`; ties keep insertion order.
    pub fn sorted_out_edges(&self, id: NodeId) -> Vec<EdgeRef> {
        let Some(node) = self.node(id) else {
            return Vec::new();
        };
        let mut edges: Vec<EdgeRef> = node.out_edges.iter().map(|&ix| self.edge_at(ix).snapshot()).collect();
        edges.sort_by_key(|e| e.attr.src_out_port);
        edges
    }

    /// `(src, src_out_port, dst_in_port)` per in-edge, ordered like [`Graph::sorted_in_edges`] without cloning
    /// tensors.
    pub fn in_links(&self, id: NodeId) -> Vec<(NodeId, usize, usize)> {
        let mut links: Vec<_> = self
            .node(id)
            .into_iter()
            .flat_map(|n| n.in_edges.iter())
            .map(|&ix| {
                let e = self.edge_at(ix);
                (e.src, e.attr.src_out_port, e.attr.dst_in_port)
            })
            .collect();
        links.sort_by_key(|&(_, _, dst_in_port)| dst_in_port);
        links
    }

    /// `(dst, src_out_port, dst_in_port)` per out-edge, ordered like [`Graph::sorted_out_edges`].
    pub fn out_links(&self, id: NodeId) -> Vec<(NodeId, usize, usize)> {
        let mut links: Vec<_> = self
            .node(id)
            .into_iter()
            .flat_map(|n| n.out_edges.iter())
            .map(|&ix| {
                let e = self.edge_at(ix);
                (e.dst, e.attr.src_out_port, e.attr.dst_in_port)
            })
            .collect();
        links.sort_by_key(|&(_, src_out_port, _)| src_out_port);
        links
    }

    pub fn in_degree(&self, id: NodeId) -> usize {
        self.node(id).map_or(0, |n| n.in_edges.len())
    }

    pub fn out_degree(&self, id: NodeId) -> usize {
        self.node(id).map_or(0, |n| n.out_edges.len())
    }

    /// Distinct producers, in in-edge insertion order.
    pub fn predecessors(&self, id: NodeId) -> Vec<NodeId> {
        self.node(id).into_iter().flat_map(|n| n.in_edges.iter()).map(|&ix| self.edge_at(ix).src).unique().collect()
    }

    /// Distinct consumers, in out-edge insertion order.
    pub fn successors(&self, id: NodeId) -> Vec<NodeId> {
        self.node(id).into_iter().flat_map(|n| n.out_edges.iter()).map(|&ix| self.edge_at(ix).dst).unique().collect()
    }

    pub fn has_edge(&self, src: NodeId, dst: NodeId) -> bool {
        self.edge_indices_between(src, dst).next().is_some()
    }

    pub fn edge_attr(&self, src: NodeId, dst: NodeId, key: u32) -> Option<&EdgeAttr> {
        let ix = self.edge_indices_between(src, dst).find(|&ix| self.edge_at(ix).key == key)?;
        self.edges[ix].as_ref().map(|e| &e.attr)
    }

    pub fn edge_attr_mut(&mut self, src: NodeId, dst: NodeId, key: u32) -> Option<&mut EdgeAttr> {
        let ix = self.edge_indices_between(src, dst).find(|&ix| self.edge_at(ix).key == key)?;
        self.edges[ix].as_mut().map(|e| &mut e.attr)
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    fn require(&self, id: NodeId) -> Result<()> {
        ensure!(self.contains(id), NodeNotFoundSnafu { node: id.to_string() });
        Ok(())
    }

    /// Callers only pass indices taken from a live node's edge lists.
    fn edge_at(&self, ix: usize) -> &Edge {
        match &self.edges[ix] {
            Some(edge) => edge,
            None => unreachable!("node adjacency references a removed edge"),
        }
    }

    fn edge_indices_between(&self, src: NodeId, dst: NodeId) -> impl Iterator<Item = usize> + '_ {
        self.node(src)
            .into_iter()
            .flat_map(|n| n.out_edges.iter().copied())
            .filter(move |&ix| self.edge_at(ix).dst == dst)
    }

    /// Smallest key not below the pair's edge count that is still free.
    fn next_key(&self, src: NodeId, dst: NodeId) -> u32 {
        let used: SmallVec<[u32; 4]> = self.edge_indices_between(src, dst).map(|ix| self.edge_at(ix).key).collect();
        let mut key = used.len() as u32;
        while used.contains(&key) {
            key += 1;
        }
        key
    }

    fn insert_edge(&mut self, edge: Edge) {
        let ix = self.edges.len();
        let (src, dst) = (edge.src, edge.dst);
        self.edges.push(Some(edge));
        if let Some(node) = self.node_mut(src) {
            node.out_edges.push(ix);
        }
        if let Some(node) = self.node_mut(dst) {
            node.in_edges.push(ix);
        }
        self.live_edges += 1;
    }

    fn detach_edge(&mut self, ix: usize) {
        let Some(edge) = self.edges.get_mut(ix).and_then(Option::take) else {
            return;
        };
        if let Some(node) = self.node_mut(edge.src) {
            node.out_edges.retain(|e| *e != ix);
        }
        if let Some(node) = self.node_mut(edge.dst) {
            node.in_edges.retain(|e| *e != ix);
        }
        self.live_edges -= 1;
    }
}
