//! Declarative subgraph patterns.
//!
//! A [`Pattern`] lists roles (each with an operator filter) and required edges between roles (each with
//! optional port constraints). [`matched_patterns`] enumerates every assignment of live nodes to roles that
//! satisfies the pattern.
//!
//! # Example
//!
//! ```ignore
//! let pattern = Pattern::new()
//!     .node("sqrt", OpType::Sqrt)
//!     .node("recip", OpType::Reciprocal)
//!     .edge("sqrt", "recip", PortFilter::any());
//! for m in matched_patterns(&graph, &pattern) {
//!     let (sqrt, recip) = (m["sqrt"], m["recip"]);
//! }
//! ```

mod matcher;

use std::ops::Index;

use smallvec::SmallVec;

pub use matcher::{matched_patterns, single_node_matcher, two_nodes_matcher};

use crate::graph::NodeId;
use crate::op::{Op, OpType};

/// Operator constraint of one role.
#[derive(Debug, Clone)]
pub enum OpFilter {
    /// Any node, including uninitialized ones.
    Any,
    One(OpType),
    Set(Vec<OpType>),
    Where(fn(&Op) -> bool),
}

impl OpFilter {
    pub fn accepts(&self, op: Option<&Op>) -> bool {
        match (self, op) {
            (Self::Any, _) => true,
            (_, None) => false,
            (Self::One(t), Some(op)) => op.op_type() == *t,
            (Self::Set(types), Some(op)) => types.contains(&op.op_type()),
            (Self::Where(pred), Some(op)) => pred(op),
        }
    }
}

impl From<OpType> for OpFilter {
    fn from(op_type: OpType) -> Self {
        Self::One(op_type)
    }
}

impl From<&[OpType]> for OpFilter {
    fn from(types: &[OpType]) -> Self {
        Self::Set(types.to_vec())
    }
}

impl<const N: usize> From<[OpType; N]> for OpFilter {
    fn from(types: [OpType; N]) -> Self {
        Self::Set(types.to_vec())
    }
}

impl From<Vec<OpType>> for OpFilter {
    fn from(types: Vec<OpType>) -> Self {
        Self::Set(types)
    }
}

/// Port constraints of one required edge. `None` matches any port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortFilter {
    pub src_out_port: Option<usize>,
    pub dst_in_port: Option<usize>,
}

impl PortFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn ports(src_out_port: usize, dst_in_port: usize) -> Self {
        Self { src_out_port: Some(src_out_port), dst_in_port: Some(dst_in_port) }
    }

    pub fn src(src_out_port: usize) -> Self {
        Self { src_out_port: Some(src_out_port), dst_in_port: None }
    }

    pub fn dst(dst_in_port: usize) -> Self {
        Self { src_out_port: None, dst_in_port: Some(dst_in_port) }
    }

    pub fn accepts(&self, src_out_port: usize, dst_in_port: usize) -> bool {
        self.src_out_port.is_none_or(|p| p == src_out_port) && self.dst_in_port.is_none_or(|p| p == dst_in_port)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Role {
    pub(crate) name: &'static str,
    pub(crate) filter: OpFilter,
    pub(crate) unique: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct RoleEdge {
    pub(crate) src: usize,
    pub(crate) dst: usize,
    pub(crate) ports: PortFilter,
}

/// Ordered role declarations plus required edges.
#[derive(Debug, Clone, Default)]
pub struct Pattern {
    pub(crate) roles: Vec<Role>,
    pub(crate) edges: Vec<RoleEdge>,
}

impl Pattern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, name: &'static str, filter: impl Into<OpFilter>) -> Self {
        self.roles.push(Role { name, filter: filter.into(), unique: false });
        self
    }

    /// Role whose node is consumed by at most one match.
    pub fn unique_node(mut self, name: &'static str, filter: impl Into<OpFilter>) -> Self {
        self.roles.push(Role { name, filter: filter.into(), unique: true });
        self
    }

    /// Required edge between two roles.
    ///
    /// Panics when either role has not been declared yet.
    pub fn edge(mut self, src: &str, dst: &str, ports: PortFilter) -> Self {
        let (Some(src_ix), Some(dst_ix)) = (self.role_index(src), self.role_index(dst)) else {
            panic!("edge {src} -> {dst} names a role that is not declared before it");
        };
        self.edges.push(RoleEdge { src: src_ix, dst: dst_ix, ports });
        self
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    fn role_index(&self, name: &str) -> Option<usize> {
        self.roles.iter().position(|r| r.name == name)
    }
}

/// One located occurrence: role name to node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    bindings: SmallVec<[(&'static str, NodeId); 6]>,
}

impl Match {
    pub(crate) fn new(bindings: SmallVec<[(&'static str, NodeId); 6]>) -> Self {
        Self { bindings }
    }

    pub fn get(&self, role: &str) -> Option<NodeId> {
        self.bindings.iter().find(|(name, _)| *name == role).map(|(_, id)| *id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.bindings.iter().map(|(_, id)| *id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, NodeId)> + '_ {
        self.bindings.iter().copied()
    }
}

impl Index<&str> for Match {
    type Output = NodeId;

    /// Panics when `role` is not part of the pattern.
    fn index(&self, role: &str) -> &NodeId {
        match self.bindings.iter().find(|(name, _)| *name == role) {
            Some((_, id)) => id,
            None => panic!("role '{role}' is not bound by this match"),
        }
    }
}
