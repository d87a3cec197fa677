use snafu::Snafu;

use crate::graph::NodeId;
use crate::op::OpType;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Node handle or name does not resolve to a live node.
    #[snafu(display("node {node} not found in graph"))]
    NodeNotFound { node: String },

    /// Explicit edge key already used between the two nodes.
    #[snafu(display("edge ({src}, {dst}, key={key}) already exists"))]
    EdgeExists { src: NodeId, dst: NodeId, key: u32 },

    /// `output_names` would reference a node that is not in the graph.
    #[snafu(display("output {name} does not refer to a node in the graph"))]
    OutputNotInGraph { name: String },

    /// The backward-reachable subgraph contains a cycle.
    #[snafu(display("graph is not a DAG: cycle through {node}"))]
    Cycle { node: String },

    /// Operator kind name is not part of the vocabulary.
    #[snafu(display("unknown operator type {name}"))]
    UnknownOpType { name: String },

    /// `replace_obj` attribute map lacks an attribute the kind requires.
    #[snafu(display("{op} requires attribute '{attr}'"))]
    MissingAttribute { op: OpType, attr: &'static str },

    /// Attribute present but of the wrong kind.
    #[snafu(display("{op} attribute '{attr}' expects {expected}"))]
    AttributeType { op: OpType, attr: &'static str, expected: &'static str },

    /// Permutation is not a permutation of `0..rank`.
    #[snafu(display("invalid permutation {perm:?}"))]
    InvalidPermutation { perm: Vec<i64> },

    /// Two in-edges of a fixed-arity operator share a `dst_in_port`.
    #[snafu(display("node {node} has duplicate in-port {port}"))]
    PortConflict { node: String, port: usize },

    /// Tensor value could not be reshaped to the requested dimensions.
    #[snafu(display("cannot reshape {from:?} into {to:?}"))]
    ShapeMismatch { from: Vec<usize>, to: Vec<usize> },
}
