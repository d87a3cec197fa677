//! Graph store, operator model and pattern matcher of the graft pass engine.
//!
//! A model arrives as a directed multigraph of operator nodes whose edges carry port indices and tensor
//! metadata. Rewrite passes locate subgraphs with the pattern matcher and mutate the graph in place; the
//! algorithms here keep the result ordered and free of dead nodes.
//!
//! # Module Organization
//!
//! - [`graph`] - Arena graph store, edge attributes and `output_names` bookkeeping
//! - [`op`] - Operator kinds, attribute schema (`replace_obj`), capability traits
//! - [`pattern`] - Declarative patterns and the backtracking matcher
//! - [`algo`] - Determined sort, reachability, dead-node elimination
//! - [`tensor`] - Per-edge tensor metadata and array helpers
//! - [`infer`] - Shape inference seam
//! - [`error`] - Error types and result handling

pub mod algo;
pub mod error;
pub mod graph;
pub mod infer;
pub mod op;
pub mod pattern;
pub mod tensor;
mod tree;


pub use algo::{clear_redundant_nodes, determined_sort, has_path};
pub use error::{Error, Result};
pub use graph::{EdgeAttr, EdgeRef, Framework, Graph, NodeId};
pub use infer::{ConstantPropagation, NoInference, ShapeInference};
pub use op::{Activation, AttrValue, Attrs, Op, OpType};
pub use pattern::{Match, OpFilter, Pattern, PortFilter, matched_patterns, single_node_matcher, two_nodes_matcher};
pub use tensor::{Array, TensorMeta};

pub use graft_dtype::DType;
