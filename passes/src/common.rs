//! Graph editing helpers shared by the rules.
//!
//! These run after validation, so their only failures are graph invariant violations.

use graft_dtype::DType;
use graft_ir::op::{self, Op};
use graft_ir::tensor::{Array, TensorMeta};
use graft_ir::{EdgeAttr, EdgeRef, Graph, NodeId, Result};

/// Fresh node named after `base` with `suffix`.
pub(crate) fn fresh_name(graph: &Graph, base: NodeId, suffix: &str) -> String {
    graph.get_valid_node_name(&format!("{}_{suffix}", graph.name(base)))
}

pub(crate) fn connect(
    graph: &mut Graph,
    src: NodeId,
    src_out_port: usize,
    dst: NodeId,
    dst_in_port: usize,
    tensor: TensorMeta,
) -> Result<u32> {
    graph.add_edge(src, dst, EdgeAttr::new(src_out_port, dst_in_port).with_tensor(tensor))
}

/// Re-home every out-edge of `from` onto `to`, keeping ports and tensors.
pub(crate) fn move_out_edges(graph: &mut Graph, from: NodeId, to: NodeId) -> Result<()> {
    for edge in graph.sorted_out_edges(from) {
        graph.remove_edge(edge.src, edge.dst, Some(edge.key));
        graph.add_edge(to, edge.dst, edge.attr)?;
    }
    Ok(())
}

/// Re-home the out-edges of `from` leaving `from_port` onto `to:to_port`.
pub(crate) fn move_port_edges(
    graph: &mut Graph,
    from: NodeId,
    from_port: usize,
    to: NodeId,
    to_port: usize,
) -> Result<()> {
    for edge in graph.sorted_out_edges(from).into_iter().filter(|e| e.src_out_port() == from_port) {
        graph.remove_edge(edge.src, edge.dst, Some(edge.key));
        graph.add_edge(to, edge.dst, edge.attr.with_ports(to_port, edge.attr.dst_in_port))?;
    }
    Ok(())
}

/// Re-attach the in-edge `edge` so that it feeds `to:to_port` instead.
pub(crate) fn redirect_in_edge(graph: &mut Graph, edge: &EdgeRef, to: NodeId, to_port: usize) -> Result<u32> {
    graph.remove_edge(edge.src, edge.dst, Some(edge.key));
    graph.add_edge(edge.src, to, edge.attr.with_ports(edge.src_out_port(), to_port))
}

/// Splice a new node into `edge`. The new node's out-edge carries `tensor`.
pub(crate) fn insert_on_edge(
    graph: &mut Graph,
    edge: &EdgeRef,
    suffix: &str,
    op: impl Into<Op>,
    tensor: TensorMeta,
) -> Result<NodeId> {
    let node = graph.add_op_node(fresh_name(graph, edge.src, suffix), op);
    graph.remove_edge(edge.src, edge.dst, Some(edge.key));
    graph.add_edge(edge.src, node, edge.attr.with_ports(edge.src_out_port(), 0))?;
    connect(graph, node, 0, edge.dst, edge.dst_in_port(), tensor)?;
    Ok(node)
}

/// New node consuming `node:port`; every former consumer of that port reads from the new node instead.
///
/// Consumers keep their edge tensors. The `node -> new` edge carries `link`. When `node` is a model output with
/// a single out-port, the new node takes its place in `output_names`.
pub(crate) fn insert_after(
    graph: &mut Graph,
    node: NodeId,
    port: usize,
    suffix: &str,
    op: impl Into<Op>,
    link: TensorMeta,
) -> Result<NodeId> {
    let consumers: Vec<EdgeRef> =
        graph.sorted_out_edges(node).into_iter().filter(|e| e.src_out_port() == port).collect();
    let new = graph.add_op_node(fresh_name(graph, node, suffix), op);
    for edge in &consumers {
        graph.remove_edge(edge.src, edge.dst, Some(edge.key));
        graph.add_edge(new, edge.dst, edge.attr.with_ports(0, edge.dst_in_port()))?;
    }
    connect(graph, node, port, new, 0, link)?;
    if graph.out_ports(node).len() == 1 {
        graph.replace_output(node, new)?;
    }
    Ok(new)
}

/// Remove a pass-through node, wiring its data producer (in-port 0) straight to its consumers.
///
/// Returns the producer, which replaces `node` in `output_names`. Other in-edges are dropped with the node.
pub(crate) fn bypass(graph: &mut Graph, node: NodeId) -> Result<Option<NodeId>> {
    let Some(input) = graph.sorted_in_edges(node).into_iter().find(|e| e.dst_in_port() == 0) else {
        return Ok(None);
    };
    for edge in graph.sorted_out_edges(node) {
        graph.add_edge(input.src, edge.dst, edge.attr.with_ports(input.src_out_port(), edge.dst_in_port()))?;
    }
    graph.replace_output(node, input.src)?;
    graph.remove_node(node);
    Ok(Some(input.src))
}

/// Drop the in-edges of `node` on the given ports.
pub(crate) fn drop_in_ports(graph: &mut Graph, node: NodeId, ports: impl Fn(usize) -> bool) {
    let edges: Vec<_> =
        graph.sorted_in_edges(node).into_iter().filter(|e| ports(e.dst_in_port())).map(|e| e.triple()).collect();
    graph.remove_edges_from(edges);
}

pub(crate) fn add_constant(graph: &mut Graph, base: NodeId, suffix: &str, value: Array) -> NodeId {
    graph.add_op_node(fresh_name(graph, base, suffix), op::Constant { value, dtype: DType::Float32 })
}

/// Constant feeding `dst:dst_in_port`, with the value mirrored on the edge.
pub(crate) fn feed_constant(
    graph: &mut Graph,
    dst: NodeId,
    dst_in_port: usize,
    suffix: &str,
    value: Array,
) -> Result<NodeId> {
    let node = add_constant(graph, dst, suffix, value.clone());
    connect(graph, node, 0, dst, dst_in_port, TensorMeta::constant(value, DType::Float32))?;
    Ok(node)
}

/// Same metadata as `tensor` with a different shape and no value.
pub(crate) fn reshaped(tensor: &TensorMeta, shape: Vec<usize>) -> TensorMeta {
    TensorMeta { value: None, is_const: false, shape: Some(shape), ..tensor.clone() }
}

pub(crate) fn shaped(shape: Vec<usize>) -> TensorMeta {
    TensorMeta::new().with_shape(shape).with_dtype(DType::Float32)
}

pub(crate) fn dims_i64(shape: &[usize]) -> Vec<i64> {
    shape.iter().map(|&d| d as i64).collect()
}

/// Elementwise broadcast of two shapes, right-aligned.
pub(crate) fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let dim = |shape: &[usize], i: usize| if i + shape.len() < rank { 1 } else { shape[i + shape.len() - rank] };
    (0..rank)
        .map(|i| match (dim(lhs, i), dim(rhs, i)) {
            (a, b) if a == b => Some(a),
            (1, b) => Some(b),
            (a, 1) => Some(a),
            _ => None,
        })
        .collect()
}
