//! Transpose sinking and reshape/transpose cleanup.
//!
//! Source models converted from NHWC frameworks carry transposes around every layout-sensitive operator. The
//! sinks push a transpose below the operator it feeds whenever the operator does not care about layout, so
//! that neighbouring transposes meet, compose, and finally cancel as identities. The driver alternates sinks
//! and cleanups until the graph settles or the iteration bound is hit.

use graft_ir::op::{self, Activation, Op, OpType};
use graft_ir::tensor::{self, Array, TensorMeta, compose_perm, inverse_perm, is_identity_perm, permute_vec};
use graft_ir::{
    EdgeRef, Graph, NodeId, OpFilter, Pattern, PortFilter, has_path, matched_patterns, single_node_matcher,
    two_nodes_matcher,
};
use itertools::Itertools;

use crate::common::{bypass, connect, insert_after, insert_on_edge, move_out_edges, redirect_in_edge};
use crate::error::{Attempt, Result, Skip};
use crate::rewrite::{
    apply_matches, require_in_edge, require_input_shape, require_kind, require_op, require_output_shape,
    require_single_consumer, unsupported,
};

/// Widest concat whose transposed inputs are sunk.
pub const MAX_CONCAT_BRANCHES: usize = 8;
/// Most consumers a transpose may have for its reshape consumers to be sunk.
pub const MAX_RESHAPE_BRANCHES: usize = 6;

fn is_unaware(op: &Op) -> bool {
    let kind = op.op_type();
    kind.is_layout_unaware() && kind.is_target()
}

fn transpose_perm(graph: &Graph, node: NodeId) -> std::result::Result<Vec<usize>, Skip> {
    let perm = match require_op(graph, node)? {
        Op::IrTranspose(t) => t.perm.clone(),
        other => return Err(unsupported(node, format!("expected IrTranspose, found {}", other.op_type()))),
    };
    if !tensor::is_permutation(&perm) {
        return Err(unsupported(node, format!("{perm:?} is not a permutation")));
    }
    Ok(perm)
}

fn inverse_of(node: NodeId, perm: &[usize]) -> std::result::Result<Vec<usize>, Skip> {
    inverse_perm(perm).map_err(|e| unsupported(node, e.to_string()))
}

/// Metadata of a tensor before `perm` was applied to it, given `inverse = perm⁻¹`.
fn untransposed(tensor: &TensorMeta, inverse: &[usize]) -> TensorMeta {
    let value = tensor.value.as_ref().and_then(|v| tensor::transpose(v, inverse).ok());
    let shape = tensor.shape().filter(|s| s.len() == inverse.len()).map(|s| permute_vec(&s, inverse));
    TensorMeta { value, shape, ..tensor.clone() }
}

/// Tensor on `node:port`, or an empty one when the port has no consumer.
fn port_tensor(graph: &Graph, node: NodeId, port: usize) -> TensorMeta {
    graph
        .sorted_out_edges(node)
        .into_iter()
        .find(|e| e.src_out_port() == port)
        .map(|e| e.attr.tensor)
        .unwrap_or_default()
}

fn single_out_port(graph: &Graph, node: NodeId) -> std::result::Result<(), Skip> {
    let kind = require_op(graph, node)?.op_type();
    if !kind.has_one_out_port() || graph.out_ports(node).len() > 1 {
        return Err(unsupported(node, "expected a single out-port"));
    }
    Ok(())
}

/// `edge` leaving `src` into `dst:port`.
fn edge_into(graph: &Graph, src: NodeId, dst: NodeId, port: usize) -> std::result::Result<EdgeRef, Skip> {
    graph
        .sorted_in_edges(dst)
        .into_iter()
        .find(|e| e.src == src && e.dst_in_port() == port)
        .ok_or_else(|| unsupported(dst, format!("in-port {port} is not fed by node {src}")))
}

fn set_const_value(graph: &mut Graph, node: NodeId, value: Array) {
    match graph.op_mut(node) {
        Some(Op::Constant(c)) => c.value = value.clone(),
        Some(Op::IrConstant(c)) => c.weights = value.clone(),
        _ => return,
    }
    for edge in graph.sorted_out_edges(node) {
        if let Some(attr) = graph.edge_attr_mut(edge.src, edge.dst, edge.key) {
            attr.tensor.set_value(Some(value.clone()));
        }
    }
}

/// Move the transpose `transpose` from above `node` to below it, reusing the transpose node.
///
/// `node` must have the transpose as its only data input and a single out-port.
fn swap_below(graph: &mut Graph, transpose: NodeId, node: NodeId, inverse: &[usize]) -> Attempt {
    let link = graph.sorted_in_edges(node).into_iter().find(|e| e.src == transpose).ok_or(Skip::Stale { node })?;
    let input = require_in_edge(graph, transpose, 0)?;
    let out = port_tensor(graph, node, 0);
    let produced = if out.shape().is_some() { untransposed(&out, inverse) } else { input.tensor().clone() };

    graph.remove_edge(link.src, link.dst, Some(link.key));
    redirect_in_edge(graph, &input, node, link.dst_in_port())?;
    move_out_edges(graph, node, transpose)?;
    connect(graph, node, 0, transpose, 0, produced)?;
    graph.replace_output(node, transpose)?;
    Ok(())
}

/// New transpose by `perm` below `node:0`; returns it.
fn post_transpose(graph: &mut Graph, node: NodeId, perm: Vec<usize>, inverse: &[usize]) -> Result<NodeId> {
    let link = untransposed(&port_tensor(graph, node, 0), inverse);
    Ok(insert_after(graph, node, 0, "post_transpose", op::IrTranspose { perm }, link)?)
}

// ============================================================================
// SINKS
// ============================================================================

/// `Transpose -> unary layout-unaware op` becomes `op -> Transpose`.
///
/// A PRELU slope is broadcast to the input rank and permuted back so it still lines up with the channels.
#[tracing::instrument(skip_all)]
pub fn sink_single_transpose(graph: &mut Graph) -> Result<bool> {
    let matches = two_nodes_matcher(graph, OpType::IrTranspose, OpFilter::Where(is_unaware));
    apply_matches(graph, "sink_single_transpose", matches, |graph, m| {
        let (transpose, unaware) = (m["begin"], m["end"]);
        let perm = transpose_perm(graph, transpose)?;
        require_single_consumer(graph, transpose)?;
        if require_op(graph, unaware)?.op_type().num_in_ports() != Some(1) {
            return Err(unsupported(unaware, "expected a unary operator").into());
        }
        single_out_port(graph, unaware)?;
        let input_shape = require_input_shape(graph, unaware, 0)?;
        let inverse = inverse_of(transpose, &perm)?;

        let slope = match require_op(graph, unaware)? {
            Op::IrActivation(a) if a.method == Activation::PRelu => match &a.negative_slope {
                Some(slope) => Some(permuted_slope(unaware, slope, input_shape.len(), &inverse)?),
                None => None,
            },
            _ => None,
        };

        swap_below(graph, transpose, unaware, &inverse)?;
        if let (Some(slope), Some(Op::IrActivation(a))) = (slope, graph.op_mut(unaware)) {
            a.negative_slope = Some(slope);
        }
        Ok(())
    })
}

fn permuted_slope(node: NodeId, slope: &Array, rank: usize, inverse: &[usize]) -> std::result::Result<Array, Skip> {
    if slope.ndim() > rank {
        return Err(unsupported(node, "slope rank exceeds input rank"));
    }
    let mut dims = vec![1; rank - slope.ndim()];
    dims.extend_from_slice(slope.shape());
    let expanded = tensor::reshape(slope, &dims).map_err(|e| unsupported(node, e.to_string()))?;
    tensor::transpose(&expanded, inverse).map_err(|e| unsupported(node, e.to_string()))
}

/// Two transposes with the same perm feeding both operands of a binary layout-unaware op become one
/// transpose after it.
#[tracing::instrument(skip_all)]
pub fn sink_double_transpose(graph: &mut Graph) -> Result<bool> {
    let pattern = Pattern::new()
        .node("trans1", OpType::IrTranspose)
        .node("trans2", OpType::IrTranspose)
        .node("unaware", OpFilter::Where(is_unaware))
        .edge("trans1", "unaware", PortFilter::ports(0, 0))
        .edge("trans2", "unaware", PortFilter::ports(0, 1));
    let matches = matched_patterns(graph, &pattern);
    apply_matches(graph, "sink_double_transpose", matches, |graph, m| {
        let (trans1, trans2, unaware) = (m["trans1"], m["trans2"], m["unaware"]);
        let perm = transpose_perm(graph, trans1)?;
        if transpose_perm(graph, trans2)? != perm {
            return Err(unsupported(trans2, "perms differ").into());
        }
        if require_op(graph, unaware)?.op_type().num_in_ports() != Some(2) {
            return Err(unsupported(unaware, "expected a binary operator").into());
        }
        single_out_port(graph, unaware)?;
        let inverse = inverse_of(trans1, &perm)?;
        let lhs = edge_into(graph, trans1, unaware, 0)?;
        let rhs = edge_into(graph, trans2, unaware, 1)?;
        let lhs_input = require_in_edge(graph, trans1, 0)?;
        let rhs_input = require_in_edge(graph, trans2, 0)?;

        graph.remove_edges_from([lhs.triple(), rhs.triple()]);
        graph.add_edge(lhs_input.src, unaware, lhs_input.attr.with_ports(lhs_input.src_out_port(), 0))?;
        graph.add_edge(rhs_input.src, unaware, rhs_input.attr.with_ports(rhs_input.src_out_port(), 1))?;
        post_transpose(graph, unaware, perm, &inverse)?;
        Ok(())
    })
}

/// A transpose and a constant feeding a binary layout-unaware op: the constant is permuted back and the
/// transpose moves below the op.
///
/// The constant must feed nothing else, and neither operand may reach the other.
#[tracing::instrument(skip_all)]
pub fn sink_transpose_with_const(graph: &mut Graph) -> Result<bool> {
    let mut matches = Vec::new();
    for port in [0, 1] {
        let pattern = Pattern::new()
            .node("trans", OpType::IrTranspose)
            .node("const", [OpType::Constant, OpType::IrConstant])
            .node("unaware", OpFilter::Where(is_unaware))
            .edge("trans", "unaware", PortFilter::ports(0, port))
            .edge("const", "unaware", PortFilter::ports(0, 1 - port));
        matches.extend(matched_patterns(graph, &pattern));
    }
    apply_matches(graph, "sink_transpose_with_const", matches, |graph, m| {
        let (trans, constant, unaware) = (m["trans"], m["const"], m["unaware"]);
        if has_path(graph, trans, constant) || has_path(graph, constant, trans) {
            return Err(Skip::CycleRisk { src: trans, dst: constant }.into());
        }
        if graph.out_degree(constant) != 1 || graph.is_output(constant) {
            return Err(unsupported(constant, "constant is shared").into());
        }
        let kind = require_op(graph, unaware)?.op_type();
        if kind.num_in_ports() != Some(2) || graph.in_degree(unaware) != 2 {
            return Err(unsupported(unaware, "expected a binary operator with both operands connected").into());
        }
        single_out_port(graph, unaware)?;
        let perm = transpose_perm(graph, trans)?;
        let inverse = inverse_of(trans, &perm)?;
        let Some(value) = graph.const_value(constant) else {
            return Err(Skip::NotConstant { node: unaware, port: 1 }.into());
        };
        let permuted = if value.ndim() == perm.len() {
            Some(tensor::transpose(value, &inverse).map_err(|e| unsupported(constant, e.to_string()))?)
        } else if kind == OpType::IrPow && value.ndim() <= 1 {
            None
        } else {
            return Err(unsupported(constant, format!("rank {} does not match perm {perm:?}", value.ndim())).into());
        };
        let port = graph
            .sorted_in_edges(unaware)
            .into_iter()
            .find(|e| e.src == trans)
            .map(|e| e.dst_in_port())
            .ok_or(Skip::Stale { node: trans })?;
        let link = edge_into(graph, trans, unaware, port)?;
        let input = require_in_edge(graph, trans, 0)?;

        graph.remove_edge(link.src, link.dst, Some(link.key));
        graph.add_edge(input.src, unaware, input.attr.with_ports(input.src_out_port(), port))?;
        if let Some(permuted) = permuted {
            set_const_value(graph, constant, permuted);
        }
        post_transpose(graph, unaware, perm, &inverse)?;
        Ok(())
    })
}

fn is_transposed_concat(graph: &Graph, concat: NodeId) -> bool {
    let inputs = graph.sorted_in_edges(concat);
    (2..=MAX_CONCAT_BRANCHES).contains(&inputs.len())
        && inputs.iter().all(|e| graph.op_type(e.src) == Some(OpType::IrTranspose))
}

/// A concat whose inputs all come through the same transpose concatenates the untransposed inputs on the
/// mapped axis, followed by one transpose.
///
/// An inverse transpose is placed on each input edge. It cancels against the producing transpose in the next
/// cleanup while leaving that transpose's other consumers alone.
#[tracing::instrument(skip_all)]
pub fn sink_transpose_through_concat(graph: &mut Graph) -> Result<bool> {
    let matches = single_node_matcher(graph, OpType::IrConcat)
        .into_iter()
        .filter(|m| is_transposed_concat(graph, m["target"]))
        .collect();
    apply_matches(graph, "sink_transpose_through_concat", matches, |graph, m| {
        let concat = m["target"];
        let inputs = graph.sorted_in_edges(concat);
        let Some(first) = inputs.first() else {
            return Err(unsupported(concat, "no inputs").into());
        };
        let perm = transpose_perm(graph, first.src)?;
        for edge in &inputs[1..] {
            if transpose_perm(graph, edge.src)? != perm {
                return Err(unsupported(edge.src, "perms differ").into());
            }
        }
        let inverse = inverse_of(concat, &perm)?;
        let axis = require_kind!(graph, concat, IrConcat).axis;
        let axis = tensor::normalize_axis(axis, perm.len()).ok_or_else(|| unsupported(concat, "axis out of range"))?;

        for edge in &inputs {
            let tensor = untransposed(edge.tensor(), &inverse);
            insert_on_edge(graph, edge, "pre_transpose", op::IrTranspose { perm: inverse.clone() }, tensor)?;
        }
        if let Some(Op::IrConcat(c)) = graph.op_mut(concat) {
            c.axis = perm[axis] as i64;
        }
        post_transpose(graph, concat, perm, &inverse)?;
        Ok(())
    })
}

/// Rewrite plan for a reshape that only inserts or removes one unit dim below a transpose.
struct ReshapePlan {
    dim: Vec<usize>,
    perm: Vec<usize>,
}

fn special_reshape(graph: &Graph, trans: NodeId, reshape: NodeId) -> std::result::Result<ReshapePlan, Skip> {
    let perm = transpose_perm(graph, trans)?;
    let trans_in = require_input_shape(graph, trans, 0)?;
    let before = require_input_shape(graph, reshape, 0)?;
    let after = require_output_shape(graph, reshape, 0)?;
    if graph.out_degree(reshape) != 1 {
        return Err(unsupported(reshape, "expected a single consumer"));
    }
    if trans_in.len() != perm.len() || before.len() != perm.len() {
        return Err(unsupported(trans, "rank does not match perm"));
    }
    if !before.contains(&1) && !after.contains(&1) || before.len().abs_diff(after.len()) != 1 {
        return Err(unsupported(reshape, "does not add or drop a unit dim"));
    }
    let non_unit = |shape: &[usize]| shape.iter().copied().filter(|&d| d != 1).collect::<Vec<_>>();
    let (kept_before, kept_after) = (non_unit(&before), non_unit(&after));
    if kept_before != kept_after || !kept_before.iter().all_unique() {
        return Err(unsupported(reshape, "moves non-unit dims"));
    }

    let diff_axis = before.iter().zip(&after).take_while(|(b, a)| b == a).count();
    let mut dim = trans_in.clone();
    if after.len() > before.len() {
        if after.get(diff_axis) != Some(&1) {
            return Err(unsupported(reshape, "inserted dim is not a unit dim"));
        }
        let at = perm.iter().position(|&p| p == diff_axis).unwrap_or(perm.len());
        dim.insert(at, 1);
    } else {
        let at = perm[diff_axis];
        if dim.get(at) != Some(&1) {
            return Err(unsupported(reshape, "removed dim is not a unit dim"));
        }
        dim.remove(at);
    }

    let mut new_perm: Vec<usize> = Vec::with_capacity(after.len());
    for d in &after {
        let found = dim.iter().enumerate().position(|(i, nd)| nd == d && !new_perm.contains(&i));
        let Some(found) = found else {
            return Err(unsupported(reshape, "no consistent permutation"));
        };
        new_perm.push(found);
    }
    if !tensor::is_permutation(&new_perm) || new_perm.len() != dim.len() {
        return Err(unsupported(reshape, "no consistent permutation"));
    }
    Ok(ReshapePlan { dim, perm: new_perm })
}

/// `Transpose -> Reshape` where the reshape only adds or drops a unit dim becomes `Reshape -> Transpose`.
///
/// Transposes with up to six consumers are considered; each qualifying reshape consumer is rewritten on its
/// own and the transpose is kept for any other consumers.
#[tracing::instrument(skip_all)]
pub fn sink_transpose_through_special_reshape(graph: &mut Graph) -> Result<bool> {
    let matches = two_nodes_matcher(graph, OpType::IrTranspose, OpType::IrReshape)
        .into_iter()
        .filter(|m| (1..=MAX_RESHAPE_BRANCHES).contains(&graph.out_degree(m["begin"])))
        .filter(|m| special_reshape(graph, m["begin"], m["end"]).is_ok())
        .collect();
    apply_matches(graph, "sink_transpose_through_special_reshape", matches, |graph, m| {
        let (trans, reshape) = (m["begin"], m["end"]);
        let ReshapePlan { dim, perm } = special_reshape(graph, trans, reshape)?;
        let link = edge_into(graph, trans, reshape, 0)?;
        let input = require_in_edge(graph, trans, 0)?;
        let produced = input.tensor().value.as_ref().and_then(|v| tensor::reshape(v, &dim).ok());
        let produced = match produced {
            Some(value) => TensorMeta { is_const: input.tensor().is_const, ..TensorMeta::from_value(value) },
            None => TensorMeta { value: None, ..input.tensor().clone() }.with_shape(dim.clone()),
        };

        graph.remove_edge(link.src, link.dst, Some(link.key));
        graph.add_edge(input.src, reshape, input.attr.with_ports(input.src_out_port(), 0))?;
        if let Some(Op::IrReshape(r)) = graph.op_mut(reshape) {
            r.dim = dim.iter().map(|&d| d as i64).collect();
        }
        insert_after(graph, reshape, 0, "post_transpose", op::IrTranspose { perm }, produced)?;
        Ok(())
    })
}

/// `Transpose -> Split` splits the untransposed tensor on the mapped axis and transposes every piece.
#[tracing::instrument(skip_all)]
pub fn sink_transpose_through_split(graph: &mut Graph) -> Result<bool> {
    let matches = two_nodes_matcher(graph, OpType::IrTranspose, OpType::IrSplit);
    apply_matches(graph, "sink_transpose_through_split", matches, |graph, m| {
        let (trans, split) = (m["begin"], m["end"]);
        let perm = transpose_perm(graph, trans)?;
        let inverse = inverse_of(trans, &perm)?;
        let axis = require_kind!(graph, split, IrSplit).axis;
        let axis = tensor::normalize_axis(axis, perm.len()).ok_or_else(|| unsupported(split, "axis out of range"))?;
        let link = edge_into(graph, trans, split, 0)?;
        let input = require_in_edge(graph, trans, 0)?;

        graph.remove_edge(link.src, link.dst, Some(link.key));
        graph.add_edge(input.src, split, input.attr.with_ports(input.src_out_port(), 0))?;
        if let Some(Op::IrSplit(s)) = graph.op_mut(split) {
            s.axis = perm[axis] as i64;
        }
        let mut posts = Vec::new();
        for port in graph.out_ports(split) {
            let link = untransposed(&port_tensor(graph, split, port), &inverse);
            let suffix = format!("port_{port}_post_transpose");
            posts.push(insert_after(graph, split, port, &suffix, op::IrTranspose { perm: perm.clone() }, link)?);
        }
        if !posts.is_empty() {
            graph.replace_output_with_many(split, &posts)?;
        }
        Ok(())
    })
}

/// `Transpose -> Tile` becomes `Tile -> Transpose` with the repeats permuted back.
#[tracing::instrument(skip_all)]
pub fn sink_transpose_through_tile(graph: &mut Graph) -> Result<bool> {
    let matches = two_nodes_matcher(graph, OpType::IrTranspose, OpType::IrTile);
    apply_matches(graph, "sink_transpose_through_tile", matches, |graph, m| {
        let (trans, tile) = (m["begin"], m["end"]);
        let perm = transpose_perm(graph, trans)?;
        require_single_consumer(graph, trans)?;
        let reps = &require_kind!(graph, tile, IrTile).reps;
        if reps.len() != perm.len() {
            return Err(unsupported(tile, "repeats do not match perm").into());
        }
        let inverse = inverse_of(trans, &perm)?;
        let reps = permute_vec(reps, &inverse);

        swap_below(graph, trans, tile, &inverse)?;
        graph.set_op(tile, op::IrTile { reps });
        Ok(())
    })
}

// ============================================================================
// CLEANUPS
// ============================================================================

/// Consecutive transposes collapse into the second one with the composed perm.
#[tracing::instrument(skip_all)]
pub fn remove_redundant_transpose(graph: &mut Graph) -> Result<bool> {
    let matches = two_nodes_matcher(graph, OpType::IrTranspose, OpType::IrTranspose);
    apply_matches(graph, "remove_redundant_transpose", matches, |graph, m| {
        let (first, second) = (m["begin"], m["end"]);
        require_single_consumer(graph, first)?;
        merge_transposes(graph, first, second)
    })
}

fn merge_transposes(graph: &mut Graph, first: NodeId, second: NodeId) -> Attempt {
    let outer = transpose_perm(graph, first)?;
    let inner = transpose_perm(graph, second)?;
    if outer.len() != inner.len() {
        return Err(unsupported(second, "ranks differ").into());
    }
    let input = require_in_edge(graph, first, 0)?;
    let link = edge_into(graph, first, second, 0)?;

    graph.remove_edge(link.src, link.dst, Some(link.key));
    graph.add_edge(input.src, second, input.attr.with_ports(input.src_out_port(), 0))?;
    graph.set_op(second, op::IrTranspose { perm: compose_perm(&outer, &inner) });
    Ok(())
}

/// A transpose feeding only transposes is folded into each of them.
#[tracing::instrument(skip_all)]
pub fn remove_redundant_transpose_pro(graph: &mut Graph) -> Result<bool> {
    let fans = single_node_matcher(graph, OpType::IrTranspose)
        .into_iter()
        .filter(|m| {
            let consumers = graph.successors(m["target"]);
            consumers.len() > 1
                && !graph.is_output(m["target"])
                && consumers.iter().all(|&c| graph.op_type(c) == Some(OpType::IrTranspose))
        })
        .collect();
    apply_matches(graph, "remove_redundant_transpose_pro", fans, |graph, m| {
        let first = m["target"];
        for edge in graph.sorted_out_edges(first) {
            if edge.dst_in_port() != 0 || graph.op_type(edge.dst) != Some(OpType::IrTranspose) {
                return Err(unsupported(edge.dst, "consumer is not a transpose").into());
            }
        }
        for consumer in graph.successors(first) {
            merge_transposes(graph, first, consumer)?;
        }
        Ok(())
    })
}

/// `Reshape -> Reshape` keeps only the second reshape.
#[tracing::instrument(skip_all)]
pub fn remove_redundant_reshape(graph: &mut Graph) -> Result<bool> {
    let matches = two_nodes_matcher(graph, OpType::IrReshape, OpType::IrReshape);
    apply_matches(graph, "remove_redundant_reshape", matches, |graph, m| {
        let (first, second) = (m["begin"], m["end"]);
        require_single_consumer(graph, first)?;
        if require_kind!(graph, second, IrReshape).dim.contains(&0) {
            return Err(unsupported(second, "dims copy from the input").into());
        }
        let input = require_in_edge(graph, first, 0)?;
        let link = edge_into(graph, first, second, 0)?;

        graph.remove_edge(link.src, link.dst, Some(link.key));
        graph.add_edge(input.src, second, input.attr.with_ports(input.src_out_port(), 0))?;
        Ok(())
    })
}

fn is_useless(graph: &Graph, node: NodeId) -> bool {
    match graph.op(node) {
        Some(Op::IrTranspose(t)) => is_identity_perm(&t.perm),
        Some(Op::IrReshape(_)) => {
            let input = graph.input_shapes(node).into_iter().next().flatten();
            let output = graph.output_shapes(node).into_iter().next().flatten();
            input.is_some() && input == output
        }
        _ => false,
    }
}

/// Identity transposes and reshapes to the same shape are bypassed, for the node kinds in `kinds`.
#[tracing::instrument(skip_all)]
pub fn remove_useless_op(graph: &mut Graph, kinds: &[OpType]) -> Result<bool> {
    let matches =
        single_node_matcher(graph, kinds).into_iter().filter(|m| is_useless(graph, m["target"])).collect();
    apply_matches(graph, "remove_useless_op", matches, |graph, m| {
        let node = m["target"];
        if !is_useless(graph, node) {
            return Err(unsupported(node, "no longer an identity").into());
        }
        require_in_edge(graph, node, 0)?;
        bypass(graph, node)?;
        Ok(())
    })
}
