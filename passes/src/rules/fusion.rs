//! Small arithmetic and logical fusions on source-format operators.

use graft_ir::op::{self, LogicalMethod, Op, OpType};
use graft_ir::tensor::{self, Array};
use graft_ir::{Graph, Match, Pattern, PortFilter, matched_patterns, single_node_matcher, two_nodes_matcher};
use ndarray::{Axis, concatenate};

use crate::common::{bypass, drop_in_ports, move_out_edges, redirect_in_edge};
use crate::error::{Attempt, Result};
use crate::rewrite::{
    apply_matches, require_const, require_in_edge, require_kind, require_op, require_single_consumer, unsupported,
};

/// `Pow(x, 2)` becomes `Square(x)`.
#[tracing::instrument(skip_all)]
pub fn merge_square(graph: &mut Graph) -> Result<bool> {
    let matches = single_node_matcher(graph, OpType::Pow);
    apply_matches(graph, "merge_square", matches, |graph, m| {
        let pow = m["target"];
        let exponent = require_const(graph, pow, 1)?;
        if !tensor::all_equal(&exponent, 2.0) {
            return Err(unsupported(pow, "exponent is not 2").into());
        }
        drop_in_ports(graph, pow, |port| port == 1);
        graph.set_op(pow, op::IrSquare {});
        Ok(())
    })
}

/// `Mul(x, x)` with both operands from the same producer port becomes `Square(x)`.
#[tracing::instrument(skip_all)]
pub fn merge_square2(graph: &mut Graph) -> Result<bool> {
    let matches = single_node_matcher(graph, OpType::Mul);
    apply_matches(graph, "merge_square2", matches, |graph, m| {
        let mul = m["target"];
        let edges = graph.sorted_in_edges(mul);
        let [lhs, rhs] = edges.as_slice() else {
            return Err(unsupported(mul, "expected two operands").into());
        };
        if lhs.src != rhs.src || lhs.src_out_port() != rhs.src_out_port() {
            return Err(unsupported(mul, "operands differ").into());
        }
        graph.remove_edge(rhs.src, rhs.dst, Some(rhs.key));
        graph.set_op(mul, op::IrSquare {});
        Ok(())
    })
}

/// `Pow(Sub(a, b), 2)` becomes `SquaredDifference(a, b)` when the subtraction has no other consumer.
#[tracing::instrument(skip_all)]
pub fn merge_squared_diff(graph: &mut Graph) -> Result<bool> {
    let pattern = Pattern::new()
        .node("sub", OpType::Sub)
        .node("pow", OpType::Pow)
        .edge("sub", "pow", PortFilter::dst(0));
    let matches = matched_patterns(graph, &pattern);
    apply_matches(graph, "merge_squared_diff", matches, |graph, m| {
        let (sub, pow) = (m["sub"], m["pow"]);
        let exponent = require_const(graph, pow, 1)?;
        if !tensor::all_equal(&exponent, 2.0) {
            return Err(unsupported(pow, "exponent is not 2").into());
        }
        require_single_consumer(graph, sub)?;
        let operands = graph.sorted_in_edges(sub);
        if operands.len() != 2 {
            return Err(unsupported(sub, "expected two operands").into());
        }
        drop_in_ports(graph, pow, |_| true);
        for edge in &operands {
            redirect_in_edge(graph, edge, pow, edge.dst_in_port())?;
        }
        graph.set_op(pow, op::IrSquaredDifference {});
        graph.remove_node(sub);
        Ok(())
    })
}

/// `Reciprocal(Sqrt(x))` becomes `Rsqrt(x)`.
///
/// The square root node survives with the new kind: it keeps its in-edges and takes over the reciprocal's
/// out-edges and output slot.
#[tracing::instrument(skip_all)]
pub fn merge_rsqrt(graph: &mut Graph) -> Result<bool> {
    let matches = two_nodes_matcher(graph, OpType::Sqrt, OpType::Reciprocal);
    apply_matches(graph, "merge_rsqrt", matches, |graph, m| {
        let (sqrt, recip) = (m["begin"], m["end"]);
        require_single_consumer(graph, sqrt)?;
        move_out_edges(graph, recip, sqrt)?;
        graph.remove_node(recip);
        graph.replace_output(recip, sqrt)?;
        graph.set_op(sqrt, op::IrRsqrt {});
        Ok(())
    })
}

/// `Not(Equal(a, b))` becomes `NotEqual(a, b)`.
#[tracing::instrument(skip_all)]
pub fn merge_not_equal(graph: &mut Graph) -> Result<bool> {
    let matches = two_nodes_matcher(graph, OpType::Equal, OpType::Not);
    apply_matches(graph, "merge_not_equal", matches, |graph, m| {
        let (equal, not) = (m["begin"], m["end"]);
        require_single_consumer(graph, equal)?;
        move_out_edges(graph, not, equal)?;
        graph.remove_node(not);
        graph.replace_output(not, equal)?;
        graph.set_op(equal, op::IrLogical { method: LogicalMethod::NotEqual });
        Ok(())
    })
}

/// `Or(Greater(a, b), Equal(a, b))` becomes `GreaterOrEqual(a, b)`, likewise for `Less`.
#[tracing::instrument(skip_all)]
pub fn merge_greater_less_equal_or(graph: &mut Graph) -> Result<bool> {
    let pattern = Pattern::new()
        .node("cmp", [OpType::Greater, OpType::Less])
        .node("or", OpType::Or)
        .node("equal", OpType::Equal)
        .edge("cmp", "or", PortFilter::any())
        .edge("equal", "or", PortFilter::any());
    let matches = matched_patterns(graph, &pattern);
    apply_matches(graph, "merge_greater_less_equal_or", matches, |graph, m| {
        let (cmp, or, equal) = (m["cmp"], m["or"], m["equal"]);
        require_single_consumer(graph, cmp)?;
        require_single_consumer(graph, equal)?;
        let operands = graph.sorted_in_edges(cmp);
        let same_operands = |lhs: &[graft_ir::EdgeRef], rhs: &[graft_ir::EdgeRef]| {
            lhs.len() == 2
                && lhs.len() == rhs.len()
                && lhs.iter().zip(rhs).all(|(a, b)| {
                    (a.src, a.src_out_port(), a.dst_in_port()) == (b.src, b.src_out_port(), b.dst_in_port())
                })
        };
        if !same_operands(&operands, &graph.sorted_in_edges(equal)) {
            return Err(unsupported(cmp, "comparison and equality read different operands").into());
        }
        let fused: Op = match require_op(graph, cmp)?.op_type() {
            OpType::Greater => op::GreaterOrEqual {}.into(),
            _ => op::LessOrEqual {}.into(),
        };
        drop_in_ports(graph, or, |_| true);
        for edge in &operands {
            redirect_in_edge(graph, edge, or, edge.dst_in_port())?;
        }
        graph.set_op(or, fused);
        Ok(())
    })
}

const CONV_ROLES: [&str; 8] = ["conv0", "conv1", "conv2", "conv3", "conv4", "conv5", "conv6", "conv7"];

/// `Split -> N x Convolution -> Concat` on the channel axis becomes one grouped convolution.
///
/// Branch counts are tried from `max_groups` (at most 8) down to 2.
#[tracing::instrument(skip_all, fields(max_groups = max_groups))]
pub fn merge_group_conv(graph: &mut Graph, max_groups: usize) -> Result<bool> {
    let mut matched = false;
    for groups in (2..=max_groups.min(CONV_ROLES.len())).rev() {
        let mut pattern = Pattern::new().node("split", OpType::IrSplit);
        for role in CONV_ROLES[..groups].iter().copied() {
            pattern = pattern.node(role, OpType::IrConvolution);
        }
        pattern = pattern.node("concat", OpType::IrConcat);
        for (i, role) in CONV_ROLES[..groups].iter().copied().enumerate() {
            pattern = pattern.edge("split", role, PortFilter::ports(i, 0)).edge(role, "concat", PortFilter::dst(i));
        }
        let matches = matched_patterns(graph, &pattern);
        matched |= apply_matches(graph, "merge_group_conv", matches, |graph, m| fuse_groups(graph, m, groups))?;
    }
    Ok(matched)
}

fn fuse_groups(graph: &mut Graph, m: &Match, groups: usize) -> Attempt {
    let (split, concat) = (m["split"], m["concat"]);
    let convs: Vec<_> = CONV_ROLES[..groups].iter().map(|&role| m[role]).collect();

    let split_op = require_kind!(graph, split, IrSplit);
    let concat_op = require_kind!(graph, concat, IrConcat);
    if split_op.axis != 1 && split_op.axis != -3 || concat_op.axis != 1 && concat_op.axis != -3 {
        return Err(unsupported(split, "split and concat must act on the channel axis").into());
    }
    if graph.out_degree(split) != groups || graph.is_output(split) || graph.in_degree(concat) != groups {
        return Err(unsupported(split, "branch count does not cover the whole split").into());
    }
    if !split_op.split.is_empty() && split_op.split.iter().any(|&s| s != split_op.split[0]) {
        return Err(unsupported(split, "uneven split").into());
    }

    let mut weights = Vec::with_capacity(groups);
    let mut biases = Vec::with_capacity(groups);
    let mut num_output = 0;
    let mut first: Option<op::IrConvolution> = None;
    for &conv in &convs {
        let c = require_kind!(graph, conv, IrConvolution);
        require_single_consumer(graph, conv)?;
        if c.group != 1 {
            return Err(unsupported(conv, "branch is already grouped").into());
        }
        if let Some(f) = &first {
            let same = (&f.kernel_shape, &f.strides, &f.pads, &f.dilations, f.activations, f.num_output)
                == (&c.kernel_shape, &c.strides, &c.pads, &c.dilations, c.activations, c.num_output);
            if !same {
                return Err(unsupported(conv, "branches differ in geometry").into());
            }
        }
        weights.push(c.weights.clone());
        biases.push(c.biases.clone());
        num_output += c.num_output;
        first.get_or_insert_with(|| c.clone());
    }
    let Some(mut fused) = first else {
        return Err(unsupported(split, "no branches").into());
    };
    let concat_all = |parts: &[Array]| {
        let views: Vec<_> = parts.iter().map(Array::view).collect();
        concatenate(Axis(0), &views).map_err(|_| unsupported(split, "branch parameters do not concatenate"))
    };
    fused.weights = concat_all(&weights)?;
    fused.biases = concat_all(&biases)?;
    fused.num_output = num_output;
    fused.group = groups;
    let input = require_in_edge(graph, split, 0)?;

    let head = convs[0];
    drop_in_ports(graph, head, |_| true);
    redirect_in_edge(graph, &input, head, 0)?;
    move_out_edges(graph, concat, head)?;
    graph.replace_output(concat, head)?;
    graph.remove_node(concat);
    for &conv in &convs[1..] {
        graph.remove_node(conv);
    }
    graph.remove_node(split);
    graph.set_op(head, fused);
    Ok(())
}

/// `Identity` nodes are dropped, their producer taking their place.
#[tracing::instrument(skip_all)]
pub fn remove_identity(graph: &mut Graph) -> Result<bool> {
    let matches = single_node_matcher(graph, OpType::Identity);
    apply_matches(graph, "remove_identity", matches, |graph, m| {
        bypass(graph, m["target"])?;
        Ok(())
    })
}
