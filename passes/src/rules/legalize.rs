//! Final legalization: constants, dtypes, weight layout and the preprocess hook.

use graft_dtype::DType;
use graft_ir::op::{self, LogicalMethod, Op, OpType, PluginOp};
use graft_ir::tensor::TensorMeta;
use graft_ir::{Attrs, EdgeAttr, EdgeRef, Graph, NodeId, OpFilter, determined_sort, single_node_matcher};

use crate::common::{bypass, insert_on_edge};
use crate::error::{Result, Skip};
use crate::plugin::{PREPROCESS, PluginRegistry};
use crate::rewrite::{apply_matches, require_in_edge, require_kind, require_single_consumer, unsupported};

// ============================================================================
// CONSTANTS
// ============================================================================

fn is_foldable(graph: &Graph, node: NodeId) -> bool {
    let Some(kind) = graph.op_type(node) else {
        return false;
    };
    if kind.is_const_like() || matches!(kind, OpType::Input | OpType::Out | OpType::Dummy | OpType::Plugin) {
        return false;
    }
    let edges = graph.sorted_out_edges(node);
    !edges.is_empty()
        && graph.out_ports(node).len() == 1
        && edges.iter().all(|e| e.tensor().is_const && e.tensor().value.is_some())
}

/// A node whose every output tensor is a known constant becomes a `Constant` holding that value.
#[tracing::instrument(skip_all)]
pub fn fuse_const(graph: &mut Graph) -> Result<bool> {
    let matches =
        single_node_matcher(graph, OpFilter::Any).into_iter().filter(|m| is_foldable(graph, m["target"])).collect();
    apply_matches(graph, "fuse_const", matches, |graph, m| {
        let node = m["target"];
        let tensor = graph.output_tensors(node).into_iter().next().ok_or_else(|| unsupported(node, "no output"))?;
        let Some(value) = tensor.value else {
            return Err(unsupported(node, "output value is unknown").into());
        };
        let stale: Vec<_> = graph.sorted_in_edges(node).iter().map(EdgeRef::triple).collect();
        graph.remove_edges_from(stale);
        graph.set_op(node, op::Constant { value, dtype: tensor.dtype.unwrap_or(DType::Float32) });
        Ok(())
    })
}

/// What happens to a source constant when the graph is lowered.
enum ConstFate {
    Lower,
    Remove,
}

fn const_fate(graph: &Graph, node: NodeId) -> ConstFate {
    if graph.op_type(node) != Some(OpType::Constant) {
        return ConstFate::Remove;
    }
    let edges = graph.sorted_out_edges(node);
    let Some(first) = edges.first() else {
        return ConstFate::Remove;
    };
    match graph.op_type(first.dst) {
        Some(OpType::Out) if edges.len() == 1 => ConstFate::Remove,
        Some(kind) if kind.is_target() && !matches!(kind, OpType::Out | OpType::Input) => {
            match kind.num_in_ports() {
                Some(arity) if first.dst_in_port() >= arity => ConstFate::Remove,
                _ => ConstFate::Lower,
            }
        }
        _ => ConstFate::Lower,
    }
}

/// `Constant` becomes `IrConstant`. Constants feeding only an `Out`, a port past the consumer's arity, or
/// nothing at all are removed together with `Dummy` placeholders.
#[tracing::instrument(skip_all)]
pub fn remove_const(graph: &mut Graph) -> Result<bool> {
    let matches = single_node_matcher(graph, [OpType::Constant, OpType::Dummy]);
    apply_matches(graph, "remove_const", matches, |graph, m| {
        let node = m["target"];
        match const_fate(graph, node) {
            ConstFate::Lower => {
                let Some(Op::Constant(constant)) = graph.op(node) else {
                    return Err(Skip::InvalidNode { node }.into());
                };
                let (weights, dtype) = (constant.value.clone(), constant.dtype);
                graph.set_op(node, op::IrConstant { weights, dtype, weights_offset: None });
            }
            ConstFate::Remove => {
                graph.remove_output(node);
                graph.remove_node(node);
            }
        }
        Ok(())
    })
}

/// Assign byte offsets into the weights blob, in determined-sort order, and narrow constant dtypes the target
/// cannot hold.
///
/// Per node: weights first, then biases, then a per-channel activation slope. Returns whether any offset was assigned.
#[tracing::instrument(skip_all, fields(graph = %graph.name))]
pub fn trim_weights(graph: &mut Graph) -> Result<bool> {
    let order = determined_sort(graph, graph.output_names())?;
    let mut offset = 0usize;
    let mut assigned = false;
    for node in order {
        let name = graph.name(node).to_string();
        let Some(op) = graph.op_mut(node) else {
            tracing::warn!(node = %name, "node without operator in trim_weights");
            continue;
        };
        if let Op::IrConstant(constant) = op
            && !constant.dtype.is_target_supported()
        {
            let legal = constant.dtype.legalized();
            tracing::warn!(node = %name, from = %constant.dtype, to = %legal, "narrowing constant dtype");
            constant.dtype = legal;
        }
        if let Some(weights) = op.as_weights_mut()
            && let Some(size) = weights.weights().map(|w| w.len())
        {
            let bytes = size * weights.weights_dtype().bytes();
            if let Some(slot) = weights.weights_offset_mut() {
                *slot = Some(offset);
                offset += bytes;
                assigned = true;
            }
        }
        if let Some(biases) = op.as_biases_mut()
            && let Some(size) = biases.biases().map(|b| b.len())
            && let Some(slot) = biases.biases_offset_mut()
        {
            *slot = Some(offset);
            offset += size * DType::Float32.bytes();
            assigned = true;
        }
        if let Op::IrActivation(activation) = op
            && let Some(size) = activation.negative_slope.as_ref().filter(|s| s.ndim() > 0).map(|s| s.len())
        {
            activation.negative_slope_offset = Some(offset);
            offset += size * DType::Float32.bytes();
            assigned = true;
        }
    }
    tracing::debug!(bytes = offset, "weights laid out");
    Ok(assigned)
}

// ============================================================================
// CASTS
// ============================================================================

/// In-ports with a mandatory element type: `None` stands for every port.
fn required_dtypes(op: &Op) -> Option<(Option<usize>, &'static [DType])> {
    const INTEGERS: &[DType] =
        &[DType::Int8, DType::UInt8, DType::Int16, DType::UInt16, DType::Int32, DType::UInt32];
    match op {
        Op::IrBitwise(_) => Some((None, INTEGERS)),
        Op::IrLogical(l) if matches!(l.method, LogicalMethod::And | LogicalMethod::Or | LogicalMethod::Xor) => {
            Some((None, &[DType::UInt8]))
        }
        Op::IrReverseSequence(_) => Some((Some(1), &[DType::Int32])),
        _ => None,
    }
}

/// `(in-edge, cast target)` for every operand of `node` in the wrong element type.
fn pending_casts(graph: &Graph, node: NodeId) -> Vec<(EdgeRef, DType)> {
    let Some((ports, allowed)) = graph.op(node).and_then(required_dtypes) else {
        return Vec::new();
    };
    graph
        .sorted_in_edges(node)
        .into_iter()
        .filter(|e| ports.is_none_or(|p| p == e.dst_in_port()))
        .filter_map(|e| {
            let tensor = e.tensor();
            let target = match (tensor.value.is_some(), tensor.dtype) {
                (true, Some(dtype)) if allowed.contains(&dtype) => return None,
                (true, Some(dtype)) => {
                    let legal = dtype.legalized();
                    if allowed.contains(&legal) { legal } else { allowed[0] }
                }
                (_, dtype) if allowed.len() == 1 && dtype != Some(allowed[0]) => allowed[0],
                _ => return None,
            };
            Some((e, target))
        })
        .collect()
}

/// Insert `IrCast` in front of operands whose element type the consuming target operator does not accept.
#[tracing::instrument(skip_all)]
pub fn insert_cast_if_must(graph: &mut Graph) -> Result<bool> {
    let matches = single_node_matcher(graph, OpFilter::Where(|op| required_dtypes(op).is_some()))
        .into_iter()
        .filter(|m| !pending_casts(graph, m["target"]).is_empty())
        .collect();
    apply_matches(graph, "insert_cast_if_must", matches, |graph, m| {
        for (edge, to) in pending_casts(graph, m["target"]) {
            let tensor = TensorMeta { value: None, is_const: false, ..edge.tensor().clone() }.with_dtype(to);
            insert_on_edge(graph, &edge, "cast", op::IrCast { to }, tensor)?;
        }
        Ok(())
    })
}

fn is_redundant_cast(graph: &Graph, cast: NodeId) -> bool {
    let Some(Op::IrCast(c)) = graph.op(cast) else {
        return false;
    };
    let input = graph.input_tensors(cast).into_iter().next().and_then(|t| t.dtype);
    let chained = graph.out_degree(cast) == 1
        && !graph.is_output(cast)
        && graph.successors(cast).iter().all(|&s| graph.op_type(s) == Some(OpType::IrCast));
    input == Some(c.to) || chained && input.is_some_and(|from| from.can_safe_cast(c.to))
}

/// Drop casts to the dtype they already receive, and fold a value-preserving cast into the cast after it.
#[tracing::instrument(skip_all)]
pub fn remove_redundant_cast(graph: &mut Graph) -> Result<bool> {
    let matches = single_node_matcher(graph, OpType::IrCast)
        .into_iter()
        .filter(|m| is_redundant_cast(graph, m["target"]))
        .collect();
    apply_matches(graph, "remove_redundant_cast", matches, |graph, m| {
        let cast = m["target"];
        let to = require_kind!(graph, cast, IrCast).to;
        let input = require_in_edge(graph, cast, 0)?;
        if input.tensor().dtype == Some(to) {
            bypass(graph, cast)?;
            return Ok(());
        }

        let next = require_single_consumer(graph, cast)?;
        if graph.op_type(next.dst) != Some(OpType::IrCast) {
            return Err(unsupported(cast, "neither a no-op nor followed by a cast").into());
        }
        let Some(from) = input.tensor().dtype else {
            return Err(unsupported(cast, "input dtype is unknown").into());
        };
        if !from.can_safe_cast(to) {
            return Err(unsupported(cast, format!("{from} -> {to} loses information")).into());
        }
        graph.remove_edge(next.src, next.dst, Some(next.key));
        graph.remove_edge(input.src, input.dst, Some(input.key));
        graph.add_edge(input.src, next.dst, input.attr.with_ports(input.src_out_port(), next.dst_in_port()))?;
        Ok(())
    })
}

// ============================================================================
// PREPROCESS
// ============================================================================

/// With a `Preprocess` plugin registered, route every graph input through one `Preprocess` node.
///
/// Inputs are ordered by determined sort and feed consecutive in-ports. Each input's consumers read the
/// matching out-port of the new node instead.
#[tracing::instrument(skip_all, fields(graph = %graph.name))]
pub fn insert_preprocess(graph: &mut Graph, plugins: &PluginRegistry) -> Result<bool> {
    if !plugins.contains(PREPROCESS) {
        return Ok(false);
    }
    let order = determined_sort(graph, graph.output_names())?;
    let inputs: Vec<NodeId> = order.into_iter().filter(|&n| graph.op_type(n) == Some(OpType::Input)).collect();
    if inputs.is_empty() {
        tracing::warn!("no graph inputs to preprocess");
        return Ok(false);
    }

    let name = graph.get_valid_node_name(&format!("{}_preprocess", graph.name));
    let preprocess = graph.add_op_node(name, PluginOp { name: PREPROCESS.to_string(), attrs: Attrs::new() });
    let mut base_port = 0;
    for (port, input) in inputs.into_iter().enumerate() {
        let edges = graph.sorted_out_edges(input);
        let Some(first) = edges.first() else {
            tracing::warn!(node = %graph.name(input), "input without consumers");
            continue;
        };
        let ports = graph.out_ports(input).len();
        graph.remove_edges_from(edges.iter().map(EdgeRef::triple).collect::<Vec<_>>());
        graph.add_edge(input, preprocess, EdgeAttr { dst_in_port: port, ..first.attr.clone() })?;
        // Every consumer of an input reads the input's first slot on the preprocess node.
        for edge in &edges {
            let attr = edge.attr.with_ports(base_port, edge.dst_in_port());
            graph.add_edge(preprocess, edge.dst, attr)?;
        }
        base_port += ports;
    }
    Ok(true)
}
