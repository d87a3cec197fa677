//! Broadcasting normalization: equal operand ranks and explicit tiling.

use graft_ir::op::{self, LogicalMethod, Op, OpType};
use graft_ir::tensor;
use graft_ir::{Graph, OpFilter, single_node_matcher};

use crate::common::{dims_i64, drop_in_ports, insert_on_edge, reshaped};
use crate::error::Result;
use crate::rewrite::{apply_matches, require_const, require_in_edge, require_input_shape, require_op, unsupported};

fn is_broadcast_binary(op: &Op) -> bool {
    match op {
        Op::IrLogical(l) => l.method != LogicalMethod::Not,
        Op::Max(_) | Op::Min(_) => true,
        op => matches!(
            op.op_type(),
            OpType::Add
                | OpType::Sub
                | OpType::Mul
                | OpType::Div
                | OpType::Pow
                | OpType::Equal
                | OpType::Greater
                | OpType::GreaterOrEqual
                | OpType::Less
                | OpType::LessOrEqual
                | OpType::And
                | OpType::Or
                | OpType::Xor
                | OpType::BitwiseAnd
                | OpType::BitwiseOr
                | OpType::BitwiseXor
                | OpType::IrEltwise
                | OpType::IrSub
                | OpType::IrDiv
                | OpType::IrPow
                | OpType::IrBitwise
                | OpType::IrSquaredDifference
        ),
    }
}

/// Give both operands of a broadcasting binary operator the same rank by prepending unit dims to the lower-rank
/// one.
///
/// A constant operand used nowhere else is reshaped in place; any other operand gets a reshape node.
#[tracing::instrument(skip_all)]
pub fn multidirectional_broadcasting(graph: &mut Graph) -> Result<bool> {
    // Only rank-mismatched nodes count as rewrites.
    let candidates = single_node_matcher(graph, OpFilter::Where(is_broadcast_binary))
        .into_iter()
        .filter(|m| {
            let shapes = graph.input_shapes(m["target"]);
            matches!(shapes.as_slice(), [Some(a), Some(b)] if a.len() != b.len())
        })
        .collect();
    apply_matches(graph, "multidirectional_broadcasting", candidates, |graph, m| {
        let node = m["target"];
        let lhs = require_in_edge(graph, node, 0)?;
        let rhs = require_in_edge(graph, node, 1)?;
        if graph.in_degree(node) != 2 {
            return Err(unsupported(node, "expected exactly two operands").into());
        }
        let lhs_shape = require_input_shape(graph, node, 0)?;
        let rhs_shape = require_input_shape(graph, node, 1)?;
        let (edge, shape, rank) = if lhs_shape.len() < rhs_shape.len() {
            (lhs, lhs_shape, rhs_shape.len())
        } else {
            (rhs, rhs_shape, lhs_shape.len())
        };
        let mut expanded = vec![1; rank - shape.len()];
        expanded.extend_from_slice(&shape);

        let in_place = graph.op_type(edge.src).is_some_and(OpType::is_const_like)
            && graph.out_degree(edge.src) == 1
            && !graph.is_output(edge.src);
        if in_place {
            let Some(value) = graph.const_value(edge.src) else {
                return Err(unsupported(edge.src, "constant without value").into());
            };
            let value = tensor::reshape(value, &expanded).map_err(|e| unsupported(edge.src, e.to_string()))?;
            match graph.op_mut(edge.src) {
                Some(Op::Constant(c)) => c.value = value.clone(),
                Some(Op::IrConstant(c)) => c.weights = value.clone(),
                _ => {}
            }
            if let Some(attr) = graph.edge_attr_mut(edge.src, edge.dst, edge.key) {
                attr.tensor.set_value(Some(value));
            }
        } else {
            let tensor = reshaped(edge.tensor(), expanded.clone());
            insert_on_edge(graph, &edge, "broadcast_reshape", op::IrReshape { dim: dims_i64(&expanded) }, tensor)?;
        }
        Ok(())
    })
}

/// `Expand(x, shape)` with a known target shape becomes `Tile(x)` with `reps = target / input`.
///
/// Dims are right-aligned. When the target has a higher rank, the input is first reshaped with leading unit
/// dims.
#[tracing::instrument(skip_all)]
pub fn split_expand(graph: &mut Graph) -> Result<bool> {
    let matches = single_node_matcher(graph, OpType::Expand);
    apply_matches(graph, "split_expand", matches, |graph, m| {
        let expand = m["target"];
        let Op::Expand(expand_op) = require_op(graph, expand)? else {
            return Err(unsupported(expand, "expected Expand").into());
        };
        let target: Vec<usize> = match &expand_op.shape {
            Some(shape) => shape.clone(),
            None => {
                let value = require_const(graph, expand, 1)?;
                if value.iter().any(|&d| d < 0.0) {
                    return Err(unsupported(expand, "negative target dim").into());
                }
                value.iter().map(|&d| d as usize).collect()
            }
        };
        let data = require_in_edge(graph, expand, 0)?;
        let input = require_input_shape(graph, expand, 0)?;

        let rank = input.len().max(target.len());
        let pad = |shape: &[usize]| {
            let mut padded = vec![1; rank - shape.len()];
            padded.extend_from_slice(shape);
            padded
        };
        let (padded_input, padded_target) = (pad(&input), pad(&target));
        let reps: Option<Vec<usize>> = padded_input
            .iter()
            .zip(&padded_target)
            .map(|(&i, &t)| match (i, t) {
                (_, 1) => Some(1),
                (0, _) => None,
                (i, t) => (t % i == 0).then_some(t / i),
            })
            .collect();
        let Some(reps) = reps else {
            return Err(unsupported(expand, format!("{input:?} does not expand to {target:?}")).into());
        };

        drop_in_ports(graph, expand, |port| port >= 1);
        if padded_input.len() != input.len() {
            let tensor = reshaped(data.tensor(), padded_input.clone());
            insert_on_edge(graph, &data, "expand_reshape", op::IrReshape { dim: dims_i64(&padded_input) }, tensor)?;
        }
        graph.set_op(expand, op::Tile { reps: Some(reps) });
        Ok(())
    })
}
