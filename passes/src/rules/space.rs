//! Space/depth/batch rearrangements.
//!
//! `SpaceToDepth` and `DepthToSpace` sandwiched between two batch/channel swaps are the NCHW spelling of
//! space-to-batch and batch-to-space. The surrounding `Pad` or `Slice` supplies the paddings or crops.

use graft_ir::op::{self, Op, OpType};
use graft_ir::tensor::permute_vec;
use graft_ir::{Graph, Match, OpFilter, Pattern, PortFilter, matched_patterns, single_node_matcher};

use crate::common::{dims_i64, insert_after, move_out_edges, redirect_in_edge, reshaped};
use crate::error::{Attempt, Result};
use crate::rewrite::{
    apply_matches, require_in_edge, require_input_shape, require_kind, require_output_shape, require_single_consumer,
    unsupported,
};

/// Swap of batch and channel on a rank-4 tensor.
const BATCH_CHANNEL_SWAP: [usize; 4] = [1, 0, 2, 3];

fn swap_pattern(inner: OpType) -> Pattern {
    Pattern::new()
        .node("transpose1", OpType::Transpose)
        .node("inner", inner)
        .node("transpose2", OpType::Transpose)
        .edge("transpose1", "inner", PortFilter::dst(0))
        .edge("inner", "transpose2", PortFilter::dst(0))
}

fn require_swaps(graph: &Graph, m: &Match) -> Attempt {
    for role in ["transpose1", "transpose2"] {
        let node = m[role];
        let transpose = require_kind!(graph, node, Transpose);
        if transpose.perm != BATCH_CHANNEL_SWAP {
            return Err(unsupported(node, format!("perm {:?} is not a batch/channel swap", transpose.perm)).into());
        }
    }
    require_single_consumer(graph, m["transpose1"])?;
    require_single_consumer(graph, m["inner"])?;
    Ok(())
}

/// `[Pad ->] Transpose -> SpaceToDepth -> Transpose` becomes `SpaceToBatch`.
///
/// The spatial paddings of a `Pad` feeding the first swap become the space-to-batch paddings, laid out as
/// `[top, left, bottom, right]`.
#[tracing::instrument(skip_all)]
pub fn merge_s2b(graph: &mut Graph) -> Result<bool> {
    let matches = matched_patterns(graph, &swap_pattern(OpType::SpaceToDepth));
    apply_matches(graph, "merge_s2b", matches, |graph, m| {
        let (transpose1, s2d, transpose2) = (m["transpose1"], m["inner"], m["transpose2"]);
        require_swaps(graph, m)?;
        let blocksize = require_kind!(graph, s2d, SpaceToDepth).blocksize;
        if require_input_shape(graph, transpose1, 0)?.len() != 4 {
            return Err(unsupported(transpose1, "expected a rank-4 input").into());
        }

        let mut input = require_in_edge(graph, transpose1, 0)?;
        let mut pads = vec![0; 4];
        if let Some(Op::Pad(pad)) = graph.op(input.src)
            && pad.mode == "constant"
            && pad.pads.len() == 8
            && graph.out_degree(input.src) == 1
            && !graph.is_output(input.src)
        {
            pads = vec![pad.pads[2], pad.pads[3], pad.pads[6], pad.pads[7]];
            input = require_in_edge(graph, input.src, 0)?;
        }

        let stale: Vec<_> = graph.sorted_in_edges(s2d).iter().map(|e| e.triple()).collect();
        graph.remove_edges_from(stale);
        redirect_in_edge(graph, &input, s2d, 0)?;
        move_out_edges(graph, transpose2, s2d)?;
        graph.replace_output(transpose2, s2d)?;
        graph.set_op(s2d, op::IrSpaceToBatch { block_size_x: blocksize, block_size_y: blocksize, pads });
        Ok(())
    })
}

/// `Transpose -> DepthToSpace -> Transpose [-> Slice]` becomes `BatchToSpace`.
///
/// A trailing full-rank unit-step `Slice` turns into the crops, laid out as `[top, left, bottom, right]`.
#[tracing::instrument(skip_all)]
pub fn merge_b2s(graph: &mut Graph) -> Result<bool> {
    let matches = matched_patterns(graph, &swap_pattern(OpType::DepthToSpace));
    apply_matches(graph, "merge_b2s", matches, |graph, m| {
        let (transpose1, d2s, transpose2) = (m["transpose1"], m["inner"], m["transpose2"]);
        require_swaps(graph, m)?;
        let d2s_op = require_kind!(graph, d2s, DepthToSpace);
        if d2s_op.mode != "DCR" {
            return Err(unsupported(d2s, format!("{} mode does not move whole blocks", d2s_op.mode)).into());
        }
        let blocksize = d2s_op.blocksize;
        let shape = require_output_shape(graph, transpose2, 0)?;
        if shape.len() != 4 {
            return Err(unsupported(transpose2, "expected a rank-4 output").into());
        }

        let mut last = transpose2;
        let mut crops = vec![0; 4];
        let consumers = graph.sorted_out_edges(transpose2);
        if let ([edge], false) = (consumers.as_slice(), graph.is_output(transpose2))
            && let Some(Op::Slice(slice)) = graph.op(edge.dst)
            && let Some((begin, end)) = slice_crops(slice, &shape)
        {
            crops = vec![begin[2], begin[3], end[2], end[3]];
            last = edge.dst;
        }
        let input = require_in_edge(graph, transpose1, 0)?;

        let stale: Vec<_> = graph.sorted_in_edges(d2s).iter().map(|e| e.triple()).collect();
        graph.remove_edges_from(stale);
        redirect_in_edge(graph, &input, d2s, 0)?;
        move_out_edges(graph, last, d2s)?;
        graph.replace_output(last, d2s)?;
        graph.set_op(d2s, op::IrBatchToSpace { block_size_x: blocksize, block_size_y: blocksize, crops });
        Ok(())
    })
}

/// Leading and trailing crop per axis of a slice over `shape`, if the slice is a plain crop.
fn slice_crops(slice: &op::Slice, shape: &[usize]) -> Option<(Vec<usize>, Vec<usize>)> {
    let rank = shape.len();
    let full_axes = slice.axes.is_empty() || slice.axes.iter().enumerate().all(|(i, &a)| a == i as i64);
    if !full_axes || slice.starts.len() != rank || slice.ends.len() != rank || slice.steps.iter().any(|&s| s != 1) {
        return None;
    }
    let mut begin = Vec::with_capacity(rank);
    let mut end = Vec::with_capacity(rank);
    for ((&start, &stop), &dim) in slice.starts.iter().zip(&slice.ends).zip(shape) {
        let clamp = |v: i64| if v < 0 { (v + dim as i64).max(0) as usize } else { (v as usize).min(dim) };
        let (start, stop) = (clamp(start), clamp(stop));
        if start >= stop {
            return None;
        }
        begin.push(start);
        end.push(dim - stop);
    }
    Some((begin, end))
}

/// `DepthToSpace` in CRD mode becomes `Reshape -> Transpose -> Reshape`.
///
/// For an `[n, c, h, w]` input and block `b`: `[n, c/b², b, b, h, w]`, permuted by `[0, 1, 4, 2, 5, 3]`, then
/// folded into `[n, c/b², h·b, w·b]`.
#[tracing::instrument(skip_all)]
pub fn split_crd_d2s(graph: &mut Graph) -> Result<bool> {
    let crd = OpFilter::Where(|op| matches!(op, Op::DepthToSpace(d) if d.mode == "CRD"));
    let matches = single_node_matcher(graph, crd);
    apply_matches(graph, "split_crd_d2s", matches, |graph, m| {
        let d2s = m["target"];
        let b = require_kind!(graph, d2s, DepthToSpace).blocksize;
        let input = require_in_edge(graph, d2s, 0)?;
        let [n, c, h, w] = require_input_shape(graph, d2s, 0)?[..] else {
            return Err(unsupported(d2s, "expected a rank-4 input").into());
        };
        if b == 0 || c % (b * b) != 0 {
            return Err(unsupported(d2s, format!("{c} channels do not split into {b}x{b} blocks")).into());
        }
        let depth = c / (b * b);
        let split = vec![n, depth, b, b, h, w];
        let perm = vec![0, 1, 4, 2, 5, 3];
        let permuted = permute_vec(&split, &perm);
        let folded = vec![n, depth, h * b, w * b];

        graph.set_op(d2s, op::IrReshape { dim: dims_i64(&split) });
        let transpose = insert_after(
            graph,
            d2s,
            0,
            "transpose",
            op::IrTranspose { perm },
            reshaped(input.tensor(), split),
        )?;
        insert_after(
            graph,
            transpose,
            0,
            "reshape",
            op::IrReshape { dim: dims_i64(&folded) },
            reshaped(input.tensor(), permuted),
        )?;
        Ok(())
    })
}

/// `SpaceToBatch -> Pooling -> BatchToSpace` with matching blocks and no crops becomes a dilated pooling.
#[tracing::instrument(skip_all)]
pub fn merge_s2b_pool_b2s(graph: &mut Graph) -> Result<bool> {
    let pattern = Pattern::new()
        .node("s2b", OpType::IrSpaceToBatch)
        .node("pool", OpType::IrPooling)
        .node("b2s", OpType::IrBatchToSpace)
        .edge("s2b", "pool", PortFilter::dst(0))
        .edge("pool", "b2s", PortFilter::dst(0));
    let matches = matched_patterns(graph, &pattern);
    apply_matches(graph, "merge_s2b_pool_b2s", matches, |graph, m| {
        let (s2b, pool, b2s) = (m["s2b"], m["pool"], m["b2s"]);
        let s2b_op = require_kind!(graph, s2b, IrSpaceToBatch).clone();
        let b2s_op = require_kind!(graph, b2s, IrBatchToSpace);
        if (s2b_op.block_size_x, s2b_op.block_size_y) != (b2s_op.block_size_x, b2s_op.block_size_y) {
            return Err(unsupported(b2s, "block sizes differ").into());
        }
        if b2s_op.crops.iter().any(|&c| c != 0) {
            return Err(unsupported(b2s, "crops are not zero").into());
        }
        require_single_consumer(graph, pool)?;
        let mut pooling = require_kind!(graph, pool, IrPooling).clone();
        if pooling.dilations.len() != 2 || pooling.pads.len() != s2b_op.pads.len() {
            return Err(unsupported(pool, "expected 2-D pooling").into());
        }
        let input = require_in_edge(graph, s2b, 0)?;
        let link = require_in_edge(graph, pool, 0)?;

        graph.remove_edge(link.src, link.dst, Some(link.key));
        graph.add_edge(input.src, pool, input.attr.with_ports(input.src_out_port(), 0))?;
        move_out_edges(graph, b2s, pool)?;
        if graph.is_output(pool) {
            graph.remove_output(b2s);
        } else {
            graph.replace_output(b2s, pool)?;
        }
        pooling.dilations[0] *= s2b_op.block_size_y;
        pooling.dilations[1] *= s2b_op.block_size_x;
        for (pad, extra) in pooling.pads.iter_mut().zip(&s2b_op.pads) {
            *pad += extra;
        }
        graph.set_op(pool, pooling);
        Ok(())
    })
}
