//! Activation fusion.

use graft_ir::op::{self, Activation, Op, OpType};
use graft_ir::tensor::float_equal;
use graft_ir::{Graph, NodeId, OpFilter, Pattern, PortFilter, matched_patterns, single_node_matcher, two_nodes_matcher};

use crate::common::{bypass, move_out_edges, redirect_in_edge};
use crate::error::{Result, Skip};
use crate::rewrite::{apply_matches, require_in_edge, require_kind, require_op, require_single_consumer, unsupported};

fn has_activation(op: &Op) -> bool {
    op.as_activation().is_some()
}

fn is_relu_like(op: &Op) -> bool {
    match op {
        Op::Relu(_) | Op::LeakyRelu(_) | Op::Clip(_) => true,
        Op::IrActivation(a) => {
            matches!(a.method, Activation::Relu | Activation::Relu6 | Activation::LeakyRelu | Activation::Clip)
        }
        _ => false,
    }
}

/// Clip bound from the attribute or from a constant in-port.
fn clip_bound(graph: &Graph, node: NodeId, attr: Option<f64>, port: usize) -> Option<f64> {
    attr.or_else(|| graph.in_const(node, port).and_then(|v| v.iter().next().copied()))
}

fn is_relu6(min: Option<f64>, max: Option<f64>) -> bool {
    matches!((min, max), (Some(lo), Some(hi)) if float_equal(lo, 0.0) && float_equal(hi, 6.0))
}

/// Fused activation and negative slope equivalent to the relu-like node, if it has one.
fn fused_activation(graph: &Graph, relu: NodeId) -> std::result::Result<(Activation, f64), Skip> {
    let fused = match require_op(graph, relu)? {
        Op::Relu(_) => (Activation::Relu, 0.0),
        Op::LeakyRelu(l) => (Activation::LeakyRelu, l.alpha),
        Op::Clip(c) if is_relu6(clip_bound(graph, relu, c.min, 1), clip_bound(graph, relu, c.max, 2)) => {
            (Activation::Relu6, 0.0)
        }
        Op::IrActivation(a) => match a.method {
            Activation::Relu | Activation::Relu6 => (a.method, 0.0),
            Activation::LeakyRelu => (Activation::LeakyRelu, a.alpha),
            Activation::Clip if is_relu6(a.clip_min, a.clip_max) => (Activation::Relu6, 0.0),
            _ => return Err(unsupported(relu, "clip range is not (0, 6)")),
        },
        _ => return Err(unsupported(relu, "only (0, 6) clips fuse")),
    };
    Ok(fused)
}

/// `linear [-> Transpose] -> relu` folds the relu into the linear operator's fused activation.
///
/// `Clip` fuses only as RELU6 and `PRelu` never does. Through a transpose, the transpose takes over the relu's
/// consumers.
#[tracing::instrument(skip_all)]
pub fn fuse_relu(graph: &mut Graph) -> Result<bool> {
    let direct = Pattern::new()
        .node("linear", OpFilter::Where(has_activation))
        .node("relu", OpFilter::Where(is_relu_like))
        .edge("linear", "relu", PortFilter::dst(0));
    let transposed = Pattern::new()
        .node("linear", OpFilter::Where(has_activation))
        .node("transpose", OpType::IrTranspose)
        .node("relu", OpFilter::Where(is_relu_like))
        .edge("linear", "transpose", PortFilter::dst(0))
        .edge("transpose", "relu", PortFilter::dst(0));
    let mut matches = matched_patterns(graph, &direct);
    matches.extend(matched_patterns(graph, &transposed));

    apply_matches(graph, "fuse_relu", matches, |graph, m| {
        let (linear, relu) = (m["linear"], m["relu"]);
        let current = require_op(graph, linear)?.as_activation().map(|a| a.activation());
        if current != Some(Activation::None) {
            return Err(unsupported(linear, "already carries an activation").into());
        }
        require_single_consumer(graph, linear)?;
        let transpose = m.get("transpose");
        if let Some(transpose) = transpose {
            require_single_consumer(graph, transpose)?;
        }
        let (activation, slope) = fused_activation(graph, relu)?;

        if let Some(fused) = graph.op_mut(linear).and_then(Op::as_activation_mut) {
            fused.set_activation(activation, slope);
        }
        match transpose {
            None => {
                bypass(graph, relu)?;
            }
            Some(transpose) => {
                graph.remove_edge(transpose, relu, None);
                move_out_edges(graph, relu, transpose)?;
                graph.replace_output(relu, transpose)?;
                graph.remove_node(relu);
            }
        }
        Ok(())
    })
}

fn is_clip_like(op: &Op) -> bool {
    matches!(op, Op::IrActivation(a) if matches!(a.method, Activation::Relu | Activation::Relu6 | Activation::Clip))
}

/// `(min, max)` of a clip-like activation, `None` meaning unbounded.
fn clip_range(activation: &op::IrActivation) -> (Option<f64>, Option<f64>) {
    match activation.method {
        Activation::Relu => (Some(0.0), None),
        Activation::Relu6 => (Some(0.0), Some(6.0)),
        _ => (activation.clip_min, activation.clip_max),
    }
}

fn clip_activation(min: Option<f64>, max: Option<f64>) -> op::IrActivation {
    let method = match (min, max) {
        _ if is_relu6(min, max) => Activation::Relu6,
        (Some(lo), None) if float_equal(lo, 0.0) => Activation::Relu,
        _ => Activation::Clip,
    };
    let (clip_min, clip_max) = if method == Activation::Clip { (min, max) } else { (None, None) };
    op::IrActivation {
        method,
        alpha: 0.0,
        beta: 0.0,
        gamma: 0.0,
        clip_min,
        clip_max,
        negative_slope: None,
        negative_slope_offset: None,
    }
}

/// Chained clips collapse into one clip over the intersected range. Clips over `(0, 6)` and `(0, inf)` are
/// renamed RELU6 and RELU.
#[tracing::instrument(skip_all)]
pub fn fuse_clip(graph: &mut Graph) -> Result<bool> {
    let chains = two_nodes_matcher(graph, OpFilter::Where(is_clip_like), OpFilter::Where(is_clip_like));
    let merged = apply_matches(graph, "fuse_clip", chains, |graph, m| {
        let (first, second) = (m["begin"], m["end"]);
        require_single_consumer(graph, first)?;
        let (lo1, hi1) = clip_range(require_kind!(graph, first, IrActivation));
        let (lo2, hi2) = clip_range(require_kind!(graph, second, IrActivation));
        let tighter = |a: Option<f64>, b: Option<f64>, pick: fn(f64, f64) -> f64| match (a, b) {
            (Some(a), Some(b)) => Some(pick(a, b)),
            (a, b) => a.or(b),
        };
        let (lo, hi) = (tighter(lo1, lo2, f64::max), tighter(hi1, hi2, f64::min));
        if let (Some(lo), Some(hi)) = (lo, hi)
            && lo > hi
        {
            return Err(unsupported(second, "clip ranges do not intersect").into());
        }
        let input = require_in_edge(graph, first, 0)?;

        graph.remove_edge(first, second, None);
        redirect_in_edge(graph, &input, second, 0)?;
        graph.set_op(second, clip_activation(lo, hi));
        Ok(())
    })?;

    let renamable = OpFilter::Where(|op| {
        matches!(op, Op::IrActivation(a) if a.method == Activation::Clip
            && clip_activation(a.clip_min, a.clip_max).method != Activation::Clip)
    });
    let clips = single_node_matcher(graph, renamable);
    let renamed = apply_matches(graph, "fuse_clip", clips, |graph, m| {
        let node = m["target"];
        let (min, max) = clip_range(require_kind!(graph, node, IrActivation));
        graph.set_op(node, clip_activation(min, max));
        Ok(())
    })?;
    Ok(merged || renamed)
}
