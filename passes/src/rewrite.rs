//! Match, validate, mutate, clean up.
//!
//! Every pass snapshots its matches up front and hands them to [`apply_matches`] with a per-match rewrite. A
//! match whose nodes disappeared under an earlier rewrite is skipped as stale. A rewrite validates everything
//! it needs before its first mutation and reports a [`Skip`] when a precondition fails, which leaves the graph
//! as it was. The dead-node sweep runs once, after the last match, and only if something was rewritten.

use graft_ir::op::OpType;
use graft_ir::tensor::Array;
use graft_ir::{EdgeRef, Graph, Match, NodeId, Op, clear_redundant_nodes, has_path};

use crate::error::{Attempt, Reject, Result, Skip};

pub(crate) fn apply_matches<F>(
    graph: &mut Graph,
    pass: &'static str,
    matches: Vec<Match>,
    mut rewrite: F,
) -> Result<bool>
where
    F: FnMut(&mut Graph, &Match) -> Attempt,
{
    let mut matched = 0usize;
    for m in matches {
        if let Some(node) = m.nodes().find(|&n| !graph.contains(n)) {
            tracing::debug!(pass, %node, "stale match");
            continue;
        }
        let anchor = m.nodes().next().map(|n| graph.name(n).to_string()).unwrap_or_default();
        match rewrite(graph, &m) {
            Ok(()) => {
                matched += 1;
                tracing::debug!(pass, node = %anchor, "rewritten");
            }
            Err(Reject::Skip(skip)) => tracing::warn!(pass, node = %anchor, %skip, "match skipped"),
            Err(Reject::Fail(error)) => return Err(error),
        }
    }
    if matched > 0 {
        let removed = clear_redundant_nodes(graph);
        tracing::debug!(pass, matched, removed, "pass applied");
    }
    Ok(matched > 0)
}

// ----------------------------------------------------------------------------
// Preconditions. Each returns a `Skip` instead of touching the graph.
// ----------------------------------------------------------------------------

pub(crate) fn unsupported(node: NodeId, reason: impl Into<String>) -> Skip {
    Skip::Unsupported { node, reason: reason.into() }
}

pub(crate) fn require_op(graph: &Graph, node: NodeId) -> std::result::Result<&Op, Skip> {
    graph.op(node).ok_or(Skip::InvalidNode { node })
}

pub(crate) fn require_type(graph: &Graph, node: NodeId, expected: OpType) -> std::result::Result<&Op, Skip> {
    let op = require_op(graph, node)?;
    if op.op_type() != expected {
        return Err(unsupported(node, format!("expected {expected}, found {}", op.op_type())));
    }
    Ok(op)
}

/// Constant operand on `port`.
pub(crate) fn require_const(graph: &Graph, node: NodeId, port: usize) -> std::result::Result<Array, Skip> {
    graph.in_const(node, port).ok_or(Skip::NotConstant { node, port })
}

/// In-edge on `port`.
pub(crate) fn require_in_edge(graph: &Graph, node: NodeId, port: usize) -> std::result::Result<EdgeRef, Skip> {
    graph
        .sorted_in_edges(node)
        .into_iter()
        .find(|e| e.dst_in_port() == port)
        .ok_or_else(|| unsupported(node, format!("in-port {port} is not connected")))
}

pub(crate) fn require_input_shape(graph: &Graph, node: NodeId, port: usize) -> std::result::Result<Vec<usize>, Skip> {
    require_in_edge(graph, node, port)?.tensor().shape().ok_or(Skip::MissingShape { node })
}

pub(crate) fn require_output_shape(graph: &Graph, node: NodeId, port: usize) -> std::result::Result<Vec<usize>, Skip> {
    graph
        .sorted_out_edges(node)
        .into_iter()
        .find(|e| e.src_out_port() == port)
        .and_then(|e| e.tensor().shape())
        .ok_or(Skip::MissingShape { node })
}

/// The only out-edge of `node`.
pub(crate) fn require_single_consumer(graph: &Graph, node: NodeId) -> std::result::Result<EdgeRef, Skip> {
    let mut edges = graph.sorted_out_edges(node);
    match (edges.pop(), edges.is_empty()) {
        (Some(edge), true) if !graph.is_output(node) => Ok(edge),
        _ => Err(unsupported(node, "expected exactly one consumer and not a model output")),
    }
}

/// Adding `src -> dst` must not close a cycle.
pub(crate) fn require_acyclic(graph: &Graph, src: NodeId, dst: NodeId) -> std::result::Result<(), Skip> {
    if has_path(graph, dst, src) {
        return Err(Skip::CycleRisk { src, dst });
    }
    Ok(())
}

/// Borrow the payload of `$node` as the `$kind` variant, or bail out of the rewrite with a `Skip`.
macro_rules! require_kind {
    ($graph:expr, $node:expr, $kind:ident) => {
        match $graph.op($node) {
            Some(graft_ir::Op::$kind(inner)) => inner,
            Some(other) => {
                let reason = format!(concat!("expected ", stringify!($kind), ", found {}"), other.op_type());
                return Err($crate::rewrite::unsupported($node, reason).into());
            }
            None => return Err($crate::error::Skip::InvalidNode { node: $node }.into()),
        }
    };
}

pub(crate) use require_kind;
