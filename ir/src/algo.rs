//! Ordering, reachability and dead-node elimination.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::error::{CycleSnafu, Result};
use crate::graph::{Graph, NodeId};
use crate::op::OpType;

/// Backward-reachable subgraph of `terminals` (inclusive).
pub fn ancestors(graph: &Graph, terminals: &[NodeId]) -> HashSet<NodeId> {
    let mut seen = HashSet::new();
    let mut stack: Vec<NodeId> = terminals.iter().copied().filter(|&t| graph.contains(t)).collect();
    while let Some(node) = stack.pop() {
        if seen.insert(node) {
            stack.extend(graph.predecessors(node));
        }
    }
    seen
}

/// Topological order of the ancestors of `terminals`.
///
/// Every node appears after all of its producers. Among nodes that are ready at the same time the earliest
/// inserted goes first, so the order is reproducible for a given graph. Fails with `Cycle` when the ancestor
/// subgraph is not a DAG.
#[tracing::instrument(level = "trace", skip_all, fields(terminals = terminals.len()))]
pub fn determined_sort(graph: &Graph, terminals: &[NodeId]) -> Result<Vec<NodeId>> {
    let members = ancestors(graph, terminals);

    let mut pending: HashMap<NodeId, usize> = members
        .iter()
        .map(|&node| (node, graph.predecessors(node).iter().filter(|p| members.contains(p)).count()))
        .collect();

    let mut ready: BinaryHeap<Reverse<NodeId>> =
        pending.iter().filter(|&(_, &count)| count == 0).map(|(&node, _)| Reverse(node)).collect();

    let mut order = Vec::with_capacity(members.len());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for succ in graph.successors(node) {
            if let Some(count) = pending.get_mut(&succ) {
                *count -= 1;
                if *count == 0 {
                    ready.push(Reverse(succ));
                }
            }
        }
    }

    if order.len() != members.len() {
        let placed: HashSet<NodeId> = order.iter().copied().collect();
        let stuck = members.iter().copied().filter(|n| !placed.contains(n)).min();
        let node = stuck.map(|n| graph.name(n).to_string()).unwrap_or_default();
        return CycleSnafu { node }.fail();
    }
    Ok(order)
}

/// Whether `to` is reachable from `from` along edge direction. A node reaches itself.
pub fn has_path(graph: &Graph, from: NodeId, to: NodeId) -> bool {
    if !graph.contains(from) || !graph.contains(to) {
        return false;
    }
    let mut seen = HashSet::new();
    let mut stack = vec![from];
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if seen.insert(node) {
            stack.extend(graph.successors(node));
        }
    }
    false
}

/// Remove every node that does not contribute to `output_names`.
///
/// Kept: ancestors of the outputs, and `Out` sinks fed by a kept node. Returns the number of removed nodes.
pub fn clear_redundant_nodes(graph: &mut Graph) -> usize {
    let mut keep = ancestors(graph, graph.output_names());
    let sinks: Vec<NodeId> = keep
        .iter()
        .flat_map(|&node| graph.successors(node))
        .filter(|&succ| graph.op_type(succ) == Some(OpType::Out))
        .collect();
    keep.extend(sinks);

    let dead: Vec<NodeId> = graph.nodes().filter(|n| !keep.contains(n)).collect();
    if !dead.is_empty() {
        tracing::debug!(removed = dead.len(), remaining = keep.len(), "clear_redundant_nodes");
    }
    let removed = dead.len();
    graph.remove_nodes_from(dead);
    removed
}
