//! Backtracking search over role assignments.
//!
//! Roles are bound in declaration order. A role connected to an already bound role draws its candidates from
//! that node's neighbours (sorted edge order); an unconnected role scans all nodes in insertion order. Every
//! candidate is checked against its filter and against all required edges to bound roles before descending.

use std::collections::HashSet;

use itertools::Itertools;
use smallvec::SmallVec;

use super::{Match, OpFilter, Pattern, PortFilter};
use crate::graph::{Graph, NodeId};

/// Every assignment of nodes to roles satisfying `pattern`.
///
/// Distinct roles bind distinct nodes. Matches are not deduplicated against each other except through
/// `unique` roles, whose node is consumed by the first match that binds it.
pub fn matched_patterns(graph: &Graph, pattern: &Pattern) -> Vec<Match> {
    if pattern.is_empty() {
        return Vec::new();
    }
    let mut search = Search {
        graph,
        pattern,
        assignment: vec![None; pattern.len()],
        consumed: HashSet::new(),
        matches: Vec::new(),
    };
    search.extend(0);
    tracing::trace!(roles = pattern.len(), matches = search.matches.len(), "matched_patterns");
    search.matches
}

/// All nodes accepted by `filter`, bound to the role `"target"`.
pub fn single_node_matcher(graph: &Graph, filter: impl Into<OpFilter>) -> Vec<Match> {
    matched_patterns(graph, &Pattern::new().node("target", filter))
}

/// Every `begin -> end` edge with unconstrained ports, bound to the roles `"begin"` and `"end"`.
pub fn two_nodes_matcher(graph: &Graph, begin: impl Into<OpFilter>, end: impl Into<OpFilter>) -> Vec<Match> {
    let pattern = Pattern::new().node("begin", begin).node("end", end).edge("begin", "end", PortFilter::any());
    matched_patterns(graph, &pattern)
}

struct Search<'a> {
    graph: &'a Graph,
    pattern: &'a Pattern,
    assignment: Vec<Option<NodeId>>,
    consumed: HashSet<NodeId>,
    matches: Vec<Match>,
}

impl Search<'_> {
    fn extend(&mut self, depth: usize) {
        if depth == self.pattern.len() {
            self.record();
            return;
        }
        for node in self.candidates(depth) {
            if self.admissible(depth, node) {
                self.assignment[depth] = Some(node);
                self.extend(depth + 1);
                self.assignment[depth] = None;
            }
        }
    }

    fn record(&mut self) {
        let unique_taken = self
            .pattern
            .roles
            .iter()
            .zip(&self.assignment)
            .any(|(role, node)| role.unique && node.is_some_and(|n| self.consumed.contains(&n)));
        if unique_taken {
            return;
        }
        let mut bindings = SmallVec::new();
        for (role, node) in self.pattern.roles.iter().zip(&self.assignment) {
            let Some(node) = *node else { return };
            if role.unique {
                self.consumed.insert(node);
            }
            bindings.push((role.name, node));
        }
        self.matches.push(Match::new(bindings));
    }

    fn candidates(&self, depth: usize) -> Vec<NodeId> {
        for edge in &self.pattern.edges {
            if edge.dst == depth && edge.src < depth {
                if let Some(src) = self.assignment[edge.src] {
                    return self.graph.out_links(src).into_iter().map(|(dst, _, _)| dst).unique().collect();
                }
            }
            if edge.src == depth && edge.dst < depth {
                if let Some(dst) = self.assignment[edge.dst] {
                    return self.graph.in_links(dst).into_iter().map(|(src, _, _)| src).unique().collect();
                }
            }
        }
        self.graph.nodes().collect()
    }

    fn admissible(&self, depth: usize, node: NodeId) -> bool {
        let role = &self.pattern.roles[depth];
        if self.assignment[..depth].contains(&Some(node)) {
            return false;
        }
        if role.unique && self.consumed.contains(&node) {
            return false;
        }
        if !role.filter.accepts(self.graph.op(node)) {
            return false;
        }
        self.pattern.edges.iter().all(|edge| {
            let endpoint = |role: usize| if role == depth { Some(node) } else { self.assignment[role] };
            match (edge.src <= depth && edge.dst <= depth, endpoint(edge.src), endpoint(edge.dst)) {
                (true, Some(src), Some(dst)) if edge.src == depth || edge.dst == depth => self
                    .graph
                    .out_links(src)
                    .iter()
                    .any(|&(to, out_port, in_port)| to == dst && edge.ports.accepts(out_port, in_port)),
                _ => true,
            }
        })
    }
}

