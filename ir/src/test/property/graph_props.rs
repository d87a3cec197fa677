use std::collections::HashMap;

use proptest::prelude::*;

use crate::algo::{ancestors, clear_redundant_nodes, determined_sort, has_path};

use super::generators::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Every producer precedes its consumers, and exactly the ancestors of the terminals are listed.
    #[test]
    fn determined_sort_respects_dependencies(spec in arb_dag(12)) {
        let (graph, _) = build_dag(&spec);
        let order = determined_sort(&graph, graph.output_names()).expect("generated graphs are acyclic");
        let position: HashMap<_, _> = order.iter().enumerate().map(|(i, n)| (*n, i)).collect();

        prop_assert_eq!(order.len(), ancestors(&graph, graph.output_names()).len());
        for edge in graph.edges() {
            if let (Some(src), Some(dst)) = (position.get(&edge.src), position.get(&edge.dst)) {
                prop_assert!(src < dst, "{} must precede {}", graph.name(edge.src), graph.name(edge.dst));
            }
        }
    }

    /// Sorting twice yields the same order.
    #[test]
    fn determined_sort_is_deterministic(spec in arb_dag(12)) {
        let (graph, _) = build_dag(&spec);
        let first = determined_sort(&graph, graph.output_names()).unwrap();
        let second = determined_sort(&graph.clone(), graph.output_names()).unwrap();
        prop_assert_eq!(first, second);
    }

    /// A second cleanup removes nothing, and no output is ever removed.
    #[test]
    fn cleanup_is_idempotent(spec in arb_dag(12)) {
        let (mut graph, _) = build_dag(&spec);
        clear_redundant_nodes(&mut graph);
        let once: Vec<_> = graph.nodes().collect();

        prop_assert_eq!(clear_redundant_nodes(&mut graph), 0);
        prop_assert_eq!(graph.nodes().collect::<Vec<_>>(), once);
        prop_assert!(graph.validate_outputs().is_ok());
    }

    /// Every surviving node reaches some output.
    #[test]
    fn cleanup_keeps_only_contributors(spec in arb_dag(12)) {
        let (mut graph, _) = build_dag(&spec);
        clear_redundant_nodes(&mut graph);
        let outputs = graph.output_names().to_vec();
        for node in graph.nodes() {
            prop_assert!(outputs.iter().any(|&out| has_path(&graph, node, out)));
        }
    }

    /// Edges generated with per-destination port numbering never collide.
    #[test]
    fn generated_ports_are_unique(spec in arb_dag(12)) {
        let (graph, _) = build_dag(&spec);
        for node in graph.nodes() {
            prop_assert!(graph.check_ports(node).is_ok());
        }
    }
}
