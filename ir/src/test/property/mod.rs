//! Property-based tests for the graph store and its algorithms.

#[cfg(test)]
mod graph_props;
