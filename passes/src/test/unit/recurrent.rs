use graft_ir::op::{self, Op, OpType};
use graft_ir::test::helpers::*;
use graft_ir::{Graph, NodeId};

use crate::rules::recurrent::*;

fn gru(hidden_size: usize, direction: &str, layout: i64) -> op::Gru {
    op::Gru {
        hidden_size,
        direction: direction.to_string(),
        linear_before_reset: false,
        layout,
        activations: Vec::new(),
    }
}

fn lstm(hidden_size: usize, direction: &str, layout: i64) -> op::Lstm {
    op::Lstm { hidden_size, direction: direction.to_string(), layout, activations: Vec::new() }
}

/// `W`, `R` and optionally `B` on in-ports 1 to 3, filled with ones.
fn parameters(g: &mut Graph, cell: NodeId, dims: [usize; 4], bias: bool) {
    let [directions, gated, width, hidden] = dims;
    let filled = |shape: &[usize]| array(shape, vec![1.0; shape.iter().product()]);
    const_operand(g, "w", cell, 1, filled(&[directions, gated, width]));
    const_operand(g, "r", cell, 2, filled(&[directions, gated, hidden]));
    if bias {
        const_operand(g, "b", cell, 3, filled(&[directions, 2 * gated]));
    }
}

fn weights_shape(graph: &Graph, node: NodeId) -> Option<Vec<usize>> {
    match graph.op(node)? {
        Op::IrGru(c) => Some(c.weights.shape().to_vec()),
        Op::IrLstm(c) => Some(c.weights.shape().to_vec()),
        _ => None,
    }
}

#[test]
fn time_major_gru_becomes_batch_major_cell() {
    let mut g = graph();
    let x = input(&mut g, "x", &[5, 1, 3]);
    let cell = node(&mut g, "gru", gru(2, "forward", 0));
    link_shaped(&mut g, x, cell, 0, 0, &[5, 1, 3]);
    parameters(&mut g, cell, [1, 6, 3, 2], true);
    output(&mut g, cell, &[5, 1, 1, 2]);

    assert!(convert_uni_gru(&mut g).unwrap());

    let Some(Op::IrGru(target)) = g.op(cell) else {
        panic!("cell converted in place");
    };
    assert_eq!((target.time_steps, target.input_size, target.hidden_size), (5, 3, 2));
    assert_eq!(target.direction, "forward");
    assert_eq!(target.biases.shape(), &[12]);
    assert_eq!(weights_shape(&g, cell), Some(vec![6, 5]));

    let transpose = g.id("gru_input_transpose").expect("time-major input is transposed");
    assert!(matches!(g.op(transpose), Some(Op::IrTranspose(t)) if t.perm == vec![1, 0, 2]));
    assert_eq!(g.predecessors(transpose), vec![x]);
    let state = g.id("gru_initial_state").expect("zero initial state");
    assert!(matches!(g.op(state), Some(Op::Constant(c)) if c.value.shape() == [1, 2]));
    assert_eq!(g.predecessors(cell), vec![transpose, state]);

    let y = g.id("gru_y_transpose").expect("source layout restored");
    assert_eq!(g.output_names(), &[y]);
    assert_eq!(op_type_of(&g, "gru_y_reshape"), Some(OpType::IrReshape));
    assert_outputs_live(&g);
    assert_ports_unique(&g);
}

#[test]
fn batch_major_lstm_exposes_final_state() {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 4, 3]);
    let cell = node(&mut g, "lstm", lstm(2, "forward", 1));
    link_shaped(&mut g, x, cell, 0, 0, &[1, 4, 3]);
    parameters(&mut g, cell, [1, 8, 3, 2], false);
    let relu = node(&mut g, "relu", op::Relu {});
    link_shaped(&mut g, cell, relu, 1, 0, &[1, 1, 2]);
    output(&mut g, relu, &[1, 1, 2]);

    assert!(convert_uni_lstm(&mut g).unwrap());

    let Some(Op::IrLstm(target)) = g.op(cell) else {
        panic!("cell converted in place");
    };
    assert_eq!(target.biases.len(), 16);
    assert!(target.biases.iter().all(|&b| b == 0.0), "missing biases are zero-filled");
    assert_eq!(g.predecessors(cell)[0], x, "batch-major input needs no transpose");
    assert_eq!(g.in_degree(cell), 3, "hidden and cell states are zero-filled");
    let state = g.id("lstm_state_out_reshape").expect("state reshaped to [B, D, H]");
    assert_eq!(g.predecessors(relu), vec![state]);
    assert_eq!(g.predecessors(state), vec![cell]);
}

#[test]
fn lstm_with_peepholes_is_skipped() {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 4, 3]);
    let cell = node(&mut g, "lstm", lstm(2, "forward", 1));
    link_shaped(&mut g, x, cell, 0, 0, &[1, 4, 3]);
    parameters(&mut g, cell, [1, 8, 3, 2], false);
    const_operand(&mut g, "p", cell, 7, vector(&[0.0; 6]));
    output(&mut g, cell, &[1, 4, 1, 2]);

    assert!(!convert_uni_lstm(&mut g).unwrap());
    assert_eq!(g.op_type(cell), Some(OpType::Lstm));
}

#[test]
fn mismatched_sequence_lengths_are_skipped() {
    let mut g = graph();
    let x = input(&mut g, "x", &[5, 1, 3]);
    let cell = node(&mut g, "gru", gru(2, "forward", 0));
    link_shaped(&mut g, x, cell, 0, 0, &[5, 1, 3]);
    parameters(&mut g, cell, [1, 6, 3, 2], true);
    const_operand(&mut g, "lens", cell, 4, vector(&[3.0]));
    output(&mut g, cell, &[5, 1, 1, 2]);

    assert!(!convert_uni_gru(&mut g).unwrap());
    assert_eq!(g.op_type(cell), Some(OpType::Gru));
}

#[test]
fn bidirectional_gru_splits_into_two_cells() {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 4, 3]);
    let cell = node(&mut g, "gru", gru(2, "bidirectional", 1));
    link_shaped(&mut g, x, cell, 0, 0, &[1, 4, 3]);
    parameters(&mut g, cell, [2, 6, 3, 2], true);
    output(&mut g, cell, &[1, 4, 2, 2]);

    assert!(!convert_uni_gru(&mut g).unwrap(), "bidirectional cells are left to the split pass");
    assert!(convert_bi_gru(&mut g).unwrap());

    assert!(!g.contains(cell));
    let fw = g.id("gru_fw").expect("forward cell");
    let bw = g.id("gru_bw").expect("backward cell");
    for direction in [fw, bw] {
        assert_eq!(g.op_type(direction), Some(OpType::IrGru));
        assert_eq!(weights_shape(&g, direction), Some(vec![6, 5]));
    }
    let reversed = g.id("gru_bw_reverse1").expect("reversed input");
    assert_eq!(g.op_type(reversed), Some(OpType::IrReverseSequence));
    assert_eq!(g.predecessors(bw)[0], reversed);
    assert_eq!(g.predecessors(fw)[0], x);

    let seq = g.id("gru_seq_concat").expect("directions concatenated");
    assert!(matches!(g.op(seq), Some(Op::IrConcat(c)) if c.axis == 2));
    assert_eq!(g.output_names(), &[seq]);
    assert_outputs_live(&g);
    assert_ports_unique(&g);
}
