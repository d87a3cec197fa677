use graft_ir::op::{self, Activation, Op, OpType};
use graft_ir::test::helpers::*;
use graft_ir::{Graph, NodeId};

use crate::rules::layout::*;
use crate::test::fixtures::{activation, transpose};

const NHWC: [usize; 4] = [0, 2, 3, 1];
const NCHW: [usize; 4] = [0, 3, 1, 2];

fn perm_of(graph: &Graph, node: NodeId) -> Vec<usize> {
    match graph.op(node) {
        Some(Op::IrTranspose(t)) => t.perm.clone(),
        other => panic!("expected a transpose, found {other:?}"),
    }
}

fn sub() -> op::IrSub {
    op::IrSub { activations: Activation::None, negative_slope: 0.0 }
}

/// `x -> Transpose(NHWC) -> unary -> out`
fn transposed_unary(unary: impl Into<Op>) -> (Graph, NodeId, NodeId, NodeId) {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 2, 3, 4]);
    let t = node(&mut g, "t", transpose(&NHWC));
    let u = node(&mut g, "unary", unary);
    link_shaped(&mut g, x, t, 0, 0, &[1, 2, 3, 4]);
    link_shaped(&mut g, t, u, 0, 0, &[1, 3, 4, 2]);
    output(&mut g, u, &[1, 3, 4, 2]);
    (g, x, t, u)
}

#[test]
fn single_transpose_moves_below_unary() {
    let (mut g, x, t, relu) = transposed_unary(activation(Activation::Relu));

    assert!(sink_single_transpose(&mut g).unwrap());

    assert_eq!(g.predecessors(relu), vec![x]);
    assert_eq!(g.successors(relu), vec![t]);
    assert_eq!(perm_of(&g, t), NHWC);
    assert_eq!(g.output_names(), &[t]);
    let link = &g.sorted_out_edges(relu)[0];
    assert_eq!(link.tensor().shape(), Some(vec![1, 2, 3, 4]));
    assert_ports_unique(&g);
}

#[test]
fn prelu_slope_is_permuted_back_to_channels() {
    let prelu = op::IrActivation { negative_slope: Some(vector(&[0.1, 0.2])), ..activation(Activation::PRelu) };
    let (mut g, _, _, node) = transposed_unary(prelu);

    assert!(sink_single_transpose(&mut g).unwrap());

    let Some(Op::IrActivation(a)) = g.op(node) else {
        panic!("activation survives");
    };
    let slope = a.negative_slope.as_ref().expect("slope kept");
    assert_eq!(slope.shape(), &[1, 2, 1, 1]);
    assert_eq!(slope.iter().copied().collect::<Vec<_>>(), vec![0.1, 0.2]);
}

#[test]
fn shared_transpose_is_not_sunk() {
    let (mut g, x, t, relu) = transposed_unary(activation(Activation::Relu));
    output(&mut g, t, &[1, 3, 4, 2]);

    assert!(!sink_single_transpose(&mut g).unwrap());
    assert_eq!(g.predecessors(relu), vec![t]);
    assert_eq!(g.predecessors(t), vec![x]);
}

#[test]
fn source_kinds_are_not_sunk_through() {
    let (mut g, _, t, relu) = transposed_unary(op::Relu {});

    assert!(!sink_single_transpose(&mut g).unwrap());
    assert_eq!(g.predecessors(relu), vec![t]);
}

#[test]
fn matching_transposes_on_both_operands_sink_together() {
    let mut g = graph();
    let a = input(&mut g, "a", &[1, 2, 3, 4]);
    let b = input(&mut g, "b", &[1, 2, 3, 4]);
    let ta = node(&mut g, "ta", transpose(&NHWC));
    let tb = node(&mut g, "tb", transpose(&NHWC));
    let s = node(&mut g, "sub", sub());
    link(&mut g, a, ta, 0, 0);
    link(&mut g, b, tb, 0, 0);
    link(&mut g, ta, s, 0, 0);
    link(&mut g, tb, s, 0, 1);
    output(&mut g, s, &[1, 3, 4, 2]);

    assert!(sink_double_transpose(&mut g).unwrap());

    assert!(!g.contains(ta) && !g.contains(tb));
    let operands: Vec<_> = g.sorted_in_edges(s).iter().map(|e| (e.src, e.dst_in_port())).collect();
    assert_eq!(operands, vec![(a, 0), (b, 1)]);
    let post = g.id("sub_post_transpose").expect("post transpose inserted");
    assert_eq!(perm_of(&g, post), NHWC);
    assert_eq!(g.output_names(), &[post]);
}

#[test]
fn different_perms_do_not_sink_together() {
    let mut g = graph();
    let a = input(&mut g, "a", &[1, 2, 3, 4]);
    let b = input(&mut g, "b", &[1, 2, 3, 4]);
    let ta = node(&mut g, "ta", transpose(&NHWC));
    let tb = node(&mut g, "tb", transpose(&[0, 1, 3, 2]));
    let s = node(&mut g, "sub", sub());
    link(&mut g, a, ta, 0, 0);
    link(&mut g, b, tb, 0, 0);
    link(&mut g, ta, s, 0, 0);
    link(&mut g, tb, s, 0, 1);
    output(&mut g, s, &[1, 3, 4, 2]);

    assert!(!sink_double_transpose(&mut g).unwrap());
    assert!(g.contains(ta) && g.contains(tb));
}

#[test]
fn constant_operand_is_permuted_back() {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 2, 3, 4]);
    let t = node(&mut g, "t", transpose(&NHWC));
    let s = node(&mut g, "sub", sub());
    link(&mut g, x, t, 0, 0);
    link(&mut g, t, s, 0, 0);
    let c = const_operand(&mut g, "bias", s, 1, array(&[1, 1, 1, 2], vec![1.0, 2.0]));
    output(&mut g, s, &[1, 3, 4, 2]);

    assert!(sink_transpose_with_const(&mut g).unwrap());

    let value = g.const_value(c).expect("constant survives");
    assert_eq!(value.shape(), &[1, 2, 1, 1]);
    assert_eq!(g.sorted_out_edges(c)[0].tensor().value.as_ref(), Some(value));
    assert_eq!(g.predecessors(s), vec![c, x]);
    let post = g.id("sub_post_transpose").expect("post transpose inserted");
    assert_eq!(g.output_names(), &[post]);
}

#[test]
fn shared_constant_blocks_the_sink() {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 2, 3, 4]);
    let t = node(&mut g, "t", transpose(&NHWC));
    let s = node(&mut g, "sub", sub());
    link(&mut g, x, t, 0, 0);
    link(&mut g, t, s, 0, 0);
    let c = const_operand(&mut g, "bias", s, 1, array(&[1, 1, 1, 2], vec![1.0, 2.0]));
    output(&mut g, s, &[1, 3, 4, 2]);
    output(&mut g, c, &[1, 1, 1, 2]);

    assert!(!sink_transpose_with_const(&mut g).unwrap());
    assert_eq!(g.predecessors(s), vec![t, c]);
}

#[test]
fn concat_axis_is_mapped_and_input_transposes_cancel() {
    let mut g = graph();
    let mut producers = Vec::new();
    let concat = node(&mut g, "concat", op::IrConcat { axis: 3 });
    for i in 0..2 {
        let x = input(&mut g, &format!("x{i}"), &[1, 2, 3, 4]);
        let t = node(&mut g, &format!("t{i}"), transpose(&NHWC));
        link(&mut g, x, t, 0, 0);
        link(&mut g, t, concat, 0, i);
        producers.push(x);
    }
    output(&mut g, concat, &[1, 3, 4, 4]);

    assert!(sink_transpose_through_concat(&mut g).unwrap());
    assert!(matches!(g.op(concat), Some(Op::IrConcat(c)) if c.axis == 1));
    let post = g.id("concat_post_transpose").expect("post transpose inserted");
    assert_eq!(perm_of(&g, post), NHWC);

    assert!(remove_redundant_transpose(&mut g).unwrap());
    assert!(remove_useless_op(&mut g, &[OpType::IrTranspose]).unwrap());
    let inputs: Vec<_> = g.sorted_in_edges(concat).iter().map(|e| e.src).collect();
    assert_eq!(inputs, producers);
    assert_eq!(g.output_names(), &[post]);
}

#[test]
fn split_axis_is_mapped_and_every_piece_transposed() {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 4, 3, 2]);
    let t = node(&mut g, "t", transpose(&NHWC));
    let split = node(&mut g, "split", op::IrSplit { axis: 3, split: vec![2, 2] });
    link_shaped(&mut g, x, t, 0, 0, &[1, 4, 3, 2]);
    link_shaped(&mut g, t, split, 0, 0, &[1, 3, 2, 4]);
    for port in 0..2 {
        let out = node(&mut g, &format!("out{port}"), op::Out {});
        link_shaped(&mut g, split, out, port, 0, &[1, 3, 2, 2]);
    }
    g.set_output_names(vec![split]).unwrap();

    assert!(sink_transpose_through_split(&mut g).unwrap());

    assert!(matches!(g.op(split), Some(Op::IrSplit(s)) if s.axis == 1));
    assert_eq!(g.predecessors(split), vec![x]);
    let posts: Vec<_> = (0..2)
        .map(|port| g.id(&format!("split_port_{port}_post_transpose")).expect("one transpose per piece"))
        .collect();
    for (port, &post) in posts.iter().enumerate() {
        assert_eq!(perm_of(&g, post), NHWC);
        let link = g.sorted_in_edges(post).remove(0);
        assert_eq!((link.src, link.src_out_port()), (split, port));
        assert_eq!(link.tensor().shape(), Some(vec![1, 2, 3, 2]));
    }
    assert_eq!(g.output_names(), posts.as_slice());
    assert_outputs_live(&g);
}

#[test]
fn tile_repeats_are_permuted_back() {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 2, 3, 4]);
    let t = node(&mut g, "t", transpose(&NHWC));
    let tile = node(&mut g, "tile", op::IrTile { reps: vec![1, 2, 3, 4] });
    link(&mut g, x, t, 0, 0);
    link(&mut g, t, tile, 0, 0);
    output(&mut g, tile, &[1, 6, 12, 8]);

    assert!(sink_transpose_through_tile(&mut g).unwrap());

    assert!(matches!(g.op(tile), Some(Op::IrTile(r)) if r.reps == [1, 4, 2, 3]));
    assert_eq!(g.predecessors(tile), vec![x]);
    assert_eq!(g.successors(tile), vec![t]);
    assert_eq!(g.output_names(), &[t]);
}

#[test]
fn reshape_dropping_unit_dim_trades_places_with_transpose() {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 8, 1, 6]);
    let t = node(&mut g, "t", transpose(&NHWC));
    let reshape = node(&mut g, "reshape", op::IrReshape { dim: vec![1, 6, 8] });
    link_shaped(&mut g, x, t, 0, 0, &[1, 8, 1, 6]);
    link_shaped(&mut g, t, reshape, 0, 0, &[1, 1, 6, 8]);
    output(&mut g, reshape, &[1, 6, 8]);

    assert!(sink_transpose_through_special_reshape(&mut g).unwrap());

    assert!(matches!(g.op(reshape), Some(Op::IrReshape(r)) if r.dim == [1, 8, 6]));
    assert_eq!(g.predecessors(reshape), vec![x]);
    assert!(!g.contains(t));
    let post = g.id("reshape_post_transpose").expect("post transpose inserted");
    assert_eq!(perm_of(&g, post), vec![0, 2, 1]);
    assert_eq!(g.sorted_in_edges(post)[0].tensor().shape(), Some(vec![1, 8, 6]));
    assert_eq!(g.output_names(), &[post]);
}

#[test]
fn reshape_moving_real_dims_is_kept() {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 8, 2, 6]);
    let t = node(&mut g, "t", transpose(&NHWC));
    let reshape = node(&mut g, "reshape", op::IrReshape { dim: vec![1, 12, 8] });
    link_shaped(&mut g, x, t, 0, 0, &[1, 8, 2, 6]);
    link_shaped(&mut g, t, reshape, 0, 0, &[1, 2, 6, 8]);
    output(&mut g, reshape, &[1, 12, 8]);

    assert!(!sink_transpose_through_special_reshape(&mut g).unwrap());
    assert_eq!(g.predecessors(reshape), vec![t]);
}

#[test]
fn inverse_transposes_compose_to_identity_and_vanish() {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 2, 3, 4]);
    let first = node(&mut g, "first", transpose(&NHWC));
    let second = node(&mut g, "second", transpose(&NCHW));
    link(&mut g, x, first, 0, 0);
    link(&mut g, first, second, 0, 0);
    let out = output(&mut g, second, &[1, 2, 3, 4]);

    assert!(remove_redundant_transpose(&mut g).unwrap());
    assert!(!g.contains(first));
    assert_eq!(perm_of(&g, second), vec![0, 1, 2, 3]);

    assert!(remove_useless_op(&mut g, &[OpType::IrTranspose]).unwrap());
    assert!(!g.contains(second));
    assert_eq!(g.successors(x), vec![out]);
    assert_eq!(g.output_names(), &[x]);
}

#[test]
fn consecutive_transposes_compose() {
    let mut g = graph();
    let x = input(&mut g, "x", &[2, 3, 4]);
    let first = node(&mut g, "first", transpose(&[1, 0, 2]));
    let second = node(&mut g, "second", transpose(&[0, 2, 1]));
    link(&mut g, x, first, 0, 0);
    link(&mut g, first, second, 0, 0);
    output(&mut g, second, &[3, 4, 2]);

    assert!(remove_redundant_transpose(&mut g).unwrap());
    assert_eq!(perm_of(&g, second), vec![1, 2, 0]);
    assert_eq!(g.predecessors(second), vec![x]);
}

#[test]
fn fanned_out_transpose_folds_into_each_consumer() {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 2, 3, 4]);
    let t = node(&mut g, "t", transpose(&NHWC));
    let a = node(&mut g, "a", transpose(&NCHW));
    let b = node(&mut g, "b", transpose(&[0, 3, 2, 1]));
    link(&mut g, x, t, 0, 0);
    link(&mut g, t, a, 0, 0);
    link(&mut g, t, b, 0, 0);
    output(&mut g, a, &[1, 2, 3, 4]);
    output(&mut g, b, &[1, 2, 4, 3]);

    assert!(remove_redundant_transpose_pro(&mut g).unwrap());

    assert!(!g.contains(t));
    assert_eq!(perm_of(&g, a), vec![0, 1, 2, 3]);
    assert_eq!(perm_of(&g, b), vec![0, 1, 3, 2]);
    assert_eq!(g.predecessors(a), vec![x]);
    assert_eq!(g.predecessors(b), vec![x]);
}

#[test]
fn reshape_chain_keeps_last_reshape() {
    let mut g = graph();
    let x = input(&mut g, "x", &[2, 3, 4]);
    let first = node(&mut g, "first", op::IrReshape { dim: vec![6, 4] });
    let second = node(&mut g, "second", op::IrReshape { dim: vec![4, 6] });
    link(&mut g, x, first, 0, 0);
    link(&mut g, first, second, 0, 0);
    output(&mut g, second, &[4, 6]);

    assert!(remove_redundant_reshape(&mut g).unwrap());
    assert!(!g.contains(first));
    assert_eq!(g.predecessors(second), vec![x]);
}

#[test]
fn reshape_copying_input_dims_is_kept() {
    let mut g = graph();
    let x = input(&mut g, "x", &[2, 3, 4]);
    let first = node(&mut g, "first", op::IrReshape { dim: vec![6, 4] });
    let second = node(&mut g, "second", op::IrReshape { dim: vec![0, 2, 2] });
    link(&mut g, x, first, 0, 0);
    link(&mut g, first, second, 0, 0);
    output(&mut g, second, &[6, 2, 2]);

    assert!(!remove_redundant_reshape(&mut g).unwrap());
    assert!(g.contains(first));
}

#[test]
fn reshape_to_same_shape_is_useless_only_when_requested() {
    let mut g = graph();
    let x = input(&mut g, "x", &[2, 3]);
    let reshape = node(&mut g, "reshape", op::IrReshape { dim: vec![2, 3] });
    link_shaped(&mut g, x, reshape, 0, 0, &[2, 3]);
    output(&mut g, reshape, &[2, 3]);

    assert!(!remove_useless_op(&mut g, &[OpType::IrTranspose]).unwrap());
    assert!(g.contains(reshape));

    assert!(remove_useless_op(&mut g, &[OpType::IrReshape, OpType::IrTranspose]).unwrap());
    assert!(!g.contains(reshape));
    assert_eq!(g.output_names(), &[x]);
}
