use graft_ir::op::{self, Activation, Op, OpType};
use graft_ir::test::helpers::*;
use graft_ir::{Graph, NodeId};
use test_case::test_case;

use crate::rules::activation::*;
use crate::test::fixtures::{clip, conv};

fn fused_activation(graph: &Graph, node: NodeId) -> Option<(Activation, f64)> {
    match graph.op(node)? {
        Op::IrConvolution(c) => Some((c.activations, c.negative_slope)),
        _ => None,
    }
}

/// `x -> conv -> relu -> out`
fn conv_relu(relu: Op) -> (Graph, NodeId, NodeId) {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 1, 4, 4]);
    let linear = node(&mut g, "conv", conv());
    let relu = node(&mut g, "relu", relu);
    link(&mut g, x, linear, 0, 0);
    link(&mut g, linear, relu, 0, 0);
    output(&mut g, relu, &[1, 1, 4, 4]);
    (g, linear, relu)
}

#[test_case(op::Relu {}.into(), Activation::Relu, 0.0; "relu")]
#[test_case(op::LeakyRelu { alpha: 0.1 }.into(), Activation::LeakyRelu, 0.1; "leaky_relu")]
#[test_case(op::Clip { min: Some(0.0), max: Some(6.0) }.into(), Activation::Relu6, 0.0; "clip_as_relu6")]
#[test_case(clip(Activation::Relu6, None, None).into(), Activation::Relu6, 0.0; "lowered_relu6")]
fn relu_folds_into_linear(relu_op: Op, expected: Activation, slope: f64) {
    let (mut g, linear, relu) = conv_relu(relu_op);

    assert!(fuse_relu(&mut g).unwrap());

    assert_eq!(fused_activation(&g, linear), Some((expected, slope)));
    assert!(!g.contains(relu));
    assert_eq!(g.output_names(), &[linear]);
    assert_outputs_live(&g);
}

#[test]
fn clip_outside_relu6_range_is_not_fused() {
    let (mut g, linear, relu) = conv_relu(op::Clip { min: Some(0.0), max: Some(4.0) }.into());

    assert!(!fuse_relu(&mut g).unwrap());
    assert_eq!(fused_activation(&g, linear), Some((Activation::None, 0.0)));
    assert!(g.contains(relu));
}

#[test]
fn clip_bounds_from_constant_ports() {
    let (mut g, linear, relu) = conv_relu(op::Clip { min: None, max: None }.into());
    const_operand(&mut g, "min", relu, 1, scalar(0.0));
    const_operand(&mut g, "max", relu, 2, scalar(6.0));

    assert!(fuse_relu(&mut g).unwrap());
    assert_eq!(fused_activation(&g, linear), Some((Activation::Relu6, 0.0)));
}

#[test]
fn linear_with_activation_is_left_alone() {
    let mut fused = conv();
    fused.activations = Activation::Relu;
    let (mut g, linear, relu) = conv_relu(op::Relu {}.into());
    g.set_op(linear, fused);

    assert!(!fuse_relu(&mut g).unwrap());
    assert!(g.contains(relu));
}

#[test]
fn relu_behind_transpose_folds_and_transpose_takes_consumers() {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 1, 4, 4]);
    let linear = node(&mut g, "conv", conv());
    let transpose = node(&mut g, "transpose", op::IrTranspose { perm: vec![0, 2, 3, 1] });
    let relu = node(&mut g, "relu", op::Relu {});
    link(&mut g, x, linear, 0, 0);
    link(&mut g, linear, transpose, 0, 0);
    link(&mut g, transpose, relu, 0, 0);
    let out = output(&mut g, relu, &[1, 4, 4, 1]);

    assert!(fuse_relu(&mut g).unwrap());

    assert_eq!(fused_activation(&g, linear), Some((Activation::Relu, 0.0)));
    assert!(!g.contains(relu));
    assert_eq!(g.successors(transpose), vec![out]);
    assert_eq!(g.output_names(), &[transpose]);
}

fn clip_chain(first: op::IrActivation, second: op::IrActivation) -> (Graph, NodeId, NodeId) {
    let mut g = graph();
    let x = input(&mut g, "x", &[4]);
    let a = node(&mut g, "first", first);
    let b = node(&mut g, "second", second);
    link(&mut g, x, a, 0, 0);
    link(&mut g, a, b, 0, 0);
    output(&mut g, b, &[4]);
    (g, a, b)
}

#[test]
fn chained_clips_intersect() {
    let (mut g, first, second) =
        clip_chain(clip(Activation::Clip, Some(-1.0), Some(3.0)), clip(Activation::Clip, Some(0.5), Some(8.0)));

    assert!(fuse_clip(&mut g).unwrap());

    assert!(!g.contains(first));
    let Some(Op::IrActivation(merged)) = g.op(second) else {
        panic!("second clip survives");
    };
    assert_eq!((merged.method, merged.clip_min, merged.clip_max), (Activation::Clip, Some(0.5), Some(3.0)));
}

#[test]
fn relu_then_six_bound_becomes_relu6() {
    let (mut g, first, second) =
        clip_chain(clip(Activation::Relu, None, None), clip(Activation::Clip, Some(-2.0), Some(6.0)));

    assert!(fuse_clip(&mut g).unwrap());

    assert!(!g.contains(first));
    assert!(matches!(g.op(second), Some(Op::IrActivation(a)) if a.method == Activation::Relu6));
}

#[test]
fn disjoint_clips_are_kept() {
    let (mut g, first, second) =
        clip_chain(clip(Activation::Clip, Some(0.0), Some(1.0)), clip(Activation::Clip, Some(2.0), Some(3.0)));

    assert!(!fuse_clip(&mut g).unwrap());
    assert!(g.contains(first));
    assert_eq!(g.op_type(second), Some(OpType::IrActivation));
}

#[test]
fn lone_clip_from_zero_is_renamed_relu() {
    let mut g = graph();
    let x = input(&mut g, "x", &[4]);
    let c = node(&mut g, "clip", clip(Activation::Clip, Some(0.0), None));
    link(&mut g, x, c, 0, 0);
    output(&mut g, c, &[4]);

    assert!(fuse_clip(&mut g).unwrap());
    assert!(matches!(g.op(c), Some(Op::IrActivation(a)) if a.method == Activation::Relu && a.clip_min.is_none()));
}
