use graft_dtype::DType;
use graft_ir::op::{self, Activation, LogicalMethod, Op, OpType};
use graft_ir::test::helpers::*;
use graft_ir::{EdgeAttr, Graph, NodeId, TensorMeta};

use crate::plugin::{PREPROCESS, PluginRegistry};
use crate::rules::legalize::*;
use crate::test::fixtures::{activation, conv};

fn sub() -> op::IrSub {
    op::IrSub { activations: Activation::None, negative_slope: 0.0 }
}

fn typed_link(graph: &mut Graph, src: NodeId, dst: NodeId, dst_in_port: usize, dtype: DType) {
    let tensor = TensorMeta::new().with_shape(vec![4]).with_dtype(dtype);
    graph.add_edge(src, dst, EdgeAttr::new(0, dst_in_port).with_tensor(tensor)).unwrap();
}

// ============================================================================
// CONSTANTS
// ============================================================================

#[test]
fn node_with_constant_outputs_becomes_constant() {
    let mut g = graph();
    let s = node(&mut g, "sub", sub());
    let a = const_operand(&mut g, "a", s, 0, vector(&[5.0, 6.0]));
    let b = const_operand(&mut g, "b", s, 1, vector(&[2.0, 2.0]));
    let out = node(&mut g, "out", op::Out {});
    let folded = TensorMeta::constant(vector(&[3.0, 4.0]), DType::Float32);
    g.add_edge(s, out, EdgeAttr::new(0, 0).with_tensor(folded)).unwrap();
    g.set_output_names(vec![s]).unwrap();

    assert!(fuse_const(&mut g).unwrap());

    assert!(matches!(g.op(s), Some(Op::Constant(c)) if c.value == vector(&[3.0, 4.0])));
    assert_eq!(g.in_degree(s), 0);
    assert!(!g.contains(a) && !g.contains(b));
}

#[test]
fn node_with_runtime_output_is_not_folded() {
    let mut g = graph();
    let x = input(&mut g, "x", &[2]);
    let s = node(&mut g, "sub", sub());
    link_shaped(&mut g, x, s, 0, 0, &[2]);
    const_operand(&mut g, "b", s, 1, vector(&[2.0, 2.0]));
    output(&mut g, s, &[2]);

    assert!(!fuse_const(&mut g).unwrap());
    assert_eq!(g.op_type(s), Some(OpType::IrSub));
}

#[test]
fn constants_are_lowered_or_dropped() {
    let mut g = graph();
    let x = input(&mut g, "x", &[2]);
    let s = node(&mut g, "sub", sub());
    link(&mut g, x, s, 0, 0);
    let operand = const_operand(&mut g, "operand", s, 1, vector(&[1.0, 2.0]));
    let beyond = const_operand(&mut g, "beyond", s, 2, vector(&[0.0]));
    output(&mut g, s, &[2]);
    let only_output = constant(&mut g, "only_output", vector(&[7.0]));
    output(&mut g, only_output, &[1]);
    let dummy = node(&mut g, "dummy", op::Dummy {});
    link(&mut g, dummy, s, 0, 3);

    assert!(remove_const(&mut g).unwrap());

    assert!(matches!(
        g.op(operand),
        Some(Op::IrConstant(c)) if c.weights == vector(&[1.0, 2.0]) && c.weights_offset.is_none()
    ));
    for gone in [beyond, only_output, dummy] {
        assert!(!g.contains(gone), "{gone:?} should be removed");
    }
    assert_eq!(g.output_names(), &[s]);
    assert_outputs_live(&g);
}

#[test]
fn weights_are_laid_out_in_sorted_order() {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 1, 2, 2]);
    let wide = op::IrConstant { weights: vector(&[1.0, 2.0, 3.0]), dtype: DType::Int64, weights_offset: None };
    let k = node(&mut g, "k", wide);
    let mut weighted = conv();
    weighted.weights = array(&[4, 1, 1, 1], vec![1.0; 4]);
    let c = node(&mut g, "conv", weighted);
    let s = node(&mut g, "sub", sub());
    link(&mut g, x, c, 0, 0);
    link(&mut g, c, s, 0, 0);
    link(&mut g, k, s, 0, 1);
    output(&mut g, s, &[1, 4, 2, 2]);

    assert!(trim_weights(&mut g).unwrap());

    let Some(Op::IrConstant(constant)) = g.op(k) else {
        panic!("constant kept");
    };
    assert_eq!(constant.dtype, DType::Int32);
    assert_eq!(constant.weights_offset, Some(0));
    let Some(Op::IrConvolution(conv)) = g.op(c) else {
        panic!("convolution kept");
    };
    assert_eq!(conv.weights_offset, Some(12));
    assert_eq!(conv.biases_offset, Some(28));
}

#[test]
fn per_channel_slopes_follow_the_biases() {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 1, 2, 2]);
    let c = node(&mut g, "conv", conv());
    let channel_slope =
        op::IrActivation { negative_slope: Some(vector(&[0.1, 0.2, 0.3])), ..activation(Activation::PRelu) };
    let prelu = node(&mut g, "prelu", channel_slope);
    let shared_slope = op::IrActivation { negative_slope: Some(scalar(0.2)), ..activation(Activation::PRelu) };
    let shared = node(&mut g, "shared", shared_slope);
    link(&mut g, x, c, 0, 0);
    link(&mut g, c, prelu, 0, 0);
    link(&mut g, prelu, shared, 0, 0);
    output(&mut g, shared, &[1, 1, 2, 2]);

    assert!(trim_weights(&mut g).unwrap());

    let Some(Op::IrConvolution(conv)) = g.op(c) else {
        panic!("convolution kept");
    };
    assert_eq!((conv.weights_offset, conv.biases_offset), (Some(0), Some(4)));
    let slope_offset = |id| match g.op(id) {
        Some(Op::IrActivation(a)) => a.negative_slope_offset,
        other => panic!("activation expected, got {other:?}"),
    };
    assert_eq!(slope_offset(prelu), Some(8));
    assert_eq!(slope_offset(shared), None, "a scalar slope stays an attribute");
}

#[test]
fn graph_without_weights_assigns_nothing() {
    let mut g = graph();
    let x = input(&mut g, "x", &[4]);
    let s = node(&mut g, "sub", sub());
    link(&mut g, x, s, 0, 0);
    link(&mut g, x, s, 0, 1);
    output(&mut g, s, &[4]);

    assert!(!trim_weights(&mut g).unwrap());
}

// ============================================================================
// CASTS
// ============================================================================

#[test]
fn boolean_logic_gets_uint8_operands() {
    let mut g = graph();
    let a = input(&mut g, "a", &[4]);
    let b = input(&mut g, "b", &[4]);
    let and = node(&mut g, "and", op::IrLogical { method: LogicalMethod::And });
    typed_link(&mut g, a, and, 0, DType::Float32);
    typed_link(&mut g, b, and, 1, DType::UInt8);
    output(&mut g, and, &[4]);

    assert!(insert_cast_if_must(&mut g).unwrap());

    let cast = g.id("a_cast").expect("cast on the float operand");
    assert!(matches!(g.op(cast), Some(Op::IrCast(c)) if c.to == DType::UInt8));
    assert!(g.id("b_cast").is_none());
    let inputs: Vec<_> = g.sorted_in_edges(and).iter().map(|e| (e.src, e.tensor().dtype)).collect();
    assert_eq!(inputs, vec![(cast, Some(DType::UInt8)), (b, Some(DType::UInt8))]);
    assert_ports_unique(&g);
}

#[test]
fn comparisons_need_no_cast() {
    let mut g = graph();
    let a = input(&mut g, "a", &[4]);
    let b = input(&mut g, "b", &[4]);
    let less = node(&mut g, "less", op::IrLogical { method: LogicalMethod::Less });
    typed_link(&mut g, a, less, 0, DType::Float32);
    typed_link(&mut g, b, less, 1, DType::Float32);
    output(&mut g, less, &[4]);

    assert!(!insert_cast_if_must(&mut g).unwrap());
}

#[test]
fn no_op_cast_is_removed() {
    let mut g = graph();
    let x = input(&mut g, "x", &[4]);
    let cast = node(&mut g, "cast", op::IrCast { to: DType::Float32 });
    typed_link(&mut g, x, cast, 0, DType::Float32);
    output(&mut g, cast, &[4]);

    assert!(remove_redundant_cast(&mut g).unwrap());
    assert!(!g.contains(cast));
    assert_eq!(g.output_names(), &[x]);
}

#[test]
fn widening_cast_folds_into_next_cast() {
    let mut g = graph();
    let x = input(&mut g, "x", &[4]);
    let widen = node(&mut g, "widen", op::IrCast { to: DType::Int32 });
    let to_float = node(&mut g, "to_float", op::IrCast { to: DType::Float32 });
    typed_link(&mut g, x, widen, 0, DType::Int8);
    typed_link(&mut g, widen, to_float, 0, DType::Int32);
    output(&mut g, to_float, &[4]);

    assert!(remove_redundant_cast(&mut g).unwrap());
    assert!(!g.contains(widen));
    assert_eq!(g.predecessors(to_float), vec![x]);
}

#[test]
fn narrowing_cast_is_kept() {
    let mut g = graph();
    let x = input(&mut g, "x", &[4]);
    let narrow = node(&mut g, "narrow", op::IrCast { to: DType::Int8 });
    let back = node(&mut g, "back", op::IrCast { to: DType::Float32 });
    typed_link(&mut g, x, narrow, 0, DType::Float32);
    typed_link(&mut g, narrow, back, 0, DType::Int8);
    output(&mut g, back, &[4]);

    assert!(!remove_redundant_cast(&mut g).unwrap());
    assert!(g.contains(narrow));
}

// ============================================================================
// PREPROCESS
// ============================================================================

fn two_input_graph() -> (Graph, NodeId, NodeId, NodeId) {
    let mut g = graph();
    let x0 = input(&mut g, "x0", &[4]);
    let x1 = input(&mut g, "x1", &[4]);
    let s = node(&mut g, "sub", sub());
    link_shaped(&mut g, x0, s, 0, 0, &[4]);
    link_shaped(&mut g, x1, s, 0, 1, &[4]);
    output(&mut g, s, &[4]);
    (g, x0, x1, s)
}

#[test]
fn inputs_are_routed_through_preprocess() {
    let (mut g, x0, x1, s) = two_input_graph();
    let plugins = PluginRegistry::new().with(PREPROCESS);

    assert!(insert_preprocess(&mut g, &plugins).unwrap());

    let pre = g.id("test_preprocess").expect("preprocess node added");
    assert!(matches!(g.op(pre), Some(Op::Plugin(p)) if p.name == PREPROCESS));
    let feeds: Vec<_> = g.sorted_in_edges(pre).iter().map(|e| (e.src, e.dst_in_port())).collect();
    assert_eq!(feeds, vec![(x0, 0), (x1, 1)]);
    let reads: Vec<_> = g.sorted_in_edges(s).iter().map(|e| (e.src, e.src_out_port(), e.dst_in_port())).collect();
    assert_eq!(reads, vec![(pre, 0, 0), (pre, 1, 1)]);
}

#[test]
fn preprocess_slots_advance_by_input_port_count() {
    let mut g = graph();
    let wide = input(&mut g, "wide", &[4]);
    let narrow = input(&mut g, "narrow", &[4]);
    let s = node(&mut g, "sub", sub());
    let a = node(&mut g, "a", op::Relu {});
    link(&mut g, wide, s, 0, 0);
    link(&mut g, wide, a, 1, 0);
    link(&mut g, narrow, s, 0, 1);
    output(&mut g, s, &[4]);
    output(&mut g, a, &[4]);

    assert!(insert_preprocess(&mut g, &PluginRegistry::new().with(PREPROCESS)).unwrap());

    let pre = g.id("test_preprocess").expect("preprocess node added");
    let reads: Vec<_> = g.sorted_in_edges(s).iter().map(|e| (e.src, e.src_out_port(), e.dst_in_port())).collect();
    assert_eq!(reads, vec![(pre, 0, 0), (pre, 2, 1)]);
    assert_eq!(g.sorted_in_edges(a)[0].src_out_port(), 0);
}

#[test]
fn preprocess_needs_registration() {
    let (mut g, x0, _, s) = two_input_graph();

    assert!(!insert_preprocess(&mut g, &PluginRegistry::new().with("Other")).unwrap());
    assert!(g.id("test_preprocess").is_none());
    assert_eq!(g.predecessors(s)[0], x0);
}
