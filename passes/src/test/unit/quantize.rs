use graft_dtype::DType;
use graft_ir::op::{self, Attrs, Op, OpSchema, OpType};
use graft_ir::test::helpers::*;
use graft_ir::{EdgeAttr, Graph, NodeId, TensorMeta};
use test_case::test_case;

use crate::rules::quantize::*;

fn bare_conv() -> op::Conv {
    op::Conv::from_attrs(&Attrs::new()).unwrap()
}

#[test]
fn constant_weights_and_biases_move_into_conv() {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 1, 4, 4]);
    let conv = node(&mut g, "conv", bare_conv());
    link(&mut g, x, conv, 0, 0);
    let w = const_operand(&mut g, "w", conv, 1, array(&[1, 1, 1, 1], vec![2.0]));
    let b = const_operand(&mut g, "b", conv, 2, vector(&[0.5]));
    if let Some(attr) = g.edge_attr_mut(w, conv, 0) {
        attr.tensor.min_max = Some((-1.0, 3.0));
    }
    output(&mut g, conv, &[1, 1, 4, 4]);

    assert!(fuse_weights_const(&mut g).unwrap());

    let Some(Op::Conv(fused)) = g.op(conv) else {
        panic!("conv kept");
    };
    assert_eq!(fused.weights, Some(array(&[1, 1, 1, 1], vec![2.0])));
    assert_eq!(fused.biases, Some(vector(&[0.5])));
    assert_eq!(fused.weights_min_max, Some(vec![-1.0, 3.0]));
    assert_eq!(g.predecessors(conv), vec![x]);
    assert!(!g.contains(w) && !g.contains(b));
}

#[test]
fn conv_without_biases_keeps_runtime_input() {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 1, 4, 4]);
    let conv = node(&mut g, "conv", op::ConvTranspose::from_attrs(&Attrs::new()).unwrap());
    link(&mut g, x, conv, 0, 0);
    const_operand(&mut g, "w", conv, 1, array(&[1, 1, 1, 1], vec![2.0]));
    output(&mut g, conv, &[1, 1, 4, 4]);

    assert!(fuse_weights_const(&mut g).unwrap());
    assert!(matches!(g.op(conv), Some(Op::ConvTranspose(c)) if c.weights.is_some() && c.biases.is_none()));
    assert_eq!(g.in_degree(conv), 1);
}

#[test]
fn runtime_weights_are_not_fused() {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 1, 4, 4]);
    let w = input(&mut g, "w", &[1, 1, 1, 1]);
    let conv = node(&mut g, "conv", bare_conv());
    link(&mut g, x, conv, 0, 0);
    link(&mut g, w, conv, 0, 1);
    output(&mut g, conv, &[1, 1, 4, 4]);

    assert!(!fuse_weights_const(&mut g).unwrap());
    assert_eq!(g.in_degree(conv), 2);
}

#[test_case(vector(&[0.2]), true; "single_slope")]
#[test_case(vector(&[0.2, 0.3]), false; "per_channel_slope")]
fn prelu_with_scalar_slope_becomes_leaky_relu(slope: graft_ir::tensor::Array, converted: bool) {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 2, 4, 4]);
    let prelu = node(&mut g, "prelu", op::PRelu {});
    link(&mut g, x, prelu, 0, 0);
    const_operand(&mut g, "slope", prelu, 1, slope);
    output(&mut g, prelu, &[1, 2, 4, 4]);

    assert_eq!(convert_special_prelu(&mut g).unwrap(), converted);
    if converted {
        assert!(matches!(g.op(prelu), Some(Op::LeakyRelu(l)) if (l.alpha - 0.2).abs() < 1e-9));
        assert_eq!(g.in_degree(prelu), 1);
    } else {
        assert_eq!(g.op_type(prelu), Some(OpType::PRelu));
    }
}

// ============================================================================
// QUANTIZED UNARY
// ============================================================================

/// Scale and `UInt8` zero point feeding in-ports 1 and 2 of a (de)quantize node.
fn quant_params(graph: &mut Graph, node: NodeId, scale: f64, zp: f64) {
    let prefix = graph.name(node).to_string();
    const_operand(graph, &format!("{prefix}_scale"), node, 1, scalar(scale));
    let zp_node = graph.add_op_node(format!("{prefix}_zp"), op::Constant { value: scalar(zp), dtype: DType::UInt8 });
    let tensor = TensorMeta::constant(scalar(zp), DType::UInt8);
    graph.add_edge(zp_node, node, EdgeAttr::new(0, 2).with_tensor(tensor)).unwrap();
}

/// `x -> DequantizeLinear -> unary -> QuantizeLinear -> out`
fn quantized_unary(unary: impl Into<Op>) -> (Graph, [NodeId; 4]) {
    let mut g = graph();
    g.quantize = true;
    let x = input(&mut g, "x", &[4]);
    let dequant = node(&mut g, "dequant", op::DequantizeLinear { axis: 1 });
    let unary = node(&mut g, "unary", unary);
    let quant = node(&mut g, "quant", op::QuantizeLinear { axis: 1 });
    link_shaped(&mut g, x, dequant, 0, 0, &[4]);
    link_shaped(&mut g, dequant, unary, 0, 0, &[4]);
    link_shaped(&mut g, unary, quant, 0, 0, &[4]);
    quant_params(&mut g, dequant, 0.25, 3.0);
    quant_params(&mut g, quant, 0.5, 0.0);
    output(&mut g, quant, &[4]);
    (g, [x, dequant, unary, quant])
}

#[test]
fn sigmoid_runs_on_quantized_data() {
    let (mut g, [x, dequant, unary, quant]) = quantized_unary(op::Sigmoid {});

    assert!(merge_q_unary(&mut g).unwrap());

    assert!(!g.contains(dequant) && !g.contains(quant));
    assert_eq!(g.output_names(), &[unary]);
    let input = &g.sorted_in_edges(unary)[0];
    assert_eq!((input.src, input.tensor().dtype), (x, Some(DType::UInt8)));
    assert_eq!(input.tensor().scale_zp, Some((scalar(0.25), scalar(3.0))));
    let output = &g.sorted_out_edges(unary)[0];
    assert_eq!(output.tensor().scale_zp, Some((scalar(0.5), scalar(0.0))));
    assert_outputs_live(&g);
}

#[test]
fn clip_bounds_are_requantized() {
    let (mut g, [_, _, unary, _]) = quantized_unary(op::Clip { min: Some(0.0), max: Some(6.0) });

    assert!(merge_q_unary(&mut g).unwrap());

    assert!(matches!(g.op(unary), Some(Op::Clip(c)) if c.min == Some(0.0) && c.max == Some(12.0)));
}

#[test]
fn clip_bound_saturates_to_dtype_range() {
    let (mut g, [_, _, unary, _]) = quantized_unary(op::Clip { min: None, max: None });
    const_operand(&mut g, "max", unary, 2, scalar(1000.0));

    assert!(merge_q_unary(&mut g).unwrap());

    assert!(matches!(g.op(unary), Some(Op::Clip(c)) if c.min.is_none() && c.max == Some(255.0)));
    assert_eq!(g.in_degree(unary), 1);
}

#[test]
fn float_graph_keeps_dequantize_pairs() {
    let (mut g, [_, dequant, _, quant]) = quantized_unary(op::Relu {});
    g.quantize = false;

    assert!(!merge_q_unary(&mut g).unwrap());
    assert!(g.contains(dequant) && g.contains(quant));
}

// ============================================================================
// SEQUENCES
// ============================================================================

/// Three inputs packed into a sequence, read back at `index` by a `Relu`.
fn sequence_at(index: f64) -> (Graph, [NodeId; 3], NodeId, NodeId) {
    let mut g = graph();
    let items = ["a", "b", "c"].map(|name| input(&mut g, name, &[2]));
    let construct = node(&mut g, "construct", op::SequenceConstruct {});
    for (port, &item) in items.iter().enumerate() {
        link(&mut g, item, construct, 0, port);
    }
    let at = node(&mut g, "at", op::SequenceAt {});
    link(&mut g, construct, at, 0, 0);
    const_operand(&mut g, "index", at, 1, scalar(index));
    let relu = node(&mut g, "relu", op::Relu {});
    link(&mut g, at, relu, 0, 0);
    output(&mut g, relu, &[2]);
    (g, items, at, relu)
}

#[test_case(1.0, 1; "positive_index")]
#[test_case(-1.0, 2; "negative_index")]
fn sequence_at_reads_item_directly(index: f64, expected: usize) {
    let (mut g, items, at, relu) = sequence_at(index);

    assert!(merge_sequence_construct_and_at(&mut g).unwrap());

    assert!(!g.contains(at));
    assert!(g.id("construct").is_none(), "the unread sequence is swept");
    assert_eq!(g.predecessors(relu), vec![items[expected]]);
}

#[test]
fn out_of_range_index_is_skipped() {
    let (mut g, _, at, _) = sequence_at(3.0);

    assert!(!merge_sequence_construct_and_at(&mut g).unwrap());
    assert!(g.contains(at));
}
