//! Front-phase cleanups: constant operands folded into attributes, and quantized-model patterns.

use graft_dtype::DType;
use graft_ir::op::{self, Op, OpType};
use graft_ir::tensor::{Array, TensorMeta};
use graft_ir::{Graph, NodeId, Pattern, PortFilter, matched_patterns, single_node_matcher};

use crate::common::{drop_in_ports, move_out_edges};
use crate::error::{Result, Skip};
use crate::rewrite::{apply_matches, require_const, require_in_edge, require_op, require_single_consumer, unsupported};

/// A constant operand together with the calibration data on its edge.
struct Operand {
    value: Array,
    min_max: Option<(f64, f64)>,
    scale_zp: Option<(Array, Array)>,
}

fn operand(graph: &Graph, node: NodeId, port: usize) -> Option<Operand> {
    let value = graph.in_const(node, port)?;
    let edge = graph.sorted_in_edges(node).into_iter().find(|e| e.dst_in_port() == port)?;
    Some(Operand { value, min_max: edge.attr.tensor.min_max, scale_zp: edge.attr.tensor.scale_zp })
}

macro_rules! store_operands {
    ($conv:expr, $weights:expr, $biases:expr) => {{
        let conv = $conv;
        let weights: Operand = $weights;
        conv.weights = Some(weights.value);
        conv.weights_min_max = weights.min_max.map(|(lo, hi)| vec![lo, hi]);
        if let Some((scale, zp)) = weights.scale_zp {
            conv.weights_scale = Some(scale);
            conv.weights_zp = Some(zp);
        }
        if let Some(biases) = $biases {
            let biases: Operand = biases;
            conv.biases = Some(biases.value);
            if let Some((scale, zp)) = biases.scale_zp {
                conv.biases_scale = Some(scale);
                conv.biases_zp = Some(zp);
            }
        }
    }};
}

fn has_const_weights(graph: &Graph, node: NodeId) -> bool {
    matches!(graph.op(node), Some(Op::Conv(c)) if c.weights.is_none())
        || matches!(graph.op(node), Some(Op::ConvTranspose(c)) if c.weights.is_none())
}

/// Constant weights on in-port 1 and biases on in-port 2 of a convolution move into its attributes, carrying
/// their calibration range and quantization parameters along.
#[tracing::instrument(skip_all)]
pub fn fuse_weights_const(graph: &mut Graph) -> Result<bool> {
    let matches = single_node_matcher(graph, [OpType::Conv, OpType::ConvTranspose])
        .into_iter()
        .filter(|m| has_const_weights(graph, m["target"]) && graph.in_const(m["target"], 1).is_some())
        .collect();
    apply_matches(graph, "fuse_weights_const", matches, |graph, m| {
        let node = m["target"];
        let weights = operand(graph, node, 1).ok_or(Skip::NotConstant { node, port: 1 })?;
        let biases = operand(graph, node, 2);
        let fused_ports = if biases.is_some() { 2 } else { 1 };

        drop_in_ports(graph, node, |port| (1..=fused_ports).contains(&port));
        match graph.op_mut(node) {
            Some(Op::Conv(conv)) => store_operands!(conv, weights, biases),
            Some(Op::ConvTranspose(conv)) => store_operands!(conv, weights, biases),
            _ => return Err(Skip::InvalidNode { node }.into()),
        }
        Ok(())
    })
}

fn scalar_slope(graph: &Graph, node: NodeId) -> Option<f64> {
    graph.in_const(node, 1).filter(|v| v.len() == 1).and_then(|v| v.iter().next().copied())
}

/// `PRelu` with a single-element constant slope is a `LeakyRelu`.
#[tracing::instrument(skip_all)]
pub fn convert_special_prelu(graph: &mut Graph) -> Result<bool> {
    let matches = single_node_matcher(graph, OpType::PRelu)
        .into_iter()
        .filter(|m| scalar_slope(graph, m["target"]).is_some())
        .collect();
    apply_matches(graph, "convert_special_prelu", matches, |graph, m| {
        let node = m["target"];
        let alpha = scalar_slope(graph, node).ok_or(Skip::NotConstant { node, port: 1 })?;
        drop_in_ports(graph, node, |port| port == 1);
        graph.set_op(node, op::LeakyRelu { alpha });
        Ok(())
    })
}

/// Unary operators that run directly on quantized data.
const QUANTIZABLE_UNARY: &[OpType] = &[
    OpType::Relu,
    OpType::LeakyRelu,
    OpType::Clip,
    OpType::Sigmoid,
    OpType::Tanh,
    OpType::HardSigmoid,
    OpType::HardSwish,
];

/// Quantization parameters read from the scale (in-port 1) and zero-point (in-port 2) operands.
struct QuantParams {
    scale: Array,
    zp: Array,
    dtype: DType,
}

impl QuantParams {
    fn read(graph: &Graph, node: NodeId) -> std::result::Result<Self, Skip> {
        let scale = require_const(graph, node, 1)?;
        let (zp, dtype) = match require_in_edge(graph, node, 2) {
            Ok(edge) => {
                let zp = require_const(graph, node, 2)?;
                let dtype = match graph.op(edge.src) {
                    Some(Op::Constant(c)) => c.dtype,
                    Some(Op::IrConstant(c)) => c.dtype,
                    _ => edge.tensor().dtype.unwrap_or(DType::UInt8),
                };
                (zp, dtype)
            }
            Err(_) => (Array::zeros(scale.raw_dim()), DType::UInt8),
        };
        if scale.len() != 1 || zp.len() != 1 {
            return Err(unsupported(node, "per-channel quantization"));
        }
        Ok(Self { scale, zp, dtype })
    }

    fn quantize(&self, value: f64) -> f64 {
        let scale = self.scale.iter().next().copied().unwrap_or(1.0);
        let zp = self.zp.iter().next().copied().unwrap_or(0.0);
        let q = (value / scale).round() + zp;
        match self.dtype.int_range() {
            Some((lo, hi)) => q.clamp(lo, hi),
            None => q,
        }
    }

    fn tensor(&self, like: &TensorMeta) -> TensorMeta {
        TensorMeta {
            value: None,
            is_const: false,
            scale_zp: Some((self.scale.clone(), self.zp.clone())),
            ..like.clone()
        }
        .with_dtype(self.dtype)
    }
}

/// `DequantizeLinear -> unary op -> QuantizeLinear` becomes the unary op running on quantized data.
///
/// Only for graphs flagged as quantized. Clip bounds are requantized with the output parameters.
#[tracing::instrument(skip_all)]
pub fn merge_q_unary(graph: &mut Graph) -> Result<bool> {
    if !graph.quantize {
        return Ok(false);
    }
    let pattern = Pattern::new()
        .node("dequant", OpType::DequantizeLinear)
        .node("unary", QUANTIZABLE_UNARY)
        .node("quant", OpType::QuantizeLinear)
        .edge("dequant", "unary", PortFilter::dst(0))
        .edge("unary", "quant", PortFilter::dst(0));
    let matches = matched_patterns(graph, &pattern);
    apply_matches(graph, "merge_q_unary", matches, |graph, m| {
        let (dequant, unary, quant) = (m["dequant"], m["unary"], m["quant"]);
        require_single_consumer(graph, dequant)?;
        require_single_consumer(graph, unary)?;
        let input_params = QuantParams::read(graph, dequant)?;
        let output_params = QuantParams::read(graph, quant)?;
        let input = require_in_edge(graph, dequant, 0)?;
        let link = require_in_edge(graph, unary, 0)?;
        let clip = match require_op(graph, unary)? {
            Op::Clip(c) => {
                let bound = |attr: Option<f64>, port| {
                    let value = attr.or_else(|| graph.in_const(unary, port)?.iter().next().copied());
                    value.map(|v| output_params.quantize(v))
                };
                Some(op::Clip { min: bound(c.min, 1), max: bound(c.max, 2) })
            }
            _ => None,
        };

        graph.remove_edge(link.src, link.dst, Some(link.key));
        graph.remove_edge(input.src, input.dst, Some(input.key));
        let quantized = input.attr.with_ports(input.src_out_port(), 0).with_tensor(input_params.tensor(input.tensor()));
        graph.add_edge(input.src, unary, quantized)?;
        move_out_edges(graph, quant, unary)?;
        for edge in graph.sorted_out_edges(unary) {
            if let Some(attr) = graph.edge_attr_mut(edge.src, edge.dst, edge.key) {
                attr.tensor = output_params.tensor(&attr.tensor);
            }
        }
        graph.replace_output(quant, unary)?;
        if let Some(clip) = clip {
            drop_in_ports(graph, unary, |port| port >= 1);
            graph.set_op(unary, clip);
        }
        Ok(())
    })
}

/// `SequenceAt(SequenceConstruct(x0, .., xn), i)` with a constant index reads `xi` directly.
#[tracing::instrument(skip_all)]
pub fn merge_sequence_construct_and_at(graph: &mut Graph) -> Result<bool> {
    let pattern = Pattern::new()
        .node("construct", OpType::SequenceConstruct)
        .node("at", OpType::SequenceAt)
        .edge("construct", "at", PortFilter::dst(0));
    let matches = matched_patterns(graph, &pattern);
    apply_matches(graph, "merge_sequence_construct_and_at", matches, |graph, m| {
        let (construct, at) = (m["construct"], m["at"]);
        let index = require_const(graph, at, 1)?;
        let [index] = index.iter().copied().collect::<Vec<_>>()[..] else {
            return Err(unsupported(at, "index is not a scalar").into());
        };
        let items = graph.sorted_in_edges(construct);
        let count = items.len() as i64;
        let index = index as i64;
        let resolved = if index < 0 { index + count } else { index };
        let Some(item) = usize::try_from(resolved).ok().and_then(|i| items.into_iter().nth(i)) else {
            return Err(unsupported(at, format!("index {index} out of {count} items")).into());
        };

        for edge in graph.sorted_out_edges(at) {
            graph.add_edge(item.src, edge.dst, edge.attr.with_ports(item.src_out_port(), edge.dst_in_port()))?;
        }
        graph.replace_output(at, item.src)?;
        graph.remove_node(at);
        Ok(())
    })
}
