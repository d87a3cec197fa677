//! Lowering of source-format operators to target IR kinds.
//!
//! Each rule validates a node and computes its replacement payload without touching the graph. The shared
//! driver then drops the in-ports the target kind no longer reads and swaps the payload in place, so edges to
//! the data inputs and all consumers survive.

use graft_dtype::DType;
use graft_ir::infer::resolve_dims;
use graft_ir::op::{
    self, Activation, BitwiseMethod, EltwiseMethod, LogicalMethod, MinMaxMethod, Op, OpType, PoolMethod,
    ReduceMethod,
};
use graft_ir::tensor::{self, Array};
use graft_ir::{Graph, NodeId, OpFilter, single_node_matcher};
use ndarray::IxDyn;

use crate::common::{dims_i64, drop_in_ports, insert_after, shaped};
use crate::error::{Result, Skip};
use crate::rewrite::{
    apply_matches, require_const, require_in_edge, require_input_shape, require_op, require_output_shape,
    unsupported,
};

type Lowering = std::result::Result<Lowered, Skip>;

/// Replacement payload of one node.
struct Lowered {
    op: Op,
    /// In-ports from this index on are disconnected.
    inputs: usize,
    /// `(produced, expected)` shapes when a reshape must follow the node.
    reshape_after: Option<(Vec<usize>, Vec<usize>)>,
}

impl Lowered {
    fn new(op: impl Into<Op>, inputs: usize) -> Self {
        Self { op: op.into(), inputs, reshape_after: None }
    }
}

fn lower_nodes(
    graph: &mut Graph,
    pass: &'static str,
    filter: impl Into<OpFilter>,
    lower: impl Fn(&Graph, NodeId) -> Lowering,
) -> Result<bool> {
    let matches = single_node_matcher(graph, filter);
    apply_matches(graph, pass, matches, |graph, m| {
        let node = m["target"];
        let Lowered { op, inputs, reshape_after } = lower(graph, node)?;
        drop_in_ports(graph, node, |port| port >= inputs);
        graph.set_op(node, op);
        if let Some((produced, expected)) = reshape_after {
            insert_after(graph, node, 0, "reshape", op::IrReshape { dim: dims_i64(&expected) }, shaped(produced))?;
        }
        Ok(())
    })
}

/// Integer operand given either as an attribute or as a constant on `port`.
fn ints_operand(graph: &Graph, node: NodeId, port: usize, attr: Option<&[i64]>) -> std::result::Result<Vec<i64>, Skip> {
    if let Some(values) = attr.filter(|v| !v.is_empty()) {
        return Ok(values.to_vec());
    }
    if require_in_edge(graph, node, port).is_err() {
        return Ok(Vec::new());
    }
    Ok(require_const(graph, node, port)?.iter().map(|&v| v as i64).collect())
}

fn scalar_operand(graph: &Graph, node: NodeId, port: usize) -> std::result::Result<Option<f64>, Skip> {
    if require_in_edge(graph, node, port).is_err() {
        return Ok(None);
    }
    let value = require_const(graph, node, port)?;
    Ok(value.iter().next().copied())
}

// ============================================================================
// ACTIVATIONS
// ============================================================================

fn activation(method: Activation) -> op::IrActivation {
    op::IrActivation {
        method,
        alpha: 0.0,
        beta: 0.0,
        gamma: 0.0,
        clip_min: None,
        clip_max: None,
        negative_slope: None,
        negative_slope_offset: None,
    }
}

/// Source activations become `IrActivation`. `Clip(0, 6)` is recognized as RELU6, `Clip(0, inf)` as RELU.
#[tracing::instrument(skip_all)]
pub fn rename_activations(graph: &mut Graph) -> Result<bool> {
    lower_nodes(graph, "rename_activations", OpFilter::Where(|op| op.op_type().is_activation_op()), |graph, node| {
        let lowered = match require_op(graph, node)? {
            Op::Relu(_) => activation(Activation::Relu),
            Op::LeakyRelu(l) => op::IrActivation { alpha: l.alpha, ..activation(Activation::LeakyRelu) },
            Op::PRelu(_) => {
                let slope = require_const(graph, node, 1)?;
                op::IrActivation { negative_slope: Some(slope), ..activation(Activation::PRelu) }
            }
            Op::Clip(clip) => {
                let min = clip.min.map_or_else(|| scalar_operand(graph, node, 1), |v| Ok(Some(v)))?;
                let max = clip.max.map_or_else(|| scalar_operand(graph, node, 2), |v| Ok(Some(v)))?;
                match (min, max) {
                    (Some(lo), Some(hi)) if tensor::float_equal(lo, 0.0) && tensor::float_equal(hi, 6.0) => {
                        activation(Activation::Relu6)
                    }
                    (Some(lo), None) if tensor::float_equal(lo, 0.0) => activation(Activation::Relu),
                    _ => op::IrActivation { clip_min: min, clip_max: max, ..activation(Activation::Clip) },
                }
            }
            Op::Sigmoid(_) => activation(Activation::Sigmoid),
            Op::Tanh(_) => activation(Activation::Tanh),
            Op::Elu(e) => op::IrActivation { alpha: e.alpha, ..activation(Activation::Elu) },
            Op::Selu(s) => op::IrActivation { alpha: s.alpha, gamma: s.gamma, ..activation(Activation::Selu) },
            Op::Celu(c) => op::IrActivation { alpha: c.alpha, ..activation(Activation::Celu) },
            Op::Gelu(_) => activation(Activation::Gelu),
            Op::HardSigmoid(h) => {
                op::IrActivation { alpha: h.alpha, beta: h.beta, ..activation(Activation::HardSigmoid) }
            }
            Op::HardSwish(_) => activation(Activation::HardSwish),
            Op::Softplus(_) => activation(Activation::Softplus),
            Op::Softsign(_) => activation(Activation::Softsign),
            Op::Silu(_) => activation(Activation::Silu),
            Op::Mish(_) => activation(Activation::Mish),
            Op::Shrink(s) => op::IrActivation { alpha: s.lambd, beta: s.bias, ..activation(Activation::Shrink) },
            Op::ThresholdedRelu(t) => op::IrActivation { alpha: t.alpha, ..activation(Activation::ThresholdedRelu) },
            other => return Err(unsupported(node, format!("{} is not an activation", other.op_type()))),
        };
        Ok(Lowered::new(lowered, 1))
    })
}

// ============================================================================
// ARITHMETIC, LOGICAL, BITWISE
// ============================================================================

#[tracing::instrument(skip_all)]
pub fn rename_mul_add_max_min(graph: &mut Graph) -> Result<bool> {
    let kinds = [OpType::Add, OpType::Mul, OpType::Max, OpType::Min];
    lower_nodes(graph, "rename_mul_add_max_min", kinds, |graph, node| {
        let method = match require_op(graph, node)?.op_type() {
            OpType::Add => EltwiseMethod::Add,
            OpType::Mul => EltwiseMethod::Mul,
            OpType::Max => EltwiseMethod::Max,
            _ => EltwiseMethod::Min,
        };
        if graph.in_degree(node) != 2 {
            return Err(unsupported(node, "only binary forms are lowered"));
        }
        let op = op::IrEltwise { method, activations: Activation::None, negative_slope: 0.0 };
        Ok(Lowered::new(op, 2))
    })
}

#[tracing::instrument(skip_all)]
pub fn rename_logical(graph: &mut Graph) -> Result<bool> {
    let kinds = [
        OpType::Equal,
        OpType::Greater,
        OpType::GreaterOrEqual,
        OpType::Less,
        OpType::LessOrEqual,
        OpType::And,
        OpType::Or,
        OpType::Xor,
        OpType::Not,
    ];
    lower_nodes(graph, "rename_logical", kinds, |graph, node| {
        let method = match require_op(graph, node)?.op_type() {
            OpType::Equal => LogicalMethod::Equal,
            OpType::Greater => LogicalMethod::Greater,
            OpType::GreaterOrEqual => LogicalMethod::GreaterEqual,
            OpType::Less => LogicalMethod::Less,
            OpType::LessOrEqual => LogicalMethod::LessEqual,
            OpType::And => LogicalMethod::And,
            OpType::Or => LogicalMethod::Or,
            OpType::Xor => LogicalMethod::Xor,
            _ => LogicalMethod::Not,
        };
        let inputs = if method == LogicalMethod::Not { 1 } else { 2 };
        Ok(Lowered::new(op::IrLogical { method }, inputs))
    })
}

#[tracing::instrument(skip_all)]
pub fn rename_bitwise(graph: &mut Graph) -> Result<bool> {
    let kinds = [OpType::BitwiseAnd, OpType::BitwiseOr, OpType::BitwiseXor];
    lower_nodes(graph, "rename_bitwise", kinds, |graph, node| {
        let method = match require_op(graph, node)?.op_type() {
            OpType::BitwiseAnd => BitwiseMethod::And,
            OpType::BitwiseOr => BitwiseMethod::Or,
            _ => BitwiseMethod::Xor,
        };
        Ok(Lowered::new(op::IrBitwise { method }, 2))
    })
}

/// Bool casts become uint8 casts; the target has no bool tensors.
#[tracing::instrument(skip_all)]
pub fn rename_cast(graph: &mut Graph) -> Result<bool> {
    lower_nodes(graph, "rename_cast", OpType::Cast, |graph, node| {
        let Op::Cast(cast) = require_op(graph, node)? else {
            return Err(unsupported(node, "expected Cast"));
        };
        let to = if cast.to == DType::Bool { DType::UInt8 } else { cast.to };
        Ok(Lowered::new(op::IrCast { to }, 1))
    })
}

// ============================================================================
// CONVOLUTION, NORMALIZATION, POOLING
// ============================================================================

/// Conv and ConvTranspose become the target convolutions with weights in OHWI order.
///
/// A convolution whose `prod(weights.shape[0..2]) == group > 1` is depthwise.
#[tracing::instrument(skip_all)]
pub fn rename_conv(graph: &mut Graph) -> Result<bool> {
    lower_nodes(graph, "rename_conv", [OpType::Conv, OpType::ConvTranspose], lower_conv)
}

fn conv_params(
    graph: &Graph,
    node: NodeId,
    weights: Option<&Array>,
    biases: Option<&Array>,
    out_channels: impl Fn(&[usize]) -> usize,
) -> std::result::Result<(Array, Array, usize), Skip> {
    let weights = match weights {
        Some(w) => w.clone(),
        None => require_const(graph, node, 1)?,
    };
    if weights.ndim() != 4 {
        return Err(unsupported(node, format!("expected 4-d weights, got {:?}", weights.shape())));
    }
    let num_output = out_channels(weights.shape());
    let biases = match biases {
        Some(b) => b.clone(),
        None if require_in_edge(graph, node, 2).is_ok() => require_const(graph, node, 2)?,
        None => Array::zeros(IxDyn(&[num_output])),
    };
    if biases.len() != num_output {
        return Err(unsupported(node, "biases do not match the output channels"));
    }
    Ok((weights, biases, num_output))
}

fn lower_conv(graph: &Graph, node: NodeId) -> Lowering {
    let transposed = |weights: &Array, perm: &[usize]| {
        tensor::transpose(weights, perm).map_err(|e| unsupported(node, e.to_string()))
    };
    let kernel = |given: &[usize], weights: &Array| {
        if given.is_empty() { weights.shape()[2..].to_vec() } else { given.to_vec() }
    };
    let op: Op = match require_op(graph, node)? {
        Op::Conv(c) => {
            let (weights, biases, num_output) =
                conv_params(graph, node, c.weights.as_ref(), c.biases.as_ref(), |shape| shape[0])?;
            let kernel_shape = kernel(&c.kernel_shape, &weights);
            let depthwise = weights.shape()[0] * weights.shape()[1] == c.group && c.group > 1;
            let ohwi = transposed(&weights, &[0, 2, 3, 1])?;
            if depthwise {
                op::IrDepthwiseConv {
                    weights: ohwi,
                    biases,
                    weights_min_max: c.weights_min_max.clone(),
                    weights_scale: c.weights_scale.clone(),
                    weights_zp: c.weights_zp.clone(),
                    biases_scale: c.biases_scale.clone(),
                    biases_zp: c.biases_zp.clone(),
                    num_output,
                    multiplier: (num_output / c.group).max(1),
                    kernel_shape,
                    strides: c.strides.clone(),
                    pads: c.pads.clone(),
                    dilations: c.dilations.clone(),
                    activations: Activation::None,
                    negative_slope: 0.0,
                    weights_offset: None,
                    biases_offset: None,
                }
                .into()
            } else {
                op::IrConvolution {
                    weights: ohwi,
                    biases,
                    weights_min_max: c.weights_min_max.clone(),
                    weights_scale: c.weights_scale.clone(),
                    weights_zp: c.weights_zp.clone(),
                    biases_scale: c.biases_scale.clone(),
                    biases_zp: c.biases_zp.clone(),
                    num_output,
                    group: c.group,
                    kernel_shape,
                    strides: c.strides.clone(),
                    pads: c.pads.clone(),
                    dilations: c.dilations.clone(),
                    activations: Activation::None,
                    negative_slope: 0.0,
                    weights_offset: None,
                    biases_offset: None,
                }
                .into()
            }
        }
        Op::ConvTranspose(c) => {
            let group = c.group;
            let (weights, biases, num_output) =
                conv_params(graph, node, c.weights.as_ref(), c.biases.as_ref(), |shape| shape[1] * group)?;
            let kernel_shape = kernel(&c.kernel_shape, &weights);
            op::IrDeconvolution {
                weights: transposed(&weights, &[1, 2, 3, 0])?,
                biases,
                weights_min_max: c.weights_min_max.clone(),
                weights_scale: c.weights_scale.clone(),
                weights_zp: c.weights_zp.clone(),
                biases_scale: c.biases_scale.clone(),
                biases_zp: c.biases_zp.clone(),
                num_output,
                group,
                kernel_shape,
                strides: c.strides.clone(),
                pads: c.pads.clone(),
                dilations: c.dilations.clone(),
                output_padding: c.output_padding.clone(),
                activations: Activation::None,
                negative_slope: 0.0,
                weights_offset: None,
                biases_offset: None,
            }
            .into()
        }
        other => return Err(unsupported(node, format!("{} is not a convolution", other.op_type()))),
    };
    Ok(Lowered::new(op, 1))
}

/// Inference-mode batch normalization folds into per-channel scale and shift:
/// `w = gamma / sqrt(var + eps)`, `b = beta - gamma * mean / sqrt(var + eps)`.
#[tracing::instrument(skip_all)]
pub fn rename_bn(graph: &mut Graph) -> Result<bool> {
    lower_nodes(graph, "rename_bn", OpType::BatchNormalization, |graph, node| {
        let Op::BatchNormalization(bn) = require_op(graph, node)? else {
            return Err(unsupported(node, "expected BatchNormalization"));
        };
        if bn.training_mode {
            return Err(unsupported(node, "training mode is not supported"));
        }
        let gamma = require_const(graph, node, 1)?;
        let beta = require_const(graph, node, 2)?;
        let mean = require_const(graph, node, 3)?;
        let var = require_const(graph, node, 4)?;
        if [&beta, &mean, &var].iter().any(|p| p.shape() != gamma.shape()) {
            return Err(unsupported(node, "normalization parameters differ in shape"));
        }
        let std = var.mapv(|v| (v + bn.epsilon).sqrt());
        let weights = &gamma / &std;
        let biases = &beta - &(&weights * &mean);
        let op = op::IrBatchNorm {
            weights,
            biases,
            activations: Activation::None,
            negative_slope: 0.0,
            weights_offset: None,
            biases_offset: None,
        };
        Ok(Lowered::new(op, 1))
    })
}

#[tracing::instrument(skip_all)]
pub fn rename_pool(graph: &mut Graph) -> Result<bool> {
    let kinds = [OpType::AveragePool, OpType::MaxPool, OpType::LpPool];
    lower_nodes(graph, "rename_pool", kinds, |graph, node| {
        let pooling = |method, kernel_shape: &[usize], strides: &[usize], pads: &[usize], dilations: &[usize]| {
            op::IrPooling {
                method,
                kernel_shape: kernel_shape.to_vec(),
                strides: strides.to_vec(),
                pads: pads.to_vec(),
                dilations: dilations.to_vec(),
                count_include_pad: false,
                activations: Activation::None,
                negative_slope: 0.0,
            }
        };
        let op = match require_op(graph, node)? {
            Op::AveragePool(p) => op::IrPooling {
                count_include_pad: p.count_include_pad,
                ..pooling(PoolMethod::Avg, &p.kernel_shape, &p.strides, &p.pads, &p.dilations)
            },
            Op::MaxPool(p) => pooling(PoolMethod::Max, &p.kernel_shape, &p.strides, &p.pads, &p.dilations),
            Op::LpPool(p) => {
                let method = match p.p {
                    1 => PoolMethod::L1,
                    2 => PoolMethod::L2,
                    other => return Err(unsupported(node, format!("LpPool with p={other}"))),
                };
                pooling(method, &p.kernel_shape, &p.strides, &p.pads, &[1, 1])
            }
            other => return Err(unsupported(node, format!("{} is not a pooling", other.op_type()))),
        };
        Ok(Lowered::new(op, 1))
    })
}

// ============================================================================
// REDUCTIONS
// ============================================================================

/// ArgMax/ArgMin become `IrArgMinMax`. Without `keepdims` a reshape drops the reduced axis afterwards.
#[tracing::instrument(skip_all)]
pub fn rename_argminmax(graph: &mut Graph) -> Result<bool> {
    lower_nodes(graph, "rename_argminmax", [OpType::ArgMax, OpType::ArgMin], |graph, node| {
        let (method, axis, keepdims, select_last_index) = match require_op(graph, node)? {
            Op::ArgMax(a) => (MinMaxMethod::Max, a.axis, a.keepdims, a.select_last_index),
            Op::ArgMin(a) => (MinMaxMethod::Min, a.axis, a.keepdims, a.select_last_index),
            other => return Err(unsupported(node, format!("{} is not an arg reduction", other.op_type()))),
        };
        let mut lowered = Lowered::new(op::IrArgMinMax { method, axis, select_last_index }, 1);
        if !keepdims {
            let shape = require_input_shape(graph, node, 0)?;
            let axis = tensor::normalize_axis(axis, shape.len()).ok_or_else(|| unsupported(node, "axis out of range"))?;
            let mut produced = shape.clone();
            produced[axis] = 1;
            let mut expected = shape;
            expected.remove(axis);
            lowered.reshape_after = Some((produced, expected));
        }
        Ok(lowered)
    })
}

#[tracing::instrument(skip_all)]
pub fn rename_reduce(graph: &mut Graph) -> Result<bool> {
    let kinds = [
        OpType::ReduceMean,
        OpType::ReduceSum,
        OpType::ReduceMax,
        OpType::ReduceMin,
        OpType::ReduceProd,
        OpType::ReduceL1,
        OpType::ReduceL2,
    ];
    lower_nodes(graph, "rename_reduce", kinds, |graph, node| {
        let (method, axes, keepdims) = match require_op(graph, node)? {
            Op::ReduceMean(r) => (ReduceMethod::Mean, &r.axes, r.keepdims),
            Op::ReduceSum(r) => (ReduceMethod::Sum, &r.axes, r.keepdims),
            Op::ReduceMax(r) => (ReduceMethod::Max, &r.axes, r.keepdims),
            Op::ReduceMin(r) => (ReduceMethod::Min, &r.axes, r.keepdims),
            Op::ReduceProd(r) => (ReduceMethod::Prod, &r.axes, r.keepdims),
            Op::ReduceL1(r) => (ReduceMethod::L1, &r.axes, r.keepdims),
            Op::ReduceL2(r) => (ReduceMethod::L2, &r.axes, r.keepdims),
            other => return Err(unsupported(node, format!("{} is not a reduction", other.op_type()))),
        };
        let mut axes = ints_operand(graph, node, 1, Some(axes.as_slice()))?;
        if axes.is_empty() {
            let rank = require_input_shape(graph, node, 0)?.len();
            axes = (0..rank as i64).collect();
        }
        Ok(Lowered::new(op::IrReduce { method, axes, keepdims }, 1))
    })
}

// ============================================================================
// SHAPE MANIPULATION
// ============================================================================

/// Reshape, Flatten, Squeeze and Unsqueeze all become `IrReshape` with explicit dims.
#[tracing::instrument(skip_all)]
pub fn rename_reshape(graph: &mut Graph) -> Result<bool> {
    let kinds = [OpType::Reshape, OpType::Flatten, OpType::Squeeze, OpType::Unsqueeze];
    lower_nodes(graph, "rename_reshape", kinds, |graph, node| {
        let input =
            graph.sorted_in_edges(node).into_iter().find(|e| e.dst_in_port() == 0).and_then(|e| e.tensor().shape());
        let dim: Vec<i64> = match require_op(graph, node)? {
            Op::Reshape(r) => {
                let dims = ints_operand(graph, node, 1, r.shape.as_deref())?;
                if dims.is_empty() {
                    return Err(unsupported(node, "reshape without target shape"));
                }
                match input.as_deref().and_then(|shape| resolve_dims(shape, &dims)) {
                    Some(resolved) => dims_i64(&resolved),
                    None => dims,
                }
            }
            Op::Flatten(f) => {
                let shape = input.ok_or(Skip::MissingShape { node })?;
                let axis = if f.axis < 0 { f.axis + shape.len() as i64 } else { f.axis };
                let axis = usize::try_from(axis).ok().filter(|&a| a <= shape.len());
                let axis = axis.ok_or_else(|| unsupported(node, "flatten axis out of range"))?;
                vec![shape[..axis].iter().product::<usize>() as i64, shape[axis..].iter().product::<usize>() as i64]
            }
            Op::Squeeze(s) => {
                let shape = input.ok_or(Skip::MissingShape { node })?;
                let axes = ints_operand(graph, node, 1, Some(s.axes.as_slice()))?;
                let axes: Option<Vec<usize>> = axes.iter().map(|&a| tensor::normalize_axis(a, shape.len())).collect();
                let axes = axes.ok_or_else(|| unsupported(node, "squeeze axis out of range"))?;
                let keep = |&(i, &d): &(usize, &usize)| if axes.is_empty() { d != 1 } else { !axes.contains(&i) };
                shape.iter().enumerate().filter(keep).map(|(_, &d)| d as i64).collect()
            }
            Op::Unsqueeze(u) => {
                let shape = input.ok_or(Skip::MissingShape { node })?;
                let axes = ints_operand(graph, node, 1, Some(u.axes.as_slice()))?;
                let rank = shape.len() + axes.len();
                let mut axes: Vec<usize> = axes
                    .iter()
                    .map(|&a| tensor::normalize_axis(a, rank))
                    .collect::<Option<_>>()
                    .ok_or_else(|| unsupported(node, "unsqueeze axis out of range"))?;
                axes.sort_unstable();
                let mut dims = shape.iter().map(|&d| d as i64);
                (0..rank).map(|i| if axes.contains(&i) { 1 } else { dims.next().unwrap_or(1) }).collect()
            }
            other => return Err(unsupported(node, format!("{} is not a reshape", other.op_type()))),
        };
        Ok(Lowered::new(op::IrReshape { dim }, 1))
    })
}

/// Slice becomes a full-rank `IrSlice` with clamped bounds. Needs the input shape.
#[tracing::instrument(skip_all)]
pub fn rename_slice(graph: &mut Graph) -> Result<bool> {
    lower_nodes(graph, "rename_slice", OpType::Slice, |graph, node| {
        let Op::Slice(slice) = require_op(graph, node)? else {
            return Err(unsupported(node, "expected Slice"));
        };
        let shape = require_input_shape(graph, node, 0)?;
        let starts = ints_operand(graph, node, 1, Some(slice.starts.as_slice()))?;
        let ends = ints_operand(graph, node, 2, Some(slice.ends.as_slice()))?;
        let axes = ints_operand(graph, node, 3, Some(slice.axes.as_slice()))?;
        let steps = ints_operand(graph, node, 4, Some(slice.steps.as_slice()))?;
        if starts.len() != ends.len() {
            return Err(unsupported(node, "starts and ends differ in length"));
        }
        let axes = if axes.is_empty() { (0..starts.len() as i64).collect() } else { axes };

        let mut full_starts = vec![0i64; shape.len()];
        let mut full_ends = dims_i64(&shape);
        let mut full_steps = vec![1i64; shape.len()];
        for (i, &axis) in axes.iter().enumerate() {
            let axis = tensor::normalize_axis(axis, shape.len()).ok_or_else(|| unsupported(node, "axis out of range"))?;
            let dim = shape[axis] as i64;
            let step = steps.get(i).copied().unwrap_or(1);
            if step == 0 {
                return Err(unsupported(node, "zero step"));
            }
            let wrap = |v: i64| if v < 0 { v + dim } else { v };
            let (start, end) = (wrap(starts[i]), wrap(ends[i]));
            (full_starts[axis], full_ends[axis]) = if step > 0 {
                (start.clamp(0, dim), end.clamp(0, dim))
            } else {
                (start.clamp(0, dim - 1), end.clamp(-1, dim - 1))
            };
            full_steps[axis] = step;
        }
        let steps = if full_steps.iter().all(|&s| s == 1) { Vec::new() } else { full_steps };
        Ok(Lowered::new(op::IrSlice { starts: full_starts, ends: full_ends, steps }, 1))
    })
}

#[tracing::instrument(skip_all)]
pub fn rename_softmax(graph: &mut Graph) -> Result<bool> {
    lower_nodes(graph, "rename_softmax", [OpType::Softmax, OpType::LogSoftmax], |graph, node| {
        let op: Op = match require_op(graph, node)? {
            Op::Softmax(s) => op::IrSoftmax { axis: s.axis }.into(),
            Op::LogSoftmax(s) => op::IrLogSoftmax { axis: s.axis }.into(),
            other => return Err(unsupported(node, format!("{} is not a softmax", other.op_type()))),
        };
        Ok(Lowered::new(op, 1))
    })
}

#[tracing::instrument(skip_all)]
pub fn rename_tile(graph: &mut Graph) -> Result<bool> {
    lower_nodes(graph, "rename_tile", OpType::Tile, |graph, node| {
        let Op::Tile(tile) = require_op(graph, node)? else {
            return Err(unsupported(node, "expected Tile"));
        };
        let attr = tile.reps.as_ref().map(|reps| dims_i64(reps));
        let reps = ints_operand(graph, node, 1, attr.as_deref())?;
        if reps.is_empty() || reps.iter().any(|&r| r < 1) {
            return Err(unsupported(node, "repeats must be positive"));
        }
        let reps = reps.into_iter().map(|r| r as usize).collect();
        Ok(Lowered::new(op::IrTile { reps }, 1))
    })
}

/// Split becomes `IrSplit` with explicit sizes taken from the attribute, the constant on in-port 1, the
/// known output shapes, or an even division of the input.
#[tracing::instrument(skip_all)]
pub fn rename_split(graph: &mut Graph) -> Result<bool> {
    lower_nodes(graph, "rename_split", OpType::Split, |graph, node| {
        let Op::Split(split) = require_op(graph, node)? else {
            return Err(unsupported(node, "expected Split"));
        };
        let axis = split.axis;
        let attr = dims_i64(&split.split);
        let mut sizes: Vec<usize> =
            ints_operand(graph, node, 1, Some(attr.as_slice()))?.into_iter().map(|s| s as usize).collect();
        if sizes.is_empty() {
            let shape = require_input_shape(graph, node, 0)?;
            let rank_axis =
                tensor::normalize_axis(axis, shape.len()).ok_or_else(|| unsupported(node, "axis out of range"))?;
            let ports = graph.out_ports(node);
            let from_outputs: Option<Vec<usize>> = (0..ports.len())
                .map(|port| require_output_shape(graph, node, port).ok().and_then(|s| s.get(rank_axis).copied()))
                .collect();
            sizes = match from_outputs {
                Some(sizes) if sizes.iter().sum::<usize>() == shape[rank_axis] => sizes,
                _ if !ports.is_empty() && shape[rank_axis] % ports.len() == 0 => {
                    vec![shape[rank_axis] / ports.len(); ports.len()]
                }
                _ => return Err(unsupported(node, "cannot derive split sizes")),
            };
        }
        Ok(Lowered::new(op::IrSplit { axis, split: sizes }, 1))
    })
}

// ============================================================================
// TABLE-DRIVEN RENAMES
// ============================================================================

/// One-to-one renames whose attributes carry over unchanged.
pub const SIMPLE_RENAMES: &[(OpType, OpType)] = &[
    (OpType::Sub, OpType::IrSub),
    (OpType::Div, OpType::IrDiv),
    (OpType::Pow, OpType::IrPow),
    (OpType::MatMul, OpType::IrMatMul),
    (OpType::Sqrt, OpType::IrSqrt),
    (OpType::Reciprocal, OpType::IrReciprocal),
    (OpType::Abs, OpType::IrAbs),
    (OpType::Exp, OpType::IrExp),
    (OpType::Log, OpType::IrLog),
    (OpType::Neg, OpType::IrNeg),
    (OpType::Floor, OpType::IrFloor),
    (OpType::Ceil, OpType::IrCeil),
    (OpType::Sin, OpType::IrSin),
    (OpType::Cos, OpType::IrCos),
    (OpType::Erf, OpType::IrErf),
    (OpType::Transpose, OpType::IrTranspose),
    (OpType::Concat, OpType::IrConcat),
    (OpType::Pad, OpType::IrPad),
    (OpType::SpaceToDepth, OpType::IrSpaceToDepth),
    (OpType::DepthToSpace, OpType::IrDepthToSpace),
];

fn simple_target(op_type: OpType) -> Option<OpType> {
    SIMPLE_RENAMES.iter().find(|(from, _)| *from == op_type).map(|(_, to)| *to)
}

/// Table-driven renames through `replace_obj`. In-ports beyond the target arity are disconnected.
#[tracing::instrument(skip_all)]
pub fn simple_rename(graph: &mut Graph) -> Result<bool> {
    let matches = single_node_matcher(graph, OpFilter::Where(|op| simple_target(op.op_type()).is_some()));
    apply_matches(graph, "simple_rename", matches, |graph, m| {
        let node = m["target"];
        let source = require_op(graph, node)?;
        let Some(target) = simple_target(source.op_type()) else {
            return Err(unsupported(node, "no rename target").into());
        };
        if let Op::DepthToSpace(d) = source
            && d.mode.eq_ignore_ascii_case("CRD")
        {
            return Err(unsupported(node, "CRD depth-to-space must be split first").into());
        }
        let attrs = source.copied_attr();
        // Validate the schema before touching edges.
        Op::from_attrs(target, &attrs).map_err(|e| unsupported(node, e.to_string()))?;
        if let Some(arity) = target.num_in_ports() {
            drop_in_ports(graph, node, |port| port >= arity);
        }
        graph.replace_obj(node, target, &attrs)?;
        Ok(())
    })
}
