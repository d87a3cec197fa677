//! Shape/type inference seam.
//!
//! Real per-operator inference lives outside the pass engine. The engine only needs to ask for cached edge
//! metadata to be refreshed after structural mutation.

use crate::algo::determined_sort;
use crate::error::Result;
use crate::graph::{Graph, NodeId};
use crate::op::Op;
use crate::tensor::{self, TensorMeta};

pub trait ShapeInference {
    /// Refresh cached `TensorMeta` on the edges of `graph`.
    fn infer(&self, graph: &mut Graph) -> Result<()>;
}

/// Leaves the graph untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInference;

impl ShapeInference for NoInference {
    fn infer(&self, _graph: &mut Graph) -> Result<()> {
        Ok(())
    }
}

/// Minimal built-in inference.
///
/// Propagates constant values out of `Constant`/`IrConstant`, and output shapes through transposes, reshapes,
/// tiles and single-input layout-unaware operators whose input shape is known.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantPropagation;

impl ShapeInference for ConstantPropagation {
    #[tracing::instrument(level = "debug", skip_all, fields(graph = %graph.name))]
    fn infer(&self, graph: &mut Graph) -> Result<()> {
        let outputs = graph.output_names().to_vec();
        for node in determined_sort(graph, &outputs)? {
            if let Some(tensor) = infer_node(graph, node) {
                for edge in graph.sorted_out_edges(node) {
                    if let Some(attr) = graph.edge_attr_mut(edge.src, edge.dst, edge.key) {
                        merge(&mut attr.tensor, &tensor);
                    }
                }
            }
        }
        Ok(())
    }
}

fn merge(target: &mut TensorMeta, inferred: &TensorMeta) {
    if inferred.value.is_some() {
        target.set_value(inferred.value.clone());
        target.is_const = inferred.is_const;
    }
    if let Some(shape) = &inferred.shape {
        target.shape = Some(shape.clone());
    }
    if inferred.dtype.is_some() {
        target.dtype = inferred.dtype;
    }
}

fn infer_node(graph: &Graph, node: NodeId) -> Option<TensorMeta> {
    let op = graph.op(node)?;
    let input_shape = || graph.input_shapes(node).into_iter().next().flatten();
    match op {
        Op::Constant(c) => Some(TensorMeta::constant(c.value.clone(), c.dtype)),
        Op::IrConstant(c) => Some(TensorMeta::constant(c.weights.clone(), c.dtype)),
        Op::Transpose(t) => transposed(input_shape()?, &t.perm),
        Op::IrTranspose(t) => transposed(input_shape()?, &t.perm),
        Op::IrReshape(r) => Some(TensorMeta::new().with_shape(resolve_dims(&input_shape()?, &r.dim)?)),
        Op::IrTile(t) => {
            let shape = input_shape()?;
            let tiled: Vec<usize> = shape.iter().zip(&t.reps).map(|(d, r)| d * r).collect();
            (shape.len() == t.reps.len()).then(|| TensorMeta::new().with_shape(tiled))
        }
        op if op.op_type().is_layout_unaware() && graph.in_degree(node) == 1 => {
            Some(TensorMeta::new().with_shape(input_shape()?))
        }
        _ => None,
    }
}

fn transposed(shape: Vec<usize>, perm: &[usize]) -> Option<TensorMeta> {
    (shape.len() == perm.len() && tensor::is_permutation(perm))
        .then(|| TensorMeta::new().with_shape(tensor::permute_vec(&shape, perm)))
}

/// Resolve `0` (copy input dim) and a single `-1` (infer) in reshape dims.
pub fn resolve_dims(input: &[usize], dims: &[i64]) -> Option<Vec<usize>> {
    let total: usize = input.iter().product();
    let mut out = Vec::with_capacity(dims.len());
    let mut infer_at = None;
    for (i, &d) in dims.iter().enumerate() {
        match d {
            -1 if infer_at.is_none() => {
                infer_at = Some(i);
                out.push(1);
            }
            0 => out.push(*input.get(i)?),
            d if d > 0 => out.push(d as usize),
            _ => return None,
        }
    }
    let known: usize = out.iter().product();
    if let Some(i) = infer_at {
        if known == 0 || total % known != 0 {
            return None;
        }
        out[i] = total / known;
    } else if known != total {
        return None;
    }
    Some(out)
}
