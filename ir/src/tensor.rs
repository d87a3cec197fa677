//! Per-edge tensor metadata and small array helpers shared by rewrites.

use graft_dtype::DType;
use ndarray::{ArrayD, Dimension, IxDyn};
use snafu::ensure;

use crate::error::{InvalidPermutationSnafu, Result, ShapeMismatchSnafu};

/// Materialized tensor value. Element type is tracked separately in [`TensorMeta::dtype`].
pub type Array = ArrayD<f64>;

/// Data flowing on one edge.
///
/// Owned by exactly one edge; rewrites that split an edge clone it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorMeta {
    pub value: Option<Array>,
    pub is_const: bool,
    pub dtype: Option<DType>,
    pub shape: Option<Vec<usize>>,
    /// Calibration range.
    pub min_max: Option<(f64, f64)>,
    /// Quantization scale and zero point.
    pub scale_zp: Option<(Array, Array)>,
}

impl TensorMeta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-constant tensor with a known value snapshot.
    pub fn from_value(value: Array) -> Self {
        let shape = Some(value.shape().to_vec());
        Self { value: Some(value), shape, ..Self::default() }
    }

    /// Constant tensor, as produced by a `Constant` node.
    pub fn constant(value: Array, dtype: DType) -> Self {
        Self { is_const: true, dtype: Some(dtype), ..Self::from_value(value) }
    }

    pub fn with_shape(mut self, shape: impl Into<Vec<usize>>) -> Self {
        self.shape = Some(shape.into());
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    /// Known shape, from the explicit annotation or the value.
    pub fn shape(&self) -> Option<Vec<usize>> {
        self.shape.clone().or_else(|| self.value.as_ref().map(|v| v.shape().to_vec()))
    }

    pub fn rank(&self) -> Option<usize> {
        self.shape().map(|s| s.len())
    }

    /// Replace the value and keep the shape annotation in sync.
    pub fn set_value(&mut self, value: Option<Array>) {
        if let Some(v) = &value {
            self.shape = Some(v.shape().to_vec());
        }
        self.value = value;
    }
}

/// Tolerance comparison used for fused constant checks (exponent == 2, clip == (0, 6), ...).
pub fn float_equal(lhs: f64, rhs: f64) -> bool {
    (lhs - rhs).abs() <= 1e-6 * (1.0 + rhs.abs())
}

/// Every element of `value` equals `expected` within [`float_equal`] tolerance.
pub fn all_equal(value: &Array, expected: f64) -> bool {
    !value.is_empty() && value.iter().all(|&v| float_equal(v, expected))
}

pub fn is_permutation(perm: &[usize]) -> bool {
    let mut seen = vec![false; perm.len()];
    perm.iter().all(|&p| p < seen.len() && !std::mem::replace(&mut seen[p], true))
}

/// `inverse[perm[i]] = i`.
pub fn inverse_perm(perm: &[usize]) -> Result<Vec<usize>> {
    ensure!(is_permutation(perm), InvalidPermutationSnafu { perm: perm.iter().map(|&p| p as i64).collect::<Vec<_>>() });
    let mut inverse = vec![0; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inverse[p] = i;
    }
    Ok(inverse)
}

/// Composition of two transposes applied in sequence: `first` then `second`.
pub fn compose_perm(first: &[usize], second: &[usize]) -> Vec<usize> {
    second.iter().map(|&i| first[i]).collect()
}

pub fn is_identity_perm(perm: &[usize]) -> bool {
    perm.iter().enumerate().all(|(i, &p)| i == p)
}

/// Apply a permutation to the axes of `value`, producing a standard-layout copy.
pub fn transpose(value: &Array, perm: &[usize]) -> Result<Array> {
    ensure!(
        value.ndim() == perm.len() && is_permutation(perm),
        InvalidPermutationSnafu { perm: perm.iter().map(|&p| p as i64).collect::<Vec<_>>() }
    );
    Ok(value.clone().permuted_axes(IxDyn(perm)).as_standard_layout().into_owned())
}

/// Reshape preserving element order.
pub fn reshape(value: &Array, dims: &[usize]) -> Result<Array> {
    let to = dims.to_vec();
    value
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order(IxDyn(dims))
        .map_err(|_| ShapeMismatchSnafu { from: value.shape().to_vec(), to }.build())
}

/// Permute the entries of a per-axis vector (shape, reps, ...) the same way a transpose permutes axes.
pub fn permute_vec<T: Clone>(values: &[T], perm: &[usize]) -> Vec<T> {
    perm.iter().map(|&p| values[p].clone()).collect()
}

/// Resolve a possibly negative axis against `rank`.
pub fn normalize_axis(axis: i64, rank: usize) -> Option<usize> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    (0..rank as i64).contains(&resolved).then_some(resolved as usize)
}

/// Repeat `value` `reps[i]` times along axis `i`. Rank of `reps` must match.
pub fn tile(value: &Array, reps: &[usize]) -> Option<Array> {
    if reps.len() != value.ndim() {
        return None;
    }
    let out_shape: Vec<usize> = value.shape().iter().zip(reps).map(|(d, r)| d * r).collect();
    Some(Array::from_shape_fn(IxDyn(&out_shape), |idx| {
        let src: Vec<usize> = (0..idx.ndim()).map(|i| idx[i] % value.shape()[i]).collect();
        value[IxDyn(&src)]
    }))
}
