//! Capability traits shared by several operator kinds.

use graft_dtype::DType;

use super::*;

/// Operator owns a weights tensor.
pub trait HasWeights {
    /// `None` while the weights still arrive on an in-edge.
    fn weights(&self) -> Option<&Array>;

    fn set_weights(&mut self, weights: Array);

    fn weights_dtype(&self) -> DType {
        DType::Float32
    }

    /// Byte offset slot in the serialized weights blob, if the kind carries one.
    fn weights_offset_mut(&mut self) -> Option<&mut Option<usize>> {
        None
    }
}

/// Operator owns a biases tensor.
pub trait HasBiases {
    fn biases(&self) -> Option<&Array>;

    fn set_biases(&mut self, biases: Array);

    fn biases_offset_mut(&mut self) -> Option<&mut Option<usize>> {
        None
    }
}

pub trait HasAxis {
    fn axis(&self) -> i64;

    fn set_axis(&mut self, axis: i64);
}

/// Operator with a fused activation slot.
pub trait HasActivation {
    fn activation(&self) -> Activation;

    fn set_activation(&mut self, activation: Activation, negative_slope: f64);
}

macro_rules! impl_weights {
    (optional: $($opt:ident),*; required: $($req:ident),*; custom: $($custom:ident),* $(;)?) => {
        $(impl HasWeights for $opt {
            fn weights(&self) -> Option<&Array> {
                self.weights.as_ref()
            }

            fn set_weights(&mut self, weights: Array) {
                self.weights = Some(weights);
            }
        })*

        $(impl HasWeights for $req {
            fn weights(&self) -> Option<&Array> {
                Some(&self.weights)
            }

            fn set_weights(&mut self, weights: Array) {
                self.weights = weights;
            }

            fn weights_offset_mut(&mut self) -> Option<&mut Option<usize>> {
                Some(&mut self.weights_offset)
            }
        })*

        impl Op {
            pub fn as_weights(&self) -> Option<&dyn HasWeights> {
                match self {
                    $(Self::$opt(op) => Some(op),)*
                    $(Self::$req(op) => Some(op),)*
                    $(Self::$custom(op) => Some(op),)*
                    _ => None,
                }
            }

            pub fn as_weights_mut(&mut self) -> Option<&mut dyn HasWeights> {
                match self {
                    $(Self::$opt(op) => Some(op),)*
                    $(Self::$req(op) => Some(op),)*
                    $(Self::$custom(op) => Some(op),)*
                    _ => None,
                }
            }
        }
    };
}

macro_rules! impl_biases {
    (optional: $($opt:ident),*; required: $($req:ident),* $(;)?) => {
        $(impl HasBiases for $opt {
            fn biases(&self) -> Option<&Array> {
                self.biases.as_ref()
            }

            fn set_biases(&mut self, biases: Array) {
                self.biases = Some(biases);
            }
        })*

        $(impl HasBiases for $req {
            fn biases(&self) -> Option<&Array> {
                Some(&self.biases)
            }

            fn set_biases(&mut self, biases: Array) {
                self.biases = biases;
            }

            fn biases_offset_mut(&mut self) -> Option<&mut Option<usize>> {
                Some(&mut self.biases_offset)
            }
        })*

        impl Op {
            pub fn as_biases(&self) -> Option<&dyn HasBiases> {
                match self {
                    $(Self::$opt(op) => Some(op),)*
                    $(Self::$req(op) => Some(op),)*
                    _ => None,
                }
            }

            pub fn as_biases_mut(&mut self) -> Option<&mut dyn HasBiases> {
                match self {
                    $(Self::$opt(op) => Some(op),)*
                    $(Self::$req(op) => Some(op),)*
                    _ => None,
                }
            }
        }
    };
}

macro_rules! impl_simple_capability {
    ($trait:ident, $as_ref:ident, $as_mut:ident: $($kind:ident),* $(,)?) => {
        impl Op {
            pub fn $as_ref(&self) -> Option<&dyn $trait> {
                match self {
                    $(Self::$kind(op) => Some(op),)*
                    _ => None,
                }
            }

            pub fn $as_mut(&mut self) -> Option<&mut dyn $trait> {
                match self {
                    $(Self::$kind(op) => Some(op),)*
                    _ => None,
                }
            }
        }
    };
}

impl_weights! {
    optional: Conv, ConvTranspose;
    required: IrConvolution, IrDepthwiseConv, IrDeconvolution, IrBatchNorm, IrGru, IrLstm, IrDecodeBox;
    custom: IrConstant;
}

impl_biases! {
    optional: Conv, ConvTranspose;
    required: IrConvolution, IrDepthwiseConv, IrDeconvolution, IrBatchNorm, IrGru, IrLstm;
}

macro_rules! impl_axis {
    ($($kind:ident),* $(,)?) => {
        $(impl HasAxis for $kind {
            fn axis(&self) -> i64 {
                self.axis
            }

            fn set_axis(&mut self, axis: i64) {
                self.axis = axis;
            }
        })*

        impl_simple_capability!(HasAxis, as_axis, as_axis_mut: $($kind),*);
    };
}

impl_axis!(
    Concat,
    Split,
    Softmax,
    LogSoftmax,
    ArgMax,
    ArgMin,
    Flatten,
    DequantizeLinear,
    QuantizeLinear,
    IrConcat,
    IrSplit,
    IrSoftmax,
    IrLogSoftmax,
    IrArgMinMax,
);

macro_rules! impl_activation {
    ($($kind:ident),* $(,)?) => {
        $(impl HasActivation for $kind {
            fn activation(&self) -> Activation {
                self.activations
            }

            fn set_activation(&mut self, activation: Activation, negative_slope: f64) {
                self.activations = activation;
                self.negative_slope = negative_slope;
            }
        })*

        impl_simple_capability!(HasActivation, as_activation, as_activation_mut: $($kind),*);
    };
}

impl_activation!(IrConvolution, IrDepthwiseConv, IrDeconvolution, IrBatchNorm, IrEltwise, IrSub, IrPooling);

impl HasWeights for IrConstant {
    fn weights(&self) -> Option<&Array> {
        Some(&self.weights)
    }

    fn set_weights(&mut self, weights: Array) {
        self.weights = weights;
    }

    fn weights_dtype(&self) -> DType {
        self.dtype
    }

    fn weights_offset_mut(&mut self) -> Option<&mut Option<usize>> {
        Some(&mut self.weights_offset)
    }
}
