//! Operator model.
//!
//! A node's payload is an [`Op`]: a closed sum type with one variant per operator kind. Source-format kinds
//! (ONNX spelling) and target-IR kinds (`Ir*`) live in the same enum so that a node can change role in place
//! through [`Graph::replace_obj`](crate::Graph::replace_obj).
//!
//! Capabilities that cut across kinds are exposed as traits ([`HasWeights`], [`HasBiases`], [`HasAxis`],
//! [`HasActivation`]) reachable through `Op::as_*` accessors, and as marker predicates on [`OpType`].

pub mod attr;
pub mod capability;
pub(crate) mod macros;
pub mod method;

use graft_dtype::DType;
use snafu::OptionExt;

pub use attr::{AttrField, AttrValue, Attrs};
pub use capability::{HasActivation, HasAxis, HasBiases, HasWeights};
pub use method::{Activation, BitwiseMethod, EltwiseMethod, LogicalMethod, MinMaxMethod, PoolMethod, ReduceMethod};

use crate::Result;
use crate::tensor::Array;
use macros::define_ops;

/// Schema of one operator kind: construction from and snapshot to an attribute map.
pub trait OpSchema: Sized {
    const TYPE: OpType;

    fn from_attrs(attrs: &Attrs) -> Result<Self>;

    fn copied_attr(&self) -> Attrs;
}

define_ops! {
    kinds {
        /// Graph input placeholder.
        Input { shape: Option<Vec<usize>>, dtype: Option<DType> },
        /// Model output sink.
        Out {},
        /// Placeholder without semantics.
        Dummy {},
        Constant { value: Array, dtype: DType = DType::Float32 },

        Add {},
        Sub {},
        Mul {},
        Div {},
        Pow {},
        Max {},
        Min {},
        Sqrt {},
        Reciprocal {},
        Abs {},
        Exp {},
        Log {},
        Neg {},
        Floor {},
        Ceil {},
        Sin {},
        Cos {},
        Erf {},
        Identity {},
        MatMul {},

        Equal {},
        Greater {},
        GreaterOrEqual {},
        Less {},
        LessOrEqual {},
        And {},
        Or {},
        Xor {},
        Not {},
        BitwiseAnd {},
        BitwiseOr {},
        BitwiseXor {},

        Relu {},
        LeakyRelu { alpha: f64 = 0.01 },
        /// Slope arrives on in-port 1.
        PRelu {},
        /// Bounds are attributes in older opsets and constant in-ports 1 and 2 in newer ones.
        Clip { min: Option<f64>, max: Option<f64> },
        Sigmoid {},
        Tanh {},
        Elu { alpha: f64 = 1.0 },
        Selu { alpha: f64 = 1.673_263_242_354_377_2, gamma: f64 = 1.050_700_987_355_480_5 },
        Celu { alpha: f64 = 1.0 },
        Gelu {},
        HardSigmoid { alpha: f64 = 0.2, beta: f64 = 0.5 },
        HardSwish {},
        Softplus {},
        Softsign {},
        Silu {},
        Mish {},
        Shrink { bias: f64 = 0.0, lambd: f64 = 0.5 },
        ThresholdedRelu { alpha: f64 = 1.0 },

        Transpose { perm: Vec<usize> },
        /// Target shape arrives on in-port 1 unless given as an attribute.
        Reshape { shape: Option<Vec<i64>> },
        Flatten { axis: i64 = 1 },
        Squeeze { axes: Vec<i64> = Vec::new() },
        Unsqueeze { axes: Vec<i64> = Vec::new() },
        Split { axis: i64 = 0, split: Vec<usize> = Vec::new() },
        Concat { axis: i64 },
        /// Repeats arrive on in-port 1 unless given as an attribute.
        Tile { reps: Option<Vec<usize>> },
        /// Target shape arrives on in-port 1 unless given as an attribute.
        Expand { shape: Option<Vec<usize>> },
        Slice { starts: Vec<i64>, ends: Vec<i64>, axes: Vec<i64> = Vec::new(), steps: Vec<i64> = Vec::new() },
        Pad { pads: Vec<usize>, mode: String = "constant".to_string(), value: f64 = 0.0 },
        SpaceToDepth { blocksize: usize },
        DepthToSpace { blocksize: usize, mode: String = "DCR".to_string() },

        Conv {
            weights: Option<Array>,
            biases: Option<Array>,
            weights_min_max: Option<Vec<f64>>,
            weights_scale: Option<Array>,
            weights_zp: Option<Array>,
            biases_scale: Option<Array>,
            biases_zp: Option<Array>,
            group: usize = 1,
            kernel_shape: Vec<usize> = Vec::new(),
            strides: Vec<usize> = vec![1, 1],
            pads: Vec<usize> = vec![0, 0, 0, 0],
            dilations: Vec<usize> = vec![1, 1],
        },
        ConvTranspose {
            weights: Option<Array>,
            biases: Option<Array>,
            weights_min_max: Option<Vec<f64>>,
            weights_scale: Option<Array>,
            weights_zp: Option<Array>,
            biases_scale: Option<Array>,
            biases_zp: Option<Array>,
            group: usize = 1,
            kernel_shape: Vec<usize> = Vec::new(),
            strides: Vec<usize> = vec![1, 1],
            pads: Vec<usize> = vec![0, 0, 0, 0],
            dilations: Vec<usize> = vec![1, 1],
            output_padding: Vec<usize> = vec![0, 0],
        },
        /// Scale, bias, mean and variance arrive on in-ports 1 to 4.
        BatchNormalization { epsilon: f64 = 1e-5, training_mode: bool = false },
        ArgMax { axis: i64 = 0, keepdims: bool = true, select_last_index: bool = false },
        ArgMin { axis: i64 = 0, keepdims: bool = true, select_last_index: bool = false },
        ReduceMean { axes: Vec<i64> = Vec::new(), keepdims: bool = true },
        ReduceSum { axes: Vec<i64> = Vec::new(), keepdims: bool = true },
        ReduceMax { axes: Vec<i64> = Vec::new(), keepdims: bool = true },
        ReduceMin { axes: Vec<i64> = Vec::new(), keepdims: bool = true },
        ReduceProd { axes: Vec<i64> = Vec::new(), keepdims: bool = true },
        ReduceL1 { axes: Vec<i64> = Vec::new(), keepdims: bool = true },
        ReduceL2 { axes: Vec<i64> = Vec::new(), keepdims: bool = true },
        AveragePool {
            kernel_shape: Vec<usize>,
            strides: Vec<usize> = vec![1, 1],
            pads: Vec<usize> = vec![0, 0, 0, 0],
            dilations: Vec<usize> = vec![1, 1],
            count_include_pad: bool = false,
        },
        MaxPool {
            kernel_shape: Vec<usize>,
            strides: Vec<usize> = vec![1, 1],
            pads: Vec<usize> = vec![0, 0, 0, 0],
            dilations: Vec<usize> = vec![1, 1],
        },
        LpPool {
            kernel_shape: Vec<usize>,
            strides: Vec<usize> = vec![1, 1],
            pads: Vec<usize> = vec![0, 0, 0, 0],
            p: i64 = 2,
        },
        Softmax { axis: i64 = -1 },
        LogSoftmax { axis: i64 = -1 },
        Cast { to: DType },
        /// In-ports: X, W, R, B, sequence_lens, initial_h.
        Gru {
            hidden_size: usize,
            direction: String = "forward".to_string(),
            linear_before_reset: bool = false,
            layout: i64 = 0,
            activations: Vec<String> = Vec::new(),
        },
        /// In-ports: X, W, R, B, sequence_lens, initial_h, initial_c.
        Lstm {
            hidden_size: usize,
            direction: String = "forward".to_string(),
            layout: i64 = 0,
            activations: Vec<String> = Vec::new(),
        },
        DequantizeLinear { axis: i64 = 1 },
        QuantizeLinear { axis: i64 = 1 },
        SequenceConstruct {},
        SequenceAt {},

        IrConstant { weights: Array, dtype: DType = DType::Float32, weights_offset: Option<usize> },
        IrActivation {
            method: Activation,
            alpha: f64 = 0.0,
            beta: f64 = 0.0,
            gamma: f64 = 0.0,
            clip_min: Option<f64>,
            clip_max: Option<f64>,
            negative_slope: Option<Array>,
            negative_slope_offset: Option<usize>,
        },
        IrSquare {},
        IrRsqrt {},
        IrSquaredDifference {},
        IrSqrt {},
        IrReciprocal {},
        IrAbs {},
        IrExp {},
        IrLog {},
        IrNeg {},
        IrFloor {},
        IrCeil {},
        IrSin {},
        IrCos {},
        IrErf {},
        IrSub { activations: Activation = Activation::None, negative_slope: f64 = 0.0 },
        IrDiv {},
        IrPow {},
        IrMatMul {},
        IrEltwise { method: EltwiseMethod, activations: Activation = Activation::None, negative_slope: f64 = 0.0 },
        IrLogical { method: LogicalMethod },
        IrBitwise { method: BitwiseMethod },
        IrConvolution {
            weights: Array,
            biases: Array,
            weights_min_max: Option<Vec<f64>>,
            weights_scale: Option<Array>,
            weights_zp: Option<Array>,
            biases_scale: Option<Array>,
            biases_zp: Option<Array>,
            num_output: usize,
            group: usize = 1,
            kernel_shape: Vec<usize> = Vec::new(),
            strides: Vec<usize> = vec![1, 1],
            pads: Vec<usize> = vec![0, 0, 0, 0],
            dilations: Vec<usize> = vec![1, 1],
            activations: Activation = Activation::None,
            negative_slope: f64 = 0.0,
            weights_offset: Option<usize>,
            biases_offset: Option<usize>,
        },
        IrDepthwiseConv {
            weights: Array,
            biases: Array,
            weights_min_max: Option<Vec<f64>>,
            weights_scale: Option<Array>,
            weights_zp: Option<Array>,
            biases_scale: Option<Array>,
            biases_zp: Option<Array>,
            num_output: usize,
            multiplier: usize = 1,
            kernel_shape: Vec<usize> = Vec::new(),
            strides: Vec<usize> = vec![1, 1],
            pads: Vec<usize> = vec![0, 0, 0, 0],
            dilations: Vec<usize> = vec![1, 1],
            activations: Activation = Activation::None,
            negative_slope: f64 = 0.0,
            weights_offset: Option<usize>,
            biases_offset: Option<usize>,
        },
        IrDeconvolution {
            weights: Array,
            biases: Array,
            weights_min_max: Option<Vec<f64>>,
            weights_scale: Option<Array>,
            weights_zp: Option<Array>,
            biases_scale: Option<Array>,
            biases_zp: Option<Array>,
            num_output: usize,
            group: usize = 1,
            kernel_shape: Vec<usize> = Vec::new(),
            strides: Vec<usize> = vec![1, 1],
            pads: Vec<usize> = vec![0, 0, 0, 0],
            dilations: Vec<usize> = vec![1, 1],
            output_padding: Vec<usize> = vec![0, 0],
            activations: Activation = Activation::None,
            negative_slope: f64 = 0.0,
            weights_offset: Option<usize>,
            biases_offset: Option<usize>,
        },
        IrBatchNorm {
            weights: Array,
            biases: Array,
            activations: Activation = Activation::None,
            negative_slope: f64 = 0.0,
            weights_offset: Option<usize>,
            biases_offset: Option<usize>,
        },
        IrCast { to: DType },
        IrArgMinMax { method: MinMaxMethod, axis: i64, select_last_index: bool = false },
        IrReduce { method: ReduceMethod, axes: Vec<i64>, keepdims: bool = true },
        IrPooling {
            method: PoolMethod,
            kernel_shape: Vec<usize>,
            strides: Vec<usize> = vec![1, 1],
            pads: Vec<usize> = vec![0, 0, 0, 0],
            dilations: Vec<usize> = vec![1, 1],
            count_include_pad: bool = false,
            activations: Activation = Activation::None,
            negative_slope: f64 = 0.0,
        },
        IrReshape { dim: Vec<i64> },
        IrTranspose { perm: Vec<usize> },
        IrSlice { starts: Vec<i64>, ends: Vec<i64>, steps: Vec<i64> = Vec::new() },
        IrSoftmax { axis: i64 },
        IrLogSoftmax { axis: i64 },
        IrTile { reps: Vec<usize> },
        IrConcat { axis: i64 },
        IrSplit { axis: i64, split: Vec<usize> },
        IrPad { pads: Vec<usize>, mode: String = "constant".to_string(), value: f64 = 0.0 },
        IrSpaceToDepth { blocksize: usize },
        IrDepthToSpace { blocksize: usize },
        IrSpaceToBatch { block_size_x: usize, block_size_y: usize, pads: Vec<usize> },
        IrBatchToSpace { block_size_x: usize, block_size_y: usize, crops: Vec<usize> },
        /// `weights` is `[W | R]` concatenated on the input axis.
        IrGru {
            time_steps: usize,
            input_size: usize,
            hidden_size: usize,
            direction: String = "forward".to_string(),
            activations: Vec<String> = Vec::new(),
            linear_before_reset: bool = false,
            weights: Array,
            biases: Array,
            weights_offset: Option<usize>,
            biases_offset: Option<usize>,
        },
        /// `weights` is `[W | R]` concatenated on the input axis.
        IrLstm {
            time_steps: usize,
            input_size: usize,
            hidden_size: usize,
            direction: String = "forward".to_string(),
            activations: Vec<String> = Vec::new(),
            weights: Array,
            biases: Array,
            weights_offset: Option<usize>,
            biases_offset: Option<usize>,
        },
        IrReverseSequence { batch_axis: i64 = 1, time_axis: i64 = 0 },
        /// In-port 0 carries class scores, in-port 1 box offsets. `weights` are the anchors in center form.
        IrDecodeBox {
            feature_map: Vec<usize> = Vec::new(),
            image_width: usize,
            image_height: usize,
            max_box_num: usize,
            class_num: usize,
            score_threshold: f64,
            variance: Vec<f64> = Vec::new(),
            weights: Array,
            weights_offset: Option<usize>,
        },
        IrNms {
            image_width: usize,
            image_height: usize,
            iou_threshold: f64,
            max_box_num: usize,
            center_point_box: i64 = 0,
        },
        IrRegion {
            grid_width: usize,
            grid_height: usize,
            box_per_grid: usize,
            max_box_num: usize,
            class_num: usize,
            obj_threshold: f64,
            grid_compensate: bool = true,
            anchors: Vec<f64>,
        },
        IrRegionFuse {},
    }
    custom {
        /// Externally registered kind, e.g. `Preprocess`.
        Plugin(PluginOp),
    }
}

/// Payload of a plugin node: the registered kind name plus free-form attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginOp {
    pub name: String,
    pub attrs: Attrs,
}

impl OpSchema for PluginOp {
    const TYPE: OpType = OpType::Plugin;

    fn from_attrs(attrs: &Attrs) -> Result<Self> {
        let name: String = attrs
            .read("type")
            .context(crate::error::MissingAttributeSnafu { op: OpType::Plugin, attr: "type" })?;
        let mut attrs = attrs.clone();
        attrs.remove("type");
        Ok(Self { name, attrs })
    }

    fn copied_attr(&self) -> Attrs {
        self.attrs.clone().with("type", self.name.as_str())
    }
}

impl OpType {
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Declared input arity, `None` for variadic kinds.
    pub fn num_in_ports(self) -> Option<usize> {
        let n = match self {
            Self::Concat
            | Self::IrConcat
            | Self::SequenceConstruct
            | Self::IrRegionFuse
            | Self::Max
            | Self::Min
            | Self::Plugin => return None,
            Self::Input | Self::Constant | Self::IrConstant | Self::Dummy => 0,
            Self::Add
            | Self::Sub
            | Self::Mul
            | Self::Div
            | Self::Pow
            | Self::Equal
            | Self::Greater
            | Self::GreaterOrEqual
            | Self::Less
            | Self::LessOrEqual
            | Self::And
            | Self::Or
            | Self::Xor
            | Self::BitwiseAnd
            | Self::BitwiseOr
            | Self::BitwiseXor
            | Self::MatMul
            | Self::PRelu
            | Self::Reshape
            | Self::Tile
            | Self::Expand
            | Self::Split
            | Self::Squeeze
            | Self::Unsqueeze
            | Self::SequenceAt
            | Self::ReduceMean
            | Self::ReduceSum
            | Self::ReduceMax
            | Self::ReduceMin
            | Self::ReduceProd
            | Self::ReduceL1
            | Self::ReduceL2
            | Self::IrSub
            | Self::IrDiv
            | Self::IrPow
            | Self::IrMatMul
            | Self::IrEltwise
            | Self::IrLogical
            | Self::IrBitwise
            | Self::IrSquaredDifference
            | Self::IrGru
            | Self::IrDecodeBox => 2,
            Self::Clip
            | Self::Conv
            | Self::ConvTranspose
            | Self::DequantizeLinear
            | Self::QuantizeLinear
            | Self::Pad
            | Self::IrLstm => 3,
            Self::IrNms => 4,
            Self::BatchNormalization | Self::Slice => 5,
            Self::Gru => 6,
            Self::Lstm => 7,
            _ => 1,
        };
        Some(n)
    }

    pub fn is_variadic(self) -> bool {
        self.num_in_ports().is_none()
    }

    /// Result is invariant under transposing every input and the output by the same permutation.
    pub fn is_layout_unaware(self) -> bool {
        matches!(
            self,
            Self::IrActivation
                | Self::IrSquare
                | Self::IrRsqrt
                | Self::IrSqrt
                | Self::IrReciprocal
                | Self::IrAbs
                | Self::IrExp
                | Self::IrLog
                | Self::IrNeg
                | Self::IrFloor
                | Self::IrCeil
                | Self::IrSin
                | Self::IrCos
                | Self::IrErf
                | Self::IrCast
                | Self::IrEltwise
                | Self::IrLogical
                | Self::IrBitwise
                | Self::IrSub
                | Self::IrDiv
                | Self::IrPow
                | Self::IrSquaredDifference
                | Self::Add
                | Self::Sub
                | Self::Mul
                | Self::Div
                | Self::Pow
                | Self::Relu
                | Self::Sigmoid
                | Self::Tanh
                | Self::Abs
                | Self::Exp
                | Self::Log
                | Self::Neg
                | Self::Sqrt
        )
    }

    pub fn is_const_like(self) -> bool {
        matches!(self, Self::Constant | Self::IrConstant)
    }

    /// The rectifier family that can be fused into a preceding linear operator.
    pub fn is_relu(self) -> bool {
        matches!(self, Self::Relu | Self::LeakyRelu | Self::PRelu | Self::Clip)
    }

    /// Source activation kinds lowered to `IrActivation`.
    pub fn is_activation_op(self) -> bool {
        matches!(
            self,
            Self::Relu
                | Self::LeakyRelu
                | Self::PRelu
                | Self::Clip
                | Self::Sigmoid
                | Self::Tanh
                | Self::Elu
                | Self::Selu
                | Self::Celu
                | Self::Gelu
                | Self::HardSigmoid
                | Self::HardSwish
                | Self::Softplus
                | Self::Softsign
                | Self::Silu
                | Self::Mish
                | Self::Shrink
                | Self::ThresholdedRelu
        )
    }

    pub fn is_deconv(self) -> bool {
        matches!(self, Self::ConvTranspose | Self::IrDeconvolution)
    }

    pub fn has_one_out_port(self) -> bool {
        !matches!(
            self,
            Self::Split
                | Self::IrSplit
                | Self::Gru
                | Self::Lstm
                | Self::IrGru
                | Self::IrLstm
                | Self::IrDecodeBox
                | Self::IrNms
                | Self::IrRegion
                | Self::Plugin
        )
    }

    /// Part of the target IR vocabulary.
    pub fn is_target(self) -> bool {
        self.name().starts_with("Ir") || matches!(self, Self::Input | Self::Out | Self::Plugin)
    }
}

impl Op {
    pub fn name(&self) -> &'static str {
        self.op_type().name()
    }
}
