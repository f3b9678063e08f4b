//! Typed parameter records attached to layers.
//!
//! Every record is a plain defaulted struct so a rewrite can re-kind a layer
//! in place (e.g. Power upgraded to Scale) without reshaping its storage.
//! Defaults follow the model schema the parsers emit.

use serde::{Deserialize, Serialize};

use crate::model::weight::ScalarKind;

pub type Shape = Vec<usize>;

/// Activation baked into a convolution or inner-product layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationKind {
    #[default]
    Identity,
    Relu,
    LeakyRelu,
    RestrictRange,
    Prelu,
    Elu,
    Hswish,
    Mish,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EltwiseOp {
    #[default]
    Sum,
    Product,
    Max,
    Min,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    #[default]
    Abs,
    Exp,
    Log,
    Neg,
    Tanh,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    #[default]
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReductionOp {
    #[default]
    Sum,
    Max,
    Min,
    Mean,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolingMethod {
    #[default]
    Max,
    Average,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvolutionParams {
    pub kernel: Shape,
    pub stride: Shape,
    pub pad: Shape,
    pub dilation: Shape,
    pub group: usize,
    pub output_num: usize,
    pub bias_term: bool,
    pub activation: ActivationKind,
    pub activation_param0: f32,
    pub activation_param1: f32,
    /// Element type the executor should run this layer at.
    pub quantization_level: ScalarKind,
}

impl Default for ConvolutionParams {
    fn default() -> Self {
        Self {
            kernel: Shape::new(),
            stride: Shape::new(),
            pad: Shape::new(),
            dilation: Shape::new(),
            group: 1,
            output_num: 0,
            bias_term: true,
            activation: ActivationKind::Identity,
            activation_param0: 0.0,
            activation_param1: 6.0,
            quantization_level: ScalarKind::F32,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InnerProductParams {
    pub output_num: usize,
    pub bias_term: bool,
    pub transpose_b: bool,
    pub axis: usize,
}

impl Default for InnerProductParams {
    fn default() -> Self {
        Self {
            output_num: 0,
            bias_term: true,
            transpose_b: false,
            axis: 1,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleParams {
    pub axis: usize,
    pub bias_term: bool,
}

/// `y = (x * scale + shift) ^ power`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerParams {
    pub power: f32,
    pub scale: f32,
    pub shift: f32,
}

impl Default for PowerParams {
    fn default() -> Self {
        Self {
            power: 1.0,
            scale: 1.0,
            shift: 0.0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReluParams {
    pub negative_slope: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EluParams {
    pub alpha: f32,
}

impl Default for EluParams {
    fn default() -> Self {
        Self { alpha: 1.0 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HswishParams {
    pub shift: f32,
    pub scale: f32,
}

impl Default for HswishParams {
    fn default() -> Self {
        Self {
            shift: 3.0,
            scale: 1.0 / 6.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftplusParams {
    pub beta: f32,
    pub threshold: f32,
}

impl Default for SoftplusParams {
    fn default() -> Self {
        Self {
            beta: 1.0,
            threshold: 20.0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreluParams {
    pub axis: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestrictRangeParams {
    pub lower: f32,
    pub upper: f32,
}

impl Default for RestrictRangeParams {
    fn default() -> Self {
        Self {
            lower: f32::MIN,
            upper: f32::MAX,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EltwiseParams {
    pub operation: EltwiseOp,
    pub coefficients: Vec<f32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnaryParams {
    pub operation: UnaryOp,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinaryParams {
    pub operation: BinaryOp,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReductionParams {
    pub operation: ReductionOp,
    pub axis: Vec<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftmaxParams {
    pub axis: i64,
}

impl Default for SoftmaxParams {
    fn default() -> Self {
        Self { axis: 1 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolingParams {
    pub method: PoolingMethod,
    pub kernel: Shape,
    pub pad: Shape,
    pub stride: Shape,
    pub exclude_pad: bool,
}

impl Default for PoolingParams {
    fn default() -> Self {
        Self {
            method: PoolingMethod::Max,
            kernel: Shape::new(),
            pad: Shape::new(),
            stride: Shape::new(),
            exclude_pad: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReshapeParams {
    pub shape: Vec<i64>,
    pub axis: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchNormParams {
    pub eps: f32,
    pub use_global_stats: bool,
    pub yolo_compatible: bool,
}

impl Default for BatchNormParams {
    fn default() -> Self {
        Self {
            eps: 1e-5,
            use_global_stats: true,
            yolo_compatible: false,
        }
    }
}

/// Parameters of a `Fused` layer. `kind` discriminates the twelve
/// recognized activation-shaped templates; `floats` carries the small
/// per-template constant tuple.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusedParams {
    pub kind: i32,
    pub floats: Vec<f32>,
}

impl Default for FusedParams {
    fn default() -> Self {
        Self {
            kind: -1,
            floats: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuffleParams {
    pub kind: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergedConvParams {
    pub conv: Vec<ConvolutionParams>,
    /// Whether the block ends with an elementwise sum with its own input.
    pub add: bool,
}

/// One port binding of a tensor iterator: which body tensor a network
/// tensor maps onto, and along which axis it is sliced per iteration
/// (`axis == -1` means the whole tensor is passed through).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Connection {
    pub port: i32,
    pub src: String,
    pub dst: String,
    pub axis: i64,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            port: 0,
            src: String::new(),
            dst: String::new(),
            axis: -1,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TensorIteratorParams {
    pub input: Vec<Connection>,
    pub back: Vec<Connection>,
    pub output: Vec<Connection>,
}
