//! The network description the optimizer rewrites: an ordered, topologically
//! sorted sequence of named layers referencing each other by tensor name,
//! plus the packed weight blob they index into.

pub mod params;
pub mod weight;

use std::collections::HashSet;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

pub use params::*;
pub use weight::{Blob, ScalarKind, TensorFormat, WeightDesc};

/// Closed set of layer operations known to the engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerKind {
    Input,
    Const,
    Meta,
    #[default]
    Stub,
    Convolution,
    Deconvolution,
    InnerProduct,
    Scale,
    Bias,
    Power,
    Relu,
    Prelu,
    Elu,
    Hswish,
    Mish,
    Softplus,
    RestrictRange,
    Sigmoid,
    Softmax,
    Eltwise,
    BinaryOp,
    UnaryOp,
    Reduction,
    Concat,
    Reshape,
    Squeeze,
    ExpandDims,
    Permute,
    Unpack,
    Pooling,
    Tile,
    BatchNorm,
    Shuffle,
    Fused,
    MergedConvolution,
    SqueezeExcitation,
    TensorIterator,
    RnnGruBd,
    DetectionOutput,
    PriorBox,
    PriorBoxClustered,
}

/// How the calibrated network maps tensors onto 8-bit integers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantizationMethod {
    #[default]
    Unknown,
    IECompatible,
    SymmetricNarrowed,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationParams {
    pub method: QuantizationMethod,
}

/// One node of the graph. Parameter records for every kind the optimizer
/// reads are always present (defaulted); rewrites may change `kind` and
/// keep the storage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,
    pub src: Vec<String>,
    pub dst: Vec<String>,
    /// Non-empty for layers living inside a subgraph (a tensor-iterator
    /// body); names the owning layer.
    pub parent: Option<String>,
    /// Pre-fusion ancestor names, kept as per-tensor statistics keys.
    pub origin: Vec<String>,
    pub weight: Vec<WeightDesc>,

    pub conv: ConvolutionParams,
    pub inner_product: InnerProductParams,
    pub scale: ScaleParams,
    pub power: PowerParams,
    pub relu: ReluParams,
    pub elu: EluParams,
    pub hswish: HswishParams,
    pub softplus: SoftplusParams,
    pub prelu: PreluParams,
    pub restrict_range: RestrictRangeParams,
    pub eltwise: EltwiseParams,
    pub unary: UnaryParams,
    pub binary: BinaryParams,
    pub reduction: ReductionParams,
    pub softmax: SoftmaxParams,
    pub pooling: PoolingParams,
    pub reshape: ReshapeParams,
    pub batch_norm: BatchNormParams,
    pub fused: FusedParams,
    pub shuffle: ShuffleParams,
    pub merged_conv: MergedConvParams,
    pub tensor_iterator: TensorIteratorParams,
}

impl Layer {
    /// A fresh layer producing a single tensor named after itself.
    pub fn new(name: impl Into<String>, kind: LayerKind) -> Self {
        let name = name.into();
        Self {
            dst: vec![name.clone()],
            name,
            kind,
            ..Default::default()
        }
    }

    pub fn with_src<S: AsRef<str>>(mut self, src: &[S]) -> Self {
        self.src = src.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Network {
    pub quantization: QuantizationParams,
    pub layers: Vec<Layer>,
    /// Names of the network outputs; no rewrite may rename these away.
    pub dst: Vec<String>,
}

impl Network {
    pub fn layer_by_name(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Whether any of the layer's outputs is a network output.
    pub fn has_output(&self, layer: &Layer) -> bool {
        layer.dst.iter().any(|d| self.dst.contains(d))
    }

    /// Structural invariants: every `src` resolves to the output of an
    /// earlier layer, and every weight descriptor lies inside the blob.
    pub fn validate(&self, blob: &Blob) -> Result<()> {
        let mut produced: HashSet<&str> = HashSet::new();
        for layer in &self.layers {
            for src in &layer.src {
                ensure!(
                    produced.contains(src.as_str()),
                    "layer '{}' reads '{}' before it is produced",
                    layer.name,
                    src
                );
            }
            for desc in &layer.weight {
                desc.validate(blob.len_bytes())
                    .with_context(|| format!("layer '{}'", layer.name))?;
            }
            for dst in &layer.dst {
                produced.insert(dst);
            }
        }
        for out in &self.dst {
            ensure!(
                produced.contains(out.as_str()),
                "network output '{}' is not produced by any layer",
                out
            );
        }
        Ok(())
    }
}
