//! The staged rewrite engine.
//!
//! `Optimizer::run` walks the layer sequence eight times with a fixed set of
//! matchers per stage, then marks in-place reuse and erases stub layers.
//! Matchers are pure: they inspect a window of the source sequence and
//! propose a [`Rewrite`]; the driver applies accepted rewrites atomically,
//! including their weight-blob edits, which go through a per-stage
//! copy-on-write buffer swapped in at end of stage.

mod conv;
mod fused;
mod iterator;
mod linear;
mod patterns;

use anyhow::{Result, bail, ensure};
use tracing::{debug, warn};

use crate::model::{
    Blob, Layer, LayerKind, Network, PoolingMethod, QuantizationMethod,
};

#[derive(Clone, Debug)]
pub struct OptimizerOptions {
    pub merge_two_convolutions: bool,
    pub merge_two_convolutions_output_num_max: usize,
    pub merge_int8_convolutions: bool,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            merge_two_convolutions: true,
            merge_two_convolutions_output_num_max: 256,
            merge_int8_convolutions: true,
        }
    }
}

/// A deferred rename applied to downstream consumers at end of stage.
pub(crate) type Rename = (String, String);

/// An edit against the weight blob. Reads always address the stage's input
/// blob; writes go to the copy-on-write buffer.
#[derive(Clone, Debug)]
pub(crate) enum WeightEdit {
    /// Transpose a `rows x cols` float matrix in place.
    Transpose {
        offset: usize,
        rows: usize,
        cols: usize,
    },
    /// Multiply `count` rows of `channels` floats by a per-channel vector
    /// (channel-last layouts).
    ScaleChannelsLast {
        offset: usize,
        count: usize,
        channels: usize,
        scale_offset: usize,
    },
    /// Multiply `channels` rows of `inner` floats by a per-row vector
    /// (channel-first layouts).
    ScaleChannelsFirst {
        offset: usize,
        channels: usize,
        inner: usize,
        scale_offset: usize,
    },
    /// Append floats at the end of the blob.
    Append { values: Vec<f32> },
}

impl WeightEdit {
    fn apply(&self, src: &Blob, dst: &mut Blob) {
        match self {
            WeightEdit::Transpose { offset, rows, cols } => {
                let input = src.floats(*offset, rows * cols).to_vec();
                let out = dst.floats_mut(*offset, rows * cols);
                for i in 0..*rows {
                    for j in 0..*cols {
                        out[j * rows + i] = input[i * cols + j];
                    }
                }
            }
            WeightEdit::ScaleChannelsLast {
                offset,
                count,
                channels,
                scale_offset,
            } => {
                let input = src.floats(*offset, count * channels).to_vec();
                let scale = src.floats(*scale_offset, *channels).to_vec();
                let out = dst.floats_mut(*offset, count * channels);
                for i in 0..*count {
                    for j in 0..*channels {
                        out[i * channels + j] = input[i * channels + j] * scale[j];
                    }
                }
            }
            WeightEdit::ScaleChannelsFirst {
                offset,
                channels,
                inner,
                scale_offset,
            } => {
                let input = src.floats(*offset, channels * inner).to_vec();
                let scale = src.floats(*scale_offset, *channels).to_vec();
                let out = dst.floats_mut(*offset, channels * inner);
                for i in 0..*channels {
                    for j in 0..*inner {
                        out[i * inner + j] = input[i * inner + j] * scale[i];
                    }
                }
            }
            WeightEdit::Append { values } => dst.extend(values),
        }
    }
}

/// What a successful match replaces: `take_back` already-emitted layers are
/// removed, `emit` layers appended, `edits` applied to the stage buffer,
/// `renames` queued, and the cursor advanced by `advance` source layers.
#[derive(Debug, Default)]
pub(crate) struct Rewrite {
    pub take_back: usize,
    pub emit: Vec<Layer>,
    pub edits: Vec<WeightEdit>,
    pub renames: Vec<Rename>,
    pub advance: usize,
}

/// Read-only view a matcher works against.
pub(crate) struct StageCtx<'a> {
    /// The stage's input sequence.
    pub src: &'a [Layer],
    /// Output prefix built so far; `take_back` counts from its end.
    pub emitted: &'a [Layer],
    /// The stage's input blob; all descriptor reads resolve here.
    pub blob: &'a Blob,
    /// Logical end of the blob in bytes, including pending appends.
    pub blob_end: usize,
    pub method: QuantizationMethod,
    pub options: &'a OptimizerOptions,
}

impl StageCtx<'_> {
    pub fn last_emitted(&self) -> Option<&Layer> {
        self.emitted.last()
    }
}

const STAGE_COUNT: usize = 8;

pub struct Optimizer {
    options: OptimizerOptions,
}

impl Optimizer {
    pub fn new(options: OptimizerOptions) -> Self {
        Self { options }
    }

    /// Rewrite the network and its blob in place.
    pub fn run(&self, network: &mut Network, blob: &mut Blob) -> Result<()> {
        for stage in 0..STAGE_COUNT {
            self.run_stage(network, blob, stage)?;
        }
        reuse_layers(network)?;
        remove_stub(network)?;
        Ok(())
    }

    fn run_stage(&self, network: &mut Network, blob: &mut Blob, stage: usize) -> Result<()> {
        let method = network.quantization.method;
        let layers = &network.layers;
        let mut merged: Vec<Layer> = Vec::with_capacity(layers.len());
        let mut changes: Vec<Rename> = Vec::new();
        let mut buf: Option<Blob> = None;
        let mut matched = 0usize;
        let mut i = 0;
        while i < layers.len() {
            let rewrite = {
                let ctx = StageCtx {
                    src: layers,
                    emitted: &merged,
                    blob,
                    blob_end: buf.as_ref().map_or(blob.len_bytes(), Blob::len_bytes),
                    method,
                    options: &self.options,
                };
                self.try_stage(stage, &ctx, i)?
            };
            match rewrite {
                Some(rw) => {
                    ensure!(
                        rw.take_back <= merged.len(),
                        "stage {}: rewrite takes back {} of {} emitted layers",
                        stage,
                        rw.take_back,
                        merged.len()
                    );
                    ensure!(
                        rw.advance >= 1 && i + rw.advance <= layers.len(),
                        "stage {}: rewrite at {} advances {} past {} layers",
                        stage,
                        i,
                        rw.advance,
                        layers.len()
                    );
                    merged.truncate(merged.len() - rw.take_back);
                    if !rw.edits.is_empty() {
                        let out = buf.get_or_insert_with(|| blob.clone());
                        for edit in &rw.edits {
                            edit.apply(blob, out);
                        }
                    }
                    merged.extend(rw.emit);
                    changes.extend(rw.renames);
                    i += rw.advance;
                    matched += 1;
                }
                None => {
                    merged.push(layers[i].clone());
                    i += 1;
                }
            }
        }
        rename_all(&changes, &mut merged);
        debug!(stage, matched, layers = merged.len(), "optimizer stage done");
        network.layers = merged;
        if let Some(buf) = buf {
            *blob = buf;
        }
        Ok(())
    }

    fn try_stage(&self, stage: usize, ctx: &StageCtx, i: usize) -> Result<Option<Rewrite>> {
        let rw = match stage {
            0 => iterator::reduce_tensor_iterator_io(ctx, i),
            1 => linear::transpose_inner_product(ctx, i),
            2 => linear::merge_current_and_bias(ctx, i),
            3 => linear::merge_convolution_and_scale(ctx, i)
                .or_else(|| linear::merge_inner_product_and_scale(ctx, i)),
            4 => patterns::merge_hswish(ctx, i)
                .or_else(|| patterns::merge_mish(ctx, i))
                .or_else(|| patterns::merge_prelu(ctx, i))
                .or_else(|| patterns::merge_shuffle0(ctx, i))
                .or_else(|| patterns::merge_shuffle1(ctx, i))
                .or_else(|| patterns::merge_softmax(ctx, i))
                .or_else(|| fused::merge_fused0(ctx, i))
                .or_else(|| fused::merge_fused1(ctx, i))
                .or_else(|| fused::merge_fused2(ctx, i))
                .or_else(|| fused::merge_fused3(ctx, i))
                .or_else(|| fused::merge_fused4(ctx, i))
                .or_else(|| fused::merge_fused5(ctx, i))
                .or_else(|| fused::merge_fused6(ctx, i))
                .or_else(|| fused::merge_fused7(ctx, i))
                .or_else(|| fused::merge_fused8(ctx, i))
                .or_else(|| fused::merge_fused9(ctx, i))
                .or_else(|| fused::merge_fused10(ctx, i))
                .or_else(|| fused::merge_fused11(ctx, i))
                .or_else(|| patterns::merge_pooling(ctx, i)),
            5 => conv::merge_convolution_and_activation(ctx, i)
                .or_else(|| iterator::merge_rnn_gru_bd(ctx, i)),
            6 => conv::merge_three_convolutions(ctx, i)
                .or_else(|| conv::merge_squeeze_excitation(ctx, i)),
            7 => conv::merge_two_convolutions(ctx, i),
            _ => bail!("unknown optimizer stage {}", stage),
        };
        Ok(rw)
    }
}

/// Exact float comparison is deliberate in the matchers; this is the one
/// tolerant comparison the hswish shape check needs.
pub(crate) fn approx_eq(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-6
}

/// True when some layer past the window consumes an interior layer of it.
/// The window's last layer is excluded: the fused output adopts its name.
pub(crate) fn inside_link(src: &[Layer], start: usize, count: usize) -> bool {
    inside_link_ext(src, start, count, 0, &[])
}

pub(crate) fn inside_link_ext(
    src: &[Layer],
    start: usize,
    count: usize,
    skip: usize,
    ignored: &[LayerKind],
) -> bool {
    for layer in &src[(start + count + skip).min(src.len())..] {
        if ignored.contains(&layer.kind) {
            continue;
        }
        for s in &layer.src {
            let interior = &src[start..(start + count - 1).min(src.len())];
            if interior.iter().any(|w| w.name == *s) {
                return true;
            }
        }
    }
    false
}

/// Number of layers from `start` on, in the given parent scope, that read
/// the named tensor.
pub(crate) fn users(name: &str, layers: &[Layer], start: usize, parent: Option<&str>) -> usize {
    layers[start.min(layers.len())..]
        .iter()
        .filter(|l| l.parent.as_deref() == parent)
        .flat_map(|l| l.src.iter())
        .filter(|s| *s == name)
        .count()
}

/// Apply one rename to every consumer. A single-input layer writing onto its
/// own input (an in-place layer) has its output renamed too, which carries
/// the rename through in-place chains.
pub(crate) fn rename_one(change: &Rename, layers: &mut [Layer]) {
    for layer in layers.iter_mut() {
        for j in 0..layer.src.len() {
            if layer.src[j] == change.0 {
                if layer.src.len() == 1 && layer.dst.first() == Some(&layer.src[0]) {
                    layer.dst[0] = change.1.clone();
                }
                layer.src[j] = change.1.clone();
            }
        }
    }
}

pub(crate) fn rename_all(changes: &[Rename], layers: &mut [Layer]) {
    for change in changes {
        rename_one(change, layers);
    }
}

fn is_unit_max_pool(layer: &Layer) -> bool {
    layer.kind == LayerKind::Pooling
        && layer.pooling.method == PoolingMethod::Max
        && layer.pooling.kernel == [1, 1]
        && layer.pooling.stride == [1, 1]
}

fn can_reuse(layer: &Layer) -> bool {
    matches!(
        layer.kind,
        LayerKind::Sigmoid
            | LayerKind::Scale
            | LayerKind::Eltwise
            | LayerKind::Relu
            | LayerKind::SqueezeExcitation
    ) || is_unit_max_pool(layer)
}

/// Mark layers that may overwrite their input buffer by renaming their
/// output onto their input. Skipped entirely under quantization, where
/// per-tensor statistics are keyed by output name.
fn reuse_layers(network: &mut Network) -> Result<()> {
    if network.quantization.method != QuantizationMethod::Unknown {
        return Ok(());
    }
    for i in 0..network.layers.len() {
        let layer = &network.layers[i];
        if layer.src.is_empty() || layer.dst.is_empty() {
            continue;
        }
        if users(&layer.src[0], &network.layers, i + 1, None) > 0 {
            continue;
        }
        if i > 0
            && layer.src[0] == network.layers[i - 1].name
            && network.layers[i - 1].kind == LayerKind::Const
        {
            continue;
        }
        if users(&layer.dst[0], &network.layers, i + 1, None) == 0 {
            continue;
        }
        if network.has_output(layer) {
            continue;
        }
        if !can_reuse(layer) {
            continue;
        }
        let change = (layer.dst[0].clone(), layer.src[0].clone());
        rename_one(&change, &mut network.layers);
        network.layers[i].dst[0] = change.1;
    }
    Ok(())
}

fn is_stub(layer: &Layer, network: &Network) -> bool {
    if layer.kind == LayerKind::Stub {
        if users(
            &layer.dst[0],
            &network.layers,
            0,
            layer.parent.as_deref(),
        ) > 0
        {
            return true;
        }
        match network.layer_by_name(&layer.src[0]) {
            Some(producer) if producer.kind == LayerKind::DetectionOutput => return true,
            Some(_) => {}
            None => warn!(stub = %layer.name, input = %layer.src[0], "stub reads an unknown tensor"),
        }
    }
    is_unit_max_pool(layer)
}

/// Erase identity layers, rewiring their consumers to the producer.
fn remove_stub(network: &mut Network) -> Result<()> {
    let mut i = 1;
    while i < network.layers.len() {
        let layer = &network.layers[i];
        if layer.src.len() != 1 || layer.dst.len() != 1 || !is_stub(layer, network) {
            i += 1;
            continue;
        }
        let change = (layer.dst[0].clone(), layer.src[0].clone());
        rename_one(&change, &mut network.layers);
        network.layers.remove(i);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{
        ActivationKind, BinaryOp, EltwiseOp, Network, ReductionOp, ScalarKind, TensorFormat,
        UnaryOp,
    };
    use crate::testing::{layer, network, push_weights, random_floats};

    fn run(net: &mut Network, blob: &mut Blob) {
        Optimizer::new(OptimizerOptions::default())
            .run(net, blob)
            .unwrap();
        net.validate(blob).unwrap();
    }

    /// Conv(no bias) -> Scale(with bias) -> Relu collapses into a single
    /// biased convolution with the scale baked into the weights and the
    /// activation recorded.
    #[test]
    fn scenario_linear_conv_scale_relu() {
        let mut blob = Blob::default();
        let mut conv = layer("conv", LayerKind::Convolution).with_src(&["in"]);
        conv.conv.bias_term = false;
        push_weights(
            &mut blob,
            &mut conv,
            vec![1, 1, 2, 2],
            TensorFormat::Nhwc,
            &[1.0, -2.0, 0.5, 4.0],
        );
        let mut scale = layer("scale", LayerKind::Scale).with_src(&["conv"]);
        scale.scale.bias_term = true;
        push_weights(&mut blob, &mut scale, vec![2], TensorFormat::Nchw, &[2.0, 3.0]);
        push_weights(&mut blob, &mut scale, vec![2], TensorFormat::Nchw, &[0.1, 0.2]);
        let relu = layer("relu", LayerKind::Relu).with_src(&["scale"]);
        let out = layer("out", LayerKind::Stub).with_src(&["relu"]);
        let mut net = network(
            vec![layer("in", LayerKind::Input), conv, scale, relu, out],
            &["out"],
        );
        run(&mut net, &mut blob);

        assert_eq!(net.layers.len(), 3);
        let fusedc = net.layer_by_name("scale").unwrap();
        assert_eq!(fusedc.kind, LayerKind::Convolution);
        assert!(fusedc.conv.bias_term);
        assert_eq!(fusedc.conv.activation, ActivationKind::Relu);
        assert_eq!(blob.floats_of(&fusedc.weight[0]), &[2.0, -6.0, 1.0, 12.0]);
        assert_eq!(blob.floats_of(&fusedc.weight[1]), &[0.1, 0.2]);
        assert_eq!(net.layer_by_name("out").unwrap().src, vec!["scale"]);
        assert_eq!(net.dst, vec!["out"]);
    }

    fn hswish_chain(upper: f32) -> Vec<Layer> {
        let mut p0 = layer("p0", LayerKind::Power).with_src(&["in"]);
        p0.power.shift = 3.0;
        let mut rr = layer("rr", LayerKind::RestrictRange).with_src(&["p0"]);
        rr.restrict_range.lower = 0.0;
        rr.restrict_range.upper = upper;
        let mut p2 = layer("p2", LayerKind::Power).with_src(&["rr"]);
        p2.power.scale = 1.0 / 6.0;
        let mut el = layer("el", LayerKind::Eltwise).with_src(&["in", "p2"]);
        el.eltwise.operation = EltwiseOp::Product;
        vec![layer("in", LayerKind::Input), p0, rr, p2, el]
    }

    #[test]
    fn scenario_hswish_canonical() {
        let mut blob = Blob::default();
        let mut net = network(hswish_chain(6.0), &["el"]);
        run(&mut net, &mut blob);
        assert_eq!(net.layers.len(), 2);
        let hswish = net.layer_by_name("el").unwrap();
        assert_eq!(hswish.kind, LayerKind::Hswish);
        assert_eq!(hswish.src, vec!["in"]);
        assert_eq!(hswish.hswish.shift, 3.0);
        assert_eq!(hswish.hswish.scale, 1.0 / 6.0);
    }

    /// With mismatched clamp bounds the chain is not an hswish; the generic
    /// fused template takes it instead.
    #[test]
    fn hswish_with_wrong_bound_becomes_fused11() {
        let mut blob = Blob::default();
        let mut net = network(hswish_chain(5.0), &["el"]);
        run(&mut net, &mut blob);
        let fusedl = net.layer_by_name("el").unwrap();
        assert_eq!(fusedl.kind, LayerKind::Fused);
        assert_eq!(fusedl.fused.kind, 11);
        assert_eq!(fusedl.fused.floats, vec![3.0, 0.0, 5.0, 1.0 / 6.0]);
    }

    #[test]
    fn hswish_with_external_reader_of_clamp_is_kept() {
        let mut blob = Blob::default();
        let mut layers = hswish_chain(6.0);
        layers.push(layer("spy", LayerKind::Relu).with_src(&["rr"]));
        let mut net = network(layers, &["el", "spy"]);
        run(&mut net, &mut blob);
        assert!(net.layer_by_name("rr").is_some());
        assert_eq!(net.layers.len(), 6);
    }

    #[test]
    fn scenario_softmax_decomposition() {
        let mut blob = Blob::default();
        let mut rmax = layer("rmax", LayerKind::Reduction).with_src(&["in"]);
        rmax.reduction.operation = ReductionOp::Max;
        rmax.reduction.axis = vec![1];
        let mut sub = layer("sub", LayerKind::BinaryOp).with_src(&["in", "rmax"]);
        sub.binary.operation = BinaryOp::Sub;
        let mut exp = layer("exp", LayerKind::UnaryOp).with_src(&["sub"]);
        exp.unary.operation = UnaryOp::Exp;
        let mut rsum = layer("rsum", LayerKind::Reduction).with_src(&["exp"]);
        rsum.reduction.operation = ReductionOp::Sum;
        rsum.reduction.axis = vec![1];
        let mut div = layer("div", LayerKind::BinaryOp).with_src(&["exp", "rsum"]);
        div.binary.operation = BinaryOp::Div;
        let mut net = network(
            vec![layer("in", LayerKind::Input), rmax, sub, exp, rsum, div],
            &["div"],
        );
        run(&mut net, &mut blob);
        assert_eq!(net.layers.len(), 2);
        let softmax = net.layer_by_name("div").unwrap();
        assert_eq!(softmax.kind, LayerKind::Softmax);
        assert_eq!(softmax.softmax.axis, 1);
        assert_eq!(softmax.src, vec!["in"]);
    }

    #[test]
    fn scenario_stub_elimination() {
        let mut blob = Blob::default();
        let conv = layer("conv", LayerKind::Convolution).with_src(&["in"]);
        let stub = layer("stub", LayerKind::Stub).with_src(&["conv"]);
        let det = layer("det", LayerKind::DetectionOutput).with_src(&["stub"]);
        let mut net = network(
            vec![layer("in", LayerKind::Input), conv, stub, det],
            &["det"],
        );
        run(&mut net, &mut blob);
        assert!(net.layer_by_name("stub").is_none());
        assert_eq!(net.layer_by_name("det").unwrap().src, vec!["conv"]);
    }

    fn bottleneck(blob: &mut Blob) -> Vec<Layer> {
        let mut l0 = layer("l0", LayerKind::Convolution).with_src(&["in"]);
        l0.conv.kernel = vec![1, 1];
        l0.conv.output_num = 4;
        l0.conv.quantization_level = ScalarKind::I8;
        push_weights(blob, &mut l0, vec![1, 1, 4, 4], TensorFormat::Nhwc, &[0.5; 16]);
        let mut l1 = layer("l1", LayerKind::Convolution).with_src(&["l0"]);
        l1.conv.kernel = vec![3, 3];
        l1.conv.output_num = 4;
        l1.conv.group = 4;
        push_weights(blob, &mut l1, vec![3, 3, 1, 4], TensorFormat::Nhwc, &[0.25; 36]);
        let mut l2 = layer("l2", LayerKind::Convolution).with_src(&["l1"]);
        l2.conv.kernel = vec![1, 1];
        l2.conv.output_num = 8;
        l2.conv.quantization_level = ScalarKind::I8;
        push_weights(blob, &mut l2, vec![1, 1, 4, 8], TensorFormat::Nhwc, &[0.125; 32]);
        let mut el = layer("el", LayerKind::Eltwise).with_src(&["in", "l2"]);
        el.eltwise.operation = EltwiseOp::Sum;
        let relu = layer("relu", LayerKind::Relu).with_src(&["el"]);
        vec![layer("in", LayerKind::Input), l0, l1, l2, el, relu]
    }

    #[test]
    fn scenario_three_convolution_bottleneck_with_residual() {
        let mut blob = Blob::default();
        let layers = bottleneck(&mut blob);
        let mut net = network(layers, &["relu"]);
        run(&mut net, &mut blob);
        assert_eq!(net.layers.len(), 2);
        let merged = net.layer_by_name("relu").unwrap();
        assert_eq!(merged.kind, LayerKind::MergedConvolution);
        assert_eq!(merged.merged_conv.conv.len(), 3);
        assert!(merged.merged_conv.add);
        assert_eq!(merged.merged_conv.conv[2].activation, ActivationKind::Relu);
        assert_eq!(merged.origin, vec!["l0", "l1"]);
        assert_eq!(merged.src, vec!["in"]);
        assert_eq!(merged.weight.len(), 3);
    }

    #[test]
    fn scenario_rnn_gru_bd_body() {
        let mut blob = Blob::default();
        let mut ti = layer("ti", LayerKind::TensorIterator).with_src(&["a", "b"]);
        ti.tensor_iterator.back.push(Default::default());
        let body = |name: &str, kind, src: &[&str]| {
            let mut l = layer(name, kind).with_src(src);
            l.parent = Some("ti".into());
            l
        };
        let mut b5 = body("b5", LayerKind::InnerProduct, &["b4"]);
        push_weights(&mut blob, &mut b5, vec![2, 2], TensorFormat::Nchw, &[0.0; 4]);
        push_weights(&mut blob, &mut b5, vec![2], TensorFormat::Nchw, &[0.0; 2]);
        let mut b12 = body("b12", LayerKind::InnerProduct, &["b11"]);
        push_weights(&mut blob, &mut b12, vec![2, 2], TensorFormat::Nchw, &[0.0; 4]);
        push_weights(&mut blob, &mut b12, vec![2], TensorFormat::Nchw, &[0.0; 2]);
        let mut b7 = body("b7", LayerKind::Unpack, &["b6"]);
        b7.dst = vec!["b7_0".into(), "b7_1".into()];
        let layers = vec![
            layer("a", LayerKind::Input),
            layer("b", LayerKind::Input),
            ti,
            body("b0", LayerKind::Input, &[]),
            body("b1", LayerKind::Meta, &[]),
            body("b2", LayerKind::Squeeze, &["b0"]),
            body("b3", LayerKind::Input, &[]),
            body("b4", LayerKind::Concat, &["b2", "b3"]),
            b5,
            body("b6", LayerKind::Sigmoid, &["b5"]),
            b7,
            body("b8", LayerKind::Eltwise, &["b7_0", "b2"]),
            body("b9", LayerKind::Power, &["b8"]),
            body("b10", LayerKind::Eltwise, &["b7_1", "b2"]),
            body("b11", LayerKind::Concat, &["b2", "b10"]),
            b12,
            body("b13", LayerKind::UnaryOp, &["b12"]),
            body("b14", LayerKind::Eltwise, &["b9", "b13"]),
            body("b15", LayerKind::Eltwise, &["b14", "b8"]),
            body("b16", LayerKind::Stub, &["b15"]),
            body("b17", LayerKind::ExpandDims, &["b16"]),
            body("b18", LayerKind::Stub, &["b17"]),
            layer("tail", LayerKind::Softmax).with_src(&["ti"]),
        ];
        let mut net = network(layers, &["tail"]);
        run(&mut net, &mut blob);
        assert_eq!(net.layers.len(), 7);
        let gru = net.layer_by_name("ti_RnnGruBd").unwrap();
        assert_eq!(gru.kind, LayerKind::RnnGruBd);
        assert_eq!(gru.parent.as_deref(), Some("ti"));
        assert_eq!(gru.src, vec!["b0", "b3"]);
        assert_eq!(gru.dst, vec!["b18", "b16"]);
        assert_eq!(gru.weight.len(), 4);
        assert!(net.layer_by_name("b0").is_some());
        assert!(net.layer_by_name("b3").is_some());
    }

    #[test]
    fn reuse_marks_in_place_sigmoid() {
        let mut blob = Blob::default();
        let conv = layer("conv", LayerKind::Convolution).with_src(&["in"]);
        let sig = layer("sig", LayerKind::Sigmoid).with_src(&["conv"]);
        let mut tail = layer("tail", LayerKind::Pooling).with_src(&["sig"]);
        tail.pooling.kernel = vec![2, 2];
        tail.pooling.stride = vec![2, 2];
        let mut net = network(
            vec![layer("in", LayerKind::Input), conv, sig, tail],
            &["tail"],
        );
        run(&mut net, &mut blob);
        let sig = net.layer_by_name("sig").unwrap();
        assert_eq!(sig.dst, vec!["conv"]);
        assert_eq!(net.layer_by_name("tail").unwrap().src, vec!["conv"]);
    }

    #[test]
    fn reuse_is_skipped_under_quantization() {
        let mut blob = Blob::default();
        let conv = layer("conv", LayerKind::Convolution).with_src(&["in"]);
        let sig = layer("sig", LayerKind::Sigmoid).with_src(&["conv"]);
        let mut tail = layer("tail", LayerKind::Pooling).with_src(&["sig"]);
        tail.pooling.kernel = vec![2, 2];
        tail.pooling.stride = vec![2, 2];
        let mut net = network(
            vec![layer("in", LayerKind::Input), conv, sig, tail],
            &["tail"],
        );
        net.quantization.method = QuantizationMethod::IECompatible;
        run(&mut net, &mut blob);
        assert_eq!(net.layer_by_name("sig").unwrap().dst, vec!["sig"]);
    }

    #[test]
    fn unit_max_pool_is_erased() {
        let mut blob = Blob::default();
        let conv = layer("conv", LayerKind::Convolution).with_src(&["in"]);
        let mut pool = layer("pool", LayerKind::Pooling).with_src(&["conv"]);
        pool.pooling.kernel = vec![1, 1];
        pool.pooling.stride = vec![1, 1];
        let relu = layer("relu", LayerKind::Softmax).with_src(&["pool"]);
        let mut net = network(
            vec![layer("in", LayerKind::Input), conv, pool, relu],
            &["relu"],
        );
        run(&mut net, &mut blob);
        assert!(net.layer_by_name("pool").is_none());
        assert_eq!(net.layer_by_name("relu").unwrap().src, vec!["conv"]);
    }

    /// Running the optimizer on its own output changes nothing.
    #[test]
    fn run_is_idempotent() {
        let mut blob = Blob::default();
        let mut conv = layer("conv", LayerKind::Convolution).with_src(&["in"]);
        conv.conv.bias_term = false;
        push_weights(
            &mut blob,
            &mut conv,
            vec![1, 1, 2, 2],
            TensorFormat::Nhwc,
            &random_floats(4, 11),
        );
        let mut scale = layer("scale", LayerKind::Scale).with_src(&["conv"]);
        push_weights(
            &mut blob,
            &mut scale,
            vec![2],
            TensorFormat::Nchw,
            &random_floats(2, 12),
        );
        let relu = layer("relu", LayerKind::Relu).with_src(&["scale"]);
        let out = layer("out", LayerKind::Stub).with_src(&["relu"]);
        let mut net = network(
            vec![layer("in", LayerKind::Input), conv, scale, relu, out],
            &["out"],
        );
        run(&mut net, &mut blob);
        let (net1, blob1) = (net.clone(), blob.clone());
        run(&mut net, &mut blob);
        assert_eq!(net, net1);
        assert_eq!(blob, blob1);
    }

    /// Two runs over identical inputs produce identical outputs.
    #[test]
    fn run_is_deterministic() {
        let mut blob_a = Blob::default();
        let layers = bottleneck(&mut blob_a);
        let mut net_a = network(layers, &["relu"]);
        let mut net_b = net_a.clone();
        let mut blob_b = blob_a.clone();
        run(&mut net_a, &mut blob_a);
        run(&mut net_b, &mut blob_b);
        assert_eq!(net_a, net_b);
        assert_eq!(blob_a, blob_b);
    }
}
