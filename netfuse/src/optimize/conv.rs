//! Convolution fusions: activation absorption, the pointwise / depthwise /
//! pointwise bottleneck, squeeze-excitation and the two-convolution pair.

use crate::model::{
    ActivationKind, EltwiseOp, Layer, LayerKind, PoolingMethod, QuantizationMethod, ScalarKind,
    TensorFormat, WeightDesc,
};
use crate::optimize::{Rename, Rewrite, StageCtx, inside_link};

/// An activation a convolution can absorb into its activation slot:
/// the kind, up to two parameters, and the slope weights for Prelu.
fn absorbable_activation(act: &Layer) -> Option<(ActivationKind, Vec<f32>, Option<&WeightDesc>)> {
    match act.kind {
        LayerKind::RestrictRange => Some((
            ActivationKind::RestrictRange,
            vec![act.restrict_range.lower, act.restrict_range.upper],
            None,
        )),
        LayerKind::Relu => {
            let kind = if act.relu.negative_slope == 0.0 {
                ActivationKind::Relu
            } else {
                ActivationKind::LeakyRelu
            };
            Some((kind, vec![act.relu.negative_slope], None))
        }
        LayerKind::Prelu => Some((ActivationKind::Prelu, Vec::new(), act.weight.first())),
        LayerKind::Elu => Some((ActivationKind::Elu, vec![act.elu.alpha], None)),
        LayerKind::Hswish => Some((
            ActivationKind::Hswish,
            vec![act.hswish.shift, act.hswish.scale],
            None,
        )),
        LayerKind::Mish => Some((ActivationKind::Mish, vec![act.softplus.threshold], None)),
        _ => None,
    }
}

/// Stage 5: write the activation following a convolution or deconvolution
/// into its activation slot. An int8 convolution keeps both names alive (the
/// pre-fusion one moves into `origin`) because the non-fused output's
/// statistics are still needed for calibration.
pub(crate) fn merge_convolution_and_activation(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    if i == 0 {
        return None;
    }
    let src = ctx.src;
    let conv = &src[i - 1];
    let act = &src[i];
    if conv.kind != LayerKind::Convolution && conv.kind != LayerKind::Deconvolution {
        return None;
    }
    if act.src.len() != 1 || act.src[0] != conv.name {
        return None;
    }
    if inside_link(src, i - 1, 2) {
        return None;
    }
    if act.kind == LayerKind::Prelu && ctx.method == QuantizationMethod::IECompatible {
        return None;
    }
    let (kind, params, prelu_weight) = absorbable_activation(act)?;
    let mut out = ctx.last_emitted()?.clone();
    out.conv.activation = kind;
    if let Some(p0) = params.first() {
        out.conv.activation_param0 = *p0;
    }
    if let Some(p1) = params.get(1) {
        out.conv.activation_param1 = *p1;
    }
    if kind == ActivationKind::Prelu {
        out.weight.push(prelu_weight?.clone());
    }
    let mut renames: Vec<Rename> = Vec::new();
    if out.conv.quantization_level == ScalarKind::I8 {
        out.origin.push(conv.name.clone());
        out.name = act.name.clone();
        *out.dst.first_mut()? = act.name.clone();
    } else {
        renames.push((act.name.clone(), conv.name.clone()));
    }
    Some(Rewrite {
        take_back: 1,
        emit: vec![out],
        renames,
        advance: 1,
        ..Default::default()
    })
}

fn square_kernel_in(kernel: &[usize], allowed: &[usize]) -> bool {
    kernel.len() >= 2 && kernel[0] == kernel[1] && allowed.contains(&kernel[0])
}

fn is_depthwise(layer: &Layer) -> bool {
    layer.conv.output_num == layer.conv.group
}

/// Stage 6: `Conv(1x1|3x3 dense) -> Conv(kxk depthwise) -> Conv(1x1 dense)`
/// into one MergedConvolution, optionally swallowing a trailing residual sum
/// with the block input and one more activation.
pub(crate) fn merge_three_convolutions(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    let src = ctx.src;
    if ctx.method != QuantizationMethod::Unknown && !ctx.options.merge_int8_convolutions {
        return None;
    }
    let l0 = src.get(i)?;
    let l1 = src.get(i + 1)?;
    let l2 = src.get(i + 2)?;
    if l0.kind != LayerKind::Convolution
        || l1.kind != LayerKind::Convolution
        || l2.kind != LayerKind::Convolution
        || l1.src.first() != l0.dst.first()
        || l2.src.first() != l1.dst.first()
    {
        return None;
    }
    if l0.weight.first()?.format != TensorFormat::Nhwc {
        return None;
    }
    if !square_kernel_in(&l0.conv.kernel, &[1, 3]) {
        return None;
    }
    if !is_depthwise(l1) || !square_kernel_in(&l1.conv.kernel, &[3, 5, 7]) {
        return None;
    }
    let k2 = &l2.conv.kernel;
    if k2.len() < 2 || k2[0] != 1 || k2[1] != 1 {
        return None;
    }
    if inside_link(src, i, 3) {
        return None;
    }
    if (l1.conv.output_num as f64) < l2.conv.output_num as f64 * 0.75
        && l2.conv.output_num > 256
    {
        return None;
    }
    // a neighbouring depthwise means the pair fusions would cover this
    // region better; leave it for stage 7
    if i > 0 && ctx.options.merge_two_convolutions {
        let ln = &src[i - 1];
        if ln.kind == LayerKind::Convolution
            && l0.src.first() == ln.dst.first()
            && is_depthwise(ln)
            && !inside_link(src, i - 1, 4)
            && l2.conv.output_num >= l1.conv.output_num
        {
            return None;
        }
    }
    if ctx.options.merge_two_convolutions {
        if let Some(l3) = src.get(i + 3) {
            if l3.kind == LayerKind::Convolution
                && l3.src.first() == l2.dst.first()
                && is_depthwise(l3)
                && !inside_link(src, i, 4)
                && l2.conv.output_num >= l1.conv.output_num
            {
                return None;
            }
        }
    }

    let mut layer = Layer::new(l2.name.clone(), LayerKind::MergedConvolution);
    layer.src = l0.src.clone();
    for part in [l0, l1, l2] {
        layer.weight.extend(part.weight.iter().cloned());
        layer.merged_conv.conv.push(part.conv.clone());
    }
    if layer.merged_conv.conv[0].quantization_level == ScalarKind::I8
        || layer.merged_conv.conv[2].quantization_level == ScalarKind::I8
    {
        layer.origin.push(l0.name.clone());
        layer.origin.push(l1.name.clone());
    }
    let mut advance = 3;

    if ctx.method == QuantizationMethod::Unknown {
        if let Some(l3) = src.get(i + 3) {
            if l2.conv.activation == ActivationKind::Identity
                && l3.kind == LayerKind::Eltwise
                && l3.eltwise.operation == EltwiseOp::Sum
                && l3.eltwise.coefficients.is_empty()
                && l3.src.len() == 2
                && l3.src[0] == *l0.src.first()?
                && l3.src[1] == *l2.dst.first()?
                && !inside_link(src, i, 4)
            {
                layer.merged_conv.add = true;
                layer.name = l3.name.clone();
                layer.dst[0] = layer.name.clone();
                advance = 4;
                if let Some(l4) = src.get(i + 4) {
                    if l4.src.len() == 1 && l4.src[0] == l3.name && !inside_link(src, i, 5) {
                        if let Some((kind, params, prelu_weight)) = absorbable_activation(l4) {
                            let tail = &mut layer.merged_conv.conv[2];
                            tail.activation = kind;
                            if let Some(p0) = params.first() {
                                tail.activation_param0 = *p0;
                            }
                            if let Some(p1) = params.get(1) {
                                tail.activation_param1 = *p1;
                            }
                            if kind == ActivationKind::Prelu {
                                layer.weight.push(prelu_weight?.clone());
                            }
                            layer.name = l4.name.clone();
                            layer.dst[0] = layer.name.clone();
                            advance = 5;
                        }
                    }
                }
            }
        }
    }
    Some(Rewrite {
        emit: vec![layer],
        advance,
        ..Default::default()
    })
}

/// Stage 6: average pool, two 1x1 convolutions, sigmoid and a product with
/// the pooled tensor's source.
pub(crate) fn merge_squeeze_excitation(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    let src = ctx.src;
    let pool = src.get(i)?;
    let c1 = src.get(i + 1)?;
    let c2 = src.get(i + 2)?;
    let sig = src.get(i + 3)?;
    let prod = src.get(i + 4)?;
    if pool.kind != LayerKind::Pooling || pool.pooling.method != PoolingMethod::Average {
        return None;
    }
    if c1.kind != LayerKind::Convolution
        || c1.conv.kernel != [1, 1]
        || c1.conv.bias_term
        || c1.src.first() != Some(&pool.name)
        || c1.conv.activation != ActivationKind::Relu
    {
        return None;
    }
    if c2.kind != LayerKind::Convolution
        || c2.conv.kernel != [1, 1]
        || c2.conv.bias_term
        || c2.src.first() != Some(&c1.name)
    {
        return None;
    }
    if sig.kind != LayerKind::Sigmoid || sig.src.first() != Some(&c2.name) {
        return None;
    }
    if prod.kind != LayerKind::Eltwise
        || prod.eltwise.operation != EltwiseOp::Product
        || prod.src.first() != pool.src.first()
        || prod.src.get(1) != sig.dst.first()
    {
        return None;
    }
    if inside_link(src, i + 1, 4) {
        return None;
    }
    let mut layer =
        Layer::new(prod.name.clone(), LayerKind::SqueezeExcitation).with_src(&[pool.src.first()?]);
    layer.weight.push(c1.weight.first()?.clone());
    layer.weight.push(c2.weight.first()?.clone());
    layer.dst = vec![prod.dst.first()?.clone()];
    Some(Rewrite {
        emit: vec![layer],
        advance: 5,
        ..Default::default()
    })
}

/// Stage 7: a dense and a depthwise convolution in either order, bounded by
/// the configured output-channel cap.
pub(crate) fn merge_two_convolutions(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    let src = ctx.src;
    if !ctx.options.merge_two_convolutions {
        return None;
    }
    if ctx.method != QuantizationMethod::Unknown && !ctx.options.merge_int8_convolutions {
        return None;
    }
    let l0 = src.get(i)?;
    let l1 = src.get(i + 1)?;
    if l0.kind != LayerKind::Convolution
        || l1.kind != LayerKind::Convolution
        || l1.src.first() != l0.dst.first()
    {
        return None;
    }
    if l0.weight.first()?.format != TensorFormat::Nhwc {
        return None;
    }
    if inside_link(src, i, 2) {
        return None;
    }
    let cap = ctx.options.merge_two_convolutions_output_num_max;
    if l0.conv.output_num > cap && l1.conv.output_num > cap {
        return None;
    }
    if l0.conv.group != 1 {
        // depthwise then pointwise
        if !is_depthwise(l0) || !square_kernel_in(&l0.conv.kernel, &[3, 5, 7]) {
            return None;
        }
        if !square_kernel_in(&l1.conv.kernel, &[1]) {
            return None;
        }
    } else {
        // dense then depthwise
        if !square_kernel_in(&l0.conv.kernel, &[1, 3]) {
            return None;
        }
        if !is_depthwise(l1) || !square_kernel_in(&l1.conv.kernel, &[3, 5, 7]) {
            return None;
        }
    }
    let mut layer = Layer::new(l1.name.clone(), LayerKind::MergedConvolution);
    layer.src = l0.src.clone();
    for part in [l0, l1] {
        layer.weight.extend(part.weight.iter().cloned());
        layer.merged_conv.conv.push(part.conv.clone());
    }
    if layer.merged_conv.conv[0].quantization_level == ScalarKind::I8
        || layer.merged_conv.conv[1].quantization_level == ScalarKind::I8
    {
        layer.origin.push(l0.name.clone());
    }
    Some(Rewrite {
        emit: vec![layer],
        advance: 2,
        ..Default::default()
    })
}
