//! The `Fused#` templates: twelve fixed activation-shaped suffixes of a
//! convolution or inner product, each collapsed into a `Fused` layer with a
//! discriminator and a small float tuple. Several templates also strip the
//! anchor's bias into the fused layer's weight list.

use crate::model::{
    ActivationKind, BinaryOp, EltwiseOp, Layer, LayerKind, UnaryOp,
};
use crate::optimize::{Rename, Rewrite, StageCtx, inside_link, inside_link_ext};

fn is_sub(layer: &Layer) -> bool {
    (layer.kind == LayerKind::Eltwise
        && layer.eltwise.operation == EltwiseOp::Sum
        && layer.eltwise.coefficients == [1.0, -1.0])
        || (layer.kind == LayerKind::BinaryOp && layer.binary.operation == BinaryOp::Sub)
}

fn is_plain_sum(layer: &Layer) -> bool {
    layer.kind == LayerKind::Eltwise
        && layer.eltwise.operation == EltwiseOp::Sum
        && layer.eltwise.coefficients.is_empty()
}

fn src_is2(layer: &Layer, a: &str, b: &str) -> bool {
    layer.src.len() == 2 && layer.src[0] == a && layer.src[1] == b
}

fn anchored_conv(layer: &Layer, bias: bool) -> bool {
    layer.kind == LayerKind::Convolution
        && layer.conv.bias_term == bias
        && layer.conv.activation == ActivationKind::Identity
}

/// The anchor gives its bias away to the fused layer.
fn strip_bias(mut conv: Layer) -> Layer {
    conv.weight.truncate(1);
    conv.conv.bias_term = false;
    conv
}

fn fused(name: &str, input: &str, kind: i32) -> Layer {
    let mut layer = Layer::new(name, LayerKind::Fused).with_src(&[input]);
    layer.fused.kind = kind;
    layer
}

/// CReLU-like: `relu(x) + s1 * s0 * (x - |x|)`.
pub(crate) fn merge_fused0(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    if i == 0 {
        return None;
    }
    let src = ctx.src;
    let conv = &src[i - 1];
    if !anchored_conv(conv, true) {
        return None;
    }
    let relu = src.get(i)?;
    let abs = src.get(i + 1)?;
    let sub = src.get(i + 2)?;
    let s3 = src.get(i + 3)?;
    let s4 = src.get(i + 4)?;
    let sum = src.get(i + 5)?;
    if relu.kind != LayerKind::Relu || relu.src.first() != Some(&conv.name) {
        return None;
    }
    if abs.kind != LayerKind::UnaryOp
        || abs.unary.operation != UnaryOp::Abs
        || abs.src.first() != Some(&conv.name)
    {
        return None;
    }
    if !is_sub(sub) || !src_is2(sub, &conv.name, &abs.name) {
        return None;
    }
    if s3.kind != LayerKind::Scale || s3.scale.bias_term || s3.src.first() != Some(&sub.name) {
        return None;
    }
    if s4.kind != LayerKind::Scale || s4.scale.bias_term || s4.src.first() != Some(&s3.name) {
        return None;
    }
    if !is_plain_sum(sum) || !src_is2(sum, &relu.name, &s4.name) {
        return None;
    }
    if inside_link(src, i - 1, 7) {
        return None;
    }
    let mut layer = fused(&sum.name, &conv.name, 0);
    layer.weight.push(conv.weight.get(1)?.clone());
    layer.weight.push(s3.weight.first()?.clone());
    layer.weight.push(s4.weight.first()?.clone());
    Some(Rewrite {
        take_back: 1,
        emit: vec![strip_bias(ctx.last_emitted()?.clone()), layer],
        advance: 6,
        ..Default::default()
    })
}

/// Shifted bi-halves: `relu(x) + s3 * relu(s1 * x + b1) + b3`, the fused
/// output keeping the convolution's own name.
pub(crate) fn merge_fused1(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    if i == 0 {
        return None;
    }
    let src = ctx.src;
    let conv = &src[i - 1];
    if !anchored_conv(conv, true) {
        return None;
    }
    let relu = src.get(i)?;
    let s1 = src.get(i + 1)?;
    let r2 = src.get(i + 2)?;
    let s3 = src.get(i + 3)?;
    let sum = src.get(i + 4)?;
    if relu.kind != LayerKind::Relu || relu.src.first() != Some(&conv.name) {
        return None;
    }
    if s1.kind != LayerKind::Scale
        || s1.scale.axis != 0
        || !s1.scale.bias_term
        || s1.src.first() != Some(&conv.name)
    {
        return None;
    }
    if r2.kind != LayerKind::Relu || r2.src.first() != Some(&s1.name) {
        return None;
    }
    if s3.kind != LayerKind::Scale || !s3.scale.bias_term || s3.src.first() != Some(&r2.name) {
        return None;
    }
    if !is_plain_sum(sum) || !src_is2(sum, &relu.name, &s3.name) {
        return None;
    }
    if inside_link(src, i - 1, 6) {
        return None;
    }
    let mut layer = fused(&sum.name, &conv.name, 1);
    layer.weight.push(conv.weight.get(1)?.clone());
    layer.weight.push(s1.weight.first()?.clone());
    layer.weight.push(s1.weight.get(1)?.clone());
    layer.weight.push(s3.weight.first()?.clone());
    layer.weight.push(s3.weight.get(1)?.clone());
    let renames: Vec<Rename> = vec![(layer.dst[0].clone(), layer.src[0].clone())];
    layer.dst[0] = layer.src[0].clone();
    Some(Rewrite {
        take_back: 1,
        emit: vec![strip_bias(ctx.last_emitted()?.clone()), layer],
        renames,
        advance: 5,
        ..Default::default()
    })
}

/// Yolo-style batch-norm + scale + relu chain, running in place on the
/// convolution's output.
pub(crate) fn merge_fused2(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    if i == 0 {
        return None;
    }
    let src = ctx.src;
    let conv = &src[i - 1];
    if !anchored_conv(conv, false) {
        return None;
    }
    let bn = src.get(i)?;
    let scale = src.get(i + 1)?;
    let relu = src.get(i + 2)?;
    if bn.kind != LayerKind::BatchNorm
        || !bn.batch_norm.use_global_stats
        || !bn.batch_norm.yolo_compatible
        || bn.src.first() != Some(&conv.name)
        || bn.dst.first() != Some(&conv.name)
    {
        return None;
    }
    if scale.kind != LayerKind::Scale
        || !scale.scale.bias_term
        || scale.scale.axis != 1
        || scale.src.first() != Some(&conv.name)
        || scale.dst.first() != Some(&conv.name)
    {
        return None;
    }
    if relu.kind != LayerKind::Relu
        || relu.src.first() != Some(&conv.name)
        || relu.dst.first() != Some(&conv.name)
    {
        return None;
    }
    let mut layer = fused(&relu.name, &conv.name, 2);
    layer.dst = relu.dst.clone();
    layer.fused.floats = vec![bn.batch_norm.eps, relu.relu.negative_slope];
    layer.weight.push(bn.weight.first()?.clone());
    layer.weight.push(bn.weight.get(1)?.clone());
    layer.weight.push(scale.weight.first()?.clone());
    layer.weight.push(scale.weight.get(1)?.clone());
    Some(Rewrite {
        emit: vec![layer],
        advance: 3,
        ..Default::default()
    })
}

/// Double-negated relu pair expressing a parametric relu. On a convolution
/// anchor the slope folds straight into the activation slot; an inner
/// product grows a `Fused` companion instead.
pub(crate) fn merge_fused3(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    if i == 0 {
        return None;
    }
    let src = ctx.src;
    let prev = &src[i - 1];
    let conv_anchor = anchored_conv(prev, true);
    let ip_anchor = prev.kind == LayerKind::InnerProduct && prev.inner_product.bias_term;
    if !conv_anchor && !ip_anchor {
        return None;
    }
    let relu = src.get(i)?;
    let neg1 = src.get(i + 1)?;
    let r2 = src.get(i + 2)?;
    let neg3 = src.get(i + 3)?;
    let s4 = src.get(i + 4)?;
    let sum = src.get(i + 5)?;
    if relu.kind != LayerKind::Relu || relu.src.first() != Some(&prev.name) {
        return None;
    }
    if neg1.kind != LayerKind::UnaryOp
        || neg1.unary.operation != UnaryOp::Neg
        || neg1.src.first() != Some(&prev.name)
    {
        return None;
    }
    if r2.kind != LayerKind::Relu || r2.src.first() != Some(&neg1.name) {
        return None;
    }
    if neg3.kind != LayerKind::UnaryOp
        || neg3.unary.operation != UnaryOp::Neg
        || neg3.src.first() != Some(&r2.name)
    {
        return None;
    }
    if s4.kind != LayerKind::Scale || s4.scale.bias_term || s4.src.first() != Some(&neg3.name) {
        return None;
    }
    if !is_plain_sum(sum) || !src_is2(sum, &relu.name, &s4.name) {
        return None;
    }
    if inside_link(src, i - 1, 7) {
        return None;
    }
    let anchor = ctx.last_emitted()?;
    if anchor.kind == LayerKind::Convolution {
        let mut out = anchor.clone();
        out.name = sum.name.clone();
        *out.dst.last_mut()? = out.name.clone();
        out.conv.activation = ActivationKind::Prelu;
        out.weight.push(s4.weight.first()?.clone());
        Some(Rewrite {
            take_back: 1,
            emit: vec![out],
            advance: 6,
            ..Default::default()
        })
    } else {
        let mut ip = anchor.clone();
        ip.weight.truncate(1);
        ip.inner_product.bias_term = false;
        let mut layer = fused(&sum.name, &prev.name, 3);
        layer.weight.push(prev.weight.get(1)?.clone());
        layer.weight.push(s4.weight.first()?.clone());
        Some(Rewrite {
            take_back: 1,
            emit: vec![ip, layer],
            advance: 6,
            ..Default::default()
        })
    }
}

/// Concatenated identity and affine image of the same tensor under a relu.
pub(crate) fn merge_fused4(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    if i == 0 {
        return None;
    }
    let src = ctx.src;
    let conv = &src[i - 1];
    if !anchored_conv(conv, true) {
        return None;
    }
    let power = src.get(i)?;
    let concat = src.get(i + 1)?;
    let relu = src.get(i + 2)?;
    if power.kind != LayerKind::Power
        || power.power.power != 1.0
        || power.src.first() != Some(&conv.name)
    {
        return None;
    }
    if concat.kind != LayerKind::Concat || !src_is2(concat, &conv.name, &power.name) {
        return None;
    }
    if relu.kind != LayerKind::Relu || relu.src.first() != Some(&concat.name) {
        return None;
    }
    if inside_link(src, i - 1, 4) {
        return None;
    }
    let mut layer = fused(&relu.name, &conv.name, 4);
    layer.weight.push(conv.weight.get(1)?.clone());
    layer.fused.floats = vec![power.power.scale, power.power.shift];
    Some(Rewrite {
        take_back: 1,
        emit: vec![strip_bias(ctx.last_emitted()?.clone()), layer],
        advance: 3,
        ..Default::default()
    })
}

/// Two chained per-channel affines under a relu, applied in place.
pub(crate) fn merge_fused5(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    if i == 0 {
        return None;
    }
    let src = ctx.src;
    let conv = &src[i - 1];
    if !anchored_conv(conv, false) {
        return None;
    }
    let s0 = src.get(i)?;
    let s1 = src.get(i + 1)?;
    let relu = src.get(i + 2)?;
    if s0.kind != LayerKind::Scale
        || !s0.scale.bias_term
        || s0.scale.axis != 1
        || s0.src.first() != Some(&conv.name)
    {
        return None;
    }
    if s1.kind != LayerKind::Scale
        || !s1.scale.bias_term
        || s1.scale.axis != 1
        || s1.src.first() != Some(&s0.name)
    {
        return None;
    }
    if relu.kind != LayerKind::Relu || relu.src.first() != Some(&s1.name) {
        return None;
    }
    if inside_link(src, i - 1, 4) {
        return None;
    }
    let mut layer = fused(&relu.name, &conv.name, 5);
    layer.dst = relu.dst.clone();
    layer.weight.push(s0.weight.first()?.clone());
    layer.weight.push(s0.weight.get(1)?.clone());
    layer.weight.push(s1.weight.first()?.clone());
    layer.weight.push(s1.weight.get(1)?.clone());
    let renames: Vec<Rename> = vec![(layer.dst[0].clone(), layer.src[0].clone())];
    layer.dst[0] = layer.src[0].clone();
    Some(Rewrite {
        emit: vec![layer],
        renames,
        advance: 3,
        ..Default::default()
    })
}

/// A single per-channel affine under a relu, applied in place.
pub(crate) fn merge_fused6(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    if i == 0 {
        return None;
    }
    let src = ctx.src;
    let conv = &src[i - 1];
    if !anchored_conv(conv, false) {
        return None;
    }
    let scale = src.get(i)?;
    let relu = src.get(i + 1)?;
    if scale.kind != LayerKind::Scale
        || !scale.scale.bias_term
        || scale.scale.axis != 1
        || scale.src.first() != Some(&conv.name)
    {
        return None;
    }
    if relu.kind != LayerKind::Relu || relu.src.first() != Some(&scale.name) {
        return None;
    }
    if inside_link(src, i - 1, 3) {
        return None;
    }
    let mut layer = fused(&relu.name, &conv.name, 6);
    layer.dst = relu.dst.clone();
    layer.weight.push(scale.weight.first()?.clone());
    layer.weight.push(scale.weight.get(1)?.clone());
    let renames: Vec<Rename> = vec![(layer.dst[0].clone(), layer.src[0].clone())];
    layer.dst[0] = layer.src[0].clone();
    Some(Rewrite {
        emit: vec![layer],
        renames,
        advance: 2,
        ..Default::default()
    })
}

/// Mirrored relu halves recombined through a per-channel affine.
pub(crate) fn merge_fused7(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    if i == 0 {
        return None;
    }
    let src = ctx.src;
    let conv = &src[i - 1];
    if !anchored_conv(conv, true) {
        return None;
    }
    let relu = src.get(i)?;
    let power = src.get(i + 1)?;
    let r2 = src.get(i + 2)?;
    let s3 = src.get(i + 3)?;
    let sum = src.get(i + 4)?;
    if relu.kind != LayerKind::Relu || relu.src.first() != Some(&conv.name) {
        return None;
    }
    if power.kind != LayerKind::Power
        || power.power.power != 1.0
        || power.power.scale != -1.0
        || power.power.shift != 0.0
        || power.src.first() != Some(&conv.name)
    {
        return None;
    }
    if r2.kind != LayerKind::Relu || r2.src.first() != Some(&power.name) {
        return None;
    }
    if s3.kind != LayerKind::Scale || !s3.scale.bias_term || s3.src.first() != Some(&r2.name) {
        return None;
    }
    if !is_plain_sum(sum) || !src_is2(sum, &relu.name, &s3.name) {
        return None;
    }
    if inside_link(src, i - 1, 6) {
        return None;
    }
    let mut layer = fused(&sum.name, &conv.name, 7);
    layer.weight.push(conv.weight.get(1)?.clone());
    layer.weight.push(s3.weight.first()?.clone());
    layer.weight.push(s3.weight.get(1)?.clone());
    let renames: Vec<Rename> = vec![(layer.dst[0].clone(), layer.src[0].clone())];
    layer.dst[0] = layer.src[0].clone();
    Some(Rewrite {
        take_back: 1,
        emit: vec![strip_bias(ctx.last_emitted()?.clone()), layer],
        renames,
        advance: 5,
        ..Default::default()
    })
}

/// Broadcast product of a tiled mask with a parallel branch, recombined by
/// sum; the parallel branch layer is kept in front of the fused layer.
pub(crate) fn merge_fused8(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    let src = ctx.src;
    let t0 = src.get(i)?;
    let t1 = src.get(i + 1)?;
    let prod = src.get(i + 2)?;
    let branch = src.get(i + 3)?;
    let sum = src.get(i + 4)?;
    if t0.kind != LayerKind::Tile {
        return None;
    }
    if t1.kind != LayerKind::Tile || t1.src.first() != Some(&t0.name) {
        return None;
    }
    if prod.kind != LayerKind::Eltwise
        || prod.eltwise.operation != EltwiseOp::Product
        || prod.src.len() != 2
        || prod.src[1] != t1.name
    {
        return None;
    }
    if inside_link(src, i, 3) {
        return None;
    }
    if branch.kind != LayerKind::Pooling && branch.kind != LayerKind::Convolution {
        return None;
    }
    if sum.kind != LayerKind::Eltwise
        || sum.eltwise.operation != EltwiseOp::Sum
        || !src_is2(sum, &prod.name, &branch.name)
    {
        return None;
    }
    let mut layer = Layer::new(sum.name.clone(), LayerKind::Fused);
    layer.src = vec![
        sum.src[1].clone(),
        prod.src[0].clone(),
        t0.src.first()?.clone(),
    ];
    layer.fused.kind = 8;
    Some(Rewrite {
        emit: vec![branch.clone(), layer],
        advance: 5,
        ..Default::default()
    })
}

/// Concat of two tensors followed by a per-channel affine and relu. When the
/// raw concat output still has consumers it stays exposed as a second
/// output.
pub(crate) fn merge_fused9(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    let src = ctx.src;
    let concat = src.get(i)?;
    let scale = src.get(i + 1)?;
    let relu = src.get(i + 2)?;
    if concat.kind != LayerKind::Concat || concat.src.len() != 2 {
        return None;
    }
    if scale.kind != LayerKind::Scale || scale.src.first() != Some(&concat.name) {
        return None;
    }
    if relu.kind != LayerKind::Relu || relu.src.first() != Some(&scale.name) {
        return None;
    }
    if inside_link(src, i + 1, 2) {
        return None;
    }
    let mut layer = Layer::new(concat.name.clone(), LayerKind::Fused);
    layer.src = concat.src.clone();
    layer.dst = vec![relu.name.clone()];
    if inside_link_ext(src, i, 2, 2, &[]) {
        layer.dst.push(concat.name.clone());
    }
    layer.weight.push(scale.weight.first()?.clone());
    layer.weight.push(scale.weight.get(1)?.clone());
    layer.fused.kind = 9;
    Some(Rewrite {
        emit: vec![layer],
        advance: 3,
        ..Default::default()
    })
}

/// A per-channel affine optionally sandwiched between two linear `Power`
/// layers; either side may be missing.
pub(crate) fn merge_fused10(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    let src = ctx.src;
    let pre = src
        .get(i)
        .is_some_and(|l| l.kind == LayerKind::Power && l.power.power == 1.0);
    let scale = src.get(i + 1)?;
    if scale.kind != LayerKind::Scale || !scale.scale.bias_term {
        return None;
    }
    if pre && scale.src.first() != Some(&src[i].name) {
        return None;
    }
    let post = src.get(i + 2).is_some_and(|l| {
        l.kind == LayerKind::Power && l.power.power == 1.0 && l.src.first() == Some(&scale.name)
    });
    if !pre && !post {
        return None;
    }
    let count = 1 + usize::from(pre) + usize::from(post);
    let start = if pre { i } else { i + 1 };
    if inside_link_ext(
        src,
        start,
        count,
        0,
        &[
            LayerKind::PriorBox,
            LayerKind::PriorBoxClustered,
            LayerKind::Meta,
        ],
    ) {
        return None;
    }
    let mut layer = Layer::new(scale.name.clone(), LayerKind::Fused);
    layer.src = vec![if pre {
        src[i].src.first()?.clone()
    } else {
        scale.src.first()?.clone()
    }];
    layer.dst = vec![if post {
        src[i + 2].dst.first()?.clone()
    } else {
        scale.dst.first()?.clone()
    }];
    layer.weight.push(scale.weight.first()?.clone());
    layer.weight.push(scale.weight.get(1)?.clone());
    layer.fused.floats = vec![
        if pre { src[i].power.scale } else { 1.0 },
        if pre { src[i].power.shift } else { 0.0 },
        if post { src[i + 2].power.scale } else { 1.0 },
        if post { src[i + 2].power.shift } else { 0.0 },
    ];
    layer.fused.kind = 10;
    let mut renames: Vec<Rename> = Vec::new();
    if pre {
        renames.push((src[i].dst.first()?.clone(), layer.dst[0].clone()));
    }
    let mut emit = Vec::new();
    if !pre {
        // the layer in front of the sandwich is untouched
        emit.push(src[i].clone());
    }
    emit.push(layer);
    Some(Rewrite {
        emit,
        renames,
        advance: 2 + usize::from(post),
        ..Default::default()
    })
}

/// The hswish shape with free clamp bounds, kept as a generic fused layer.
pub(crate) fn merge_fused11(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    let src = ctx.src;
    let p0 = src.get(i)?;
    let rr = src.get(i + 1)?;
    let p2 = src.get(i + 2)?;
    let el = src.get(i + 3)?;
    if p0.kind != LayerKind::Power || p0.power.power != 1.0 || p0.power.scale != 1.0 {
        return None;
    }
    if rr.kind != LayerKind::RestrictRange || rr.src.first() != Some(&p0.name) {
        return None;
    }
    if p2.kind != LayerKind::Power
        || p2.power.power != 1.0
        || p2.power.shift != 0.0
        || p2.src.first() != Some(&rr.name)
    {
        return None;
    }
    if el.kind != LayerKind::Eltwise
        || el.src.len() != 2
        || el.src[0] != *p0.src.first()?
        || el.src[1] != p2.name
        || el.eltwise.operation != EltwiseOp::Product
    {
        return None;
    }
    if inside_link(src, i + 1, 3) {
        return None;
    }
    let mut layer = fused(&el.name, &p0.src[0], 11);
    layer.fused.floats = vec![
        p0.power.shift,
        rr.restrict_range.lower,
        rr.restrict_range.upper,
        p2.power.scale,
    ];
    Some(Rewrite {
        emit: vec![layer],
        advance: 4,
        ..Default::default()
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{Blob, Network, TensorFormat};
    use crate::optimize::{Optimizer, OptimizerOptions};
    use crate::testing::{layer, network, push_weights};

    fn run(net: &mut Network, blob: &mut Blob) {
        Optimizer::new(OptimizerOptions::default())
            .run(net, blob)
            .unwrap();
        net.validate(blob).unwrap();
    }

    fn scale2(blob: &mut Blob, name: &str, src: &str) -> Layer {
        let mut scale = layer(name, LayerKind::Scale).with_src(&[src]);
        scale.scale.bias_term = true;
        scale.scale.axis = 1;
        push_weights(blob, &mut scale, vec![2], TensorFormat::Nchw, &[1.0, 1.0]);
        push_weights(blob, &mut scale, vec![2], TensorFormat::Nchw, &[0.0, 0.0]);
        scale
    }

    #[test]
    fn fused0_strips_conv_bias_into_fused_layer() {
        let mut blob = Blob::default();
        let mut conv = layer("conv", LayerKind::Convolution).with_src(&["in"]);
        push_weights(&mut blob, &mut conv, vec![1, 1, 2, 2], TensorFormat::Nhwc, &[1.0; 4]);
        push_weights(&mut blob, &mut conv, vec![2], TensorFormat::Nchw, &[0.5, 0.5]);
        let relu = layer("relu", LayerKind::Relu).with_src(&["conv"]);
        let mut abs = layer("abs", LayerKind::UnaryOp).with_src(&["conv"]);
        abs.unary.operation = UnaryOp::Abs;
        let mut sub = layer("sub", LayerKind::BinaryOp).with_src(&["conv", "abs"]);
        sub.binary.operation = BinaryOp::Sub;
        let mut s3 = layer("s3", LayerKind::Scale).with_src(&["sub"]);
        push_weights(&mut blob, &mut s3, vec![2], TensorFormat::Nchw, &[0.5, 0.5]);
        let mut s4 = layer("s4", LayerKind::Scale).with_src(&["s3"]);
        push_weights(&mut blob, &mut s4, vec![2], TensorFormat::Nchw, &[2.0, 2.0]);
        let mut sum = layer("sum", LayerKind::Eltwise).with_src(&["relu", "s4"]);
        sum.eltwise.operation = EltwiseOp::Sum;
        let mut net = network(
            vec![layer("in", LayerKind::Input), conv, relu, abs, sub, s3, s4, sum],
            &["sum"],
        );
        run(&mut net, &mut blob);
        assert_eq!(net.layers.len(), 3);
        let conv = net.layer_by_name("conv").unwrap();
        assert!(!conv.conv.bias_term);
        assert_eq!(conv.weight.len(), 1);
        let f = net.layer_by_name("sum").unwrap();
        assert_eq!(f.kind, LayerKind::Fused);
        assert_eq!(f.fused.kind, 0);
        assert_eq!(f.src, vec!["conv"]);
        assert_eq!(f.weight.len(), 3);
        assert_eq!(blob.floats_of(&f.weight[0]), &[0.5, 0.5]);
    }

    #[test]
    fn fused2_keeps_conv_and_runs_in_place() {
        let mut blob = Blob::default();
        let mut conv = layer("conv", LayerKind::Convolution).with_src(&["in"]);
        conv.conv.bias_term = false;
        let mut bn = layer("bn", LayerKind::BatchNorm).with_src(&["conv"]);
        bn.dst = vec!["conv".into()];
        bn.batch_norm.yolo_compatible = true;
        push_weights(&mut blob, &mut bn, vec![2], TensorFormat::Nchw, &[0.0, 0.0]);
        push_weights(&mut blob, &mut bn, vec![2], TensorFormat::Nchw, &[1.0, 1.0]);
        let mut sc = scale2(&mut blob, "sc", "conv");
        sc.dst = vec!["conv".into()];
        let mut relu = layer("relu", LayerKind::Relu).with_src(&["conv"]);
        relu.dst = vec!["conv".into()];
        let mut net = network(
            vec![layer("in", LayerKind::Input), conv, bn, sc, relu],
            &["conv"],
        );
        run(&mut net, &mut blob);
        assert_eq!(net.layers.len(), 3);
        assert!(net.layer_by_name("conv").is_some());
        let f = net.layer_by_name("relu").unwrap();
        assert_eq!(f.fused.kind, 2);
        assert_eq!(f.dst, vec!["conv"]);
        assert_eq!(f.fused.floats, vec![1e-5, 0.0]);
        assert_eq!(f.weight.len(), 4);
    }

    #[test]
    fn fused6_adopts_conv_output_and_renames_consumers() {
        let mut blob = Blob::default();
        let mut conv = layer("conv", LayerKind::Convolution).with_src(&["in"]);
        conv.conv.bias_term = false;
        let sc = scale2(&mut blob, "sc", "conv");
        let relu = layer("relu", LayerKind::Relu).with_src(&["sc"]);
        let tail = layer("tail", LayerKind::Softmax).with_src(&["relu"]);
        let mut net = network(
            vec![layer("in", LayerKind::Input), conv, sc, relu, tail],
            &["tail"],
        );
        run(&mut net, &mut blob);
        assert_eq!(net.layers.len(), 4);
        let f = net.layer_by_name("relu").unwrap();
        assert_eq!(f.fused.kind, 6);
        assert_eq!(f.dst, vec!["conv"]);
        assert_eq!(net.layer_by_name("tail").unwrap().src, vec!["conv"]);
    }

    #[test]
    fn fused10_sandwich_consumes_both_powers() {
        let mut blob = Blob::default();
        let mut p0 = layer("p0", LayerKind::Power).with_src(&["in"]);
        p0.power.scale = 2.0;
        p0.power.shift = 3.0;
        let sc = scale2(&mut blob, "sc", "p0");
        let mut p2 = layer("p2", LayerKind::Power).with_src(&["sc"]);
        p2.power.scale = 4.0;
        p2.power.shift = 5.0;
        let tail = layer("tail", LayerKind::Softmax).with_src(&["p2"]);
        let mut net = network(
            vec![layer("in", LayerKind::Input), p0, sc, p2, tail],
            &["tail"],
        );
        run(&mut net, &mut blob);
        assert_eq!(net.layers.len(), 3);
        let f = net.layer_by_name("sc").unwrap();
        assert_eq!(f.fused.kind, 10);
        assert_eq!(f.src, vec!["in"]);
        assert_eq!(f.dst, vec!["p2"]);
        assert_eq!(f.fused.floats, vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn fused10_post_only_keeps_the_layer_in_front() {
        let mut blob = Blob::default();
        let anchor = layer("anchor", LayerKind::Softmax).with_src(&["in"]);
        let sc = scale2(&mut blob, "sc", "anchor");
        let mut p2 = layer("p2", LayerKind::Power).with_src(&["sc"]);
        p2.power.scale = 0.5;
        let tail = layer("tail", LayerKind::Softmax).with_src(&["p2"]);
        let mut net = network(
            vec![layer("in", LayerKind::Input), anchor, sc, p2, tail],
            &["tail"],
        );
        run(&mut net, &mut blob);
        assert!(net.layer_by_name("anchor").is_some());
        let f = net.layer_by_name("sc").unwrap();
        assert_eq!(f.fused.kind, 10);
        assert_eq!(f.src, vec!["anchor"]);
        assert_eq!(f.dst, vec!["p2"]);
        assert_eq!(f.fused.floats, vec![1.0, 0.0, 0.5, 0.0]);
        assert_eq!(net.layer_by_name("tail").unwrap().src, vec!["p2"]);
    }
}
