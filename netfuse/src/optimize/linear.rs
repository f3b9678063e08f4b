//! Linear-algebra folds: weight transposition, trailing-bias absorption and
//! per-channel scale baking. These run early so the later activation and
//! convolution fusions see already-biased layers.

use crate::model::{LayerKind, TensorFormat};
use crate::optimize::{Rewrite, StageCtx, WeightEdit, inside_link};

/// Stage 1: rewrite `InnerProduct(transposeB = true)` into standard layout by
/// materially transposing the weight matrix in the blob.
pub(crate) fn transpose_inner_product(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    let ip = &ctx.src[i];
    if ip.kind != LayerKind::InnerProduct || !ip.inner_product.transpose_b {
        return None;
    }
    let desc = ip.weight.first()?;
    if desc.dim.len() != 2 || desc.end() > ctx.blob.len_bytes() {
        return None;
    }
    let (rows, cols) = (desc.dim[0], desc.dim[1]);
    let mut out = ip.clone();
    out.inner_product.transpose_b = false;
    out.weight[0].dim = vec![cols, rows];
    Some(Rewrite {
        take_back: 0,
        emit: vec![out],
        edits: vec![WeightEdit::Transpose {
            offset: desc.offset,
            rows,
            cols,
        }],
        renames: Vec::new(),
        advance: 1,
    })
}

/// Stage 2: fold a trailing `Bias` into the layer producing its input.
/// A biasless Convolution, InnerProduct or Scale simply gains the bias
/// weights; a parameter-only `Power(power = 1, shift = 0)` is upgraded to a
/// Scale whose multiplier vector is materialized at the blob tail.
pub(crate) fn merge_current_and_bias(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    if i == 0 {
        return None;
    }
    let current = &ctx.src[i - 1];
    let bias = &ctx.src[i];
    if bias.kind != LayerKind::Bias || bias.src.first() != Some(&current.name) {
        return None;
    }
    if inside_link(ctx.src, i - 1, 2) {
        return None;
    }
    let bias_weight = bias.weight.first()?;
    let mut out = ctx.last_emitted()?.clone();
    let mut edits = Vec::new();
    match current.kind {
        LayerKind::Convolution => {
            if current.conv.bias_term {
                return None;
            }
            out.conv.bias_term = true;
        }
        LayerKind::InnerProduct => {
            if current.inner_product.bias_term {
                return None;
            }
            out.inner_product.bias_term = true;
        }
        LayerKind::Power => {
            if current.power.power != 1.0 || current.power.shift != 0.0 {
                return None;
            }
            out.kind = LayerKind::Scale;
            out.scale.bias_term = true;
            let mut scale_weight = bias_weight.clone();
            scale_weight.offset = ctx.blob_end;
            let channels = *scale_weight.dim.first()?;
            out.weight.push(scale_weight);
            edits.push(WeightEdit::Append {
                values: vec![current.power.scale; channels],
            });
            out.power.scale = 1.0;
        }
        LayerKind::Scale => {
            if current.scale.bias_term {
                return None;
            }
            out.scale.bias_term = true;
        }
        _ => return None,
    }
    out.name = bias.name.clone();
    out.dst = bias.dst.clone();
    out.weight.push(bias_weight.clone());
    Some(Rewrite {
        take_back: 1,
        emit: vec![out],
        edits,
        renames: Vec::new(),
        advance: 1,
    })
}

/// Stage 3: absorb a per-output-channel `Scale` into the preceding
/// convolution's weights. Only legal when the convolution has no bias, an
/// identity activation and channel-last weights.
pub(crate) fn merge_convolution_and_scale(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    if i == 0 {
        return None;
    }
    let conv = &ctx.src[i - 1];
    let scale = &ctx.src[i];
    if conv.kind != LayerKind::Convolution
        || conv.conv.bias_term
        || conv.conv.activation != crate::model::ActivationKind::Identity
    {
        return None;
    }
    if scale.kind != LayerKind::Scale || scale.src.first() != Some(&conv.name) {
        return None;
    }
    if inside_link(ctx.src, i - 1, 2) {
        return None;
    }
    let weights = conv.weight.first()?;
    if weights.format != TensorFormat::Nhwc || weights.dim.len() != 4 {
        return None;
    }
    let scale_weight = scale.weight.first()?;
    if weights.end() > ctx.blob.len_bytes()
        || scale_weight.end() > ctx.blob.len_bytes()
        || scale_weight.count() < weights.dim[3]
    {
        return None;
    }
    let mut out = ctx.last_emitted()?.clone();
    out.name = scale.name.clone();
    out.dst = scale.dst.clone();
    if scale.scale.bias_term {
        out.conv.bias_term = true;
        out.weight.push(scale.weight.get(1)?.clone());
    }
    let dim = &weights.dim;
    Some(Rewrite {
        take_back: 1,
        emit: vec![out],
        edits: vec![WeightEdit::ScaleChannelsLast {
            offset: weights.offset,
            count: dim[0] * dim[1] * dim[2],
            channels: dim[3],
            scale_offset: scale_weight.offset,
        }],
        renames: Vec::new(),
        advance: 1,
    })
}

/// Stage 3: the inner-product variant; rows of the weight matrix are scaled
/// by the per-output vector.
pub(crate) fn merge_inner_product_and_scale(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    if i == 0 {
        return None;
    }
    let ip = &ctx.src[i - 1];
    let scale = &ctx.src[i];
    if ip.kind != LayerKind::InnerProduct
        || ip.inner_product.bias_term
        || ip.inner_product.transpose_b
    {
        return None;
    }
    if scale.kind != LayerKind::Scale || scale.src.first() != Some(&ip.name) {
        return None;
    }
    if inside_link(ctx.src, i - 1, 2) {
        return None;
    }
    let weights = ip.weight.first()?;
    if weights.dim.len() != 2 {
        return None;
    }
    let scale_weight = scale.weight.first()?;
    if weights.end() > ctx.blob.len_bytes()
        || scale_weight.end() > ctx.blob.len_bytes()
        || scale_weight.count() < weights.dim[0]
    {
        return None;
    }
    let mut out = ctx.last_emitted()?.clone();
    out.name = scale.name.clone();
    out.dst = scale.dst.clone();
    if scale.scale.bias_term {
        out.inner_product.bias_term = true;
        out.weight.push(scale.weight.get(1)?.clone());
    }
    Some(Rewrite {
        take_back: 1,
        emit: vec![out],
        edits: vec![WeightEdit::ScaleChannelsFirst {
            offset: weights.offset,
            channels: weights.dim[0],
            inner: weights.dim[1],
            scale_offset: scale_weight.offset,
        }],
        renames: Vec::new(),
        advance: 1,
    })
}
