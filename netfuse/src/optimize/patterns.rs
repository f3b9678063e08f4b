//! Stage 4 templates: canonical activation and shape decompositions that
//! parsers emit as multi-layer chains, collapsed here into single layers.

use crate::model::{EltwiseOp, Layer, LayerKind, ReductionOp, UnaryOp};
use crate::optimize::{Rewrite, StageCtx, approx_eq, inside_link, inside_link_ext};

/// `y = x * clamp(x + s, 0, 2s) * k`, four layers down to one Hswish.
pub(crate) fn merge_hswish(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    let src = ctx.src;
    let p0 = src.get(i)?;
    let rr = src.get(i + 1)?;
    let p2 = src.get(i + 2)?;
    let el = src.get(i + 3)?;
    if p0.kind != LayerKind::Power || p0.power.power != 1.0 || p0.power.scale != 1.0 {
        return None;
    }
    if rr.kind != LayerKind::RestrictRange
        || rr.src.first() != Some(&p0.name)
        || rr.restrict_range.lower != 0.0
    {
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
    if !approx_eq(p0.power.shift * 2.0, rr.restrict_range.upper) {
        return None;
    }
    if inside_link(src, i + 1, 3) {
        return None;
    }
    let mut layer = Layer::new(el.name.clone(), LayerKind::Hswish).with_src(&[&p0.src[0]]);
    layer.hswish.shift = p0.power.shift;
    layer.hswish.scale = p2.power.scale;
    Some(Rewrite {
        emit: vec![layer],
        advance: 4,
        ..Default::default()
    })
}

/// `y = x * tanh(log(1 + exp(x)))`, five layers down to one Mish.
pub(crate) fn merge_mish(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    let src = ctx.src;
    let exp = src.get(i)?;
    let add = src.get(i + 1)?;
    let log = src.get(i + 2)?;
    let tanh = src.get(i + 3)?;
    let el = src.get(i + 4)?;
    if exp.kind != LayerKind::UnaryOp || exp.unary.operation != UnaryOp::Exp {
        return None;
    }
    if add.kind != LayerKind::Power
        || add.power.power != 1.0
        || add.power.scale != 1.0
        || add.power.shift != 1.0
        || add.src.first() != Some(&exp.name)
    {
        return None;
    }
    if log.kind != LayerKind::UnaryOp
        || log.unary.operation != UnaryOp::Log
        || log.src.first() != Some(&add.name)
    {
        return None;
    }
    if tanh.kind != LayerKind::UnaryOp
        || tanh.unary.operation != UnaryOp::Tanh
        || tanh.src.first() != Some(&log.name)
    {
        return None;
    }
    if el.kind != LayerKind::Eltwise
        || el.src.len() != 2
        || el.src[0] != *exp.src.first()?
        || el.src[1] != tanh.name
        || el.eltwise.operation != EltwiseOp::Product
    {
        return None;
    }
    if inside_link(src, i + 1, 4) {
        return None;
    }
    let layer = Layer::new(el.name.clone(), LayerKind::Mish).with_src(&[&exp.src[0]]);
    Some(Rewrite {
        emit: vec![layer],
        advance: 5,
        ..Default::default()
    })
}

/// `max(x, a * x)` with all slopes inside [-1, 1] becomes Prelu. The slope
/// vector is read from the blob to verify the side conditions.
pub(crate) fn merge_prelu(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    let src = ctx.src;
    let scale = src.get(i)?;
    let el = src.get(i + 1)?;
    if scale.kind != LayerKind::Scale {
        return None;
    }
    if el.kind != LayerKind::Eltwise
        || el.src.len() != 2
        || el.src[1] != *scale.src.first()?
        || el.src[0] != scale.name
        || el.eltwise.operation != EltwiseOp::Max
    {
        return None;
    }
    if inside_link(src, i + 1, 1) {
        return None;
    }
    let slopes = scale.weight.first()?;
    if slopes.end() > ctx.blob.len_bytes() {
        return None;
    }
    if ctx
        .blob
        .floats_of(slopes)
        .iter()
        .any(|&s| !(-1.0..=1.0).contains(&s))
    {
        return None;
    }
    if let Some(shift) = scale.weight.get(1) {
        if shift.end() > ctx.blob.len_bytes() {
            return None;
        }
        if ctx.blob.floats_of(shift).iter().any(|&s| s != 0.0) {
            return None;
        }
    }
    let mut layer = Layer::new(el.name.clone(), LayerKind::Prelu).with_src(&[&scale.src[0]]);
    layer.prelu.axis = scale.scale.axis;
    layer.weight.push(slopes.clone());
    Some(Rewrite {
        emit: vec![layer],
        advance: 2,
        ..Default::default()
    })
}

/// The numerically stable softmax decomposition:
/// `exp(x - max(x)) / sum(exp(x - max(x)))` along one axis.
pub(crate) fn merge_softmax(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    if i == 0 {
        return None;
    }
    let src = ctx.src;
    let rmax = src.get(i)?;
    let sub = src.get(i + 1)?;
    let exp = src.get(i + 2)?;
    let rsum = src.get(i + 3)?;
    let div = src.get(i + 4)?;
    if rmax.kind != LayerKind::Reduction
        || rmax.reduction.operation != ReductionOp::Max
        || rmax.reduction.axis.len() != 1
    {
        return None;
    }
    if sub.kind != LayerKind::BinaryOp
        || sub.binary.operation != crate::model::BinaryOp::Sub
        || sub.src.first() != rmax.src.first()
        || sub.src.get(1) != Some(&rmax.name)
    {
        return None;
    }
    if exp.kind != LayerKind::UnaryOp
        || exp.unary.operation != UnaryOp::Exp
        || exp.src.first() != Some(&sub.name)
    {
        return None;
    }
    if rsum.kind != LayerKind::Reduction
        || rsum.reduction.operation != ReductionOp::Sum
        || rsum.reduction.axis != rmax.reduction.axis
        || rsum.src.first() != Some(&exp.name)
    {
        return None;
    }
    if div.kind != LayerKind::BinaryOp
        || div.binary.operation != crate::model::BinaryOp::Div
        || div.src.first() != Some(&exp.name)
        || div.src.get(1) != Some(&rsum.name)
    {
        return None;
    }
    if inside_link(src, i, 5) {
        return None;
    }
    let mut layer = Layer::new(div.name.clone(), LayerKind::Softmax).with_src(&[rmax.src.first()?]);
    layer.softmax.axis = rmax.reduction.axis[0];
    Some(Rewrite {
        emit: vec![layer],
        advance: 5,
        ..Default::default()
    })
}

/// Channel shuffle written as concat / reshape / permute / unpack / reshapes.
pub(crate) fn merge_shuffle0(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    let src = ctx.src;
    let concat = src.get(i)?;
    let r1 = src.get(i + 1)?;
    let perm = src.get(i + 2)?;
    let unpack = src.get(i + 3)?;
    let r4 = src.get(i + 4)?;
    let r5 = src.get(i + 5)?;
    if concat.kind != LayerKind::Concat || concat.src.len() != 2 {
        return None;
    }
    if r1.kind != LayerKind::Reshape || r1.reshape.shape.len() != 3 {
        return None;
    }
    if perm.kind != LayerKind::Permute {
        return None;
    }
    if unpack.kind != LayerKind::Unpack || unpack.dst.len() != 2 {
        return None;
    }
    if r4.kind != LayerKind::Reshape || r4.reshape.shape.len() as i64 + r4.reshape.axis != 4 {
        return None;
    }
    if r5.kind != LayerKind::Reshape || r5.reshape.shape.len() as i64 + r5.reshape.axis != 4 {
        return None;
    }
    if inside_link_ext(src, i, 4, 1, &[]) {
        return None;
    }
    let mut layer = Layer::new(concat.name.clone(), LayerKind::Shuffle);
    layer.src = concat.src.clone();
    layer.shuffle.kind = 0;
    layer.dst = vec![r4.dst.first()?.clone(), r5.dst.first()?.clone()];
    Some(Rewrite {
        emit: vec![layer],
        advance: 6,
        ..Default::default()
    })
}

/// The other shuffle spelling, ending in a two-output unpack.
pub(crate) fn merge_shuffle1(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    let src = ctx.src;
    let concat = src.get(i)?;
    let r1 = src.get(i + 1)?;
    let perm = src.get(i + 2)?;
    let r3 = src.get(i + 3)?;
    let unpack = src.get(i + 4)?;
    if concat.kind != LayerKind::Concat || concat.src.len() != 2 {
        return None;
    }
    if r1.kind != LayerKind::Reshape || r1.reshape.shape.len() != 4 {
        return None;
    }
    if perm.kind != LayerKind::Permute {
        return None;
    }
    if r3.kind != LayerKind::Reshape || r3.reshape.shape.len() != 3 {
        return None;
    }
    if unpack.kind != LayerKind::Unpack || unpack.dst.len() != 2 {
        return None;
    }
    if inside_link_ext(src, i, 4, 0, &[]) {
        return None;
    }
    let mut layer = Layer::new(concat.name.clone(), LayerKind::Shuffle);
    layer.src = concat.src.clone();
    layer.shuffle.kind = 1;
    layer.dst = vec![unpack.dst[0].clone(), unpack.dst[1].clone()];
    Some(Rewrite {
        emit: vec![layer],
        advance: 5,
        ..Default::default()
    })
}

/// Two one-dimensional pools separated by reshapes collapse into a single
/// two-dimensional pool.
pub(crate) fn merge_pooling(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    let src = ctx.src;
    let r0 = src.get(i)?;
    let p1 = src.get(i + 1)?;
    let r2 = src.get(i + 2)?;
    let r3 = src.get(i + 3)?;
    let p4 = src.get(i + 4)?;
    if r0.kind != LayerKind::Reshape {
        return None;
    }
    if p1.kind != LayerKind::Pooling
        || p1.src.first() != Some(&r0.name)
        || p1.pooling.kernel.get(1) != Some(&1)
    {
        return None;
    }
    if r2.kind != LayerKind::Reshape || r2.src.first() != Some(&p1.name) {
        return None;
    }
    if r3.kind != LayerKind::Reshape || r3.src.first() != Some(&r2.name) {
        return None;
    }
    if p4.kind != LayerKind::Pooling
        || p4.src.first() != Some(&r3.name)
        || p4.pooling.kernel.get(1) != Some(&1)
    {
        return None;
    }
    if inside_link(src, i + 1, 4) {
        return None;
    }
    let mut layer = Layer::new(p4.name.clone(), LayerKind::Pooling).with_src(&[r0.src.first()?]);
    layer.pooling.method = p4.pooling.method;
    layer.pooling.kernel = vec![p1.pooling.kernel[0], p4.pooling.kernel[0]];
    layer.pooling.pad = p4.pooling.pad.clone();
    layer.pooling.stride = p4.pooling.stride.clone();
    layer.pooling.exclude_pad = p4.pooling.exclude_pad;
    Some(Rewrite {
        emit: vec![layer],
        advance: 5,
        ..Default::default()
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{Blob, Network, PoolingMethod, TensorFormat};
    use crate::optimize::{Optimizer, OptimizerOptions};
    use crate::testing::{layer, network, push_weights};

    fn run(net: &mut Network, blob: &mut Blob) {
        Optimizer::new(OptimizerOptions::default())
            .run(net, blob)
            .unwrap();
        net.validate(blob).unwrap();
    }

    fn prelu_chain(blob: &mut Blob, slopes: &[f32], shift: Option<&[f32]>) -> Vec<Layer> {
        let mut scale = layer("sc", LayerKind::Scale).with_src(&["in"]);
        push_weights(blob, &mut scale, vec![slopes.len()], TensorFormat::Nchw, slopes);
        if let Some(shift) = shift {
            push_weights(blob, &mut scale, vec![shift.len()], TensorFormat::Nchw, shift);
        }
        let mut el = layer("el", LayerKind::Eltwise).with_src(&["sc", "in"]);
        el.eltwise.operation = EltwiseOp::Max;
        vec![layer("in", LayerKind::Input), scale, el]
    }

    #[test]
    fn prelu_template_fuses_bounded_slopes() {
        let mut blob = Blob::default();
        let mut net = network(prelu_chain(&mut blob, &[0.1, -0.5], None), &["el"]);
        run(&mut net, &mut blob);
        assert_eq!(net.layers.len(), 2);
        let prelu = net.layer_by_name("el").unwrap();
        assert_eq!(prelu.kind, LayerKind::Prelu);
        assert_eq!(prelu.src, vec!["in"]);
        assert_eq!(blob.floats_of(&prelu.weight[0]), &[0.1, -0.5]);
    }

    #[test]
    fn prelu_template_rejects_out_of_range_slope() {
        let mut blob = Blob::default();
        let mut net = network(prelu_chain(&mut blob, &[1.5, 0.0], None), &["el"]);
        run(&mut net, &mut blob);
        assert_eq!(net.layers.len(), 3);
        assert!(net.layer_by_name("sc").is_some());
    }

    #[test]
    fn prelu_template_rejects_nonzero_shift() {
        let mut blob = Blob::default();
        let mut net = network(
            prelu_chain(&mut blob, &[0.5, 0.5], Some(&[0.0, 0.25])),
            &["el"],
        );
        run(&mut net, &mut blob);
        assert_eq!(net.layers.len(), 3);
    }

    #[test]
    fn mish_template_collapses_five_layers() {
        let mut blob = Blob::default();
        let mut exp = layer("exp", LayerKind::UnaryOp).with_src(&["in"]);
        exp.unary.operation = UnaryOp::Exp;
        let mut add = layer("add", LayerKind::Power).with_src(&["exp"]);
        add.power.shift = 1.0;
        let mut log = layer("log", LayerKind::UnaryOp).with_src(&["add"]);
        log.unary.operation = UnaryOp::Log;
        let mut tanh = layer("tanh", LayerKind::UnaryOp).with_src(&["log"]);
        tanh.unary.operation = UnaryOp::Tanh;
        let mut el = layer("el", LayerKind::Eltwise).with_src(&["in", "tanh"]);
        el.eltwise.operation = EltwiseOp::Product;
        let mut net = network(
            vec![layer("in", LayerKind::Input), exp, add, log, tanh, el],
            &["el"],
        );
        run(&mut net, &mut blob);
        assert_eq!(net.layers.len(), 2);
        let mish = net.layer_by_name("el").unwrap();
        assert_eq!(mish.kind, LayerKind::Mish);
        assert_eq!(mish.src, vec!["in"]);
    }

    #[test]
    fn shuffle1_yields_two_output_shuffle() {
        let mut blob = Blob::default();
        let concat = layer("concat", LayerKind::Concat).with_src(&["a", "b"]);
        let mut r1 = layer("r1", LayerKind::Reshape).with_src(&["concat"]);
        r1.reshape.shape = vec![1, 2, 3, 4];
        let perm = layer("perm", LayerKind::Permute).with_src(&["r1"]);
        let mut r3 = layer("r3", LayerKind::Reshape).with_src(&["perm"]);
        r3.reshape.shape = vec![1, 2, 3];
        let mut unpack = layer("unpack", LayerKind::Unpack).with_src(&["r3"]);
        unpack.dst = vec!["u0".into(), "u1".into()];
        let mut net = network(
            vec![
                layer("a", LayerKind::Input),
                layer("b", LayerKind::Input),
                concat,
                r1,
                perm,
                r3,
                unpack,
            ],
            &["u0", "u1"],
        );
        run(&mut net, &mut blob);
        assert_eq!(net.layers.len(), 3);
        let shuffle = net.layer_by_name("concat").unwrap();
        assert_eq!(shuffle.kind, LayerKind::Shuffle);
        assert_eq!(shuffle.shuffle.kind, 1);
        assert_eq!(shuffle.dst, vec!["u0", "u1"]);
        assert_eq!(shuffle.src, vec!["a", "b"]);
    }

    #[test]
    fn pooling_cluster_becomes_two_dimensional_pool() {
        let mut blob = Blob::default();
        let r0 = layer("r0", LayerKind::Reshape).with_src(&["in"]);
        let mut p1 = layer("p1", LayerKind::Pooling).with_src(&["r0"]);
        p1.pooling.kernel = vec![4, 1];
        let r2 = layer("r2", LayerKind::Reshape).with_src(&["p1"]);
        let r3 = layer("r3", LayerKind::Reshape).with_src(&["r2"]);
        let mut p4 = layer("p4", LayerKind::Pooling).with_src(&["r3"]);
        p4.pooling.kernel = vec![5, 1];
        p4.pooling.method = PoolingMethod::Average;
        p4.pooling.stride = vec![1, 1];
        let mut net = network(
            vec![layer("in", LayerKind::Input), r0, p1, r2, r3, p4],
            &["p4"],
        );
        run(&mut net, &mut blob);
        assert_eq!(net.layers.len(), 2);
        let pool = net.layer_by_name("p4").unwrap();
        assert_eq!(pool.kind, LayerKind::Pooling);
        assert_eq!(pool.pooling.kernel, vec![4, 5]);
        assert_eq!(pool.pooling.method, PoolingMethod::Average);
        assert_eq!(pool.src, vec!["in"]);
    }
}
