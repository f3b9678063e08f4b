//! Tensor-iterator subgraph passes: duplicate-port reduction and the
//! bidirectional-GRU body template.

use std::collections::HashSet;

use itertools::Itertools;

use crate::model::{Layer, LayerKind};
use crate::optimize::{Rewrite, StageCtx};

/// Stage 0: a TensorIterator whose extra inputs all duplicate its second
/// input (with matching back-edge duplicates) is collapsed to two ports;
/// body input layers made redundant are dropped and their consumers rewired.
pub(crate) fn reduce_tensor_iterator_io(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    let src = ctx.src;
    let tt = &src[i];
    if tt.kind != LayerKind::TensorIterator
        || tt.src.len() < 3
        || tt.tensor_iterator.back.is_empty()
    {
        return None;
    }
    let src_dupls = (2..tt.src.len())
        .filter(|&k| tt.src[1] == tt.src[k])
        .count();
    let back = &tt.tensor_iterator.back;
    let back_dupls = (1..back.len())
        .filter(|&k| back[0].src == back[k].src)
        .count();
    if src_dupls == 0 || src_dupls != back_dupls || src_dupls < tt.src.len() - 2 {
        return None;
    }

    let mut dtt = tt.clone();
    dtt.src.truncate(2);
    // the iterated port: the one sliced along an axis
    let iter = dtt
        .tensor_iterator
        .input
        .iter()
        .find(|c| c.axis != -1)
        .map(|c| c.dst.clone())
        .unwrap_or_default();
    // the surviving duplicate: the first non-iterated body input
    let mut rem = String::new();
    for layer in &src[i + 1..] {
        if layer.parent.as_deref() != Some(tt.name.as_str()) {
            break;
        }
        if layer.kind == LayerKind::Input && layer.name != iter {
            rem = layer.name.clone();
            break;
        }
    }

    let mut del: HashSet<String> = HashSet::new();
    let mut kept = Vec::new();
    for conn in &dtt.tensor_iterator.input {
        if conn.dst == rem || conn.dst == iter {
            let mut conn = conn.clone();
            conn.port = conn.port.min(1);
            kept.push(conn);
        } else {
            del.insert(conn.dst.clone());
        }
    }
    dtt.tensor_iterator.input = kept;
    dtt.tensor_iterator.back.retain(|c| !del.contains(&c.dst));

    let mut emit = vec![dtt];
    let mut advance = 1;
    for layer in &src[i + 1..] {
        if layer.parent.as_deref() != Some(tt.name.as_str()) {
            break;
        }
        if layer.kind != LayerKind::Input || !del.contains(&layer.name) {
            let mut layer = layer.clone();
            for s in layer.src.iter_mut() {
                if del.contains(s) {
                    *s = rem.clone();
                }
            }
            emit.push(layer);
        }
        advance += 1;
    }
    Some(Rewrite {
        emit,
        advance,
        ..Default::default()
    })
}

const RNN_GRU_BD_BODY: [LayerKind; 19] = [
    LayerKind::Input,
    LayerKind::Meta,
    LayerKind::Squeeze,
    LayerKind::Input,
    LayerKind::Concat,
    LayerKind::InnerProduct,
    LayerKind::Sigmoid,
    LayerKind::Unpack,
    LayerKind::Eltwise,
    LayerKind::Power,
    LayerKind::Eltwise,
    LayerKind::Concat,
    LayerKind::InnerProduct,
    LayerKind::UnaryOp,
    LayerKind::Eltwise,
    LayerKind::Eltwise,
    LayerKind::Stub,
    LayerKind::ExpandDims,
    LayerKind::Stub,
];

/// Stage 5: the exact nineteen-layer bidirectional-GRU step inside a
/// TensorIterator body, replaced by the two body inputs plus one RnnGruBd
/// layer carrying both inner-product weight pairs.
pub(crate) fn merge_rnn_gru_bd(ctx: &StageCtx, i: usize) -> Option<Rewrite> {
    let src = ctx.src;
    if i == 0 || i + RNN_GRU_BD_BODY.len() >= src.len() {
        return None;
    }
    let parent = &src[i - 1];
    if parent.kind != LayerKind::TensorIterator
        || parent.src.len() != 2
        || parent.dst.len() != 1
        || parent.tensor_iterator.back.len() != 1
    {
        return None;
    }
    let body = &src[i..i + RNN_GRU_BD_BODY.len()];
    if body
        .iter()
        .any(|l| l.parent.as_deref() != Some(parent.name.as_str()))
    {
        return None;
    }
    if body
        .iter()
        .zip_eq(RNN_GRU_BD_BODY.iter())
        .any(|(l, kind)| l.kind != *kind)
    {
        return None;
    }
    if body[5].weight.len() != 2 || body[12].weight.len() != 2 {
        return None;
    }
    if src[i + RNN_GRU_BD_BODY.len()].parent.is_some() {
        return None;
    }

    let mut layer = Layer::new(format!("{}_RnnGruBd", parent.name), LayerKind::RnnGruBd);
    layer.parent = Some(parent.name.clone());
    layer.src = vec![body[0].dst.first()?.clone(), body[3].dst.first()?.clone()];
    layer.dst = vec![body[18].dst.first()?.clone(), body[16].dst.first()?.clone()];
    layer.weight = vec![
        body[5].weight[0].clone(),
        body[5].weight[1].clone(),
        body[12].weight[0].clone(),
        body[12].weight[1].clone(),
    ];
    Some(Rewrite {
        emit: vec![body[0].clone(), body[3].clone(), layer],
        advance: RNN_GRU_BD_BODY.len(),
        ..Default::default()
    })
}
