//! Int8 weight quantization.
//!
//! Calibration is assumed complete: every tensor the engine quantizes has a
//! [`TensorStats`] record with per-channel ranges. This module turns float
//! convolution weights into per-output-channel int8 weights plus the integer
//! and float conversion parameters the executor applies around the int8 gemm.

use anyhow::{Result, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::model::{QuantizationMethod, TensorFormat};

/// IE-compatible mode: full-range u8 sources, full-range i8 weights.
pub const IE_COMPAT_SRC_U8_MAX: i32 = 255;
pub const IE_COMPAT_WEIGHT_MIN: i32 = -128;
pub const IE_COMPAT_WEIGHT_MAX: i32 = 127;

/// Narrowed mode: ranges chosen so that two source-by-weight products fit a
/// 16-bit accumulator (180 * 90 * 2 < 32768).
pub const SYMM_NARROWED_SRC_U8_MAX: i32 = 180;
pub const SYMM_NARROWED_WEIGHT_MIN: i32 = -90;
pub const SYMM_NARROWED_WEIGHT_MAX: i32 = 90;

const BIAS_GUARD: f32 = (128 * 256 * 256) as f32;

/// Round half away from zero, as the executor's integer kernels expect.
pub fn round_half_away(value: f32) -> i32 {
    if value >= 0.0 {
        (value + 0.5) as i32
    } else {
        (value - 0.5) as i32
    }
}

fn convert_to_8i(value: f32, scale: f32, lo: i32, up: i32) -> i8 {
    round_half_away(value * scale).clamp(lo, up) as i8
}

fn weight_range(method: QuantizationMethod) -> (i32, i32) {
    match method {
        QuantizationMethod::SymmetricNarrowed => (SYMM_NARROWED_WEIGHT_MIN, SYMM_NARROWED_WEIGHT_MAX),
        _ => (IE_COMPAT_WEIGHT_MIN, IE_COMPAT_WEIGHT_MAX),
    }
}

/// Per-tensor calibration statistics, keyed by layer name (fused layers keep
/// their pre-fusion keys in `origin`). `min`/`max` come from the calibration
/// collaborator; the u8 mapping is derived on demand.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TensorStats {
    pub min: Vec<f32>,
    pub max: Vec<f32>,
    /// f32 -> u8 multiplier, per channel.
    pub scale_to_u8: Vec<f32>,
    /// u8 -> f32 multiplier, the exact reciprocal.
    pub scale_to_f32: Vec<f32>,
    /// f32 -> u8 additive term (the zero point, as a float).
    pub shift_to_u8: Vec<f32>,
    /// u8 -> f32 additive term.
    pub shift_to_f32: Vec<f32>,
    pub zero: Vec<u8>,
    /// True when the observed range spans both signs.
    pub negative: bool,
}

impl TensorStats {
    pub fn from_min_max(min: Vec<f32>, max: Vec<f32>) -> Self {
        Self {
            min,
            max,
            ..Default::default()
        }
    }

    /// Derive the u8 mapping from the observed ranges. Idempotent.
    ///
    /// IE-compatible mode maps `[min(0,min), max(0,max)]` onto 0..255 with a
    /// rounded zero point; narrowed mode maps symmetric ranges onto 0..180
    /// around a zero point of 90 (or 0..180 from zero when the tensor never
    /// goes negative).
    pub fn init_8u(&mut self, method: QuantizationMethod) {
        if !self.scale_to_u8.is_empty() {
            return;
        }
        self.negative = self.min.iter().any(|&m| m < 0.0);
        for i in 0..self.min.len() {
            let (scale, zero) = match method {
                QuantizationMethod::SymmetricNarrowed => {
                    if self.negative {
                        let abs = self.min[i].abs().max(self.max[i].abs());
                        (non_zero(abs / 90.0), 90.0)
                    } else {
                        (non_zero(self.max[i].max(0.0) / 180.0), 0.0)
                    }
                }
                _ => {
                    let lo = self.min[i].min(0.0);
                    let hi = self.max[i].max(0.0);
                    let scale = non_zero((hi - lo) / 255.0);
                    let zero = (round_half_away(-lo / scale)).clamp(0, 255) as f32;
                    (scale, zero)
                }
            };
            self.scale_to_f32.push(scale);
            self.scale_to_u8.push(1.0 / scale);
            self.shift_to_u8.push(zero);
            self.shift_to_f32.push(-zero * scale);
            self.zero.push(zero as u8);
        }
    }

    pub fn channels(&self) -> usize {
        self.min.len()
    }
}

fn non_zero(scale: f32) -> f32 {
    if scale == 0.0 { 1.0 } else { scale }
}

/// Geometry of the convolution being quantized. `kernel` is the number of
/// spatial kernel positions (`ky * kx`).
#[derive(Clone, Copy, Debug)]
pub struct ConvGeometry {
    pub src_c: usize,
    pub dst_c: usize,
    pub kernel: usize,
    pub group: usize,
    pub format: TensorFormat,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct QuantizeOptions {
    /// Normalize weights by dividing by the f32->u8 scale instead of
    /// multiplying by its reciprocal. Reproduces the historical rounding.
    pub legacy_input_round: bool,
}

/// Output of [`quantize_convolution`]: int8 weights in the source layout,
/// the `norm` array of per-channel multipliers followed by quantized biases,
/// and the per-channel conversion the executor applies to the accumulator.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantizedConv {
    pub weight: Vec<i8>,
    /// Length `2 * dst_c`: multipliers, then bias terms.
    pub norm: Vec<i32>,
    pub out_scale: Vec<f32>,
    pub out_shift: Vec<f32>,
}

/// Quantize one convolution to int8 weights with per-output-channel scales.
///
/// For every output channel the weights are first normalized by the source
/// channel scale, then mapped symmetrically onto the method's weight range.
/// The bias compensates the asymmetric source zero point
/// (`normB = -sum(wQ * shift_src)`). When the source spans both signs in
/// IE-compatible mode, weights are forced even and halved so that the 16-bit
/// accumulator cannot overflow; the per-channel multiplier becomes 2.
pub fn quantize_convolution(
    geom: &ConvGeometry,
    weights: &[f32],
    bias: Option<&[f32]>,
    src_stats: &TensorStats,
    dst_stats: &TensorStats,
    method: QuantizationMethod,
    dst_8u: bool,
    opts: &QuantizeOptions,
) -> Result<QuantizedConv> {
    if method == QuantizationMethod::Unknown {
        bail!("cannot quantize weights without a quantization method");
    }
    let groups = geom.group;
    ensure!(
        groups > 0 && geom.src_c % groups == 0 && geom.dst_c % groups == 0,
        "group {} does not divide channels {}x{}",
        groups,
        geom.src_c,
        geom.dst_c
    );
    let c_per_g = geom.src_c / groups;
    let d_per_g = geom.dst_c / groups;
    let k = geom.kernel;
    ensure!(
        weights.len() == k * c_per_g * geom.dst_c,
        "weight count {} does not match geometry",
        weights.len()
    );
    ensure!(
        src_stats.channels() >= geom.src_c && src_stats.zero.len() >= geom.src_c,
        "source statistics cover {} of {} channels",
        src_stats.channels(),
        geom.src_c
    );
    if dst_8u {
        ensure!(
            dst_stats.zero.len() >= geom.dst_c,
            "destination statistics cover {} of {} channels",
            dst_stats.zero.len(),
            geom.dst_c
        );
    }
    if let Some(b) = bias {
        ensure!(b.len() == geom.dst_c, "bias count {} != dst_c", b.len());
    }

    let (w_lo, w_up) = weight_range(method);
    let avoid_overflow = src_stats.negative && method == QuantizationMethod::IECompatible;
    let trans = geom.format == TensorFormat::Nhwc;

    let mut out = QuantizedConv {
        weight: vec![0; weights.len()],
        norm: vec![0; 2 * geom.dst_c],
        out_scale: vec![0.0; geom.dst_c],
        out_shift: vec![0.0; geom.dst_c],
    };
    let mut norm_w = vec![0.0f32; c_per_g * k];

    for g in 0..groups {
        for d in 0..d_per_g {
            let gd = g * d_per_g + d;
            // (in-group flat index, global weight index, global source channel)
            let position = |slot: usize| -> (usize, usize) {
                if trans {
                    // layout [ky*kx, srcC/group, dstC], slot = k * C + c
                    let c = slot % c_per_g;
                    (slot * geom.dst_c + gd, g * c_per_g + c)
                } else {
                    // layout [dstC, srcC/group, ky*kx], slot = c * K + k
                    let c = slot / k;
                    (gd * c_per_g * k + slot, g * c_per_g + c)
                }
            };
            let mut min_w = f32::MAX;
            let mut max_w = f32::MIN;
            for slot in 0..c_per_g * k {
                let (widx, c) = position(slot);
                norm_w[slot] = if opts.legacy_input_round {
                    weights[widx] / src_stats.scale_to_u8[c]
                } else {
                    weights[widx] * src_stats.scale_to_f32[c]
                };
                min_w = min_w.min(norm_w[slot]);
                max_w = max_w.max(norm_w[slot]);
            }
            let mut abs = max_w.abs().max(min_w.abs());
            if let Some(b) = bias {
                abs = abs.max(b[gd].abs() / BIAS_GUARD);
            }
            let scale = w_up as f32 / non_zero(abs);
            let mut norm_b = 0.0f32;
            for slot in 0..c_per_g * k {
                let (widx, c) = position(slot);
                if avoid_overflow {
                    let mut w = convert_to_8i(norm_w[slot], scale, w_lo, w_up) as i32;
                    if w & 1 != 0 {
                        w = round_half_away(w as f32 * 0.25) * 4;
                    }
                    out.weight[widx] = (w / 2) as i8;
                    norm_b -= w as f32 * src_stats.shift_to_u8[c];
                } else {
                    let q = convert_to_8i(norm_w[slot], scale, w_lo, w_up);
                    out.weight[widx] = q;
                    norm_b -= q as f32 * src_stats.shift_to_u8[c];
                }
            }
            out.norm[gd] = if avoid_overflow { 2 } else { 1 };
            if let Some(b) = bias {
                norm_b += b[gd] * scale;
            }
            out.norm[geom.dst_c + gd] = round_half_away(norm_b);
            if dst_8u {
                out.out_scale[gd] = (1.0 / scale) * dst_stats.scale_to_u8[gd];
                out.out_shift[gd] = -dst_stats.shift_to_f32[gd] / dst_stats.scale_to_f32[gd];
            } else {
                out.out_scale[gd] = 1.0 / scale;
                out.out_shift[gd] = 0.0;
            }
        }
    }
    Ok(out)
}

/// Float-norm quantization of one dense (group == 1, channel-last) member of
/// a merged convolution. The depthwise member stays float, so the conversion
/// parameters here are floats applied when leaving the int8 stage.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantizedDense {
    pub weight: Vec<i8>,
    pub norm: Vec<f32>,
    pub bias: Vec<f32>,
}

pub fn quantize_dense_convolution(
    src_c: usize,
    dst_c: usize,
    kernel: usize,
    weights: &[f32],
    bias: Option<&[f32]>,
    src_stats: &TensorStats,
    method: QuantizationMethod,
) -> Result<QuantizedDense> {
    if method == QuantizationMethod::Unknown {
        bail!("cannot quantize weights without a quantization method");
    }
    ensure!(
        weights.len() == kernel * src_c * dst_c,
        "weight count {} does not match {}x{}x{}",
        weights.len(),
        kernel,
        src_c,
        dst_c
    );
    ensure!(
        src_stats.channels() >= src_c,
        "source statistics cover {} of {} channels",
        src_stats.channels(),
        src_c
    );
    let (w_lo, w_up) = weight_range(method);
    let avoid_overflow = src_stats.negative && method == QuantizationMethod::IECompatible;

    let mut out = QuantizedDense {
        weight: vec![0; weights.len()],
        norm: vec![0.0; dst_c],
        bias: vec![0.0; dst_c],
    };
    let mut norm_w = vec![0.0f32; kernel * src_c];
    for d in 0..dst_c {
        let mut min_w = f32::MAX;
        let mut max_w = f32::MIN;
        for slot in 0..kernel * src_c {
            let c = slot % src_c;
            norm_w[slot] = weights[slot * dst_c + d] / src_stats.scale_to_u8[c];
            min_w = min_w.min(norm_w[slot]);
            max_w = max_w.max(norm_w[slot]);
        }
        let scale = w_up as f32 / non_zero(max_w.abs().max(min_w.abs()));
        let mut norm_b = 0.0f32;
        for slot in 0..kernel * src_c {
            let c = slot % src_c;
            if avoid_overflow {
                let mut w = convert_to_8i(norm_w[slot], scale, w_lo, w_up) as i32;
                if w & 1 != 0 {
                    w = round_half_away(w as f32 * 0.25) * 4;
                }
                out.weight[slot * dst_c + d] = (w / 2) as i8;
                norm_b -= w as f32 * src_stats.shift_to_u8[c];
            } else {
                let q = convert_to_8i(norm_w[slot], scale, w_lo, w_up);
                out.weight[slot * dst_c + d] = q;
                norm_b -= q as f32 * src_stats.shift_to_u8[c];
            }
        }
        let mult = if avoid_overflow { 2.0f32 } else { 1.0 };
        out.norm[d] = mult / scale;
        out.bias[d] = bias.map_or(0.0, |b| b[d]) + norm_b / scale;
    }
    Ok(out)
}
