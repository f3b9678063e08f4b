//! Builders shared by the test suite.

use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::model::{Blob, Layer, LayerKind, Network, Shape, TensorFormat, WeightDesc};

pub fn layer(name: &str, kind: LayerKind) -> Layer {
    Layer::new(name, kind)
}

/// Append float weights at the blob tail and attach the descriptor.
pub fn push_weights(
    blob: &mut Blob,
    layer: &mut Layer,
    dim: Shape,
    format: TensorFormat,
    values: &[f32],
) {
    assert_eq!(dim.iter().product::<usize>(), values.len());
    let desc = WeightDesc::new(blob.len_bytes(), dim, format);
    blob.extend(values);
    layer.weight.push(desc);
}

pub fn network(layers: Vec<Layer>, outputs: &[&str]) -> Network {
    Network {
        layers,
        dst: outputs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

pub fn random_floats(n: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect()
}
