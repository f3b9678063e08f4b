//! Weight descriptors and the packed weight blob.

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::model::params::Shape;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorFormat {
    #[default]
    Nchw,
    Nhwc,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarKind {
    #[default]
    F32,
    I8,
    I32,
}

impl ScalarKind {
    pub fn size(self) -> usize {
        match self {
            ScalarKind::F32 | ScalarKind::I32 => 4,
            ScalarKind::I8 => 1,
        }
    }
}

/// A view into the weight blob: byte offset, byte length, logical shape.
/// Descriptors are value types; two descriptors alias iff they describe
/// the same tensor (offset equality).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightDesc {
    pub offset: usize,
    pub size: usize,
    pub dim: Shape,
    pub format: TensorFormat,
    pub scalar: ScalarKind,
}

impl WeightDesc {
    pub fn new(offset: usize, dim: Shape, format: TensorFormat) -> Self {
        let size = dim.iter().product::<usize>() * ScalarKind::F32.size();
        Self {
            offset,
            size,
            dim,
            format,
            scalar: ScalarKind::F32,
        }
    }

    /// Number of elements described.
    pub fn count(&self) -> usize {
        self.size / self.scalar.size()
    }

    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    pub fn validate(&self, blob_len: usize) -> Result<()> {
        ensure!(
            self.offset % self.scalar.size() == 0,
            "weight offset {} is not aligned to element size {}",
            self.offset,
            self.scalar.size()
        );
        ensure!(
            self.size == self.dim.iter().product::<usize>() * self.scalar.size(),
            "weight size {} does not match shape {:?}",
            self.size,
            self.dim
        );
        ensure!(
            self.end() <= blob_len,
            "weight [{}, {}) exceeds blob of {} bytes",
            self.offset,
            self.end(),
            blob_len
        );
        Ok(())
    }
}

/// The packed float weight blob. Layers reference it through byte offsets;
/// the blob itself owns the storage.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Blob {
    data: Vec<f32>,
}

impl Blob {
    pub fn new(data: Vec<f32>) -> Self {
        Self { data }
    }

    pub fn len_bytes(&self) -> usize {
        self.data.len() * 4
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// `count` floats starting at a byte offset.
    pub fn floats(&self, offset: usize, count: usize) -> &[f32] {
        let start = offset / 4;
        &self.data[start..start + count]
    }

    pub fn floats_mut(&mut self, offset: usize, count: usize) -> &mut [f32] {
        let start = offset / 4;
        &mut self.data[start..start + count]
    }

    /// The floats a descriptor points at.
    pub fn floats_of(&self, desc: &WeightDesc) -> &[f32] {
        self.floats(desc.offset, desc.count())
    }

    pub fn extend(&mut self, values: &[f32]) {
        self.data.extend_from_slice(values);
    }
}
