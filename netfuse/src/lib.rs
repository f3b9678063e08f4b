//! Graph optimizer for the inference engine.
//!
//! The optimizer consumes a parsed network description plus its packed
//! weight blob and produces a semantically equivalent graph with fused,
//! canonicalized layers and a possibly rewritten blob. It runs offline
//! during model preparation, single threaded, with exclusive access to both
//! inputs.
//!
//! ```
//! use netfuse::{Blob, Network, Optimizer, OptimizerOptions};
//!
//! let mut network = Network::default();
//! let mut blob = Blob::default();
//! Optimizer::new(OptimizerOptions::default())
//!     .run(&mut network, &mut blob)
//!     .unwrap();
//! ```

pub mod model;
pub mod optimize;
pub mod quantization;
#[cfg(test)]
pub mod testing;

pub use model::{Blob, Layer, LayerKind, Network, QuantizationMethod};
pub use optimize::{Optimizer, OptimizerOptions};
