//! Inference engines that turn a batch of normalized patches into output patches.

pub mod backend;
pub mod onnx;

use anyhow::Result;
use ndarray::{Array4, ArrayView4};

pub use backend::{build_session, InferenceBackend, SessionConfig};
pub use onnx::{OnnxEngine, OnnxEngineConfig, TensorLayout};

/// A model that maps an NHWC batch in its input range to an NHWC batch in its
/// output range.
///
/// Implementations must return exactly one output patch per input patch, in
/// the same order and with the same spatial size.
pub trait InferenceEngine {
    fn name(&self) -> &str;

    fn infer(&mut self, batch: ArrayView4<'_, f32>) -> Result<Array4<f32>>;
}

/// Returns its input unchanged. Useful for dry runs of the tiling path.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityEngine;

impl InferenceEngine for IdentityEngine {
    fn name(&self) -> &str {
        "identity"
    }

    fn infer(&mut self, batch: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        Ok(batch.to_owned())
    }
}
