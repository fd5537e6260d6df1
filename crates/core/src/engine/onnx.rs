//! ONNX Runtime engine.

use std::fmt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array4, ArrayD, ArrayView4, Ix4};
use ort::{session::Session, value::Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::backend::{build_session, InferenceBackend, SessionConfig};
use super::InferenceEngine;

/// Memory layout the model expects for its image tensors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    #[default]
    Nhwc,
    Nchw,
}

impl TensorLayout {
    /// Parse from string (case-insensitive). Returns `Nhwc` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "nchw" | "channels_first" => Self::Nchw,
            _ => Self::Nhwc,
        }
    }
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nhwc => write!(f, "nhwc"),
            Self::Nchw => write!(f, "nchw"),
        }
    }
}

pub struct OnnxEngineConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub layout: TensorLayout,
    pub trt_cache_dir: Option<&'a Path>,
    pub intra_threads: Option<usize>,
    /// Input tensor name; the session's first input when `None`.
    pub input_name: Option<&'a str>,
    /// Output tensor name; the session's first output when `None`.
    pub output_name: Option<&'a str>,
}

pub struct OnnxEngine {
    session: Session,
    name: String,
    input_name: String,
    output_name: String,
    layout: TensorLayout,
    is_fp16: bool,
}

impl OnnxEngine {
    pub fn load(config: &OnnxEngineConfig<'_>) -> Result<Self> {
        debug!(
            model = %config.model_path.display(),
            backend = %config.backend,
            layout = %config.layout,
            "Loading ONNX model"
        );

        let session = build_session(&SessionConfig {
            model_path: config.model_path,
            backend: config.backend,
            trt_cache_dir: config.trt_cache_dir,
            intra_threads: config.intra_threads,
        })?;

        let input = match config.input_name {
            Some(name) => session
                .inputs()
                .iter()
                .find(|input| input.name() == name)
                .with_context(|| format!("Model has no input named '{name}'"))?,
            None => session.inputs().first().context("Model declares no inputs")?,
        };
        let input_name = input.name().to_string();
        let is_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        let output_name = match config.output_name {
            Some(name) => {
                if !session.outputs().iter().any(|output| output.name() == name) {
                    bail!("Model has no output named '{name}'");
                }
                name.to_string()
            }
            None => session
                .outputs()
                .first()
                .context("Model declares no outputs")?
                .name()
                .to_string(),
        };

        let name = config
            .model_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());

        info!(
            model = %name,
            %input_name, %output_name, is_fp16,
            "Detected model IO"
        );

        Ok(Self {
            session,
            name,
            input_name,
            output_name,
            layout: config.layout,
            is_fp16,
        })
    }

    pub fn is_fp16(&self) -> bool {
        self.is_fp16
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    fn run_f32(&mut self, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let input_tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        Ok(output_view.to_owned())
    }

    fn run_f16(&mut self, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let shape = input.shape().to_vec();
        let f32_slice = input
            .as_slice()
            .context("Input batch must be contiguous for f16 conversion")?;
        let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
        fp16_data.convert_from_f32_slice(f32_slice);

        let input_tensor = Tensor::from_array(ArrayD::from_shape_vec(shape, fp16_data)?)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;

        let fp16_owned = output_view.as_standard_layout().into_owned();
        let fp16_slice = fp16_owned
            .as_slice()
            .context("Model output is not contiguous")?;
        let mut f32_data = vec![0.0f32; fp16_slice.len()];
        fp16_slice.convert_to_f32_slice(&mut f32_data);

        Ok(ArrayD::from_shape_vec(output_view.shape().to_vec(), f32_data)?)
    }
}

impl InferenceEngine for OnnxEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn infer(&mut self, batch: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let input = to_model_layout(batch, self.layout);
        let output = if self.is_fp16 {
            self.run_f16(input)?
        } else {
            self.run_f32(input)?
        };

        let output = output
            .into_dimensionality::<Ix4>()
            .with_context(|| format!("Model '{}' did not return a 4-D tensor", self.name))?;
        Ok(from_model_layout(output, self.layout))
    }
}

/// NHWC batch → contiguous batch in `layout`.
pub fn to_model_layout(batch: ArrayView4<'_, f32>, layout: TensorLayout) -> Array4<f32> {
    match layout {
        TensorLayout::Nhwc => batch.as_standard_layout().into_owned(),
        TensorLayout::Nchw => batch
            .permuted_axes([0, 3, 1, 2])
            .as_standard_layout()
            .into_owned(),
    }
}

/// Batch in `layout` → contiguous NHWC batch.
pub fn from_model_layout(batch: Array4<f32>, layout: TensorLayout) -> Array4<f32> {
    match layout {
        TensorLayout::Nhwc => batch,
        TensorLayout::Nchw => batch
            .permuted_axes([0, 2, 3, 1])
            .as_standard_layout()
            .into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: (usize, usize, usize, usize)) -> Array4<f32> {
        let mut i = 0.0;
        Array4::from_shape_simple_fn(shape, || {
            i += 1.0;
            i
        })
    }

    #[test]
    fn test_layout_from_str_lossy() {
        assert_eq!(TensorLayout::from_str_lossy("NCHW"), TensorLayout::Nchw);
        assert_eq!(TensorLayout::from_str_lossy("nhwc"), TensorLayout::Nhwc);
        assert_eq!(TensorLayout::from_str_lossy("bogus"), TensorLayout::Nhwc);
        assert_eq!(TensorLayout::Nchw.to_string(), "nchw");
    }

    #[test]
    fn test_nchw_transpose_moves_channels_first() {
        let batch = ramp((2, 3, 4, 3));
        let nchw = to_model_layout(batch.view(), TensorLayout::Nchw);
        assert_eq!(nchw.dim(), (2, 3, 3, 4));
        assert!(nchw.is_standard_layout());
        assert_eq!(nchw[[1, 2, 0, 3]], batch[[1, 0, 3, 2]]);
    }

    #[test]
    fn test_layout_round_trip_is_lossless() {
        let batch = ramp((2, 5, 3, 4));
        for layout in [TensorLayout::Nhwc, TensorLayout::Nchw] {
            let restored = from_model_layout(to_model_layout(batch.view(), layout), layout);
            assert_eq!(restored, batch, "{layout}");
        }
    }

    /// Requires the ONNX Runtime library.
    #[test]
    #[ignore]
    fn test_load_missing_model_fails() {
        let config = OnnxEngineConfig {
            model_path: Path::new("no/such/model.onnx"),
            backend: InferenceBackend::Cpu,
            layout: TensorLayout::Nhwc,
            trt_cache_dir: None,
            intra_threads: None,
            input_name: None,
            output_name: None,
        };
        assert!(OnnxEngine::load(&config).is_err());
    }

    /// Requires ONNX Runtime + model file. Run: `cargo test -p tilefuse-core -- --ignored`
    #[test]
    #[ignore]
    fn test_onnx_engine_keeps_patch_shape() {
        let config = OnnxEngineConfig {
            model_path: Path::new("data/models/generator.onnx"),
            backend: InferenceBackend::Cpu,
            layout: TensorLayout::Nhwc,
            trt_cache_dir: None,
            intra_threads: None,
            input_name: None,
            output_name: None,
        };
        let mut engine = OnnxEngine::load(&config).expect("model should load");
        let batch = Array4::<f32>::zeros((2, 224, 224, 3));
        let out = engine.infer(batch.view()).expect("inference should succeed");
        assert_eq!(out.dim(), (2, 224, 224, 3));
    }
}
